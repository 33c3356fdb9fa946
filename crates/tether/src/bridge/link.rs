//! Link and registry abstractions over the underlying process channel.
//!
//! The router never spawns or supervises processes. It relies on whatever owns
//! the children to provide:
//! - a [`Link`] per peer that hands an envelope to the channel synchronously
//! - a [`ChildRegistry`] enumerating the children that are live right now
//! - a [`ChildJoined`] notification carrying the inbound side of each new child

use std::sync::Arc;

use tokio::sync::mpsc;

use super::envelope::{ChildId, Envelope};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("link closed")]
    Closed,
    #[error("failed to send on link: {0}")]
    Send(String),
}

/// Outbound half of a parent/child channel.
pub trait Link: Send + Sync {
    /// Hand the envelope to the channel. Must not block on the peer.
    fn transmit(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Parent-side view of the current child set.
pub trait ChildRegistry: Send + Sync {
    /// Live children in a stable enumeration order.
    fn live_children(&self) -> Vec<(ChildId, Arc<dyn Link>)>;

    fn child(&self, id: &ChildId) -> Option<Arc<dyn Link>> {
        self.live_children()
            .into_iter()
            .find(|(child_id, _)| child_id == id)
            .map(|(_, link)| link)
    }
}

/// Announced by the registry when a child becomes live.
pub struct ChildJoined {
    pub id: ChildId,
    /// Envelopes sent by this child, in arrival order.
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl std::fmt::Debug for ChildJoined {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildJoined").field("id", &self.id).finish()
    }
}

/// Link backed by an unbounded tokio channel.
///
/// Sending never waits; it fails only once the receiving side is gone.
pub struct ChannelLink {
    peer: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelLink {
    pub fn new(peer: impl Into<String>, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            peer: peer.into(),
            tx,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Link for ChannelLink {
    fn transmit(&self, envelope: Envelope) -> Result<(), TransportError> {
        tracing::trace!(peer = %self.peer, channel = %envelope.channel, "Transmitting envelope");
        self.tx.send(envelope).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedRegistry(Vec<(ChildId, Arc<dyn Link>)>);

    impl ChildRegistry for FixedRegistry {
        fn live_children(&self) -> Vec<(ChildId, Arc<dyn Link>)> {
            self.0.clone()
        }
    }

    #[test]
    fn channel_link_delivers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = ChannelLink::new("a", tx);

        link.transmit(Envelope::message("c", json!(1))).unwrap();
        link.transmit(Envelope::message("c", json!(2))).unwrap();

        assert_eq!(rx.try_recv().unwrap().payload, json!(1));
        assert_eq!(rx.try_recv().unwrap().payload, json!(2));
    }

    #[test]
    fn channel_link_fails_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = ChannelLink::new("a", tx);
        drop(rx);

        assert!(link.is_closed());
        assert_eq!(
            link.transmit(Envelope::message("c", json!(null))),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn default_child_lookup_scans_live_children() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link: Arc<dyn Link> = Arc::new(ChannelLink::new("a", tx));
        let registry = FixedRegistry(vec![(ChildId::from("a"), link)]);

        assert!(registry.child(&ChildId::from("a")).is_some());
        assert!(registry.child(&ChildId::from("b")).is_none());
    }
}
