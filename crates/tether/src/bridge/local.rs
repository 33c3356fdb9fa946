//! In-process child registry.
//!
//! Children are tasks in the same process, each wired to the parent by a pair
//! of unbounded channels. Useful for tests and for hosts that run workers as
//! tasks instead of subprocesses.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc;

use super::envelope::{ChildId, Envelope};
use super::link::{ChannelLink, ChildJoined, ChildRegistry, Link};

/// Child-side ends of a joined child.
pub struct LocalChild {
    pub id: ChildId,
    /// Link back to the parent.
    pub parent: Arc<dyn Link>,
    /// Envelopes sent by the parent to this child.
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

pub struct LocalRegistry {
    children: StdMutex<Vec<(ChildId, Arc<ChannelLink>)>>,
    joins_tx: mpsc::UnboundedSender<ChildJoined>,
}

impl LocalRegistry {
    /// Returns the registry and the stream of join announcements for the parent router.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ChildJoined>) {
        let (joins_tx, joins_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            children: StdMutex::new(Vec::new()),
            joins_tx,
        });
        (registry, joins_rx)
    }

    /// Make a new child live and announce it.
    ///
    /// Re-joining an id that is already live replaces the old child.
    pub fn join(&self, id: impl Into<ChildId>) -> LocalChild {
        let id = id.into();
        let (to_child_tx, to_child_rx) = mpsc::unbounded_channel();
        let (to_parent_tx, to_parent_rx) = mpsc::unbounded_channel();

        let link = Arc::new(ChannelLink::new(id.to_string(), to_child_tx));
        {
            let mut children = self.lock_children();
            children.retain(|(child_id, _)| child_id != &id);
            children.push((id.clone(), link));
        }

        if self
            .joins_tx
            .send(ChildJoined {
                id: id.clone(),
                inbound: to_parent_rx,
            })
            .is_err()
        {
            tracing::warn!(child = %id, "No listener for child joins");
        }
        tracing::debug!(child = %id, "Child joined");

        LocalChild {
            parent: Arc::new(ChannelLink::new("parent", to_parent_tx)),
            id,
            inbound: to_child_rx,
        }
    }

    /// Make a child non-live. Its link is dropped, so later sends to it fail.
    pub fn remove(&self, id: &ChildId) -> bool {
        let mut children = self.lock_children();
        let before = children.len();
        children.retain(|(child_id, _)| child_id != id);
        let removed = children.len() != before;
        if removed {
            tracing::debug!(child = %id, "Child removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock_children().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, Vec<(ChildId, Arc<ChannelLink>)>> {
        self.children.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Local registry mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }
}

impl ChildRegistry for LocalRegistry {
    fn live_children(&self) -> Vec<(ChildId, Arc<dyn Link>)> {
        self.lock_children()
            .iter()
            .filter(|(_, link)| !link.is_closed())
            .map(|(id, link)| (id.clone(), Arc::clone(link) as Arc<dyn Link>))
            .collect()
    }
}
