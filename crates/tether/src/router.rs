//! Router - the facade over dispatch, request tracking and inbound routing.
//!
//! Outbound:
//! 1. `send` / `publish` / `request` pick target(s) through the [`Dispatcher`]
//! 2. An [`Envelope`] is built and handed to the target's [`Link`]
//!
//! Inbound (one listener task per link, see [`Router::attach`]):
//! - replies settle the matching pending request
//! - requests become [`RouterEvent::Request`] with a [`Responder`]
//! - everything else becomes [`RouterEvent::Message`]

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::envelope::{ChildId, Envelope, EnvelopeKind, RequestId};
use crate::bridge::link::{ChildJoined, ChildRegistry, Link};
use crate::child_log::{self, LOG_CHANNEL};
use crate::dispatch::{Destinations, Dispatcher, Target};
use crate::error::RouterError;
use crate::tracker::{ReplyFuture, RequestTracker};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

const REQUEST_TIMEOUT_ENV: &str = "TETHER_REQUEST_TIMEOUT_MS";

fn parse_timeout_ms(raw: Option<&str>) -> Duration {
    raw.and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long `request` waits for a reply.
    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: parse_timeout_ms(std::env::var(REQUEST_TIMEOUT_ENV).ok().as_deref()),
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Which side of the process tree this router runs on, fixed at construction.
#[derive(Clone)]
pub enum Role {
    Parent {
        registry: Arc<dyn ChildRegistry>,
    },
    Child {
        id: ChildId,
        parent: Arc<dyn Link>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Parent,
    Child,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child => "child",
        }
    }
}

/// Sends the reply for one inbound request back to whoever asked.
///
/// Clones share the same request; replying more than once is harmless since
/// the requester ignores replies it is no longer waiting for.
#[derive(Clone)]
pub struct Responder {
    destinations: Destinations,
    origin: Option<ChildId>,
    channel: String,
    request_id: RequestId,
}

impl Responder {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Transmit `value` as the reply.
    ///
    /// In the parent role the origin child is looked up at reply time, so a
    /// child that left in the meantime yields `NoTargetAvailable`.
    pub fn reply(self, value: serde_json::Value) -> Result<(), RouterError> {
        let target = match &self.destinations {
            Destinations::Parent(link) => Target {
                id: None,
                link: Arc::clone(link),
            },
            Destinations::Children(registry) => {
                let id = self.origin.ok_or(RouterError::NoTargetAvailable)?;
                let link = registry
                    .child(&id)
                    .ok_or(RouterError::NoTargetAvailable)?;
                Target { id: Some(id), link }
            }
        };
        tracing::debug!(request_id = %self.request_id, channel = %self.channel, "Sending reply");
        transmit(&target, Envelope::reply(self.channel, value, self.request_id))
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("origin", &self.origin)
            .field("channel", &self.channel)
            .field("request_id", &self.request_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: serde_json::Value,
    /// Sending child; `None` in the child role.
    pub origin: Option<ChildId>,
}

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub channel: String,
    pub payload: serde_json::Value,
    pub origin: Option<ChildId>,
    pub responder: Responder,
}

impl InboundRequest {
    pub fn reply(self, value: serde_json::Value) -> Result<(), RouterError> {
        self.responder.reply(value)
    }
}

#[derive(Debug, Clone)]
pub enum RouterEvent {
    Message(InboundMessage),
    Request(InboundRequest),
}

/// Stream of consumer-visible events from one router.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<RouterEvent>,
}

impl Subscription {
    /// Next event, or `None` once the router is gone.
    pub async fn recv(&mut self) -> Option<RouterEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RouterEvent> {
        self.rx.try_recv().ok()
    }
}

impl futures::Stream for Subscription {
    type Item = RouterEvent;

    fn poll_next(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

fn transmit(target: &Target, envelope: Envelope) -> Result<(), RouterError> {
    target
        .link
        .transmit(envelope)
        .map_err(|source| RouterError::Transport {
            target: target.id.clone(),
            source,
        })
}

pub struct Router {
    kind: RoleKind,
    child_id: Option<ChildId>,
    config: RouterConfig,
    dispatcher: Dispatcher,
    tracker: RequestTracker,
    subscribers: StdMutex<Vec<mpsc::UnboundedSender<RouterEvent>>>,
    shutdown: CancellationToken,
}

impl Router {
    pub fn new(role: Role, config: RouterConfig) -> Arc<Self> {
        let (kind, child_id, destinations) = match role {
            Role::Parent { registry } => (RoleKind::Parent, None, Destinations::Children(registry)),
            Role::Child { id, parent } => (RoleKind::Child, Some(id), Destinations::Parent(parent)),
        };
        tracing::debug!(role = kind.as_str(), child = ?child_id, timeout = ?config.request_timeout, "Creating router");

        Arc::new(Self {
            kind,
            child_id,
            config,
            dispatcher: Dispatcher::new(destinations),
            tracker: RequestTracker::new(),
            subscribers: StdMutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn parent(registry: Arc<dyn ChildRegistry>, config: RouterConfig) -> Arc<Self> {
        Self::new(Role::Parent { registry }, config)
    }

    pub fn child(id: impl Into<ChildId>, parent: Arc<dyn Link>, config: RouterConfig) -> Arc<Self> {
        Self::new(
            Role::Child {
                id: id.into(),
                parent,
            },
            config,
        )
    }

    pub fn role(&self) -> RoleKind {
        self.kind
    }

    pub fn is_parent(&self) -> bool {
        self.kind == RoleKind::Parent
    }

    /// Own identity in the child role.
    pub fn child_id(&self) -> Option<&ChildId> {
        self.child_id.as_ref()
    }

    /// Live children in enumeration order. Empty in the child role.
    pub fn children(&self) -> Vec<ChildId> {
        match self.dispatcher.destinations() {
            Destinations::Children(registry) => registry
                .live_children()
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
            Destinations::Parent(_) => Vec::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn pending_requests(&self) -> usize {
        self.tracker.pending()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_subscribers().push(tx);
        Subscription { rx }
    }

    /// Fire-and-forget to one target.
    ///
    /// `hint` names a child or a sticky key; it is ignored in the child role.
    pub fn send(
        &self,
        channel: impl Into<String>,
        payload: serde_json::Value,
        hint: Option<&str>,
    ) -> Result<(), RouterError> {
        self.ensure_open()?;
        let target = self.dispatcher.select(hint)?;
        let envelope = Envelope::message(channel, payload);
        tracing::trace!(target = ?target.id, channel = %envelope.channel, "Sending message");
        transmit(&target, envelope)
    }

    /// Fire-and-forget to every live child. Parent role only.
    ///
    /// Returns how many children were reached.
    pub fn publish(
        &self,
        channel: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<usize, RouterError> {
        if !self.is_parent() {
            return Err(RouterError::RoleViolation);
        }
        self.ensure_open()?;
        let envelope = Envelope::message(channel, payload);
        let delivered = self.dispatcher.publish_all(&envelope)?;
        tracing::debug!(channel = %envelope.channel, delivered, "Published message");
        Ok(delivered)
    }

    /// Send a request and wait up to the configured timeout for its reply.
    ///
    /// Failures to pick a target or transmit settle the returned future
    /// immediately; nothing is left pending. Must be called within a tokio runtime.
    pub fn request(
        &self,
        channel: impl Into<String>,
        payload: serde_json::Value,
        hint: Option<&str>,
    ) -> ReplyFuture {
        self.request_with_timeout(channel, payload, hint, self.config.request_timeout)
    }

    pub fn request_with_timeout(
        &self,
        channel: impl Into<String>,
        payload: serde_json::Value,
        hint: Option<&str>,
        timeout: Duration,
    ) -> ReplyFuture {
        let channel = channel.into();
        let (request_id, reply) = self.tracker.begin_request(timeout);

        let sent = self.ensure_open().and_then(|()| {
            let target = self.dispatcher.select(hint)?;
            tracing::debug!(%request_id, target = ?target.id, channel = %channel, "Sending request");
            transmit(&target, Envelope::request(channel.clone(), payload, request_id))
        });

        if let Err(e) = sent {
            tracing::debug!(%request_id, channel = %channel, error = %e, "Request failed before sending");
            self.tracker.fail(request_id, e);
        }

        reply
    }

    /// Route one inbound envelope. `origin` is the sending child in the parent role.
    pub fn handle_inbound(&self, envelope: Envelope, origin: Option<ChildId>) {
        match envelope.kind() {
            EnvelopeKind::Reply(request_id) => {
                if !self.tracker.resolve(request_id, envelope.payload) {
                    tracing::debug!(%request_id, child = ?origin, "Dropping reply with no pending request");
                }
            }
            EnvelopeKind::Request(request_id) => {
                tracing::trace!(%request_id, child = ?origin, channel = %envelope.channel, "Inbound request");
                let responder = Responder {
                    destinations: self.dispatcher.destinations().clone(),
                    origin: origin.clone(),
                    channel: envelope.channel.clone(),
                    request_id,
                };
                self.emit(RouterEvent::Request(InboundRequest {
                    channel: envelope.channel,
                    payload: envelope.payload,
                    origin,
                    responder,
                }));
            }
            EnvelopeKind::Message if self.is_parent() && envelope.channel == LOG_CHANNEL => {
                child_log::replay(origin.as_ref(), envelope.payload);
            }
            EnvelopeKind::Message => {
                tracing::trace!(child = ?origin, channel = %envelope.channel, "Inbound message");
                self.emit(RouterEvent::Message(InboundMessage {
                    channel: envelope.channel,
                    payload: envelope.payload,
                    origin,
                }));
            }
            EnvelopeKind::Malformed => {
                tracing::warn!(child = ?origin, channel = %envelope.channel, "Dropping reply envelope without request id");
            }
        }
    }

    /// Spawn a listener feeding `inbound` to [`Router::handle_inbound`] in arrival order.
    ///
    /// The listener holds only a weak reference and stops on shutdown, when the
    /// router is dropped, or when the link's sender side closes.
    pub fn attach(
        self: &Arc<Self>,
        origin: Option<ChildId>,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> JoinHandle<()> {
        let router = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tracing::debug!(child = ?origin, "Attaching inbound listener");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    msg = inbound.recv() => {
                        let Some(envelope) = msg else { break };
                        let Some(router) = router.upgrade() else { break };
                        router.handle_inbound(envelope, origin.clone());
                    }
                }
            }
            tracing::debug!(child = ?origin, "Inbound listener exiting");
        })
    }

    /// Attach a listener to every child the registry announces.
    pub fn listen(self: &Arc<Self>, mut joins: mpsc::UnboundedReceiver<ChildJoined>) -> JoinHandle<()> {
        let router = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    joined = joins.recv() => {
                        let Some(ChildJoined { id, inbound }) = joined else { break };
                        let Some(router) = router.upgrade() else { break };
                        tracing::info!(child = %id, "Child became live");
                        let _ = router.attach(Some(id), inbound);
                    }
                }
            }
            tracing::debug!("Join listener exiting");
        })
    }

    /// Stop all listeners and fail every pending request with `Closed`.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let failed = self.tracker.fail_all(RouterError::Closed);
        tracing::info!(role = self.kind.as_str(), failed_requests = failed, "Router shut down");
    }

    fn ensure_open(&self) -> Result<(), RouterError> {
        if self.shutdown.is_cancelled() {
            Err(RouterError::Closed)
        } else {
            Ok(())
        }
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<RouterEvent>>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Subscriber list mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn emit(&self, event: RouterEvent) {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            tracing::debug!(?event, "No subscribers - event dropped");
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
