//! tether: message routing between a parent process and its children.
//!
//! Built over one ordered, message-framed channel per child, it adds
//! round-robin and sticky target selection, broadcast, and request/reply
//! correlation with bounded waits.

mod child_log;
mod dispatch;
mod error;
mod tracker;

pub mod bridge;
pub mod router;
pub mod telemetry;

pub use bridge::envelope::{ChildId, Envelope, EnvelopeKind, RequestId};
pub use bridge::link::{ChannelLink, ChildJoined, ChildRegistry, Link, TransportError};
pub use bridge::local::{LocalChild, LocalRegistry};
pub use child_log::{ChildLogLayer, ChildLogRecord, LOG_CHANNEL};
pub use dispatch::{Destinations, Dispatcher, RoundRobin, StickyMap, Target};
pub use error::{BroadcastError, RouterError};
pub use router::{
    DEFAULT_REQUEST_TIMEOUT, InboundMessage, InboundRequest, Responder, Role, RoleKind, Router,
    RouterConfig, RouterEvent, Subscription,
};
pub use tracker::{ReplyFuture, RequestTracker};
