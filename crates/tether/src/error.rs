use std::time::Duration;

use crate::bridge::envelope::{ChildId, RequestId};
use crate::bridge::link::TransportError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    #[error("no target available")]
    NoTargetAvailable,
    #[error("publish is only available to the parent")]
    RoleViolation,
    #[error("request {request_id} timed out after {timeout:?}")]
    RequestTimeout {
        request_id: RequestId,
        timeout: Duration,
    },
    #[error("transmit to {} failed: {source}", .target.as_ref().map_or("parent", ChildId::as_str))]
    Transport {
        /// `None` when the target was the parent.
        target: Option<ChildId>,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error("router closed")]
    Closed,
}

/// Per-child failures of a publish, collected after every child was attempted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("broadcast reached {delivered} of {} children", .delivered + .failures.len())]
pub struct BroadcastError {
    pub delivered: usize,
    pub failures: Vec<(ChildId, TransportError)>,
}

impl RouterError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }
}
