//! Pending request table.
//!
//! Every in-flight request owns one table entry and one deadline task. The
//! entry is settled by exactly one of: a matching reply, a synchronous send
//! failure, the deadline firing, or shutdown. `DashMap::remove` is the only
//! way to take an entry, so whichever path removes it first is the one that
//! settles it; the others find nothing and do nothing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::bridge::envelope::RequestId;
use crate::error::RouterError;

type Settle = oneshot::Sender<Result<serde_json::Value, RouterError>>;

struct PendingRequest {
    settle: Settle,
    deadline: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn disarm(&self) {
        if let Some(deadline) = &self.deadline {
            deadline.abort();
        }
    }
}

/// Resolves with the reply payload, or the error that ended the request.
#[must_use = "a request's outcome is only observable by awaiting its ReplyFuture"]
pub struct ReplyFuture {
    request_id: RequestId,
    rx: oneshot::Receiver<Result<serde_json::Value, RouterError>>,
}

impl ReplyFuture {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Future for ReplyFuture {
    type Output = Result<serde_json::Value, RouterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without settling: the tracker went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RouterError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct RequestTracker {
    pending: Arc<DashMap<RequestId, PendingRequest>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Register a new request and arm its deadline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn begin_request(&self, timeout: Duration) -> (RequestId, ReplyFuture) {
        let request_id = RequestId::new();
        let (settle, rx) = oneshot::channel();

        self.pending.insert(
            request_id,
            PendingRequest {
                settle,
                deadline: None,
            },
        );

        let table = Arc::clone(&self.pending);
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = table.remove(&request_id) {
                tracing::debug!(%request_id, ?timeout, "Request timed out");
                let _ = entry.settle.send(Err(RouterError::RequestTimeout {
                    request_id,
                    timeout,
                }));
            }
        });

        // The entry is inserted before the deadline exists so the deadline can
        // never miss it; attach the handle unless something already settled it.
        match self.pending.get_mut(&request_id) {
            Some(mut entry) => entry.deadline = Some(deadline),
            None => deadline.abort(),
        }
        tracing::trace!(%request_id, ?timeout, "Request registered");

        (request_id, ReplyFuture { request_id, rx })
    }

    /// Settle a request with its reply payload.
    ///
    /// Returns false for unknown, late or duplicate replies, which are ignored.
    pub fn resolve(&self, request_id: RequestId, payload: serde_json::Value) -> bool {
        self.settle(request_id, Ok(payload))
    }

    /// Settle a request with an error before any reply could arrive.
    pub fn fail(&self, request_id: RequestId, error: RouterError) -> bool {
        self.settle(request_id, Err(error))
    }

    /// Fail every pending request. Returns how many were failed.
    pub fn fail_all(&self, error: RouterError) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.settle(*id, Err(error.clone())))
            .count()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    fn settle(&self, request_id: RequestId, result: Result<serde_json::Value, RouterError>) -> bool {
        let Some((_, entry)) = self.pending.remove(&request_id) else {
            tracing::debug!(%request_id, "No pending request - ignoring");
            return false;
        };
        entry.disarm();
        if entry.settle.send(result).is_err() {
            tracing::trace!(%request_id, "Requester dropped its ReplyFuture");
        }
        true
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        // Deadline tasks hold the table; stop them so the table and any
        // unsettled senders are released now.
        for entry in self.pending.iter() {
            entry.disarm();
        }
        self.pending.clear();
    }
}
