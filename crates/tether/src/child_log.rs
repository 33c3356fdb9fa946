//! Child log forwarding.
//!
//! In the child role, [`ChildLogLayer`] turns tracing events into envelopes on
//! [`LOG_CHANNEL`] and ships them to the parent. The parent router recognizes
//! the channel and re-emits each record through its own subscriber under the
//! `tether::child` target.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::envelope::{ChildId, Envelope};
use crate::bridge::link::Link;

/// Reserved channel carrying forwarded log records.
pub const LOG_CHANNEL: &str = "tether:log";

const QUEUE_CAPACITY: usize = 1024;

/// Targets never forwarded: logging them would produce more envelopes.
const SUPPRESSED_TARGETS: &[&str] = &["tether::bridge::link", "tether::child_log"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildLogRecord {
    pub target: String,
    pub level: String,
    pub message: String,
}

pub struct ChildLogLayer {
    tx: mpsc::Sender<Envelope>,
    dropped: Arc<AtomicUsize>,
}

impl ChildLogLayer {
    /// Create the layer and spawn the task that drains it into `parent`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(parent: Arc<dyn Link>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(QUEUE_CAPACITY);
        let drain = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if parent.transmit(envelope).is_err() {
                    break;
                }
            }
        });
        (
            Self {
                tx,
                dropped: Arc::new(AtomicUsize::new(0)),
            },
            drain,
        )
    }

    /// Records discarded because the queue was full or closed.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }
}

impl<S> Layer<S> for ChildLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if SUPPRESSED_TARGETS.iter().any(|t| target.starts_with(t)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = ChildLogRecord {
            target: target.to_string(),
            level: Self::level_to_string(metadata.level()).to_string(),
            message: visitor.message,
        };
        let Ok(payload) = serde_json::to_value(&record) else {
            return;
        };

        if self
            .tx
            .try_send(Envelope::message(LOG_CHANNEL, payload))
            .is_err()
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Re-emit a forwarded record on the parent side.
pub fn replay(origin: Option<&ChildId>, payload: serde_json::Value) {
    let child = origin.map_or("unknown", ChildId::as_str);
    let record: ChildLogRecord = match serde_json::from_value(payload) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(child, error = %e, "Malformed child log record");
            return;
        }
    };

    let ChildLogRecord {
        target: origin_target,
        level,
        message,
    } = record;
    match level.as_str() {
        "error" => tracing::error!(target: "tether::child", child, origin_target = %origin_target, "{}", message),
        "warn" => tracing::warn!(target: "tether::child", child, origin_target = %origin_target, "{}", message),
        "debug" => tracing::debug!(target: "tether::child", child, origin_target = %origin_target, "{}", message),
        "trace" => tracing::trace!(target: "tether::child", child, origin_target = %origin_target, "{}", message),
        _ => tracing::info!(target: "tether::child", child, origin_target = %origin_target, "{}", message),
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.len() >= 2 && self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}
