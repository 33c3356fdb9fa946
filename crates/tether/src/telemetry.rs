//! Subscriber setup for hosts embedding the router.
//!
//! `RUST_LOG` wins when set. Otherwise `TETHER_LOG` picks the level for the
//! `tether` targets (default `info`). `LOG_FORMAT=json` switches to JSON lines.
//! Output always goes to stderr so stdout stays free for the host.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::link::Link;
use crate::child_log::ChildLogLayer;

fn filter_directive(tether_log: Option<&str>) -> String {
    let level = match tether_log {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("tether={level}")
}

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directive(std::env::var("TETHER_LOG").ok().as_deref()))
    }
}

fn use_json() -> bool {
    std::env::var("LOG_FORMAT").as_deref() == Ok("json")
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let filter = env_filter();

    if use_json() {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Install the global subscriber for a child, also forwarding events to `parent`.
///
/// The env filter only governs local stderr output. Every event reaches the
/// forwarding layer so the parent decides what to keep.
///
/// Returns the forwarding task. Must be called from within a tokio runtime.
pub fn init_child_tracing(parent: Arc<dyn Link>) -> JoinHandle<()> {
    let (forward, drain) = ChildLogLayer::spawn(parent);
    let filter = env_filter();

    if use_json() {
        let subscriber = tracing_subscriber::registry().with(forward).with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        );
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(forward)
            .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter));
        let _ = subscriber.try_init();
    }

    drain
}
