//! Wire-level types and link plumbing between parent and children.
//!
//! # Architecture
//!
//! - **envelope**: Envelope shape, request and child identities
//! - **link**: Link/registry traits the router routes over
//! - **local**: In-process registry backed by tokio channels

pub mod envelope;
pub mod link;
pub mod local;
