//! Live tracking engine
//!
//! Two independent pollers (subject position, reference location) feed one
//! event loop that fuses them, keeps a route synchronized between them, and
//! publishes an immutable [`SyncSnapshot`](homeward_common::model::SyncSnapshot)
//! after every change.

pub mod engine;
pub mod fusion;
pub mod messages;
pub mod position_poller;
pub mod reference_resolver;
pub mod route_sync;

pub use engine::TrackingEngine;
pub use fusion::{SnapshotCallback, SubscriptionId};
