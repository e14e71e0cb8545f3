//! # Homeward Tracker
//!
//! Live tracking and route synchronization for the caregiver dashboard.
//!
//! Polls a patient's live position and configured home, keeps a driving
//! route between them in sync, and publishes one consistent snapshot of
//! position, home, route and their freshness after every change.
//!
//! - [`tracking`]: the engine (pollers, route synchronizer, fusion)
//! - [`sources`]: capability traits the engine consumes
//! - [`clients`]: HTTP implementations of those capabilities
//! - [`api`]: axum presentation API (snapshot, manual refresh, SSE)

pub mod api;
pub mod clients;
pub mod error;
pub mod scheduler;
pub mod sources;
pub mod tracking;

pub use error::{Error, FetchError, Result, RouteError};
pub use sources::Sources;
pub use tracking::TrackingEngine;
