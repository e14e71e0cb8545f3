//! Presentation HTTP API
//!
//! Read-only view of the tracking engine for the caregiver dashboard, plus
//! the two manual actions the dashboard offers (refresh home, refresh route).

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{build_router, run, AppContext};
