//! # Homeward Common Library
//!
//! Shared code for the Homeward tracking crates:
//! - Tracking data model (positions, reference locations, routes, snapshots)
//! - Event types (TrackingEvent enum)
//! - Configuration loading
//! - Clocks and timestamp utilities
//! - Great-circle helpers

pub mod config;
pub mod error;
pub mod events;
pub mod geo;
pub mod model;
pub mod time;

pub use error::{Error, Result};
pub use events::TrackingEvent;
