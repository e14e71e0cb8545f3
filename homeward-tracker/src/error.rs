//! Error types for homeward-tracker
//!
//! Capability failures are values, not faults: the engine records them in the
//! snapshot and on the event channel and keeps running. Only `start()` returns
//! the common [`Error`].

use homeward_common::model::{FetchErrorKind, RouteFailure, RouteFailureKind};
use thiserror::Error;

pub use homeward_common::{Error, Result};

/// Position/reference fetch failure (transient; each poller retries on its own schedule)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network(_) => FetchErrorKind::Network,
            FetchError::Api(..) => FetchErrorKind::Api,
            FetchError::Parse(_) => FetchErrorKind::Parse,
        }
    }
}

/// Route provider failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RouteError {
    /// Transient; retried after the normal backoff
    #[error("Network error: {0}")]
    NetworkError(String),

    /// No route between these inputs; not retried until they change
    #[error("No route found: {0}")]
    NoRouteFound(String),

    /// Retried after the longer rate-limit backoff
    #[error("Rate limit exceeded")]
    RateLimited,
}

impl RouteError {
    pub fn kind(&self) -> RouteFailureKind {
        match self {
            RouteError::NetworkError(_) => RouteFailureKind::NetworkError,
            RouteError::NoRouteFound(_) => RouteFailureKind::NoRouteFound,
            RouteError::RateLimited => RouteFailureKind::RateLimited,
        }
    }

    pub fn to_failure(&self) -> RouteFailure {
        RouteFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}
