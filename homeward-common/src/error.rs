//! Common error types for Homeward

use thiserror::Error;

/// Common result type for Homeward operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the Homeward crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML config file could not be parsed
    #[error("Config file parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timers or tasks could not be allocated
    ///
    /// The only fatal engine error; surfaced from `start()`.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
