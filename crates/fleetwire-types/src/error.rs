//! Configuration-time error types.
//!
//! Everything in here is a hard fault raised before any socket is opened.
//! Runtime conditions (peer gone, transport reset) are reported through
//! plain return values in `fleetwire-wire` instead.

use thiserror::Error;

/// Top-level configuration error type.
#[derive(Error, Debug)]
pub enum FleetError {
    /// The shared secret is missing or shorter than the required minimum.
    #[error("Shared secret must be at least {min} characters (got {actual})")]
    SecretTooShort {
        /// Required minimum length in characters.
        min: usize,
        /// Length of the provided secret in characters.
        actual: usize,
    },

    /// The listen host/port pair does not form a bindable socket address.
    #[error("Invalid bind address '{addr}': {reason}")]
    InvalidBindAddress {
        /// The offending `host:port` string.
        addr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The peer timeout is not strictly greater than the heartbeat interval.
    #[error("Peer timeout ({timeout_secs}s) must exceed the heartbeat interval ({interval_secs}s)")]
    TimeoutNotAboveInterval {
        /// Configured heartbeat interval.
        interval_secs: u64,
        /// Configured peer timeout.
        timeout_secs: u64,
    },

    /// Any other invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to parse a configuration file.
    #[error("Config parse error: {0}")]
    Parse(String),

    /// An I/O error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with FleetError.
pub type FleetResult<T> = Result<T, FleetError>;
