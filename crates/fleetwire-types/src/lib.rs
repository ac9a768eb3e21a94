//! Shared types for the fleetwire controller/agent messaging substrate.
//!
//! This crate holds the configuration model consumed by the listener, relay
//! and reconnecting client, plus the configuration-fault error taxonomy. It
//! contains no networking code.

pub mod config;
pub mod error;

pub use config::{
    AuthConfig, ClientSettings, DuplicatePolicy, FleetConfig, HeartbeatSettings, ListenConfig,
    MIN_SECRET_LEN,
};
pub use error::{FleetError, FleetResult};
