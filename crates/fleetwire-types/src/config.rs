//! Configuration model for listeners, relays and reconnecting clients.
//!
//! All sections use `#[serde(default)]` so a partial TOML file only needs to
//! name the values it changes. Call [`FleetConfig::validate`] before handing
//! the config to any networking component.

use crate::error::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Minimum shared-secret length, in characters.
pub const MIN_SECRET_LEN: usize = 32;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Listening endpoint (hub and relay roles).
    pub listen: ListenConfig,
    /// Shared-secret authentication.
    pub auth: AuthConfig,
    /// Liveness probing.
    pub heartbeat: HeartbeatSettings,
    /// Outbound connection settings (agent and relay-controller roles).
    pub client: ClientSettings,
    /// Log filter directive used when `RUST_LOG` is unset. Default: "info".
    pub log_level: Option<String>,
}

/// Listening endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Bind host. Default: "0.0.0.0".
    pub host: String,
    /// Bind port. Default: 8765.
    pub port: u16,
    /// HTTP path upgraded to WebSocket. Default: "/ws".
    pub path: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            path: "/ws".to_string(),
        }
    }
}

impl ListenConfig {
    /// Resolve the configured host/port into a socket address.
    pub fn socket_addr(&self) -> FleetResult<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()
            .map_err(|e| FleetError::InvalidBindAddress {
                addr: addr.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| FleetError::InvalidBindAddress {
                addr,
                reason: "host resolved to no addresses".to_string(),
            })
    }
}

/// What a registry does when a peer id that already has a live session
/// authenticates again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Close the old session and keep the new one.
    #[default]
    Replace,
    /// Refuse the new connection; the old session stays.
    Reject,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Process-wide shared secret (at least 32 characters).
    pub shared_secret: String,
    /// How long the listener waits for `auth_response`. Default: 10.
    pub handshake_timeout_secs: u64,
    /// Duplicate peer-id policy. Default: replace.
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            handshake_timeout_secs: 10,
            duplicate_policy: DuplicatePolicy::Replace,
        }
    }
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Heartbeat send / monitor interval in seconds. Default: 30.
    pub interval_secs: u64,
    /// Silence after which a peer is evicted. Default: 60.
    pub timeout_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 60,
        }
    }
}

impl HeartbeatSettings {
    /// The heartbeat interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// The peer timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for the connecting side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Target `host:port` (or a full `ws://` / `wss://` URL).
    pub connect: Option<String>,
    /// Display name announced during the handshake.
    pub display_name: String,
    /// Suggested persistent peer id. `None` lets the listener choose.
    pub peer_id: Option<String>,
    /// First reconnect delay in seconds. Default: 1.
    pub initial_backoff_secs: u64,
    /// Reconnect delay ceiling in seconds. Default: 60.
    pub max_backoff_secs: u64,
    /// Pending-message capacity while disconnected. Default: 1000.
    pub queue_capacity: usize,
    /// Spacing between flushed queued messages in milliseconds. Default: 100.
    pub flush_spacing_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect: None,
            display_name: "agent".to_string(),
            peer_id: None,
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
            queue_capacity: 1000,
            flush_spacing_ms: 100,
        }
    }
}

impl FleetConfig {
    /// Check every invariant that must hold before networking starts.
    ///
    /// `require_listen` additionally checks that the listen address resolves;
    /// pure clients skip that.
    pub fn validate(&self, require_listen: bool) -> FleetResult<()> {
        validate_secret(&self.auth.shared_secret)?;

        if self.heartbeat.interval_secs == 0 {
            return Err(FleetError::Config(
                "heartbeat.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat.timeout_secs <= self.heartbeat.interval_secs {
            return Err(FleetError::TimeoutNotAboveInterval {
                interval_secs: self.heartbeat.interval_secs,
                timeout_secs: self.heartbeat.timeout_secs,
            });
        }
        if self.auth.handshake_timeout_secs == 0 {
            return Err(FleetError::Config(
                "auth.handshake_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.client.queue_capacity == 0 {
            return Err(FleetError::Config(
                "client.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.client.initial_backoff_secs == 0
            || self.client.max_backoff_secs < self.client.initial_backoff_secs
        {
            return Err(FleetError::Config(format!(
                "invalid backoff range {}s..{}s",
                self.client.initial_backoff_secs, self.client.max_backoff_secs
            )));
        }
        if !self.listen.path.starts_with('/') {
            return Err(FleetError::Config(format!(
                "listen.path must start with '/': {}",
                self.listen.path
            )));
        }
        if require_listen {
            self.listen.socket_addr()?;
        }
        Ok(())
    }

    /// Parse a config from TOML text. Missing sections fall back to defaults.
    pub fn from_toml_str(text: &str) -> FleetResult<Self> {
        toml::from_str(text).map_err(|e| FleetError::Parse(e.to_string()))
    }
}

/// Reject secrets shorter than [`MIN_SECRET_LEN`] characters.
pub fn validate_secret(secret: &str) -> FleetResult<()> {
    let actual = secret.chars().count();
    if actual < MIN_SECRET_LEN {
        return Err(FleetError::SecretTooShort {
            min: MIN_SECRET_LEN,
            actual,
        });
    }
    Ok(())
}
