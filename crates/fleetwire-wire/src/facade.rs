//! Blocking facade for callers outside the tokio runtime.
//!
//! A thread that is not a runtime worker (a UI thread, a CPU-bound job
//! reporting progress) must not touch connection state directly. It hands
//! the work to the runtime through a [`BlockingHandle`] and blocks on the
//! result for a bounded time, getting [`WireError::Timeout`] instead of
//! hanging.

use std::future::Future;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;

use crate::client::{ClientHandle, Delivery};
use crate::error::WireError;
use crate::message::{AgentSummary, MessageType};
use crate::server::Hub;

/// Default bound for single-peer operations.
pub const DEFAULT_UNICAST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound for broadcasts.
pub const DEFAULT_BROADCAST_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs futures on a runtime from a foreign thread.
#[derive(Clone, Debug)]
pub struct BlockingHandle {
    runtime: Handle,
    timeout: Duration,
}

impl BlockingHandle {
    pub fn new(runtime: Handle, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// Capture the runtime of the calling context, if any.
    pub fn current(timeout: Duration) -> Option<Self> {
        Handle::try_current().ok().map(|runtime| Self::new(runtime, timeout))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `fut` on the runtime and wait for it with the default timeout.
    ///
    /// Must not be called from a runtime worker thread.
    pub fn call<F, T>(&self, fut: F) -> Result<T, WireError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.call_with_timeout(fut, self.timeout)
    }

    /// Run `fut` on the runtime and wait at most `timeout`.
    ///
    /// On timeout the future is cancelled on the runtime as well.
    pub fn call_with_timeout<F, T>(&self, fut: F, timeout: Duration) -> Result<T, WireError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = std_mpsc::sync_channel(1);
        self.runtime.spawn(async move {
            if let Ok(value) = tokio::time::timeout(timeout, fut).await {
                let _ = tx.send(value);
            }
        });
        rx.recv_timeout(timeout)
            .map_err(|_| WireError::Timeout(timeout))
    }

    /// [`ClientHandle::send`] from a foreign thread.
    pub fn send(
        &self,
        client: &ClientHandle,
        message_type: MessageType,
        payload: Value,
    ) -> Result<Delivery, WireError> {
        let client = client.clone();
        self.call(async move { client.send(message_type, payload).await })?
    }
}

/// A [`Hub`] driven from a foreign thread.
#[derive(Clone)]
pub struct BlockingHub {
    hub: Hub,
    handle: BlockingHandle,
    broadcast_timeout: Duration,
}

impl BlockingHub {
    pub fn new(hub: Hub, runtime: Handle) -> Self {
        Self {
            hub,
            handle: BlockingHandle::new(runtime, DEFAULT_UNICAST_TIMEOUT),
            broadcast_timeout: DEFAULT_BROADCAST_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, unicast: Duration, broadcast: Duration) -> Self {
        self.handle = BlockingHandle::new(self.handle.runtime.clone(), unicast);
        self.broadcast_timeout = broadcast;
        self
    }

    pub fn send_command(
        &self,
        peer_id: &str,
        message_type: MessageType,
        payload: Value,
    ) -> Result<bool, WireError> {
        let hub = self.hub.clone();
        let peer_id = peer_id.to_string();
        self.handle
            .call(async move { hub.send_command(&peer_id, message_type, payload) })
    }

    pub fn broadcast_command(
        &self,
        message_type: MessageType,
        payload: Value,
    ) -> Result<usize, WireError> {
        let hub = self.hub.clone();
        self.handle.call_with_timeout(
            async move { hub.broadcast_command(message_type, payload) },
            self.broadcast_timeout,
        )
    }

    pub fn disconnect_peer(&self, peer_id: &str) -> Result<bool, WireError> {
        let hub = self.hub.clone();
        let peer_id = peer_id.to_string();
        self.handle.call(async move { hub.disconnect_peer(&peer_id) })
    }

    pub fn peers(&self) -> Result<Vec<AgentSummary>, WireError> {
        let hub = self.hub.clone();
        self.handle.call(async move { hub.peers() })
    }
}
