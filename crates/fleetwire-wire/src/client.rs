//! Reconnecting client: the connecting side of both topologies.
//!
//! The client is an explicit state machine:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> AUTHENTICATING -> CONNECTED -> DISCONNECTED ...
//!                         any state -> STOPPED
//! ```
//!
//! While CONNECTED three activities run side by side under one `select!`: the
//! heartbeat sender, the receive loop and the queue flush loop. The first one
//! to fail ends the connection, which cancels the other two, publishes
//! DISCONNECTED, emits exactly one [`ClientEvent::Disconnected`] and waits out
//! the backoff before the next attempt.
//!
//! [`ClientHandle::send`] never blocks on reconnection: while disconnected it
//! enqueues into a bounded FIFO that the flush loop drains in order once the
//! link is back. [`ClientHandle::stop`] can be called from any thread.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetwire_types::{FleetConfig, FleetResult};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{self, Authenticated, ConnectorIdentity, SharedSecret};
use crate::backoff::Backoff;
use crate::error::WireError;
use crate::message::{MessageType, PeerRole, WireMessage};
use crate::queue::{MessageQueue, PendingMessage};
use crate::transport::{Connector, Frame, FrameSink, FrameStream, Transport};

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Stopped,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Notifications for the client's owner, delivered on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Authenticated; `peer_id` is the id the listener registered us under.
    Connected { peer_id: String },
    /// A connection attempt or live connection ended.
    Disconnected { reason: String },
    /// A post-auth inbound message other than a heartbeat ack.
    Message(WireMessage),
}

/// Receiving end of a client's event stream.
pub type ClientEvents = mpsc::UnboundedReceiver<ClientEvent>;

/// What happened to a message handed to [`ClientHandle::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the live connection.
    Sent,
    /// Stored for delivery after (re)connection.
    Queued,
    /// The live connection failed mid-send; the message is lost and the
    /// client reconnects.
    Dropped,
}

/// Validated client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub secret: SharedSecret,
    pub identity: ConnectorIdentity,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub queue_capacity: usize,
    pub flush_spacing: Duration,
}

impl ClientOptions {
    /// Validate `config` and build options for a client playing `role`.
    pub fn from_config(config: &FleetConfig, role: PeerRole) -> FleetResult<Self> {
        config.validate(false)?;
        let client = &config.client;
        let mut identity = ConnectorIdentity::new(role, client.display_name.clone());
        identity.peer_id = client.peer_id.clone();
        Ok(Self {
            secret: SharedSecret::new(config.auth.shared_secret.clone())?,
            identity,
            heartbeat_interval: config.heartbeat.interval(),
            handshake_timeout: Duration::from_secs(config.auth.handshake_timeout_secs),
            initial_backoff: Duration::from_secs(client.initial_backoff_secs),
            max_backoff: Duration::from_secs(client.max_backoff_secs),
            queue_capacity: client.queue_capacity,
            flush_spacing: Duration::from_millis(client.flush_spacing_ms),
        })
    }
}

type SharedSink = Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>;

/// The live connection, present only while CONNECTED.
#[derive(Clone)]
struct Link {
    sink: SharedSink,
    token: String,
    broken: Arc<Notify>,
}

struct Shared {
    state: watch::Sender<ClientState>,
    stop: watch::Sender<bool>,
    queue: Mutex<MessageQueue>,
    link: Mutex<Option<Link>>,
    flush_wake: Notify,
    peer_id: Mutex<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Client state");
        }
    }

    fn link(&self) -> Option<Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_link(&self, link: Option<Link>) {
        *self.link.lock().unwrap_or_else(|e| e.into_inner()) = link;
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, MessageQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable, thread-safe handle to a running [`ReconnectingClient`].
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

/// Entry point for spawning clients.
pub struct ReconnectingClient;

impl ReconnectingClient {
    /// Start the reconnect loop on the current tokio runtime.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        options: ClientOptions,
    ) -> (ClientHandle, ClientEvents) {
        let (state_tx, _) = watch::channel(ClientState::Disconnected);
        let (stop_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: state_tx,
            stop: stop_tx,
            queue: Mutex::new(MessageQueue::new(options.queue_capacity)),
            link: Mutex::new(None),
            flush_wake: Notify::new(),
            peer_id: Mutex::new(options.identity.peer_id.clone()),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run(Arc::clone(&shared), connector, options, events_tx));
        *shared.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        (ClientHandle { shared }, events_rx)
    }
}

impl ClientHandle {
    /// Send now if connected, otherwise enqueue.
    ///
    /// While earlier queued messages are still being flushed the new message
    /// joins the queue, so per-connection order is preserved.
    pub async fn send(
        &self,
        message_type: MessageType,
        payload: Value,
    ) -> Result<Delivery, WireError> {
        if self.is_stopped() {
            return Err(WireError::Stopped);
        }
        let live = self.shared.link().filter(|_| self.shared.queue().is_empty());
        let Some(link) = live else {
            self.shared
                .queue()
                .push(PendingMessage::new(message_type, payload));
            self.shared.flush_wake.notify_one();
            return Ok(Delivery::Queued);
        };

        let text = WireMessage::new(message_type.clone(), payload)
            .with_token(link.token.clone())
            .encode()?;
        let result = link.sink.lock().await.send(Frame::Text(text)).await;
        match result {
            Ok(()) => Ok(Delivery::Sent),
            Err(e) => {
                warn!(message_type = %message_type, error = %e, "Send failed, message dropped");
                link.broken.notify_one();
                Ok(Delivery::Dropped)
            }
        }
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Wait until the client reaches `state`, bounded by `timeout`.
    pub async fn wait_for_state(
        &self,
        state: ClientState,
        timeout: Duration,
    ) -> Result<(), WireError> {
        let mut rx = self.subscribe_state();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .map_err(|_| WireError::Timeout(timeout))?
            .map_err(|_| WireError::Stopped)?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.stop.borrow()
    }

    /// Messages waiting for a connection.
    pub fn queue_len(&self) -> usize {
        self.shared.queue().len()
    }

    /// The id the listener last registered us under.
    pub fn peer_id(&self) -> Option<String> {
        self.shared
            .peer_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ask the reconnect loop to exit. Safe from any thread; idempotent.
    pub fn stop(&self) {
        if !self.shared.stop.send_replace(true) {
            info!("Client stop requested");
        }
        self.shared.flush_wake.notify_one();
    }

    /// Wait for the reconnect loop to exit.
    pub async fn join(&self) {
        let task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn run(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut stop = shared.stop.subscribe();
    let mut backoff = Backoff::new(options.initial_backoff, options.max_backoff);
    let target = connector.target();
    info!(target = %target, role = %options.identity.role, "Client started");

    loop {
        if *stop.borrow() {
            break;
        }

        let attempt = tokio::select! {
            result = establish(&shared, connector.as_ref(), &options) => result,
            _ = stopped(&mut stop) => break,
        };

        let reason = match attempt {
            Ok((transport, authenticated)) => {
                backoff.reset();
                run_connected(&shared, transport, authenticated, &options, &events, &mut stop).await
            }
            Err(e) => e.to_string(),
        };

        shared.set_link(None);
        shared.set_state(ClientState::Disconnected);
        info!(target = %target, reason = %reason, "Disconnected");
        let _ = events.send(ClientEvent::Disconnected { reason });

        if *stop.borrow() {
            break;
        }
        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(&mut stop) => break,
        }
    }

    shared.set_link(None);
    shared.set_state(ClientState::Stopped);
    info!(target = %target, "Client stopped");
}

async fn establish(
    shared: &Shared,
    connector: &dyn Connector,
    options: &ClientOptions,
) -> Result<(Transport, Authenticated), WireError> {
    shared.set_state(ClientState::Connecting);
    let mut transport = connector.connect().await?;
    shared.set_state(ClientState::Authenticating);
    let authenticated = auth::authenticate(
        &mut transport,
        &options.secret,
        &options.identity,
        options.handshake_timeout,
    )
    .await?;
    Ok((transport, authenticated))
}

/// Run one authenticated connection until it fails or the client stops.
/// Returns the disconnect reason.
async fn run_connected(
    shared: &Shared,
    transport: Transport,
    authenticated: Authenticated,
    options: &ClientOptions,
    events: &mpsc::UnboundedSender<ClientEvent>,
    stop: &mut watch::Receiver<bool>,
) -> String {
    let Transport { sink, mut stream } = transport;
    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
    let broken = Arc::new(Notify::new());
    let token = authenticated.session_token;

    *shared.peer_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(authenticated.peer_id.clone());
    shared.set_link(Some(Link {
        sink: Arc::clone(&sink),
        token: token.clone(),
        broken: Arc::clone(&broken),
    }));
    shared.set_state(ClientState::Connected);
    info!(peer_id = %authenticated.peer_id, "Connected");
    let _ = events.send(ClientEvent::Connected {
        peer_id: authenticated.peer_id,
    });
    shared.flush_wake.notify_one();

    let reason = tokio::select! {
        reason = heartbeat_loop(&sink, &token, options.heartbeat_interval) => reason,
        reason = receive_loop(stream.as_mut(), events) => reason,
        reason = flush_loop(shared, &sink, &token, options.flush_spacing) => reason,
        _ = broken.notified() => "send failed".to_string(),
        _ = stopped(stop) => "client stopped".to_string(),
    };

    shared.set_link(None);
    sink.lock().await.close(Some(reason.clone())).await;
    reason
}

async fn heartbeat_loop(sink: &SharedSink, token: &str, interval: Duration) -> String {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let text = match WireMessage::heartbeat().with_token(token).encode() {
            Ok(text) => text,
            Err(e) => return format!("heartbeat encode failed: {e}"),
        };
        if let Err(e) = sink.lock().await.send(Frame::Text(text)).await {
            return format!("heartbeat send failed: {e}");
        }
    }
}

async fn receive_loop(
    stream: &mut dyn FrameStream,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> String {
    loop {
        let text = match stream.recv().await {
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Binary(_))) => {
                warn!("Dropping non-text frame");
                continue;
            }
            Some(Ok(Frame::Close(reason))) => {
                return format!(
                    "server closed connection{}",
                    reason.map(|r| format!(": {r}")).unwrap_or_default()
                );
            }
            None => return "server closed connection".to_string(),
            Some(Err(e)) => return e.to_string(),
        };
        let msg = match WireMessage::decode(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                continue;
            }
        };
        match &msg.message_type {
            MessageType::HeartbeatAck => debug!("Heartbeat acknowledged"),
            MessageType::Unknown(name) => {
                warn!(message_type = %name, "Unknown message type dropped");
            }
            t if t.is_handshake() || *t == MessageType::Heartbeat => {
                debug!(message_type = %t, "Ignoring control message");
            }
            _ => {
                let _ = events.send(ClientEvent::Message(msg));
            }
        }
    }
}

async fn flush_loop(shared: &Shared, sink: &SharedSink, token: &str, spacing: Duration) -> String {
    loop {
        let mut writer = sink.lock().await;
        // Popped under the sink lock so a direct send cannot overtake it, and
        // before sending so a send cut short by a disconnect is not repeated.
        let next = shared.queue().pop();
        let Some(pending) = next else {
            drop(writer);
            shared.flush_wake.notified().await;
            continue;
        };

        match pending.to_wire(token).encode() {
            Ok(text) => {
                if let Err(e) = writer.send(Frame::Text(text)).await {
                    shared.queue().requeue_front(pending);
                    return format!("flush failed: {e}");
                }
            }
            Err(e) => warn!(error = %e, "Dropping unencodable queued message"),
        }
        drop(writer);

        let remaining = shared.queue().len();
        debug!(message_type = %pending.message_type, remaining, "Flushed queued message");
        if remaining > 0 && !spacing.is_zero() {
            tokio::time::sleep(spacing).await;
        }
    }
}
