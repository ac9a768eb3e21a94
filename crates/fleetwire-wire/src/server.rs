//! Direct topology listener ("hub").
//!
//! The controller process listens and agents connect to it. Everything a
//! controller needs to observe arrives on the [`HubEvent`] channel returned
//! by [`Hub::start`]; commands go out through [`Hub::send_command`] and
//! [`Hub::broadcast_command`], which return plain counts and booleans rather
//! than errors when a peer is missing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{HandshakeError, WireError};
use crate::heartbeat;
use crate::listener::{self, ListenerSettings, SessionHandler};
use crate::message::{AgentSummary, MessageType, PeerRole, WireMessage};
use crate::registry::{Registry, Session};
use crate::transport::Transport;

/// Close reason used when the listener stops.
pub const SHUTDOWN_REASON: &str = "server shutdown";

/// Something the controller should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    PeerConnected { agent: AgentSummary },
    PeerDisconnected {
        peer_id: String,
        reason: String,
    },
    /// An application message from an agent, payload verbatim.
    Message {
        peer_id: String,
        message_type: MessageType,
        payload: Value,
    },
}

/// Receiving end of the hub's event stream.
pub type HubEvents = mpsc::UnboundedReceiver<HubEvent>;

struct HubCore {
    agents: Registry,
    events: mpsc::UnboundedSender<HubEvent>,
    accepting: AtomicBool,
}

impl HubCore {
    fn emit(&self, event: HubEvent) {
        if self.events.send(event).is_err() {
            debug!("Hub event receiver dropped");
        }
    }
}

#[async_trait]
impl SessionHandler for HubCore {
    fn roles(&self) -> &'static [PeerRole] {
        &[PeerRole::Agent]
    }

    fn registry(&self, _role: PeerRole) -> &Registry {
        &self.agents
    }

    fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn admit(&self, session: &Session) -> Result<(), HandshakeError> {
        if let Some(old) = listener::register_replacing(&self.agents, session)? {
            self.on_disconnected(&old, listener::REPLACED_REASON);
        }
        self.emit(HubEvent::PeerConnected {
            agent: session.summary(),
        });
        Ok(())
    }

    async fn on_message(&self, session: &Session, msg: WireMessage) {
        if let MessageType::Unknown(name) = &msg.message_type {
            warn!(peer_id = %session.peer_id, message_type = %name, "Unknown message type dropped");
            return;
        }
        if !msg.message_type.is_application() {
            debug!(
                peer_id = %session.peer_id,
                message_type = %msg.message_type,
                "Ignoring control message from agent"
            );
            return;
        }
        self.emit(HubEvent::Message {
            peer_id: session.peer_id.clone(),
            message_type: msg.message_type,
            payload: msg.payload,
        });
    }

    fn on_disconnected(&self, session: &Session, reason: &str) {
        self.emit(HubEvent::PeerDisconnected {
            peer_id: session.peer_id.clone(),
            reason: reason.to_string(),
        });
    }
}

/// The listening controller of the direct topology.
///
/// Cheap to clone; all clones drive the same listener.
#[derive(Clone)]
pub struct Hub {
    core: Arc<HubCore>,
    settings: Arc<ListenerSettings>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Hub {
    /// Create a hub and start its heartbeat monitor. Must run inside a tokio runtime.
    pub fn start(settings: ListenerSettings) -> (Self, HubEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let core = Arc::new(HubCore {
            agents: Registry::new(PeerRole::Agent, settings.duplicate_policy),
            events: events_tx,
            accepting: AtomicBool::new(true),
        });
        let monitor =
            heartbeat::spawn_monitor(Arc::clone(&core), settings.heartbeat.clone(), shutdown_rx);
        let hub = Self {
            core,
            settings: Arc::new(settings),
            shutdown: Arc::new(shutdown_tx),
            tasks: Arc::new(Mutex::new(vec![monitor])),
        };
        (hub, events_rx)
    }

    /// Serve the WebSocket endpoint at `path` on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr, path: &str) -> Result<SocketAddr, WireError> {
        let app = listener::router(Arc::clone(&self.core), Arc::clone(&self.settings), path);
        let (local, task) = listener::spawn_server(addr, app, self.shutdown.subscribe()).await?;
        self.track(task);
        Ok(local)
    }

    /// Serve an already-established transport, e.g. one half of a memory pair.
    pub fn accept(&self, transport: Transport, ip: impl Into<String>) {
        let core = Arc::clone(&self.core);
        let settings = Arc::clone(&self.settings);
        let ip = ip.into();
        let task = tokio::spawn(async move {
            listener::serve_connection(core, &settings, transport, ip).await;
        });
        self.track(task);
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Send a message to one agent. `false` if it is not connected.
    pub fn send_command(&self, peer_id: &str, message_type: MessageType, payload: Value) -> bool {
        let sent = self
            .core
            .agents
            .send_to(peer_id, &WireMessage::new(message_type.clone(), payload));
        if !sent {
            warn!(peer_id = %peer_id, message_type = %message_type, "Agent not connected");
        }
        sent
    }

    /// Send a message to every live agent. Returns how many it was queued for.
    pub fn broadcast_command(&self, message_type: MessageType, payload: Value) -> usize {
        let count = self
            .core
            .agents
            .broadcast(&WireMessage::new(message_type.clone(), payload));
        info!(message_type = %message_type, recipients = count, "Broadcast command");
        count
    }

    /// Close one agent's connection. `false` if it is not connected.
    pub fn disconnect_peer(&self, peer_id: &str) -> bool {
        match self.core.agents.lookup(peer_id) {
            Some(session) => listener::remove_session(
                self.core.as_ref(),
                PeerRole::Agent,
                peer_id,
                &session.session_token,
                "disconnected by controller",
            ),
            None => false,
        }
    }

    /// Snapshot of connected agents.
    pub fn peers(&self) -> Vec<AgentSummary> {
        self.core.agents.list().iter().map(Session::summary).collect()
    }

    pub fn peer(&self, peer_id: &str) -> Option<AgentSummary> {
        self.core.agents.lookup(peer_id).map(|s| s.summary())
    }

    pub fn peer_count(&self) -> usize {
        self.core.agents.len()
    }

    pub fn is_running(&self) -> bool {
        self.core.accepting()
    }

    /// Stop accepting, close every connection and cancel the monitor.
    pub fn stop(&self) {
        if !self.core.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let closed = listener::close_all(self.core.as_ref(), SHUTDOWN_REASON);
        info!(closed, "Hub stopped");
    }

    /// Wait for the listener and monitor tasks to finish after [`stop`](Self::stop).
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{self, ConnectorIdentity, SharedSecret};
    use crate::transport::{memory_pair, Frame};
    use fleetwire_types::{DuplicatePolicy, HeartbeatSettings};
    use serde_json::json;
    use std::time::Duration;

    fn settings(policy: DuplicatePolicy) -> ListenerSettings {
        ListenerSettings {
            secret: SharedSecret::new("a".repeat(32)).unwrap(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatSettings::default(),
            duplicate_policy: policy,
        }
    }

    async fn connect(hub: &Hub, id: &str) -> (Transport, String) {
        let (server, mut client) = memory_pair();
        hub.accept(server, "127.0.0.1");
        let identity = ConnectorIdentity::new(PeerRole::Agent, id).with_peer_id(id);
        let auth = auth::authenticate(
            &mut client,
            &SharedSecret::new("a".repeat(32)).unwrap(),
            &identity,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (client, auth.session_token)
    }

    async fn recv(client: &mut Transport) -> WireMessage {
        match client.stream.recv().await.unwrap().unwrap() {
            Frame::Text(text) => WireMessage::decode(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_event_and_send_command() {
        let (hub, mut events) = Hub::start(settings(DuplicatePolicy::Replace));
        let (mut client, _token) = connect(&hub, "w1").await;

        match events.recv().await.unwrap() {
            HubEvent::PeerConnected { agent } => {
                assert_eq!(agent.agent_id, "w1");
                assert_eq!(agent.ip, "127.0.0.1");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(hub.peer_count(), 1);

        assert!(hub.send_command("w1", MessageType::parse("get_status"), json!({"x": 1})));
        let msg = recv(&mut client).await;
        assert_eq!(msg.message_type.as_str(), "get_status");
        assert_eq!(msg.payload, json!({"x": 1}));

        assert!(!hub.send_command("nobody", MessageType::parse("stop"), json!({})));
        hub.stop();
    }

    #[tokio::test]
    async fn test_report_and_heartbeat_ack() {
        let (hub, mut events) = Hub::start(settings(DuplicatePolicy::Replace));
        let (mut client, token) = connect(&hub, "w1").await;
        events.recv().await.unwrap();

        let hb = WireMessage::heartbeat().with_token(&token);
        client.sink.send(Frame::Text(hb.encode().unwrap())).await.unwrap();
        assert_eq!(recv(&mut client).await.message_type, MessageType::HeartbeatAck);

        let report = WireMessage::new(MessageType::parse("scan_progress"), json!({"done": 3}))
            .with_token(&token);
        client.sink.send(Frame::Text(report.encode().unwrap())).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            HubEvent::Message {
                peer_id: "w1".into(),
                message_type: MessageType::parse("scan_progress"),
                payload: json!({"done": 3}),
            }
        );
        hub.stop();
    }

    #[tokio::test]
    async fn test_unknown_type_dropped_by_hub() {
        let (hub, mut events) = Hub::start(settings(DuplicatePolicy::Replace));
        let (mut client, token) = connect(&hub, "w1").await;
        events.recv().await.unwrap();

        for (name, n) in [("reboot", 1), ("scan_results", 2)] {
            let msg = WireMessage::new(MessageType::parse(name), json!({ "n": n }))
                .with_token(&token);
            client.sink.send(Frame::Text(msg.encode().unwrap())).await.unwrap();
        }
        match events.recv().await.unwrap() {
            HubEvent::Message { message_type, payload, .. } => {
                assert_eq!(message_type.as_str(), "scan_results");
                assert_eq!(payload, json!({"n": 2}));
            }
            other => panic!("unexpected event {other:?}"),
        }
        hub.stop();
    }

    #[tokio::test]
    async fn test_bad_token_is_not_honored() {
        let (hub, mut events) = Hub::start(settings(DuplicatePolicy::Replace));
        let (mut client, _token) = connect(&hub, "w1").await;
        events.recv().await.unwrap();

        let forged = WireMessage::new(MessageType::parse("scan_results"), json!({}))
            .with_token("forged");
        client.sink.send(Frame::Text(forged.encode().unwrap())).await.unwrap();
        assert_eq!(recv(&mut client).await.message_type, MessageType::Error);
        assert!(events.try_recv().is_err());
        hub.stop();
    }

    #[tokio::test]
    async fn test_disconnect_peer_fires_once() {
        let (hub, mut events) = Hub::start(settings(DuplicatePolicy::Replace));
        let (mut client, _token) = connect(&hub, "w1").await;
        events.recv().await.unwrap();

        assert!(hub.disconnect_peer("w1"));
        assert!(!hub.disconnect_peer("w1"));
        assert!(matches!(
            events.recv().await.unwrap(),
            HubEvent::PeerDisconnected { ref peer_id, .. } if peer_id == "w1"
        ));
        // The client sees the close frame and its stream ends.
        assert!(matches!(
            client.stream.recv().await,
            Some(Ok(Frame::Close(_)))
        ));
        hub.stop();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_replace_emits_disconnect_then_connect() {
        let (hub, mut events) = Hub::start(settings(DuplicatePolicy::Replace));
        let (_old, old_token) = connect(&hub, "w1").await;
        events.recv().await.unwrap();
        let (_new, new_token) = connect(&hub, "w1").await;
        assert_ne!(old_token, new_token);

        assert!(matches!(
            events.recv().await.unwrap(),
            HubEvent::PeerDisconnected { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            HubEvent::PeerConnected { .. }
        ));
        assert_eq!(hub.peer_count(), 1);
        hub.stop();
    }

    #[tokio::test]
    async fn test_duplicate_reject() {
        let (hub, mut events) = Hub::start(settings(DuplicatePolicy::Reject));
        let (_first, _) = connect(&hub, "w1").await;
        events.recv().await.unwrap();

        let (server, mut client) = memory_pair();
        hub.accept(server, "127.0.0.1");
        let identity = ConnectorIdentity::new(PeerRole::Agent, "w1").with_peer_id("w1");
        let err = auth::authenticate(
            &mut client,
            &SharedSecret::new("a".repeat(32)).unwrap(),
            &identity,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            crate::error::HandshakeError::Rejected("Peer already connected".into())
        );
        hub.stop();
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        use crate::client::{ClientEvent, ClientOptions, ClientState, Delivery, ReconnectingClient};
        use crate::transport::WsConnector;
        use std::sync::Arc;

        let (hub, mut events) = Hub::start(settings(DuplicatePolicy::Replace));
        let addr = hub
            .listen("127.0.0.1:0".parse().unwrap(), "/ws")
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);

        let connector = WsConnector::new(&addr.to_string(), "/ws").unwrap();
        let options = ClientOptions {
            secret: SharedSecret::new("a".repeat(32)).unwrap(),
            identity: ConnectorIdentity::new(PeerRole::Agent, "ws-agent").with_peer_id("ws-1"),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            queue_capacity: 10,
            flush_spacing: Duration::ZERO,
        };
        let (client, mut client_events) = ReconnectingClient::spawn(Arc::new(connector), options);
        client
            .wait_for_state(ClientState::Connected, Duration::from_secs(5))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            HubEvent::PeerConnected { agent } => {
                assert_eq!(agent.agent_id, "ws-1");
                assert_eq!(agent.name, "ws-agent");
                assert_eq!(agent.ip, "127.0.0.1");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let delivery = client
            .send(MessageType::parse("scan_progress"), json!({"done": 7}))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Sent);
        assert_eq!(
            events.recv().await.unwrap(),
            HubEvent::Message {
                peer_id: "ws-1".into(),
                message_type: MessageType::parse("scan_progress"),
                payload: json!({"done": 7}),
            }
        );

        assert!(hub.send_command("ws-1", MessageType::parse("get_status"), json!({"v": 1})));
        assert!(matches!(
            client_events.recv().await.unwrap(),
            ClientEvent::Connected { ref peer_id } if peer_id == "ws-1"
        ));
        match client_events.recv().await.unwrap() {
            ClientEvent::Message(msg) => {
                assert_eq!(msg.message_type.as_str(), "get_status");
                assert_eq!(msg.payload, json!({"v": 1}));
            }
            other => panic!("unexpected {other:?}"),
        }

        client.stop();
        client.join().await;
        assert!(matches!(
            events.recv().await.unwrap(),
            HubEvent::PeerDisconnected { ref peer_id, .. } if peer_id == "ws-1"
        ));
        hub.stop();
        hub.join().await;
    }

    #[tokio::test]
    async fn test_stop_closes_everyone() {
        let (hub, mut events) = Hub::start(settings(DuplicatePolicy::Replace));
        let (mut a, _) = connect(&hub, "a").await;
        let (_b, _) = connect(&hub, "b").await;
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        hub.stop();
        assert_eq!(hub.peer_count(), 0);
        assert!(!hub.is_running());
        assert_eq!(
            a.stream.recv().await.unwrap().unwrap(),
            Frame::Close(Some(SHUTDOWN_REASON.to_string()))
        );
        let mut reasons = Vec::new();
        for _ in 0..2 {
            if let HubEvent::PeerDisconnected { reason, .. } = events.recv().await.unwrap() {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec![SHUTDOWN_REASON, SHUTDOWN_REASON]);
        hub.join().await;
    }
}
