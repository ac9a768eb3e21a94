//! Relay: a neutral listener that bridges controllers and agents.
//!
//! Both roles connect out to the relay and authenticate with the same shared
//! secret. The relay keeps one [`Registry`] per role and routes by sender:
//!
//! - controller message with `target_agent_id`: unicast to that agent, tagged
//!   with `source_controller`; an `error` goes back if the agent is not live;
//! - controller message without a target: broadcast to every live agent;
//! - agent message: broadcast to every live controller, tagged with
//!   `source_agent_id` / `source_agent_name`.
//!
//! Payloads are opaque: any type that is not part of the protocol itself is
//! forwarded, including names this crate does not recognise. Protocol types
//! sent by a peer are answered with an `error`.
//!
//! The routing field is stripped before forwarding so an agent sees the same
//! payload it would get from a direct hub. Agent arrivals and departures are
//! pushed to controllers, and a new controller first gets an `agent_list`.
//! Presence changes and controller admission are serialized so no
//! `agent_connected` or `agent_disconnected` can overtake that snapshot or
//! fall between it and the controller's registration.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{HandshakeError, WireError};
use crate::heartbeat;
use crate::listener::{self, ListenerSettings, SessionHandler, REPLACED_REASON};
use crate::message::{
    AgentDisconnectedPayload, AgentListPayload, AgentSummary, MessageType, PeerRole,
    WireMessage, TARGET_AGENT_FIELD,
};
use crate::registry::{Registry, Session};
use crate::server::SHUTDOWN_REASON;
use crate::transport::Transport;

/// Outcome of routing one controller message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to the named agent.
    Unicast(String),
    /// The named agent is not live; the sender got an `error`.
    TargetMissing(String),
    /// Queued for this many agents or controllers.
    Broadcast(usize),
    /// A protocol message the relay does not route; the sender got an `error`.
    Refused,
}

/// Remove the routing field from a payload.
pub fn strip_target(payload: &mut Value) {
    if let Value::Object(map) = payload {
        map.remove(TARGET_AGENT_FIELD);
    }
}

fn forwardable(msg: &WireMessage) -> WireMessage {
    let mut forwarded = msg.clone();
    forwarded.session_token = None;
    forwarded
}

/// Whether the relay forwards messages of this type between peers.
fn routable(message_type: &MessageType) -> bool {
    matches!(
        message_type,
        MessageType::Command(_) | MessageType::Report(_) | MessageType::Unknown(_)
    )
}

fn refuse(sender: &Session, msg: &WireMessage) -> RouteOutcome {
    warn!(
        peer_id = %sender.peer_id,
        message_type = %msg.message_type,
        "Refusing to route protocol message"
    );
    sender.send(&WireMessage::error(format!(
        "Message type {} cannot be routed",
        msg.message_type
    )));
    RouteOutcome::Refused
}

struct RelayCore {
    controllers: Registry,
    agents: Registry,
    accepting: AtomicBool,
    /// Held while admitting a controller or announcing agent presence.
    presence: Mutex<()>,
}

impl RelayCore {
    fn agent_list(&self) -> WireMessage {
        let agents: Vec<AgentSummary> = self.agents.list().iter().map(Session::summary).collect();
        WireMessage::new(
            MessageType::AgentList,
            serde_json::to_value(AgentListPayload { agents }).unwrap_or_default(),
        )
    }

    fn route_from_controller(&self, controller: &Session, msg: &WireMessage) -> RouteOutcome {
        if !routable(&msg.message_type) {
            return refuse(controller, msg);
        }

        let mut forwarded = forwardable(msg);
        forwarded.source_controller = Some(controller.peer_id.clone());

        match msg.target_agent_id() {
            Some(target) => {
                let target = target.to_string();
                strip_target(&mut forwarded.payload);
                forwarded.extra.remove(TARGET_AGENT_FIELD);
                if self.agents.send_to(&target, &forwarded) {
                    debug!(
                        controller = %controller.peer_id,
                        agent = %target,
                        message_type = %msg.message_type,
                        "Unicast forwarded"
                    );
                    RouteOutcome::Unicast(target)
                } else {
                    warn!(
                        controller = %controller.peer_id,
                        agent = %target,
                        "Unicast target not connected"
                    );
                    controller.send(&WireMessage::error(format!("Agent {target} not found")));
                    RouteOutcome::TargetMissing(target)
                }
            }
            None => {
                let count = self.agents.broadcast(&forwarded);
                debug!(
                    controller = %controller.peer_id,
                    message_type = %msg.message_type,
                    recipients = count,
                    "Broadcast to agents"
                );
                RouteOutcome::Broadcast(count)
            }
        }
    }

    fn route_from_agent(&self, agent: &Session, msg: &WireMessage) -> RouteOutcome {
        if !routable(&msg.message_type) {
            return refuse(agent, msg);
        }
        let mut forwarded = forwardable(msg);
        forwarded.source_agent_id = Some(agent.peer_id.clone());
        forwarded.source_agent_name = Some(agent.display_name.clone());
        RouteOutcome::Broadcast(self.controllers.broadcast(&forwarded))
    }

    fn announce_arrival(&self, agent: &Session) {
        let notice = WireMessage::new(
            MessageType::AgentConnected,
            serde_json::to_value(agent.summary()).unwrap_or_default(),
        );
        let count = self.controllers.broadcast(&notice);
        debug!(agent = %agent.peer_id, controllers = count, "Announced agent");
    }

    fn announce_departure(&self, agent: &Session, reason: &str) {
        let notice = WireMessage::new(
            MessageType::AgentDisconnected,
            serde_json::to_value(AgentDisconnectedPayload {
                agent_id: agent.peer_id.clone(),
                name: agent.display_name.clone(),
                reason: reason.to_string(),
            })
            .unwrap_or_default(),
        );
        self.controllers.broadcast(&notice);
    }

    fn lock_presence(&self) -> std::sync::MutexGuard<'_, ()> {
        self.presence.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SessionHandler for RelayCore {
    fn roles(&self) -> &'static [PeerRole] {
        &[PeerRole::Controller, PeerRole::Agent]
    }

    fn registry(&self, role: PeerRole) -> &Registry {
        match role {
            PeerRole::Controller => &self.controllers,
            PeerRole::Agent => &self.agents,
        }
    }

    fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn admit(&self, session: &Session) -> Result<(), HandshakeError> {
        let _presence = self.lock_presence();
        match session.role {
            PeerRole::Controller => {
                // Queued before the controller is visible to presence broadcasts.
                session.send(&self.agent_list());
                if let Some(old) = listener::register_replacing(&self.controllers, session)? {
                    debug!(peer_id = %old.peer_id, "Controller session replaced");
                }
            }
            PeerRole::Agent => {
                if let Some(old) = listener::register_replacing(&self.agents, session)? {
                    self.announce_departure(&old, REPLACED_REASON);
                }
                self.announce_arrival(session);
            }
        }
        Ok(())
    }

    async fn on_message(&self, session: &Session, msg: WireMessage) {
        match session.role {
            PeerRole::Controller => self.route_from_controller(session, &msg),
            PeerRole::Agent => self.route_from_agent(session, &msg),
        };
    }

    fn on_disconnected(&self, session: &Session, reason: &str) {
        if session.role != PeerRole::Agent {
            return;
        }
        let _presence = self.lock_presence();
        self.announce_departure(session, reason);
    }
}

/// The relay listener. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    core: Arc<RelayCore>,
    settings: Arc<ListenerSettings>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Relay {
    /// Create a relay and start its heartbeat monitor. Must run inside a tokio runtime.
    pub fn start(settings: ListenerSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let core = Arc::new(RelayCore {
            controllers: Registry::new(PeerRole::Controller, settings.duplicate_policy),
            agents: Registry::new(PeerRole::Agent, settings.duplicate_policy),
            accepting: AtomicBool::new(true),
            presence: Mutex::new(()),
        });
        let monitor =
            heartbeat::spawn_monitor(Arc::clone(&core), settings.heartbeat.clone(), shutdown_rx);
        Self {
            core,
            settings: Arc::new(settings),
            shutdown: Arc::new(shutdown_tx),
            tasks: Arc::new(Mutex::new(vec![monitor])),
        }
    }

    /// Serve the WebSocket endpoint at `path` on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr, path: &str) -> Result<SocketAddr, WireError> {
        let app = listener::router(Arc::clone(&self.core), Arc::clone(&self.settings), path);
        let (local, task) = listener::spawn_server(addr, app, self.shutdown.subscribe()).await?;
        self.track(task);
        Ok(local)
    }

    /// Serve an already-established transport.
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

    pub fn agents(&self) -> Vec<AgentSummary> {
        self.core.agents.list().iter().map(Session::summary).collect()
    }

    pub fn agent_count(&self) -> usize {
        self.core.agents.len()
    }

    pub fn controller_count(&self) -> usize {
        self.core.controllers.len()
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
        info!(closed, "Relay stopped");
    }

    /// Wait for the listener and monitor tasks after [`stop`](Self::stop).
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
