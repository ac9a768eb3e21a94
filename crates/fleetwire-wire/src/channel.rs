//! Command/stats channel: the contract collaborators program against.
//!
//! Agent side: implement [`CommandHandler`] and hand it to
//! [`AgentChannel::serve`]. Every inbound command reaches
//! [`CommandHandler::on_command`] with its payload untouched; results go back
//! through [`AgentChannel::send_stats`] and [`AgentChannel::send_log`].
//!
//! Controller side: implement [`ControllerHandler`]. For the direct topology
//! feed it the hub's events with [`serve_hub_events`]; behind a relay use
//! [`RelayController`], which also keeps a live view of connected agents.
//!
//! Handlers run on their own task, fed through a channel, never inside the
//! connection's activities. Long-running work belongs on a separate thread
//! or task that reports back through the channel.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{
    ClientEvent, ClientEvents, ClientHandle, ClientOptions, Delivery, ReconnectingClient,
};
use crate::error::WireError;
use crate::message::{
    log_message_type, unix_timestamp, AgentDisconnectedPayload, AgentListPayload, AgentSummary,
    MessageType, PeerRole, WireMessage, TARGET_AGENT_FIELD,
};
use crate::server::{HubEvent, HubEvents};
use crate::transport::Connector;

/// Agent-side collaborator.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// A command from a controller. `payload` is exactly what the controller sent.
    async fn on_command(&self, command_type: &MessageType, payload: Value, channel: &AgentChannel);

    /// The channel authenticated.
    fn on_connected(&self, _peer_id: &str) {}

    /// The channel lost its connection and is reconnecting.
    fn on_disconnected(&self, _reason: &str) {}
}

/// Controller-side collaborator.
#[async_trait]
pub trait ControllerHandler: Send + Sync + 'static {
    /// A message from an agent, attributed to its peer id.
    async fn on_message(&self, peer_id: &str, message_type: &MessageType, payload: Value);

    fn on_agent_connected(&self, _agent: &AgentSummary) {}

    fn on_agent_disconnected(&self, _peer_id: &str, _reason: &str) {}

    /// A routing error reported back by a relay.
    fn on_error(&self, message: &str) {
        warn!(error = %message, "Relay reported an error");
    }
}

/// Parse an outbound type name, refusing names the listener would drop.
pub fn outbound_type(name: &str) -> Result<MessageType, WireError> {
    match MessageType::parse(name) {
        MessageType::Unknown(name) => Err(WireError::Protocol(format!(
            "unknown message type '{name}'"
        ))),
        t if !t.is_application() => Err(WireError::Protocol(format!(
            "'{t}' is reserved for the protocol"
        ))),
        t => Ok(t),
    }
}

// ---------------------------------------------------------------------------
// Agent side
// ---------------------------------------------------------------------------

/// An agent's connection to its controller or relay.
#[derive(Clone)]
pub struct AgentChannel {
    client: ClientHandle,
}

impl AgentChannel {
    /// Start connecting. The identity's role is forced to agent.
    pub fn connect(
        connector: Arc<dyn Connector>,
        mut options: ClientOptions,
    ) -> (Self, ClientEvents) {
        options.identity.role = PeerRole::Agent;
        let (client, events) = ReconnectingClient::spawn(connector, options);
        (Self { client }, events)
    }

    /// Wrap an already running client.
    pub fn from_client(client: ClientHandle) -> Self {
        Self { client }
    }

    /// Send a result (`*_progress`, `*_stats`, `*_results`, `status_update`, ...).
    pub async fn send_stats(
        &self,
        report_type: &str,
        payload: Value,
    ) -> Result<Delivery, WireError> {
        let message_type = outbound_type(report_type)?;
        self.client.send(message_type, payload).await
    }

    /// Send a log line upstream as `log_info`, `log_warning` or `log_error`.
    pub async fn send_log(&self, level: &str, message: &str) -> Result<Delivery, WireError> {
        let payload = json!({
            "level": level,
            "message": message,
            "timestamp": unix_timestamp(),
        });
        self.client.send(log_message_type(level), payload).await
    }

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub fn stop(&self) {
        self.client.stop();
    }

    /// Deliver `events` to `handler` on a dedicated task until the client stops.
    pub fn serve<H: CommandHandler>(
        &self,
        mut events: ClientEvents,
        handler: Arc<H>,
    ) -> JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ClientEvent::Connected { peer_id } => handler.on_connected(&peer_id),
                    ClientEvent::Disconnected { reason } => handler.on_disconnected(&reason),
                    ClientEvent::Message(msg) => match msg.message_type {
                        MessageType::Error => {
                            warn!(payload = %msg.payload, "Listener reported an error");
                        }
                        ref t if t.is_application() => {
                            handler.on_command(t, msg.payload, &channel).await;
                        }
                        ref t => debug!(message_type = %t, "Ignoring control message"),
                    },
                }
            }
            debug!("Agent channel event stream ended");
        })
    }
}

// ---------------------------------------------------------------------------
// Controller side, direct topology
// ---------------------------------------------------------------------------

/// Deliver hub events to `handler` on a dedicated task.
pub fn serve_hub_events<H: ControllerHandler>(
    mut events: HubEvents,
    handler: Arc<H>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                HubEvent::PeerConnected { agent } => handler.on_agent_connected(&agent),
                HubEvent::PeerDisconnected { peer_id, reason } => {
                    handler.on_agent_disconnected(&peer_id, &reason)
                }
                HubEvent::Message {
                    peer_id,
                    message_type,
                    payload,
                } => handler.on_message(&peer_id, &message_type, payload).await,
            }
        }
        debug!("Hub event stream ended");
    })
}

// ---------------------------------------------------------------------------
// Controller side, relayed topology
// ---------------------------------------------------------------------------

/// A controller connected to a relay as a reconnecting client.
///
/// Keeps a cache of live agents from `agent_list`, `agent_connected` and
/// `agent_disconnected`. The cache is cleared when the relay connection drops
/// and rebuilt from the snapshot sent on reconnect.
#[derive(Clone)]
pub struct RelayController {
    client: ClientHandle,
    agents: Arc<DashMap<String, AgentSummary>>,
}

impl RelayController {
    /// Start connecting. The identity's role is forced to controller.
    pub fn connect(
        connector: Arc<dyn Connector>,
        mut options: ClientOptions,
    ) -> (Self, ClientEvents) {
        options.identity.role = PeerRole::Controller;
        let (client, events) = ReconnectingClient::spawn(connector, options);
        (
            Self {
                client,
                agents: Arc::new(DashMap::new()),
            },
            events,
        )
    }

    /// Send a command to one agent (`target = Some`) or to all of them.
    ///
    /// The target travels in the payload's `target_agent_id`, which the relay
    /// strips before forwarding.
    pub async fn send_command(
        &self,
        command_type: &str,
        mut payload: Value,
        target: Option<&str>,
    ) -> Result<Delivery, WireError> {
        let message_type = outbound_type(command_type)?;
        if let Some(target) = target {
            if payload.is_null() {
                payload = Value::Object(Map::new());
            }
            let Some(map) = payload.as_object_mut() else {
                return Err(WireError::Protocol(
                    "a targeted command needs an object payload".to_string(),
                ));
            };
            map.insert(
                TARGET_AGENT_FIELD.to_string(),
                Value::String(target.to_string()),
            );
        }
        self.client.send(message_type, payload).await
    }

    /// Snapshot of live agents as last reported by the relay.
    pub fn agents(&self) -> Vec<AgentSummary> {
        self.agents.iter().map(|a| a.value().clone()).collect()
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentSummary> {
        self.agents.get(agent_id).map(|a| a.value().clone())
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub fn stop(&self) {
        self.client.stop();
    }

    /// Deliver `events` to `handler` on a dedicated task, keeping the agent
    /// cache current.
    pub fn serve<H: ControllerHandler>(
        &self,
        mut events: ClientEvents,
        handler: Arc<H>,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                controller.handle_event(event, handler.as_ref()).await;
            }
            debug!("Relay controller event stream ended");
        })
    }

    async fn handle_event<H: ControllerHandler + ?Sized>(&self, event: ClientEvent, handler: &H) {
        match event {
            ClientEvent::Connected { peer_id } => {
                info!(peer_id = %peer_id, "Connected to relay");
            }
            ClientEvent::Disconnected { reason } => {
                let lost: Vec<String> = self.agents.iter().map(|a| a.key().clone()).collect();
                self.agents.clear();
                for agent_id in lost {
                    handler.on_agent_disconnected(&agent_id, "relay connection lost");
                }
                debug!(reason = %reason, "Relay connection down");
            }
            ClientEvent::Message(msg) => self.handle_message(msg, handler).await,
        }
    }

    async fn handle_message<H: ControllerHandler + ?Sized>(&self, msg: WireMessage, handler: &H) {
        match msg.message_type {
            MessageType::AgentList => {
                let list: AgentListPayload = match serde_json::from_value(msg.payload) {
                    Ok(list) => list,
                    Err(e) => {
                        warn!(error = %e, "Malformed agent_list");
                        return;
                    }
                };
                let listed: Vec<String> = list.agents.iter().map(|a| a.agent_id.clone()).collect();
                let stale: Vec<String> = self
                    .agents
                    .iter()
                    .filter(|a| !listed.contains(a.key()))
                    .map(|a| a.key().clone())
                    .collect();
                for agent_id in stale {
                    self.agents.remove(&agent_id);
                    handler.on_agent_disconnected(&agent_id, "not in agent list");
                }
                for agent in list.agents {
                    let known = self.agents.contains_key(&agent.agent_id);
                    self.agents.insert(agent.agent_id.clone(), agent.clone());
                    if !known {
                        handler.on_agent_connected(&agent);
                    }
                }
                info!(agents = self.agents.len(), "Agent list received");
            }
            MessageType::AgentConnected => {
                match serde_json::from_value::<AgentSummary>(msg.payload) {
                    Ok(agent) => {
                        info!(agent_id = %agent.agent_id, name = %agent.name, "Agent connected");
                        self.agents.insert(agent.agent_id.clone(), agent.clone());
                        handler.on_agent_connected(&agent);
                    }
                    Err(e) => warn!(error = %e, "Malformed agent_connected"),
                }
            }
            MessageType::AgentDisconnected => {
                match serde_json::from_value::<AgentDisconnectedPayload>(msg.payload) {
                    Ok(gone) => {
                        info!(
                            agent_id = %gone.agent_id,
                            reason = %gone.reason,
                            "Agent disconnected"
                        );
                        self.agents.remove(&gone.agent_id);
                        handler.on_agent_disconnected(&gone.agent_id, &gone.reason);
                    }
                    Err(e) => warn!(error = %e, "Malformed agent_disconnected"),
                }
            }
            MessageType::Error => {
                let text = msg
                    .field_str("message")
                    .unwrap_or("unspecified error")
                    .to_string();
                handler.on_error(&text);
            }
            ref t if t.is_application() => {
                let Some(peer_id) = msg.source_agent_id.clone() else {
                    warn!(message_type = %t, "Relayed message without source agent");
                    return;
                };
                handler.on_message(&peer_id, t, msg.payload).await;
            }
            ref t => debug!(message_type = %t, "Ignoring control message"),
        }
    }
}
