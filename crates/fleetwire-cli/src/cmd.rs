//! Subcommand implementations.

use crate::console::{self, ConsoleCommand};
use anyhow::Context;
use async_trait::async_trait;
use fleetwire_types::FleetConfig;
use fleetwire_wire::{
    outbound_type, serve_hub_events, AgentChannel, AgentSummary, ClientOptions, CommandHandler,
    ControllerHandler, Hub, ListenerSettings, MessageType, PeerRole, Relay, RelayController,
    WsConnector,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

pub async fn run_relay(config: FleetConfig) -> anyhow::Result<()> {
    let settings = ListenerSettings::from_config(&config)?;
    let addr = config.listen.socket_addr()?;
    let relay = Relay::start(settings);
    let bound = relay.listen(addr, &config.listen.path).await?;
    info!(addr = %bound, path = %config.listen.path, "Relay listening");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down relay");
    relay.stop();
    relay.join().await;
    Ok(())
}

pub async fn run_controller(config: FleetConfig, listen: bool) -> anyhow::Result<()> {
    let plane = match config.client.connect.clone().filter(|_| !listen) {
        Some(target) => {
            let connector = WsConnector::new(&target, &config.listen.path)?;
            let options = ClientOptions::from_config(&config, PeerRole::Controller)?;
            let (controller, events) = RelayController::connect(Arc::new(connector), options);
            controller.serve(events, Arc::new(Reporter));
            info!(relay = %target, "Controller attached to relay");
            ControlPlane::Relay(controller)
        }
        None => {
            let settings = ListenerSettings::from_config(&config)?;
            let addr = config.listen.socket_addr()?;
            let (hub, events) = Hub::start(settings);
            let bound = hub.listen(addr, &config.listen.path).await?;
            serve_hub_events(events, Arc::new(Reporter));
            info!(addr = %bound, path = %config.listen.path, "Controller listening for agents");
            ControlPlane::Direct(hub)
        }
    };

    let result = console_loop(&plane).await;
    plane.shutdown().await;
    result
}

pub async fn run_agent(config: FleetConfig) -> anyhow::Result<()> {
    let target = config
        .client
        .connect
        .clone()
        .context("no target: pass --connect HOST:PORT or set client.connect")?;
    let connector = WsConnector::new(&target, &config.listen.path)?;
    let options = ClientOptions::from_config(&config, PeerRole::Agent)?;
    let (channel, events) = AgentChannel::connect(Arc::new(connector), options);
    let worker = channel.serve(events, Arc::new(DemoAgent::new()));
    info!(target = %target, name = %config.client.display_name, "Agent started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down agent");
    channel.stop();
    channel.client().join().await;
    let _ = worker.await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Controller console
// ---------------------------------------------------------------------------

enum ControlPlane {
    Direct(Hub),
    Relay(RelayController),
}

impl ControlPlane {
    async fn send(&self, message_type: &str, payload: Value, target: Option<&str>) {
        match self {
            Self::Direct(hub) => {
                let t = match outbound_type(message_type) {
                    Ok(t) => t,
                    Err(e) => {
                        println!("error: {e}");
                        return;
                    }
                };
                match target {
                    Some(peer) => {
                        if hub.send_command(peer, t, payload) {
                            println!("sent to {peer}");
                        } else {
                            println!("agent {peer} is not connected");
                        }
                    }
                    None => println!("sent to {} agent(s)", hub.broadcast_command(t, payload)),
                }
            }
            Self::Relay(controller) => {
                match controller.send_command(message_type, payload, target).await {
                    Ok(delivery) => println!("{delivery:?}"),
                    Err(e) => println!("error: {e}"),
                }
            }
        }
    }

    fn agents(&self) -> Vec<AgentSummary> {
        match self {
            Self::Direct(hub) => hub.peers(),
            Self::Relay(controller) => controller.agents(),
        }
    }

    fn kick(&self, peer_id: &str) {
        match self {
            Self::Direct(hub) if hub.disconnect_peer(peer_id) => println!("disconnected {peer_id}"),
            Self::Direct(_) => println!("agent {peer_id} is not connected"),
            Self::Relay(_) => println!("kick is only available when listening directly"),
        }
    }

    async fn shutdown(&self) {
        match self {
            Self::Direct(hub) => {
                hub.stop();
                hub.join().await;
            }
            Self::Relay(controller) => {
                controller.stop();
                controller.client().join().await;
            }
        }
    }
}

fn print_agents(agents: &[AgentSummary]) {
    if agents.is_empty() {
        println!("no agents connected");
        return;
    }
    for agent in agents {
        println!(
            "{:<34} {:<20} {:<16} {}",
            agent.agent_id, agent.name, agent.ip, agent.status
        );
    }
}

async fn console_loop(plane: &ControlPlane) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", console::HELP);
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                return Ok(());
            }
        };
        let Some(line) = line else {
            // stdin closed; keep serving until interrupted.
            tokio::signal::ctrl_c().await?;
            return Ok(());
        };
        match console::parse(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Send {
                message_type,
                payload,
                target,
            })) => plane.send(&message_type, payload, target.as_deref()).await,
            Ok(Some(ConsoleCommand::List)) => print_agents(&plane.agents()),
            Ok(Some(ConsoleCommand::Kick(peer_id))) => plane.kick(&peer_id),
            Ok(Some(ConsoleCommand::Help)) => println!("{}", console::HELP),
            Ok(Some(ConsoleCommand::Quit)) => return Ok(()),
            Err(e) => println!("{e}"),
        }
    }
}

/// Logs everything agents report.
struct Reporter;

#[async_trait]
impl ControllerHandler for Reporter {
    async fn on_message(&self, peer_id: &str, message_type: &MessageType, payload: Value) {
        info!(peer_id = %peer_id, message_type = %message_type, payload = %payload, "Report");
    }

    fn on_agent_connected(&self, agent: &AgentSummary) {
        info!(peer_id = %agent.agent_id, name = %agent.name, ip = %agent.ip, "Agent connected");
    }

    fn on_agent_disconnected(&self, peer_id: &str, reason: &str) {
        info!(peer_id = %peer_id, reason = %reason, "Agent disconnected");
    }
}

// ---------------------------------------------------------------------------
// Demo agent
// ---------------------------------------------------------------------------

/// Answers `get_status` and logs every other command.
struct DemoAgent {
    started: Instant,
}

impl DemoAgent {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    fn status(&self) -> Value {
        json!({
            "status": "idle",
            "uptime_secs": self.started.elapsed().as_secs(),
        })
    }
}

#[async_trait]
impl CommandHandler for DemoAgent {
    async fn on_command(&self, command_type: &MessageType, payload: Value, channel: &AgentChannel) {
        if command_type.as_str() == "get_status" {
            if let Err(e) = channel.send_stats("status_update", self.status()).await {
                warn!(error = %e, "Failed to send status");
            }
            return;
        }
        info!(command = %command_type, payload = %payload, "Command received");
        let note = format!("received {command_type}");
        if let Err(e) = channel.send_log("info", &note).await {
            warn!(error = %e, "Failed to send log");
        }
    }

    fn on_connected(&self, peer_id: &str) {
        info!(peer_id = %peer_id, "Connected");
    }

    fn on_disconnected(&self, reason: &str) {
        warn!(reason = %reason, "Connection lost, reconnecting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_config() -> FleetConfig {
        let mut config = FleetConfig::default();
        config.auth.shared_secret = "s".repeat(32);
        config
    }

    #[tokio::test]
    async fn test_direct_plane_send_and_kick_without_agents() {
        let settings = ListenerSettings::from_config(&direct_config()).unwrap();
        let (hub, _events) = Hub::start(settings);
        let plane = ControlPlane::Direct(hub.clone());

        plane.send("get_status", json!({}), Some("nobody")).await;
        plane.send("get_status", json!({"verbose": true}), None).await;
        plane.send("auth_success", json!({}), None).await;
        plane.kick("nobody");
        assert!(plane.agents().is_empty());

        plane.shutdown().await;
        assert!(!hub.is_running());
    }

    #[test]
    fn test_demo_status_shape() {
        let status = DemoAgent::new().status();
        assert_eq!(status["status"], "idle");
        assert!(status["uptime_secs"].is_u64());
    }
}
