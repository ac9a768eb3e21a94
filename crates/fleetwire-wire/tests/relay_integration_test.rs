//! End-to-end tests for the relay topology.
//!
//! Controllers and agents are raw connectors driving the real handshake
//! against a [`Relay`] over in-process transports, so every frame goes
//! through the same listener core a WebSocket connection would.

use std::time::Duration;

use fleetwire_types::{DuplicatePolicy, HeartbeatSettings};
use fleetwire_wire::auth::{authenticate, ConnectorIdentity, SharedSecret};
use fleetwire_wire::transport::Frame;
use fleetwire_wire::{
    memory_pair, HandshakeError, Hub, HubEvent, ListenerSettings, MessageType, PeerRole, Relay,
    Transport, WireMessage,
};
use serde_json::{json, Value};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn secret() -> SharedSecret {
    SharedSecret::new("a".repeat(32)).unwrap()
}

fn settings(interval_secs: u64, timeout_secs: u64) -> ListenerSettings {
    ListenerSettings {
        secret: secret(),
        handshake_timeout: Duration::from_secs(10),
        heartbeat: HeartbeatSettings {
            interval_secs,
            timeout_secs,
        },
        duplicate_policy: DuplicatePolicy::Replace,
    }
}

/// A connector that has completed the handshake.
struct Peer {
    transport: Transport,
    token: String,
    peer_id: String,
}

impl Peer {
    /// Next decoded frame, skipping heartbeat acks. `None` once closed.
    async fn recv(&mut self) -> Option<WireMessage> {
        loop {
            match self.transport.stream.recv().await? {
                Ok(Frame::Text(text)) => {
                    let msg = WireMessage::decode(&text).unwrap();
                    if msg.message_type != MessageType::HeartbeatAck {
                        return Some(msg);
                    }
                }
                Ok(Frame::Close(_)) | Err(_) => return None,
                Ok(Frame::Binary(_)) => {}
            }
        }
    }

    async fn next(&mut self) -> WireMessage {
        tokio::time::timeout(Duration::from_secs(5), self.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
    }

    async fn send(&mut self, message_type: &str, payload: Value) {
        let msg = WireMessage::new(MessageType::parse(message_type), payload)
            .with_token(self.token.clone());
        self.transport
            .sink
            .send(Frame::Text(msg.encode().unwrap()))
            .await
            .unwrap();
    }

    async fn heartbeat(&mut self) {
        let msg = WireMessage::heartbeat().with_token(self.token.clone());
        self.transport
            .sink
            .send(Frame::Text(msg.encode().unwrap()))
            .await
            .unwrap();
    }
}

async fn handshake(
    accept: impl FnOnce(Transport),
    secret: &SharedSecret,
    identity: ConnectorIdentity,
) -> Result<Peer, HandshakeError> {
    let (mut client, server) = memory_pair();
    accept(server);
    let auth = authenticate(&mut client, secret, &identity, Duration::from_secs(5)).await?;
    Ok(Peer {
        transport: client,
        token: auth.session_token,
        peer_id: auth.peer_id,
    })
}

async fn join_relay(relay: &Relay, role: PeerRole, name: &str, peer_id: Option<&str>) -> Peer {
    let mut identity = ConnectorIdentity::new(role, name);
    if let Some(id) = peer_id {
        identity = identity.with_peer_id(id);
    }
    handshake(|t| relay.accept(t, "127.0.0.1"), &secret(), identity)
        .await
        .unwrap()
}

/// A controller that has consumed its initial agent list.
async fn join_controller(relay: &Relay) -> Peer {
    let mut ctl = join_relay(relay, PeerRole::Controller, "ctl", None).await;
    assert_eq!(ctl.next().await.message_type, MessageType::AgentList);
    ctl
}

/// Join an agent and wait until `ctl` has seen it arrive.
async fn join_agent(relay: &Relay, ctl: &mut Peer, id: &str) -> Peer {
    let agent = join_relay(relay, PeerRole::Agent, &format!("{id}-name"), Some(id)).await;
    let joined = ctl.next().await;
    assert_eq!(joined.message_type, MessageType::AgentConnected);
    assert_eq!(joined.payload["agent_id"], id);
    agent
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_handshake_with_right_and_wrong_secret() {
    let relay = Relay::start(settings(30, 60));

    let ok = join_relay(&relay, PeerRole::Agent, "good", Some("agent-1")).await;
    assert_eq!(ok.peer_id, "agent-1");
    assert_eq!(ok.token.len(), 64);

    let wrong = SharedSecret::new("b".repeat(32)).unwrap();
    let err = handshake(
        |t| relay.accept(t, "127.0.0.1"),
        &wrong,
        ConnectorIdentity::new(PeerRole::Agent, "bad"),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err, HandshakeError::Rejected("Invalid credentials".to_string()));
    assert_eq!(relay.agent_count(), 1);

    relay.stop();
    relay.join().await;
}

#[tokio::test]
async fn test_controller_sees_existing_agents() {
    let relay = Relay::start(settings(30, 60));
    let _a = join_relay(&relay, PeerRole::Agent, "alpha", Some("a")).await;
    let _b = join_relay(&relay, PeerRole::Agent, "beta", Some("b")).await;

    let mut ctl = join_relay(&relay, PeerRole::Controller, "ctl", None).await;
    let list = ctl.next().await;
    assert_eq!(list.message_type, MessageType::AgentList);
    let mut ids: Vec<String> = list.payload["agents"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["agent_id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);

    relay.stop();
}

#[tokio::test]
async fn test_unicast_reaches_exactly_the_target() {
    let relay = Relay::start(settings(30, 60));
    let mut ctl = join_controller(&relay).await;
    let mut a = join_agent(&relay, &mut ctl, "a").await;
    let mut b = join_agent(&relay, &mut ctl, "b").await;

    ctl.send("start_scan", json!({"target_agent_id": "b", "urls": ["https://x"]}))
        .await;
    let got = b.next().await;
    assert_eq!(got.message_type.as_str(), "start_scan");
    assert_eq!(got.payload, json!({"urls": ["https://x"]}));
    assert_eq!(got.source_controller.as_deref(), Some(ctl.peer_id.as_str()));
    assert!(got.session_token.is_none());

    // The first thing `a` sees is the later broadcast, not the unicast.
    ctl.send("get_status", json!({})).await;
    assert_eq!(a.next().await.message_type.as_str(), "get_status");
    assert_eq!(b.next().await.message_type.as_str(), "get_status");

    relay.stop();
}

#[tokio::test]
async fn test_missing_target_reports_error_to_sender() {
    let relay = Relay::start(settings(30, 60));
    let mut ctl = join_controller(&relay).await;

    ctl.send("stop", json!({"target_agent_id": "ghost"})).await;
    let reply = ctl.next().await;
    assert_eq!(reply.message_type, MessageType::Error);
    assert_eq!(reply.payload["message"], "Agent ghost not found");

    relay.stop();
}

#[tokio::test]
async fn test_broadcast_reaches_only_live_agents() {
    let relay = Relay::start(settings(30, 60));
    let mut ctl = join_controller(&relay).await;
    let mut a = join_agent(&relay, &mut ctl, "a").await;
    let b = join_agent(&relay, &mut ctl, "b").await;
    let mut c = join_agent(&relay, &mut ctl, "c").await;

    drop(b);
    let gone = ctl.next().await;
    assert_eq!(gone.message_type, MessageType::AgentDisconnected);
    assert_eq!(gone.payload["agent_id"], "b");
    assert_eq!(relay.agent_count(), 2);

    ctl.send("update_config", json!({"rate": 5})).await;
    for agent in [&mut a, &mut c] {
        let got = agent.next().await;
        assert_eq!(got.message_type.as_str(), "update_config");
        assert_eq!(got.payload, json!({"rate": 5}));
    }

    relay.stop();
}

#[tokio::test]
async fn test_broadcast_not_replayed_to_later_agents() {
    let relay = Relay::start(settings(30, 60));
    let mut ctl = join_controller(&relay).await;
    let mut early = join_agent(&relay, &mut ctl, "early").await;

    ctl.send("start_scan", json!({"round": 1})).await;
    assert_eq!(early.next().await.payload, json!({"round": 1}));

    let mut late = join_agent(&relay, &mut ctl, "late").await;
    ctl.send("start_scan", json!({"round": 2})).await;
    assert_eq!(early.next().await.payload, json!({"round": 2}));
    // The first thing the late agent hears is the broadcast sent after it joined.
    assert_eq!(late.next().await.payload, json!({"round": 2}));

    relay.stop();
}

#[tokio::test]
async fn test_unrecognised_types_are_routed_opaquely() {
    let relay = Relay::start(settings(30, 60));
    let mut ctl = join_controller(&relay).await;
    let mut agent = join_agent(&relay, &mut ctl, "a1").await;

    let raw = json!({
        "type": "command",
        "target_agent_id": "a1",
        "payload": {"action": "scan"},
        "session_token": ctl.token,
    });
    ctl.transport
        .sink
        .send(Frame::Text(raw.to_string()))
        .await
        .unwrap();
    let got = agent.next().await;
    assert_eq!(got.message_type.as_str(), "command");
    assert_eq!(got.payload, json!({"action": "scan"}));
    assert_eq!(got.source_controller.as_deref(), Some(ctl.peer_id.as_str()));
    assert!(got.extra.get("target_agent_id").is_none());

    agent.send("result", json!({"ok": true})).await;
    let back = ctl.next().await;
    assert_eq!(back.message_type.as_str(), "result");
    assert_eq!(back.payload, json!({"ok": true}));
    assert_eq!(back.source_agent_id.as_deref(), Some("a1"));

    relay.stop();
}

#[tokio::test]
async fn test_agent_reports_reach_every_controller() {
    let relay = Relay::start(settings(30, 60));
    let mut c1 = join_controller(&relay).await;
    let mut c2 = join_controller(&relay).await;
    let mut agent = join_relay(&relay, PeerRole::Agent, "scanner", Some("s1")).await;
    for ctl in [&mut c1, &mut c2] {
        assert_eq!(ctl.next().await.message_type, MessageType::AgentConnected);
    }

    agent.send("scan_stats", json!({"requests": 120})).await;
    for ctl in [&mut c1, &mut c2] {
        let got = ctl.next().await;
        assert_eq!(got.message_type.as_str(), "scan_stats");
        assert_eq!(got.payload, json!({"requests": 120}));
        assert_eq!(got.source_agent_id.as_deref(), Some("s1"));
        assert_eq!(got.source_agent_name.as_deref(), Some("scanner"));
    }

    relay.stop();
}

#[tokio::test]
async fn test_bad_token_is_answered_not_routed() {
    let relay = Relay::start(settings(30, 60));
    let mut ctl = join_controller(&relay).await;
    let mut a = join_agent(&relay, &mut ctl, "a").await;

    ctl.token = "forged".to_string();
    ctl.send("stop", json!({})).await;
    let reply = ctl.next().await;
    assert_eq!(reply.message_type, MessageType::Error);
    assert_eq!(reply.payload["message"], "Invalid session token");

    relay.stop();
    assert!(a.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_silent_agent_evicted_once() {
    let relay = Relay::start(settings(1, 5));
    let mut ctl = join_controller(&relay).await;
    let _quiet = join_agent(&relay, &mut ctl, "quiet").await;
    let started = Instant::now();

    let mut disconnects = Vec::new();
    for _ in 0..8 {
        ctl.heartbeat().await;
        let tick = tokio::time::sleep(Duration::from_secs(1));
        tokio::pin!(tick);
        loop {
            tokio::select! {
                _ = &mut tick => break,
                msg = ctl.recv() => {
                    let msg = msg.expect("controller was disconnected");
                    if msg.message_type == MessageType::AgentDisconnected {
                        disconnects.push((msg, started.elapsed()));
                    }
                }
            }
        }
    }

    assert_eq!(disconnects.len(), 1);
    let (msg, at) = &disconnects[0];
    assert_eq!(msg.payload["agent_id"], "quiet");
    assert_eq!(msg.payload["reason"], "heartbeat timeout");
    assert!(*at <= Duration::from_secs(7), "evicted after {at:?}");
    assert_eq!(relay.agent_count(), 0);
    assert_eq!(relay.controller_count(), 1);

    relay.stop();
}

#[tokio::test]
async fn test_relay_delivery_matches_direct_delivery() {
    let payload = json!({"urls": ["https://a", "https://b"], "depth": 2});

    let (hub, mut events) = Hub::start(settings(30, 60));
    let mut direct = handshake(
        |t| hub.accept(t, "127.0.0.1"),
        &secret(),
        ConnectorIdentity::new(PeerRole::Agent, "direct").with_peer_id("agent-1"),
    )
    .await
    .unwrap();
    assert!(matches!(
        events.recv().await,
        Some(HubEvent::PeerConnected { .. })
    ));
    assert!(hub.send_command("agent-1", MessageType::parse("start_scan"), payload.clone()));
    let via_hub = direct.next().await;

    let relay = Relay::start(settings(30, 60));
    let mut ctl = join_controller(&relay).await;
    let mut relayed = join_agent(&relay, &mut ctl, "agent-1").await;
    let mut targeted = payload.clone();
    targeted["target_agent_id"] = json!("agent-1");
    ctl.send("start_scan", targeted).await;
    let via_relay = relayed.next().await;

    assert_eq!(via_hub.message_type, via_relay.message_type);
    assert_eq!(via_hub.payload, payload);
    assert_eq!(via_relay.payload, payload);

    hub.stop();
    relay.stop();
}

#[tokio::test]
async fn test_stop_closes_every_connection() {
    let relay = Relay::start(settings(30, 60));
    let mut ctl = join_controller(&relay).await;
    let mut a = join_agent(&relay, &mut ctl, "a").await;

    relay.stop();
    assert!(!relay.is_running());
    assert!(a.recv().await.is_none());
    // The controller may still see the agent leave before its own close.
    while let Some(msg) = ctl.recv().await {
        assert_eq!(msg.message_type, MessageType::AgentDisconnected);
    }
    relay.join().await;
    assert_eq!(relay.agent_count(), 0);
}
