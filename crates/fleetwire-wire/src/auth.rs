//! Challenge/response authentication.
//!
//! The listener sends a one-shot random challenge; the connector proves it
//! knows the shared secret by answering with `HMAC-SHA256(secret, challenge)`
//! in hex. The listener recomputes the digest and compares in constant time.
//! Nothing but the handshake pair is accepted before this completes.

use std::time::Duration;

use fleetwire_types::config::validate_secret;
use fleetwire_types::FleetResult;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{HandshakeError, WireError};
use crate::message::{
    AuthFailurePayload, AuthResponsePayload, AuthSuccessPayload, ChallengePayload, MessageType,
    PeerRole, WireMessage,
};
use crate::transport::{Frame, FrameSink, FrameStream, Transport};

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in a challenge.
pub const CHALLENGE_BYTES: usize = 32;

/// Random bytes in a session token.
pub const TOKEN_BYTES: usize = 32;

/// The process-wide shared secret. Wiped from memory on drop.
#[derive(Clone)]
pub struct SharedSecret(Zeroizing<String>);

impl SharedSecret {
    /// Wrap a secret, failing if it is shorter than 32 characters.
    pub fn new(secret: impl Into<String>) -> FleetResult<Self> {
        let secret = Zeroizing::new(secret.into());
        validate_secret(&secret)?;
        Ok(Self(secret))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A fresh hex challenge with 256 bits of entropy.
pub fn generate_challenge() -> String {
    random_hex(CHALLENGE_BYTES)
}

/// A fresh unguessable session token.
pub fn generate_session_token() -> String {
    random_hex(TOKEN_BYTES)
}

/// A listener-assigned peer id for connectors that do not suggest one.
pub fn generate_peer_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Hex `HMAC-SHA256(secret, challenge)`.
pub fn compute_response(secret: &SharedSecret, challenge: &str) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a connector's response.
pub fn verify_response(secret: &SharedSecret, challenge: &str, response: &str) -> bool {
    let expected = compute_response(secret, challenge);
    if expected.is_empty() {
        return false;
    }
    expected.as_bytes().ct_eq(response.as_bytes()).into()
}

/// What the listener learned about an authenticated connector.
#[derive(Debug, Clone)]
pub struct AcceptedPeer {
    pub role: PeerRole,
    pub display_name: String,
    /// Id the connector asked to be registered under.
    pub requested_id: Option<String>,
    pub extra_info: Map<String, Value>,
}

/// How a connector introduces itself.
#[derive(Debug, Clone)]
pub struct ConnectorIdentity {
    pub role: PeerRole,
    pub display_name: String,
    pub peer_id: Option<String>,
    pub extra_info: Map<String, Value>,
}

impl ConnectorIdentity {
    pub fn new(role: PeerRole, display_name: impl Into<String>) -> Self {
        Self {
            role,
            display_name: display_name.into(),
            peer_id: None,
            extra_info: Map::new(),
        }
    }

    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn with_extra_info(mut self, extra_info: Map<String, Value>) -> Self {
        self.extra_info = extra_info;
        self
    }
}

/// What the connector receives on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub session_token: String,
    pub peer_id: String,
}

async fn send_message(sink: &mut dyn FrameSink, msg: &WireMessage) -> Result<(), WireError> {
    sink.send(Frame::Text(msg.encode()?)).await
}

/// Read the next handshake frame and decode it.
async fn next_message(stream: &mut dyn FrameStream) -> Result<WireMessage, HandshakeError> {
    match stream.recv().await {
        Some(Ok(Frame::Text(text))) => {
            WireMessage::decode(&text).map_err(|e| HandshakeError::Malformed(e.to_string()))
        }
        Some(Ok(Frame::Binary(_))) => Err(HandshakeError::NonTextFrame),
        Some(Ok(Frame::Close(_))) | None => Err(HandshakeError::Closed),
        Some(Err(e)) => {
            debug!(error = %e, "Transport error during handshake");
            Err(HandshakeError::Closed)
        }
    }
}

/// Tell the connector why it was refused, then close.
pub async fn reject(sink: &mut dyn FrameSink, err: &HandshakeError) {
    if *err != HandshakeError::Closed {
        let failure = WireMessage::new(
            MessageType::AuthFailure,
            serde_json::to_value(AuthFailurePayload {
                reason: err.reason(),
            })
            .unwrap_or_default(),
        );
        if let Err(e) = send_message(sink, &failure).await {
            debug!(error = %e, "Could not deliver auth_failure");
        }
    }
    sink.close(Some(err.reason())).await;
}

/// Confirm a registered session to the connector.
pub async fn send_success(
    sink: &mut dyn FrameSink,
    session_token: &str,
    peer_id: &str,
) -> Result<(), WireError> {
    let success = WireMessage::new(
        MessageType::AuthSuccess,
        serde_json::to_value(AuthSuccessPayload {
            session_token: session_token.to_string(),
            peer_id: peer_id.to_string(),
        })?,
    );
    send_message(sink, &success).await
}

/// Listener side: challenge the connector and verify its answer.
///
/// On failure the connector has already been sent `auth_failure` and the
/// transport closed. On success the caller registers the session and then
/// calls [`send_success`].
pub async fn accept_connector(
    transport: &mut Transport,
    secret: &SharedSecret,
    timeout: Duration,
    allowed: &[PeerRole],
) -> Result<AcceptedPeer, HandshakeError> {
    let result = challenge_connector(transport, secret, timeout, allowed).await;
    if let Err(err) = &result {
        warn!(reason = %err, "Authentication failed");
        reject(transport.sink.as_mut(), err).await;
    }
    result
}

async fn challenge_connector(
    transport: &mut Transport,
    secret: &SharedSecret,
    timeout: Duration,
    allowed: &[PeerRole],
) -> Result<AcceptedPeer, HandshakeError> {
    let challenge = generate_challenge();
    let payload = serde_json::to_value(ChallengePayload {
        challenge: challenge.clone(),
    })
    .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    let msg = WireMessage::new(MessageType::AuthChallenge, payload);
    send_message(transport.sink.as_mut(), &msg)
        .await
        .map_err(|_| HandshakeError::Closed)?;

    let reply = tokio::time::timeout(timeout, next_message(transport.stream.as_mut()))
        .await
        .map_err(|_| HandshakeError::Timeout)??;

    if reply.message_type != MessageType::AuthResponse {
        return Err(HandshakeError::Malformed(format!(
            "expected auth_response, got '{}'",
            reply.message_type
        )));
    }
    let payload: AuthResponsePayload = serde_json::from_value(reply.payload)
        .map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    if !verify_response(secret, &challenge, &payload.response) {
        return Err(HandshakeError::InvalidCredentials);
    }

    let role = PeerRole::parse(&payload.client_type)
        .filter(|role| allowed.contains(role))
        .ok_or_else(|| HandshakeError::UnknownClientType(payload.client_type.clone()))?;

    Ok(AcceptedPeer {
        role,
        display_name: payload.display_name,
        requested_id: payload.peer_id.filter(|id| !id.is_empty()),
        extra_info: payload.extra_info,
    })
}

/// Connector side: answer the listener's challenge.
pub async fn authenticate(
    transport: &mut Transport,
    secret: &SharedSecret,
    identity: &ConnectorIdentity,
    timeout: Duration,
) -> Result<Authenticated, HandshakeError> {
    tokio::time::timeout(timeout, answer_challenge(transport, secret, identity))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn answer_challenge(
    transport: &mut Transport,
    secret: &SharedSecret,
    identity: &ConnectorIdentity,
) -> Result<Authenticated, HandshakeError> {
    let challenge_msg = next_message(transport.stream.as_mut()).await?;
    if challenge_msg.message_type != MessageType::AuthChallenge {
        return Err(HandshakeError::Malformed(format!(
            "expected auth_challenge, got '{}'",
            challenge_msg.message_type
        )));
    }
    let challenge = challenge_msg
        .field_str("challenge")
        .ok_or_else(|| HandshakeError::Malformed("challenge missing".to_string()))?;

    let response = AuthResponsePayload {
        response: compute_response(secret, challenge),
        client_type: identity.role.as_str().to_string(),
        display_name: identity.display_name.clone(),
        peer_id: identity.peer_id.clone(),
        extra_info: identity.extra_info.clone(),
    };
    let payload =
        serde_json::to_value(response).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    send_message(
        transport.sink.as_mut(),
        &WireMessage::new(MessageType::AuthResponse, payload),
    )
    .await
    .map_err(|_| HandshakeError::Closed)?;

    let verdict = next_message(transport.stream.as_mut()).await?;
    match verdict.message_type {
        MessageType::AuthSuccess => {
            let session_token = verdict
                .field_str("session_token")
                .or(verdict.session_token.as_deref())
                .ok_or_else(|| HandshakeError::Malformed("session_token missing".to_string()))?
                .to_string();
            let peer_id = verdict
                .field_str("peer_id")
                .map(str::to_string)
                .or_else(|| identity.peer_id.clone())
                .unwrap_or_default();
            Ok(Authenticated {
                session_token,
                peer_id,
            })
        }
        MessageType::AuthFailure => Err(HandshakeError::Rejected(
            verdict
                .field_str("reason")
                .unwrap_or("unspecified")
                .to_string(),
        )),
        other => Err(HandshakeError::Malformed(format!(
            "expected auth verdict, got '{other}'"
        ))),
    }
}
