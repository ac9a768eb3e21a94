//! Listening side shared by the direct hub and the relay.
//!
//! [`serve_connection`] runs one accepted connection end to end: handshake,
//! registration, a writer task draining the session's outbound queue, and a
//! reader loop that validates the session token on every frame, refreshes
//! liveness, answers heartbeats and hands everything else to a
//! [`SessionHandler`]. The hub and relay differ only in their handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use fleetwire_types::{DuplicatePolicy, FleetConfig, FleetResult, HeartbeatSettings};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::auth::{self, SharedSecret};
use crate::error::{HandshakeError, WireError};
use crate::message::{MessageType, PeerRole, WireMessage};
use crate::registry::{Outbound, Registry, Session};
use crate::transport::{self, Frame, FrameSink, Transport};

/// How long a closing connection's writer gets to flush its close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Disconnect reason for a session displaced by a newer one with the same id.
pub const REPLACED_REASON: &str = "replaced by new connection";

/// Validated settings for a listening component.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub secret: SharedSecret,
    pub handshake_timeout: Duration,
    pub heartbeat: HeartbeatSettings,
    pub duplicate_policy: DuplicatePolicy,
}

impl ListenerSettings {
    /// Validate `config` and extract the listener settings.
    pub fn from_config(config: &FleetConfig) -> FleetResult<Self> {
        config.validate(false)?;
        Ok(Self {
            secret: SharedSecret::new(config.auth.shared_secret.clone())?,
            handshake_timeout: Duration::from_secs(config.auth.handshake_timeout_secs),
            heartbeat: config.heartbeat.clone(),
            duplicate_policy: config.auth.duplicate_policy,
        })
    }
}

/// Role-specific behaviour of a listener.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Roles this listener authenticates.
    fn roles(&self) -> &'static [PeerRole];

    /// The registry holding sessions of `role`.
    fn registry(&self, role: PeerRole) -> &Registry;

    /// `false` once the listener is shutting down.
    fn accepting(&self) -> bool {
        true
    }

    /// Make a freshly authenticated session visible and announce it.
    ///
    /// Runs before `auth_success` is sent. Anything queued on the session
    /// here reaches the peer right after it. A replaced session must be
    /// closed and reported through [`on_disconnected`](Self::on_disconnected).
    fn admit(&self, session: &Session) -> Result<(), HandshakeError>;

    /// A validated post-auth message other than a heartbeat, including
    /// types this crate does not recognise.
    async fn on_message(&self, session: &Session, msg: WireMessage);

    /// A session was removed. Called exactly once per session.
    fn on_disconnected(&self, session: &Session, reason: &str);
}

/// Register `session` in `registry`, closing the session it replaces.
///
/// The replaced session is returned for the caller to report.
pub fn register_replacing(
    registry: &Registry,
    session: &Session,
) -> Result<Option<Session>, HandshakeError> {
    let old = registry.register(session.clone())?;
    if let Some(old) = &old {
        old.close(REPLACED_REASON);
    }
    Ok(old)
}

/// Remove a session if it is still live, close it and report the disconnect.
///
/// Returns `false` if some other path already removed it.
pub fn remove_session<H: SessionHandler + ?Sized>(
    handler: &H,
    role: PeerRole,
    peer_id: &str,
    session_token: &str,
    reason: &str,
) -> bool {
    match handler
        .registry(role)
        .unregister(peer_id, session_token, reason)
    {
        Some(session) => {
            session.close(reason);
            handler.on_disconnected(&session, reason);
            true
        }
        None => false,
    }
}

/// Close every session of every role with `reason`.
pub fn close_all<H: SessionHandler + ?Sized>(handler: &H, reason: &str) -> usize {
    let mut closed = 0;
    for role in handler.roles() {
        for session in handler.registry(*role).drain() {
            session.close(reason);
            handler.on_disconnected(&session, reason);
            closed += 1;
        }
    }
    closed
}

async fn write_loop(
    mut sink: Box<dyn FrameSink>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: Arc<Notify>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Frame::Text(text)).await {
                    debug!(error = %e, "Writer stopped");
                    shutdown.notify_one();
                    return;
                }
            }
            Outbound::Close(reason) => {
                sink.close(Some(reason)).await;
                return;
            }
        }
    }
}

/// Drive one accepted connection until it closes.
pub async fn serve_connection<H: SessionHandler + ?Sized>(
    handler: Arc<H>,
    settings: &ListenerSettings,
    mut transport: Transport,
    ip: String,
) {
    let accepted = match auth::accept_connector(
        &mut transport,
        &settings.secret,
        settings.handshake_timeout,
        handler.roles(),
    )
    .await
    {
        Ok(accepted) => accepted,
        Err(e) => {
            info!(ip = %ip, reason = %e, "Connection refused");
            return;
        }
    };

    if !handler.accepting() {
        auth::reject(
            transport.sink.as_mut(),
            &HandshakeError::Rejected("server shutdown".to_string()),
        )
        .await;
        return;
    }

    let role = accepted.role;
    let peer_id = accepted
        .requested_id
        .clone()
        .unwrap_or_else(auth::generate_peer_id);
    let token = auth::generate_session_token();
    let (session, link) = Session::new(
        peer_id.clone(),
        role,
        accepted.display_name,
        ip.clone(),
        token.clone(),
        accepted.extra_info,
    );

    if let Err(e) = handler.admit(&session) {
        auth::reject(transport.sink.as_mut(), &e).await;
        return;
    }

    if let Err(e) = auth::send_success(transport.sink.as_mut(), &token, &peer_id).await {
        warn!(peer_id = %peer_id, error = %e, "Failed to confirm authentication");
        remove_session(handler.as_ref(), role, &peer_id, &token, "auth confirmation failed");
        return;
    }
    let registry = handler.registry(role);

    info!(
        role = %role,
        peer_id = %peer_id,
        name = %session.display_name,
        ip = %ip,
        "Peer authenticated"
    );

    let Transport { sink, mut stream } = transport;
    let writer = tokio::spawn(write_loop(sink, link.outbound, Arc::clone(&link.shutdown)));

    let reason = loop {
        let frame = tokio::select! {
            frame = stream.recv() => frame,
            _ = link.shutdown.notified() => break "closed by listener".to_string(),
        };
        let text = match frame {
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Binary(_))) => {
                warn!(peer_id = %peer_id, "Dropping non-text frame");
                continue;
            }
            Some(Ok(Frame::Close(_))) | None => break "connection closed".to_string(),
            Some(Err(e)) => break format!("transport error: {e}"),
        };
        let msg = match WireMessage::decode(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Dropping malformed message");
                continue;
            }
        };
        if msg.session_token.as_deref() != Some(token.as_str()) {
            warn!(peer_id = %peer_id, message_type = %msg.message_type, "Invalid session token");
            session.send(&WireMessage::error("Invalid session token"));
            continue;
        }
        registry.touch(&peer_id, &token);

        match &msg.message_type {
            MessageType::Heartbeat => {
                session.send(&WireMessage::heartbeat_ack());
            }
            MessageType::HeartbeatAck => {}
            t if t.is_handshake() => {
                debug!(
                    peer_id = %peer_id,
                    message_type = %t,
                    "Ignoring handshake message after auth"
                );
            }
            _ => handler.on_message(&session, msg).await,
        }
    };

    remove_session(handler.as_ref(), role, &peer_id, &token, &reason);
    // The remover queued a close frame; give the writer a moment to send it.
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        abort.abort();
    }
}

struct ListenerState<H: ?Sized> {
    handler: Arc<H>,
    settings: Arc<ListenerSettings>,
}

impl<H: ?Sized> Clone for ListenerState<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            settings: Arc::clone(&self.settings),
        }
    }
}

async fn ws_handler<H: SessionHandler>(
    State(state): State<ListenerState<H>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        serve_connection(
            state.handler,
            &state.settings,
            transport::from_axum(socket),
            addr.ip().to_string(),
        )
        .await;
    })
}

/// The axum router exposing `path` as the WebSocket endpoint.
pub fn router<H: SessionHandler>(
    handler: Arc<H>,
    settings: Arc<ListenerSettings>,
    path: &str,
) -> Router {
    Router::new()
        .route(path, get(ws_handler::<H>))
        .with_state(ListenerState { handler, settings })
}

/// Bind `addr` and serve `app` until `shutdown` turns `true`.
///
/// Returns the bound address and the server task.
pub async fn spawn_server(
    addr: SocketAddr,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), WireError> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(addr = %local, "Listening");
    let task = tokio::spawn(async move {
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        });
        if let Err(e) = server.await {
            warn!(error = %e, "Listener stopped with error");
        }
    });
    Ok((local, task))
}
