//! Frame transport: the seam between protocol logic and sockets.
//!
//! Protocol code only sees [`FrameSink`] / [`FrameStream`] halves carrying
//! [`Frame`]s. Three implementations exist:
//!
//! - server side: an upgraded `axum` WebSocket ([`from_axum`]);
//! - client side: a `tokio-tungstenite` connection made by [`WsConnector`];
//! - in process: [`memory_pair`] / [`memory_connector`], used by tests and
//!   embedders that want the protocol without real sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as TungMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::WireError;

/// One WebSocket-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Close with an optional human-readable reason.
    Close(Option<String>),
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Send one frame.
    async fn send(&mut self, frame: Frame) -> Result<(), WireError>;

    /// Send a close frame, ignoring failures.
    async fn close(&mut self, reason: Option<String>) {
        let _ = self.send(Frame::Close(reason)).await;
    }
}

/// Read half of a connection.
#[async_trait]
pub trait FrameStream: Send + 'static {
    /// The next frame, or `None` once the connection is gone.
    async fn recv(&mut self) -> Option<Result<Frame, WireError>>;
}

/// Both halves of one connection.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl Transport {
    pub fn new(sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream>) -> Self {
        Self { sink, stream }
    }
}

/// Opens new outbound connections. Used by the reconnecting client so the
/// state machine can run against a fake transport.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a fresh connection.
    async fn connect(&self) -> Result<Transport, WireError>;

    /// Human-readable target for logs.
    fn target(&self) -> String;
}

// ---------------------------------------------------------------------------
// Client side: tokio-tungstenite
// ---------------------------------------------------------------------------

type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TungSink(SplitSink<ClientWs, TungMessage>);
struct TungStream(SplitStream<ClientWs>);

#[async_trait]
impl FrameSink for TungSink {
    async fn send(&mut self, frame: Frame) -> Result<(), WireError> {
        let msg = match frame {
            Frame::Text(text) => TungMessage::Text(text),
            Frame::Binary(bytes) => TungMessage::Binary(bytes),
            Frame::Close(reason) => TungMessage::Close(reason.map(|r| CloseFrame {
                code: CloseCode::Normal,
                reason: r.into(),
            })),
        };
        self.0
            .send(msg)
            .await
            .map_err(|e| WireError::Transport(format!("Send error: {e}")))
    }
}

#[async_trait]
impl FrameStream for TungStream {
    async fn recv(&mut self) -> Option<Result<Frame, WireError>> {
        loop {
            let msg = match self.0.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(WireError::Transport(format!("Read error: {e}")))),
            };
            return Some(Ok(match msg {
                TungMessage::Text(text) => Frame::Text(text),
                TungMessage::Binary(bytes) => Frame::Binary(bytes),
                TungMessage::Close(frame) => Frame::Close(frame.map(|f| f.reason.into_owned())),
                // Pings are answered by tungstenite itself.
                TungMessage::Ping(_) | TungMessage::Pong(_) | TungMessage::Frame(_) => continue,
            }));
        }
    }
}

/// Build the WebSocket URL for a `host:port` target or a full `ws(s)://` URL.
///
/// A bare target gets `ws://` and `path`; a URL without a path gets `path`.
pub fn ws_url(target: &str, path: &str) -> Result<url::Url, WireError> {
    let raw = if target.starts_with("ws://") || target.starts_with("wss://") {
        target.to_string()
    } else {
        format!("ws://{target}")
    };
    let mut url = url::Url::parse(&raw)
        .map_err(|e| WireError::Protocol(format!("invalid target '{target}': {e}")))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(path);
    }
    Ok(url)
}

/// Connects to a listener over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: url::Url,
}

impl WsConnector {
    /// `target` is `host:port` or a full URL; `path` is the upgrade path.
    pub fn new(target: &str, path: &str) -> Result<Self, WireError> {
        Ok(Self {
            url: ws_url(target, path)?,
        })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Transport, WireError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| WireError::Transport(format!("Connect to {} failed: {e}", self.url)))?;
        debug!(url = %self.url, "WebSocket connected");
        let (sink, stream) = ws.split();
        Ok(Transport::new(
            Box::new(TungSink(sink)),
            Box::new(TungStream(stream)),
        ))
    }

    fn target(&self) -> String {
        self.url.to_string()
    }
}

// ---------------------------------------------------------------------------
// Server side: axum
// ---------------------------------------------------------------------------

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};

struct AxumSink(SplitSink<WebSocket, AxumMessage>);
struct AxumStream(SplitStream<WebSocket>);

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, frame: Frame) -> Result<(), WireError> {
        let msg = match frame {
            Frame::Text(text) => AxumMessage::Text(text.into()),
            Frame::Binary(bytes) => AxumMessage::Binary(bytes.into()),
            Frame::Close(reason) => AxumMessage::Close(reason.map(|r| AxumCloseFrame {
                code: axum::extract::ws::close_code::NORMAL,
                reason: r.into(),
            })),
        };
        self.0
            .send(msg)
            .await
            .map_err(|e| WireError::Transport(format!("Send error: {e}")))
    }
}

#[async_trait]
impl FrameStream for AxumStream {
    async fn recv(&mut self) -> Option<Result<Frame, WireError>> {
        loop {
            let msg = match self.0.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(WireError::Transport(format!("Read error: {e}")))),
            };
            return Some(Ok(match msg {
                AxumMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
                AxumMessage::Binary(bytes) => Frame::Binary(bytes.to_vec()),
                AxumMessage::Close(frame) => {
                    Frame::Close(frame.map(|f| f.reason.as_str().to_owned()))
                }
                AxumMessage::Ping(_) | AxumMessage::Pong(_) => continue,
            }));
        }
    }
}

/// Wrap an upgraded axum WebSocket.
pub fn from_axum(socket: WebSocket) -> Transport {
    let (sink, stream) = socket.split();
    Transport::new(Box::new(AxumSink(sink)), Box::new(AxumStream(stream)))
}

// ---------------------------------------------------------------------------
// In-process transport
// ---------------------------------------------------------------------------

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), WireError> {
        let closing = matches!(frame, Frame::Close(_));
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| WireError::Closed("sink closed".to_string()))?;
        tx.send(frame)
            .map_err(|_| WireError::Closed("peer dropped".to_string()))?;
        if closing {
            // Dropping the sender ends the peer's stream after the close frame.
            self.tx = None;
        }
        Ok(())
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Option<Result<Frame, WireError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Two connected in-memory transports: whatever one side sends, the other receives.
pub fn memory_pair() -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = Transport::new(
        Box::new(MemorySink { tx: Some(a_tx) }),
        Box::new(MemoryStream { rx: b_rx }),
    );
    let b = Transport::new(
        Box::new(MemorySink { tx: Some(b_tx) }),
        Box::new(MemoryStream { rx: a_rx }),
    );
    (a, b)
}

/// A [`Connector`] whose connections land on an in-process receiver.
///
/// Every successful `connect()` hands the server half to the receiver
/// returned by [`memory_connector`]. `set_online(false)` makes subsequent
/// connects fail, which simulates an unreachable listener.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<Transport>,
    online: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

/// Create a [`MemoryConnector`] and the receiver of accepted server halves.
pub fn memory_connector() -> (MemoryConnector, mpsc::UnboundedReceiver<Transport>) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            accept_tx,
            online: Arc::new(AtomicBool::new(true)),
        },
        accept_rx,
    )
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Transport, WireError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(WireError::Transport("listener unreachable".to_string()));
        }
        let (client, server) = memory_pair();
        self.accept_tx
            .send(server)
            .map_err(|_| WireError::Transport("listener gone".to_string()))?;
        Ok(client)
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_from_host_port() {
        let url = ws_url("127.0.0.1:8765", "/ws").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8765/ws");
    }

    #[test]
    fn test_ws_url_keeps_explicit_path() {
        let url = ws_url("wss://relay.example.com/custom", "/ws").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/custom");
        let url = ws_url("wss://relay.example.com", "/ws").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws");
    }

    #[test]
    fn test_ws_url_invalid() {
        assert!(ws_url("ws://", "/ws").is_err());
    }

    #[tokio::test]
    async fn test_memory_pair_delivers_both_ways() {
        let (mut a, mut b) = memory_pair();
        a.sink.send(Frame::Text("ping".into())).await.unwrap();
        assert_eq!(
            b.stream.recv().await.unwrap().unwrap(),
            Frame::Text("ping".into())
        );
        b.sink.send(Frame::Binary(vec![1, 2])).await.unwrap();
        assert_eq!(
            a.stream.recv().await.unwrap().unwrap(),
            Frame::Binary(vec![1, 2])
        );
    }

    #[tokio::test]
    async fn test_memory_close_ends_peer_stream() {
        let (mut a, mut b) = memory_pair();
        a.sink.close(Some("bye".into())).await;
        assert_eq!(
            b.stream.recv().await.unwrap().unwrap(),
            Frame::Close(Some("bye".into()))
        );
        assert!(b.stream.recv().await.is_none());
        assert!(a.sink.send(Frame::Text("late".into())).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_connector_offline() {
        let (connector, mut accepted) = memory_connector();
        assert!(connector.connect().await.is_ok());
        assert!(accepted.recv().await.is_some());

        connector.set_online(false);
        assert!(connector.connect().await.is_err());
    }
}
