//! Authenticated controller/agent messaging over WebSocket.
//!
//! Peers authenticate with an HMAC-SHA256 challenge/response against a
//! shared secret, then exchange JSON envelopes carrying a session token.
//! Two listener shapes are provided:
//!
//! - [`Hub`]: agents connect directly to a controller-side listener.
//! - [`Relay`]: agents and controllers both connect out to a broker that
//!   routes commands down (unicast or broadcast) and reports up.
//!
//! Connectors use [`ReconnectingClient`], which re-authenticates with
//! exponential backoff and queues outbound messages while offline.

pub mod auth;
pub mod backoff;
pub mod channel;
pub mod client;
pub mod error;
pub mod facade;
pub mod heartbeat;
pub mod listener;
pub mod message;
pub mod queue;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;

pub use auth::{ConnectorIdentity, SharedSecret};
pub use backoff::Backoff;
pub use channel::{
    outbound_type, serve_hub_events, AgentChannel, CommandHandler, ControllerHandler,
    RelayController,
};
pub use client::{
    ClientEvent, ClientEvents, ClientHandle, ClientOptions, ClientState, Delivery,
    ReconnectingClient,
};
pub use error::{HandshakeError, WireError, WireResult};
pub use facade::{BlockingHandle, BlockingHub};
pub use listener::{ListenerSettings, SessionHandler};
pub use message::{AgentSummary, MessageType, PeerRole, WireMessage};
pub use queue::MessageQueue;
pub use registry::{Registry, Session};
pub use router::Relay;
pub use server::{Hub, HubEvent, HubEvents};
pub use transport::{memory_connector, memory_pair, Connector, Transport, WsConnector};
