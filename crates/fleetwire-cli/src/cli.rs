//! Clap CLI definitions for fleetwire.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  fleetwire relay --port 8765                 Run a relay on 0.0.0.0:8765
  fleetwire controller --listen               Accept agents directly
  fleetwire controller --relay relay.lan:8765 Control agents through a relay
  fleetwire agent --connect relay.lan:8765 --relay --name scanner-1

\x1b[1;36mConfiguration:\x1b[0m
  ~/.fleetwire/config.toml, then FLEETWIRE_SECRET / FLEETWIRE_HOST /
  FLEETWIRE_PORT / FLEETWIRE_LOG_LEVEL, then command-line flags.";

/// fleetwire: authenticated controller/agent messaging.
#[derive(Parser, Debug)]
#[command(
    name = "fleetwire",
    version,
    about = "Authenticated controller/agent messaging over WebSocket",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (e.g. "debug", "fleetwire_wire=trace").
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Bind address overrides.
#[derive(Args, Debug, Default, Clone)]
pub struct ListenArgs {
    /// Host to bind.
    #[arg(long)]
    pub host: Option<String>,
    /// Port to bind.
    #[arg(long)]
    pub port: Option<u16>,
}

/// Shared secret override.
#[derive(Args, Debug, Default, Clone)]
pub struct SecretArg {
    /// Shared secret (at least 32 characters). Prefer FLEETWIRE_SECRET.
    #[arg(long)]
    pub secret: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a relay that bridges controllers and agents.
    Relay {
        #[command(flatten)]
        listen: ListenArgs,
        #[command(flatten)]
        secret: SecretArg,
    },
    /// Run a controller, either listening for agents or attached to a relay.
    Controller {
        /// Accept agent connections directly (the default without --relay).
        #[arg(long, conflicts_with = "relay")]
        listen: bool,
        /// Connect to a relay at HOST:PORT instead of listening.
        #[arg(long, value_name = "HOST:PORT")]
        relay: Option<String>,
        /// Display name announced to the relay.
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        bind: ListenArgs,
        #[command(flatten)]
        secret: SecretArg,
    },
    /// Run a demo agent that answers get_status and logs other commands.
    Agent {
        /// Controller or relay address, HOST:PORT or a ws:// URL.
        #[arg(long, value_name = "HOST:PORT")]
        connect: Option<String>,
        /// Display name.
        #[arg(long)]
        name: Option<String>,
        /// Persistent peer id to request.
        #[arg(long)]
        id: Option<String>,
        /// The target is a relay: the id defaults to the display name.
        #[arg(long)]
        relay: bool,
        #[command(flatten)]
        secret: SecretArg,
    },
}
