//! Config loading: `~/.fleetwire/config.toml` (or `--config`), then
//! `FLEETWIRE_*` environment variables, then command-line flags.

use crate::cli::{Cli, Commands, ListenArgs, SecretArg};
use anyhow::{bail, Context};
use fleetwire_types::FleetConfig;
use std::path::{Path, PathBuf};

pub const ENV_SECRET: &str = "FLEETWIRE_SECRET";
pub const ENV_HOST: &str = "FLEETWIRE_HOST";
pub const ENV_PORT: &str = "FLEETWIRE_PORT";
pub const ENV_LOG_LEVEL: &str = "FLEETWIRE_LOG_LEVEL";

/// `~/.fleetwire/config.toml`, or `./fleetwire.toml` without a home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".fleetwire").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("fleetwire.toml"))
}

/// Read the config file. A missing default file yields defaults; a missing
/// explicit file is an error. Also returns the path that was read, if any.
pub fn load_file(explicit: Option<&Path>) -> anyhow::Result<(FleetConfig, Option<PathBuf>)> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    if !path.exists() {
        if explicit.is_some() {
            bail!("config file not found: {}", path.display());
        }
        return Ok((FleetConfig::default(), None));
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = FleetConfig::from_toml_str(&text)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok((config, Some(path)))
}

/// Apply `FLEETWIRE_*` overrides, reading variables through `lookup`.
pub fn apply_env(
    config: &mut FleetConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(secret) = lookup(ENV_SECRET) {
        config.auth.shared_secret = secret;
    }
    if let Some(host) = lookup(ENV_HOST) {
        config.listen.host = host;
    }
    if let Some(port) = lookup(ENV_PORT) {
        config.listen.port = port
            .trim()
            .parse()
            .with_context(|| format!("{ENV_PORT} is not a valid port: {port}"))?;
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log_level = Some(level);
    }
    Ok(())
}

fn apply_listen(config: &mut FleetConfig, args: &ListenArgs) {
    if let Some(host) = &args.host {
        config.listen.host = host.clone();
    }
    if let Some(port) = args.port {
        config.listen.port = port;
    }
}

fn apply_secret(config: &mut FleetConfig, arg: &SecretArg) {
    if let Some(secret) = &arg.secret {
        config.auth.shared_secret = secret.clone();
    }
}

/// Apply the command-line flags of `cli` on top of `config`.
pub fn apply_flags(config: &mut FleetConfig, cli: &Cli) {
    if let Some(level) = &cli.log_level {
        config.log_level = Some(level.clone());
    }
    match &cli.command {
        Commands::Relay { listen, secret } => {
            apply_listen(config, listen);
            apply_secret(config, secret);
        }
        Commands::Controller {
            relay,
            name,
            bind,
            secret,
            ..
        } => {
            apply_listen(config, bind);
            apply_secret(config, secret);
            if let Some(target) = relay {
                config.client.connect = Some(target.clone());
            }
            if let Some(name) = name {
                config.client.display_name = name.clone();
            }
        }
        Commands::Agent {
            connect,
            name,
            id,
            relay,
            secret,
        } => {
            apply_secret(config, secret);
            if let Some(target) = connect {
                config.client.connect = Some(target.clone());
            }
            if let Some(name) = name {
                config.client.display_name = name.clone();
            }
            if let Some(id) = id {
                config.client.peer_id = Some(id.clone());
            } else if *relay && config.client.peer_id.is_none() {
                config.client.peer_id = Some(config.client.display_name.clone());
            }
        }
    }
}

/// File, then environment, then flags. Also returns the file that was read.
pub fn load(cli: &Cli) -> anyhow::Result<(FleetConfig, Option<PathBuf>)> {
    let (mut config, source) = load_file(cli.config.as_deref())?;
    apply_env(&mut config, |key| std::env::var(key).ok())?;
    apply_flags(&mut config, cli);
    Ok((config, source))
}
