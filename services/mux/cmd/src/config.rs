//! Configuration handling for the mux service.
//!
//! Settings come from the shared YAML config file, then `MUX_*` environment
//! variables, then command line flags (applied in `main`).

use anyhow::{Context, Result};
use mux_session::EndpointConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Mux service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Address to accept connections on
    pub listen_addr: Option<SocketAddr>,
    /// Peers to connect to
    pub connect_addrs: Vec<SocketAddr>,
    /// Dialogs a peer may have open per connection
    pub max_dialogs: u32,
    /// Largest frame payload
    pub max_length: u32,
    /// Largest dialog message
    pub max_total_length: u32,
    /// Proposed heartbeat interval
    pub heartbeat_interval: Duration,
    /// Silent intervals before a connection times out
    pub heartbeat_timeout: u32,
    /// Whether to send heartbeats
    pub send_heartbeat: bool,
    /// Close connections without dialogs after this long
    pub idle_timeout: Option<Duration>,
    /// Handshake deadline
    pub connect_timeout: Duration,
    /// Inbound dialog permits shared by all connections; 0 for unlimited
    pub dialog_permits: u32,
    /// Timeout of echo dialogs started by this node
    pub dialog_timeout: Duration,
    /// Grace period for open dialogs on shutdown
    pub shutdown_grace: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        let endpoint = EndpointConfig::default();
        Self {
            listen_addr: None,
            connect_addrs: Vec::new(),
            max_dialogs: endpoint.max_dialogs,
            max_length: endpoint.max_length,
            max_total_length: endpoint.max_total_length,
            heartbeat_interval: endpoint.heartbeat_interval,
            heartbeat_timeout: endpoint.heartbeat_timeout,
            send_heartbeat: endpoint.send_heartbeat,
            idle_timeout: endpoint.idle_timeout,
            connect_timeout: endpoint.connect_timeout,
            dialog_permits: 0,
            dialog_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    mux: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl MuxConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root)?;
                    info!("Loaded configuration from {:?}", path);
                }
                Err(err) => warn!("Failed to parse config file {:?}, using defaults: {}", path, err),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Final mux configuration: listen={:?}, connect={:?}, max_dialogs={}, heartbeat={:?}",
            config.listen_addr, config.connect_addrs, config.max_dialogs, config.heartbeat_interval
        );
        Ok(config)
    }

    /// Settings for one endpoint
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            max_dialogs: self.max_dialogs,
            max_length: self.max_length,
            max_total_length: self.max_total_length,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            send_heartbeat: self.send_heartbeat,
            idle_timeout: self.idle_timeout,
            connect_timeout: self.connect_timeout,
            ..EndpointConfig::default()
        }
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        let Some(service) = root.services.and_then(|s| s.mux) else {
            return Ok(());
        };

        for arg in service.args.unwrap_or_default() {
            if let Some(addr) = arg.strip_prefix("--listen=") {
                self.listen_addr = Some(addr.parse().with_context(|| format!("invalid listen address {}", addr))?);
            } else if let Some(addr) = arg.strip_prefix("--connect=") {
                self.connect_addrs
                    .push(addr.parse().with_context(|| format!("invalid connect address {}", addr))?);
            }
        }

        for (key, value) in service.config.unwrap_or_default() {
            if let Some(setting) = key.strip_prefix("services.mux.") {
                self.set(setting, &value)
                    .with_context(|| format!("invalid value {:?} for {}", value, key))?;
            }
        }
        Ok(())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for setting in OVERRIDABLE {
            let var = format!("MUX_{}", setting.to_uppercase());
            if let Some(value) = lookup(&var) {
                self.set(setting, &value)
                    .with_context(|| format!("invalid value {:?} in {}", value, var))?;
                info!("{} overridden by environment: {}", setting, value);
            }
        }
        Ok(())
    }

    /// Set one named setting from its string form
    fn set(&mut self, setting: &str, value: &str) -> Result<()> {
        match setting {
            "listen_addr" => self.listen_addr = Some(value.parse()?),
            "max_dialogs" => self.max_dialogs = value.parse()?,
            "max_length" => self.max_length = value.parse()?,
            "max_total_length" => self.max_total_length = value.parse()?,
            "heartbeat_interval" => self.heartbeat_interval = humantime::parse_duration(value)?,
            "heartbeat_timeout" => self.heartbeat_timeout = value.parse()?,
            "send_heartbeat" => self.send_heartbeat = value.eq_ignore_ascii_case("true"),
            "idle_timeout" => {
                self.idle_timeout = match value {
                    "" | "0" | "off" => None,
                    v => idle_timeout(humantime::parse_duration(v)?),
                }
            }
            "connect_timeout" => self.connect_timeout = humantime::parse_duration(value)?,
            "dialog_permits" => self.dialog_permits = value.parse()?,
            "dialog_timeout" => self.dialog_timeout = humantime::parse_duration(value)?,
            "shutdown_grace" => self.shutdown_grace = humantime::parse_duration(value)?,
            _ => {
                // Ignore unknown configuration keys
            }
        }
        Ok(())
    }
}

/// Idle timeout setting; zero turns the check off
pub fn idle_timeout(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

const OVERRIDABLE: [&str; 12] = [
    "listen_addr",
    "max_dialogs",
    "max_length",
    "max_total_length",
    "heartbeat_interval",
    "heartbeat_timeout",
    "send_heartbeat",
    "idle_timeout",
    "connect_timeout",
    "dialog_permits",
    "dialog_timeout",
    "shutdown_grace",
];
