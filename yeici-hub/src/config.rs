//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;
use yeici_core::natnet::{DEFAULT_DATA_PORT, DEFAULT_MULTICAST_GROUP};

use crate::ingest::IngestConfig;
use crate::server::ServerConfig;

/// Hub configuration. File: ~/.config/yeicicap/config.toml or /etc/yeicicap/config.toml.
/// Env overrides: YEICI_MULTICAST_GROUP, YEICI_MULTICAST_INTERFACE, YEICI_DATA_PORT,
/// YEICI_BRIDGE_HOST, YEICI_BRIDGE_PORT.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// NatNet multicast group (default 239.255.42.99).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// Local interface used to join the group (default 0.0.0.0, any).
    #[serde(default = "default_multicast_interface")]
    pub multicast_interface: Ipv4Addr,
    /// NatNet data port (default 1511).
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// Distribution listen host (default 127.0.0.1).
    #[serde(default = "default_bridge_host")]
    pub bridge_host: String,
    /// Distribution listen port (default 54321).
    #[serde(default = "default_bridge_port")]
    pub bridge_port: u16,
    /// Decoded frames buffered between receive and broadcast (default 100).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-client write budget before the client is dropped (default 1000 ms).
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Status line period; 0 disables (default 10 s).
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_multicast_group() -> Ipv4Addr {
    DEFAULT_MULTICAST_GROUP
}
fn default_multicast_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_data_port() -> u16 {
    DEFAULT_DATA_PORT
}
fn default_bridge_host() -> String {
    "127.0.0.1".to_string()
}
fn default_bridge_port() -> u16 {
    54321
}
fn default_queue_capacity() -> usize {
    100
}
fn default_write_timeout_ms() -> u64 {
    1000
}
fn default_stats_interval_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multicast_group: default_multicast_group(),
            multicast_interface: default_multicast_interface(),
            data_port: default_data_port(),
            bridge_host: default_bridge_host(),
            bridge_port: default_bridge_port(),
            queue_capacity: default_queue_capacity(),
            write_timeout_ms: default_write_timeout_ms(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl Config {
    pub fn ingest(&self) -> IngestConfig {
        IngestConfig {
            multicast_group: self.multicast_group,
            interface: self.multicast_interface,
            port: self.data_port,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            host: self.bridge_host.clone(),
            port: self.bridge_port,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from `lookup` (the process environment in `load`).
    /// Values that do not parse are ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "YEICI_MULTICAST_GROUP", &mut self.multicast_group);
        override_parsed(
            &lookup,
            "YEICI_MULTICAST_INTERFACE",
            &mut self.multicast_interface,
        );
        override_parsed(&lookup, "YEICI_DATA_PORT", &mut self.data_port);
        if let Some(host) = lookup("YEICI_BRIDGE_HOST") {
            self.bridge_host = host;
        }
        override_parsed(&lookup, "YEICI_BRIDGE_PORT", &mut self.bridge_port);
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.multicast_group.is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "multicast_group {} is not a multicast address",
                self.multicast_group
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".into()));
        }
        if self.bridge_host.trim().is_empty() {
            return Err(ConfigError::Invalid("bridge_host must not be empty".into()));
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, var: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(s) = lookup(var) {
        match s.trim().parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var, value = %s, "ignoring unparsable override"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Load config: default, then `explicit` or the first config file found, then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => Config::from_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => Config::from_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/yeicicap/config.toml"));
    }
    out.push(PathBuf::from("/etc/yeicicap/config.toml"));
    out
}
