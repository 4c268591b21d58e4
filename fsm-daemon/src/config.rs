//! Load config from file and environment.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fsm_core::{Endpoint, PeerTimings, SupervisorConfig};
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: `--config PATH`, else ~/.config/telescope-fsm/config.toml
/// or /etc/telescope-fsm/config.toml.
/// Env overrides: FSM_BIND, FSM_TICK_MS, FSM_TIMEOUT_MS.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    /// Command endpoint (default 0.0.0.0:5555).
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Loop period in ms (default 500, i.e. 2 Hz).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Per-exchange peer timeout in ms (default 5000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Round trips slower than this are logged (default 500).
    #[serde(default = "default_slow_reply_ms")]
    pub slow_reply_ms: u64,
    /// Consecutive failures before a peer is declared dead (default 5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Name of the peer that power-cycles modules on `reboot`.
    #[serde(default)]
    pub power_controller: Option<String>,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5555))
}
fn default_tick_ms() -> u64 {
    500
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_slow_reply_ms() -> u64 {
    500
}
fn default_failure_threshold() -> u32 {
    fsm_core::supervisor::DEFAULT_FAILURE_THRESHOLD
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tick_ms: default_tick_ms(),
            timeout_ms: default_timeout_ms(),
            slow_reply_ms: default_slow_reply_ms(),
            failure_threshold: default_failure_threshold(),
            power_controller: None,
        }
    }
}

/// One controllable module. Only name, host, port and prefix are used; any
/// other field (description, hardware notes) is kept but has no effect.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub prefix: String,
    #[serde(flatten)]
    pub details: BTreeMap<String, toml::Value>,
}

impl PeerEntry {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.as_str(), self.port)
    }

    pub fn description(&self) -> Option<&str> {
        self.details.get("description").and_then(|v| v.as_str())
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            tick_period: Duration::from_millis(self.supervisor.tick_ms),
            failure_threshold: self.supervisor.failure_threshold,
            power_controller: self.supervisor.power_controller.clone(),
        }
    }

    pub fn peer_timings(&self) -> PeerTimings {
        PeerTimings {
            timeout: Duration::from_millis(self.supervisor.timeout_ms),
            slow_reply: Duration::from_millis(self.supervisor.slow_reply_ms),
        }
    }

    /// Address a local client should dial to reach the command endpoint.
    pub fn command_endpoint(&self) -> Endpoint {
        let bind = self.supervisor.bind;
        let host = if bind.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            bind.ip().to_string()
        };
        Endpoint::new(host, bind.port())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for p in &self.peers {
            if !seen.insert(p.name.as_str()) {
                return Err(ConfigError::DuplicatePeer(p.name.clone()));
            }
        }
        if let Some(ctrl) = &self.supervisor.power_controller {
            if !seen.contains(ctrl.as_str()) {
                return Err(ConfigError::UnknownPowerController(ctrl.clone()));
            }
        }
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("FSM_BIND") {
            match s.parse::<SocketAddr>() {
                Ok(a) => self.supervisor.bind = a,
                Err(_) => warn!(value = %s, "ignoring invalid FSM_BIND"),
            }
        }
        if let Some(s) = var("FSM_TICK_MS") {
            match s.parse::<u64>() {
                Ok(ms) => self.supervisor.tick_ms = ms,
                Err(_) => warn!(value = %s, "ignoring invalid FSM_TICK_MS"),
            }
        }
        if let Some(s) = var("FSM_TIMEOUT_MS") {
            match s.parse::<u64>() {
                Ok(ms) => self.supervisor.timeout_ms = ms,
                Err(_) => warn!(value = %s, "ignoring invalid FSM_TIMEOUT_MS"),
            }
        }
    }
}

/// Load config: explicit path if given, else the first default path that
/// exists, else defaults; then env vars; then validate.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => {
                warn!("no config file found, starting with no peers");
                Config::default()
            }
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/telescope-fsm/config.toml"));
    }
    out.push(PathBuf::from("/etc/telescope-fsm/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Config::from_toml(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("peer {0} is listed more than once")]
    DuplicatePeer(String),
    #[error("power controller {0} is not a configured peer")]
    UnknownPowerController(String),
}
