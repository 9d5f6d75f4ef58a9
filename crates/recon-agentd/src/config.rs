use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use recon_core::{DispatchConfig, NodeSettings, RunnerConfig, Tier};
use recon_model::NodeId;
use recon_observe::{LoggerConfig, LoggerFormat};
use recon_peer::PeerConfig;
use serde::Deserialize;
use thiserror::Error;

/// Path of the optional JSON configuration file.
pub const CONFIG_ENV: &str = "RECON_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub tier: Tier,
    /// Defaults to the host name.
    pub node_id: Option<String>,
    pub listen: SocketAddr,
    pub upstream: Option<String>,
    pub token: String,
    pub data_dir: Option<PathBuf>,
    pub bootstrap_peers: Vec<String>,
    /// File the camera pipeline keeps the current frame in.
    pub capture_path: PathBuf,
    pub cycles: u32,
    pub interval_ms: u64,
    pub call_timeout_ms: u64,
    pub notify_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_blocking_threads: usize,
    pub logger: LoggerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            tier: Tier::Worker,
            node_id: None,
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upstream: None,
            token: String::new(),
            data_dir: None,
            bootstrap_peers: Vec::new(),
            capture_path: PathBuf::from("/var/lib/recon/frame.jpg"),
            cycles: runner.cycles,
            interval_ms: runner.interval.as_millis() as u64,
            call_timeout_ms: 10_000,
            notify_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
            max_blocking_threads: 64,
            logger: LoggerConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Defaults, then the `RECON_CONFIG` file, then `RECON_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from environment-style lookups.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("RECON_TIER") {
            self.tier = parse("RECON_TIER", &v)?;
        }
        if let Some(v) = var("RECON_NODE_ID") {
            self.node_id = Some(v);
        }
        if let Some(v) = var("RECON_LISTEN") {
            self.listen = parse("RECON_LISTEN", &v)?;
        }
        if let Some(v) = var("RECON_UPSTREAM") {
            self.upstream = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(v) = var("RECON_TOKEN") {
            self.token = v;
        }
        if let Some(v) = var("RECON_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("RECON_PEERS") {
            self.bootstrap_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("RECON_CAPTURE_PATH") {
            self.capture_path = PathBuf::from(v);
        }
        if let Some(v) = var("RECON_CYCLES") {
            self.cycles = parse("RECON_CYCLES", &v)?;
        }
        if let Some(v) = var("RECON_INTERVAL_MS") {
            self.interval_ms = parse("RECON_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("RECON_CALL_TIMEOUT_MS") {
            self.call_timeout_ms = parse("RECON_CALL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("RECON_NOTIFY_TIMEOUT_MS") {
            self.notify_timeout_ms = parse("RECON_NOTIFY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("RECON_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse("RECON_CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("RECON_MAX_BLOCKING_THREADS") {
            self.max_blocking_threads = parse("RECON_MAX_BLOCKING_THREADS", &v)?;
        }
        if let Some(v) = var("RECON_LOG_LEVEL") {
            self.logger.level = v;
        }
        if let Some(v) = var("RECON_LOG_FORMAT") {
            self.logger.format = v.parse::<LoggerFormat>().map_err(|_| ConfigError::InvalidValue {
                key: "RECON_LOG_FORMAT",
                value: v,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycles == 0 {
            return Err(ConfigError::Invalid("cycles must be positive".into()));
        }
        for (key, value) in [
            ("interval_ms", self.interval_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("notify_timeout_ms", self.notify_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be positive")));
            }
        }
        if self.max_blocking_threads == 0 {
            return Err(ConfigError::Invalid(
                "max_blocking_threads must be positive".into(),
            ));
        }
        match (&self.upstream, self.tier) {
            (None, Tier::Edge | Tier::Worker) => {
                return Err(ConfigError::Invalid(format!(
                    "{} nodes need an upstream address",
                    self.tier
                )));
            }
            (Some(up), _) if !(up.starts_with("http://") || up.starts_with("https://")) => {
                return Err(ConfigError::InvalidValue {
                    key: "upstream",
                    value: up.clone(),
                });
            }
            _ => {}
        }
        if let Some(id) = &self.node_id {
            NodeId::parse(id.as_str()).map_err(|_| ConfigError::InvalidValue {
                key: "node_id",
                value: id.clone(),
            })?;
        }
        Ok(())
    }

    pub fn resolved_node_id(&self) -> NodeId {
        if let Some(id) = &self.node_id {
            return NodeId::from(id.as_str());
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty() && !h.contains('/'))
            .map(NodeId::from)
            .unwrap_or_else(|| NodeId::from("recon-node"))
    }

    pub fn node_settings(&self) -> NodeSettings {
        let mut settings = NodeSettings::new(self.tier, self.resolved_node_id());
        settings.upstream = self.upstream.clone();
        settings.token = self.token.clone();
        settings.data_dir = self.data_dir.clone();
        settings.bootstrap_peers = self.bootstrap_peers.clone();
        settings.runner = RunnerConfig {
            cycles: self.cycles,
            interval: Duration::from_millis(self.interval_ms),
        };
        settings.dispatch = DispatchConfig {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        };
        settings.notify_timeout = Duration::from_millis(self.notify_timeout_ms);
        settings
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            timeout: Duration::from_millis(self.call_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..PeerConfig::default()
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
