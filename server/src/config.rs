//! Relay configuration loaded from a JSON file and overridden from the command line.

use serde::{Deserialize, Serialize};
use shared::Vector3;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server_name: String,
    pub network_interface: String,
    pub port: u16,
    pub backend_host: String,
    pub backend_port: u16,
    /// Server ticks per second.
    pub update_fps: u32,
    /// Rank label to capability labels.
    pub ranks: BTreeMap<String, Vec<String>>,
    /// Lines sent to a player after joining. `%(server_name)s` is substituted.
    pub welcome: Vec<String>,
    pub max_connections_per_ip: usize,
    /// `None` keeps storage in memory only.
    pub data_path: Option<PathBuf>,
    pub default_spawn: [i64; 3],
    /// Chat messages containing any of these words are dropped.
    pub banned_words: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let mut ranks = BTreeMap::new();
        ranks.insert("default".to_string(), vec!["member".to_string()]);
        ranks.insert(
            "admin".to_string(),
            vec!["member".to_string(), "admin".to_string()],
        );

        Self {
            server_name: "a mitm relay".to_string(),
            network_interface: "0.0.0.0".to_string(),
            port: 12345,
            backend_host: "127.0.0.1".to_string(),
            backend_port: 12346,
            update_fps: 20,
            ranks,
            welcome: vec![
                "Welcome to %(server_name)s!".to_string(),
                "Type /help to get a list of commands.".to_string(),
            ],
            max_connections_per_ip: 5,
            data_path: Some(PathBuf::from("./data/relay.json")),
            default_spawn: [550301073408, 550301073408, 1000000],
            banned_words: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Reads a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RelayConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.normalized()
    }

    /// Lower-cases rank labels and checks values the relay cannot run with.
    pub fn normalized(mut self) -> Result<Self, ConfigError> {
        if self.update_fps == 0 {
            return Err(ConfigError::Invalid("update_fps must be at least 1".into()));
        }
        if self.max_connections_per_ip == 0 {
            return Err(ConfigError::Invalid(
                "max_connections_per_ip must be at least 1".into(),
            ));
        }

        self.ranks = self
            .ranks
            .into_iter()
            .map(|(rank, rights)| {
                let rights = rights.into_iter().map(|r| r.to_lowercase()).collect();
                (rank.to_lowercase(), rights)
            })
            .collect();
        self.banned_words = self
            .banned_words
            .into_iter()
            .map(|w| w.to_lowercase())
            .collect();
        Ok(self)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network_interface, self.port)
    }

    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }

    /// Applies a `host:port` backend override.
    pub fn set_backend(&mut self, backend: &str) -> Result<(), ConfigError> {
        if let Ok(addr) = backend.parse::<SocketAddr>() {
            self.backend_host = addr.ip().to_string();
            self.backend_port = addr.port();
            return Ok(());
        }
        let (host, port) = backend
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("backend {backend:?} is not host:port")))?;
        self.backend_port = port
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("backend port {port:?} is not a number")))?;
        self.backend_host = host.to_string();
        Ok(())
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.update_fps.max(1) as f64)
    }

    pub fn spawn_point(&self) -> Vector3 {
        let [x, y, z] = self.default_spawn;
        Vector3::new(x, y, z)
    }

    /// Welcome lines with the server name filled in.
    pub fn welcome_lines(&self) -> Vec<String> {
        self.welcome.iter().map(|line| self.format(line)).collect()
    }

    pub fn format(&self, line: &str) -> String {
        line.replace("%(server_name)s", &self.server_name)
    }
}
