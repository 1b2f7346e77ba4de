use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// Environment variable prefix; nested keys use `__`, e.g. `FLEETSCRIPT_AGENT__PORT`.
pub const ENV_PREFIX: &str = "FLEETSCRIPT_";

/// Address of the agent endpoint served by `fleetscript agent`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4100,
        }
    }
}

/// A remote agent the controller can dispatch to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeEndpoint {
    pub name: String,
    pub url: String,
}

/// Configuration for the controller and agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Holds `scripts/`, `registry.json` and `approvals.json`
    pub home_dir: PathBuf,
    pub script_extension: String,
    pub node_timeout_ms: u64,
    pub max_parallel_dispatch: usize,
    pub agent: AgentConfig,
    pub nodes: Vec<NodeEndpoint>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home_dir: PathBuf::from("fleetscript"),
            script_extension: "js".to_string(),
            node_timeout_ms: 30_000,
            max_parallel_dispatch: 16,
            agent: AgentConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file if given, then `FLEETSCRIPT_*` variables.
    pub fn load(file: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            figment = figment.merge(Toml::file(file));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Create config from environment variables only
    pub fn from_env() -> AppResult<Self> {
        Self::load(None)
    }

    /// Config rooted at `home_dir`, with short timeouts for tests
    pub fn test_config(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            node_timeout_ms: 2_000,
            max_parallel_dispatch: 4,
            agent: AgentConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            ..Self::default()
        }
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.home_dir.join("scripts")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.home_dir.join("registry.json")
    }

    pub fn approvals_path(&self) -> PathBuf {
        self.home_dir.join("approvals.json")
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn agent_addr(&self) -> String {
        format!("{}:{}", self.agent.host, self.agent.port)
    }
}
