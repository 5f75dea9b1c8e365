// Service Configuration
// Layered settings: built-in defaults, an optional TOML file, then ETOAD_* environment variables
//
//   ETOAD_LOG_LEVEL=debug
//   ETOAD_SERVER__LISTEN_ADDR=0.0.0.0:50052
//   ETOAD_REGISTRY__RETENTION_SECS=0

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File read when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "etoad.toml";

pub const ENV_PREFIX: &str = "ETOAD_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Fallback tracing filter when RUST_LOG is unset
    pub log_level: String,
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Base directory for relative job files
    pub protocol_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long finished executions stay queryable (0 = forever)
    pub retention_secs: u64,
    pub prune_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Intermediate payloads emitted per measurement step
    pub payloads_per_step: u32,
    /// Delay before each payload
    pub step_delay_ms: u64,
    /// JSON/YAML mapping of technique -> analysis outputs
    pub outputs_file: Option<PathBuf>,
    /// Techniques the simulated instrument accepts; empty accepts any
    pub techniques: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 50052)),
            protocol_dir: PathBuf::from("."),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            prune_interval_secs: 60,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            payloads_per_step: 3,
            step_delay_ms: 50,
            outputs_file: None,
            techniques: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Load from `path`, or from `etoad.toml` in the working directory when it exists
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        Self::figment(path).extract::<Self>()?.validated()
    }

    /// Defaults, then the TOML file (skipped when absent), then the environment
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ServiceConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "invalid log_level '{}', expected one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.registry.retention_secs > 0 && self.registry.prune_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "registry.prune_interval_secs must be positive when retention is enabled"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

impl RegistryConfig {
    /// `None` keeps finished executions forever
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_secs > 0).then(|| Duration::from_secs(self.retention_secs))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

impl SimulationConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}
