//! Configuration for the kas router.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. Config file (`~/.config/kas/settings.json` or an explicit path)
//! 3. Environment variables
//! 4. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete kas router configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KasConfig {
    #[serde(default)]
    pub private_api: PrivateApiConfig,
    #[serde(default)]
    pub internal_api: InternalApiConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Agent gRPC services to route through tunnels.
    #[serde(default)]
    pub agent_api: Vec<AgentApiConfig>,
}

/// Server that sibling kas instances dial to reach tunnels held here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivateApiConfig {
    pub listen: SocketAddr,
    /// URL advertised to siblings, `tcp://host:port`. Empty means tunnels
    /// held by this instance are not routable from elsewhere.
    pub url: String,
    pub max_connection_age_secs: u64,
}

impl Default for PrivateApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8155)),
            url: String::new(),
            max_connection_age_secs: 30 * 60,
        }
    }
}

impl PrivateApiConfig {
    pub const fn max_connection_age(&self) -> Duration {
        Duration::from_secs(self.max_connection_age_secs)
    }
}

/// Server that in-cluster callers use to reach agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalApiConfig {
    pub listen: SocketAddr,
}

impl Default for InternalApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8153)),
        }
    }
}

/// Polling periods of the routing side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Pause between full routing attempts (milliseconds).
    pub route_attempt_period_ms: u64,
    /// Pause between tunnel tracker queries that found nothing (milliseconds).
    pub get_tunnels_attempt_period_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            route_attempt_period_ms: 3_000,
            get_tunnels_attempt_period_ms: 1_000,
        }
    }
}

impl RouterConfig {
    pub const fn route_attempt_period(&self) -> Duration {
        Duration::from_millis(self.route_attempt_period_ms)
    }

    pub const fn get_tunnels_attempt_period(&self) -> Duration {
        Duration::from_millis(self.get_tunnels_attempt_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// An agent gRPC service exposed through the router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentApiConfig {
    /// Fully-qualified service name, e.g. `gitlab.agent.grpctool.test.Testing`.
    pub service: String,
    /// Unary method names.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Streaming method names.
    #[serde(default)]
    pub streams: Vec<String>,
}

impl KasConfig {
    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.router.route_attempt_period_ms == 0 {
            return Err(Error::Config(
                "router.route_attempt_period_ms must be positive".into(),
            ));
        }
        if self.router.get_tunnels_attempt_period_ms == 0 {
            return Err(Error::Config(
                "router.get_tunnels_attempt_period_ms must be positive".into(),
            ));
        }
        if self.private_api.max_connection_age_secs == 0 {
            return Err(Error::Config(
                "private_api.max_connection_age_secs must be positive".into(),
            ));
        }
        let url = &self.private_api.url;
        if !url.is_empty() && !url.starts_with("tcp://") {
            return Err(Error::Config(format!(
                "private_api.url must use the tcp scheme, got {url}"
            )));
        }
        let mut seen = HashSet::new();
        for api in &self.agent_api {
            if api.service.is_empty() {
                return Err(Error::Config("agent_api.service must not be empty".into()));
            }
            if !seen.insert(api.service.as_str()) {
                return Err(Error::Config(format!(
                    "agent_api service {} is listed twice",
                    api.service
                )));
            }
            if api.methods.iter().any(|m| api.streams.contains(m)) {
                return Err(Error::Config(format!(
                    "agent_api service {} lists a method as both unary and streaming",
                    api.service
                )));
            }
        }
        Ok(())
    }
}

/// Load configuration: defaults, then the file (explicit path or the default
/// location if it exists), then environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<KasConfig> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => match default_config_path() {
            Some(p) if p.exists() => load_config_file(&p)?,
            _ => KasConfig::default(),
        },
    };

    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// `<config dir>/kas/settings.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("kas").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<KasConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut KasConfig) {
    if let Ok(val) = std::env::var("KAS_LOG_LEVEL") {
        config.observability.log_level = val;
    }
    if let Ok(val) = std::env::var("KAS_PRIVATE_API_URL") {
        config.private_api.url = val;
    }
}
