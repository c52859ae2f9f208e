use crate::heartbeat::HeartbeatConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "PROGRESS_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Session ids are appended to this as one path segment.
    pub base_url: String,
    pub ping_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:8000/ws/progress".to_string(),
            ping_interval_secs: 25,
            heartbeat_timeout_secs: 40,
        }
    }
}

impl TrackerConfig {
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            timeout: Duration::from_secs(self.heartbeat_timeout_secs),
        }
    }

    pub fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(self.base_url.trim()).map_err(|err| ConfigError::Url(err.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid("tracker.base_url must use ws:// or wss://"));
        }
        if url.cannot_be_a_base() {
            return Err(ConfigError::Invalid("tracker.base_url must be a hierarchical url"));
        }
        Ok(url)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_base_url()?;
        if self.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid("tracker.ping_interval_secs must be non-zero"));
        }
        if self.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::Invalid("tracker.heartbeat_timeout_secs must be non-zero"));
        }
        // A full ping round trip has to fit in the window before it can lapse.
        if self.ping_interval_secs.saturating_mul(2) >= self.heartbeat_timeout_secs {
            return Err(ConfigError::Invalid(
                "tracker.ping_interval_secs must be less than half of heartbeat_timeout_secs",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub step_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub total_items: u64,
    pub services: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            step_interval_ms: 500,
            heartbeat_interval_secs: 10,
            total_items: 200,
            services: vec![
                "crm".to_string(),
                "billing".to_string(),
                "support".to_string(),
                "analytics".to_string(),
            ],
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero"));
        }
        if self.step_interval_ms == 0 {
            return Err(ConfigError::Invalid("server.step_interval_ms must be non-zero"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("server.heartbeat_interval_secs must be non-zero"));
        }
        if self.total_items == 0 {
            return Err(ConfigError::Invalid("server.total_items must be non-zero"));
        }
        if self.services.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid("server.services must name at least one service"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid(&'static str),
    Url(String),
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    AlreadyExists(PathBuf),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
            Self::Url(err) => write!(f, "invalid tracker.base_url: {err}"),
            Self::Io(err) => write!(f, "config io error: {err}"),
            Self::Parse(err) => write!(f, "config parse error: {err}"),
            Self::Serialize(err) => write!(f, "config serialize error: {err}"),
            Self::AlreadyExists(path) => write!(f, "{} already exists", path.display()),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Serialize(err) => Some(err),
            Self::Invalid(_) | Self::Url(_) | Self::AlreadyExists(_) => None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = active_config_path();
        let mut config = match fs::read_to_string(&config_path) {
            Ok(raw) => toml::from_str::<Config>(&raw).map_err(ConfigError::Parse)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(ConfigError::Io(err)),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(format!("{ENV_PREFIX}{key}")).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Tracker settings
        if let Some(val) = lookup("BASE_URL") {
            self.tracker.base_url = val;
        }
        if let Some(secs) = lookup("PING_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.tracker.ping_interval_secs = secs;
        }
        if let Some(secs) = lookup("HEARTBEAT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.tracker.heartbeat_timeout_secs = secs;
        }

        // Simulated feed settings
        if let Some(port) = lookup("SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(ms) = lookup("STEP_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.server.step_interval_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tracker.validate()?;
        self.server.validate()
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(ConfigError::Io)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default()).map_err(ConfigError::Serialize)?;
        fs::write(path, data).map_err(ConfigError::Io)
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{ENV_PREFIX}CONFIG_PATH")) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .or_else(|_| env::var("APPDATA"))
        .unwrap_or_else(|_| ".".to_string());
    Path::new(&base).join("ingest-progress").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
