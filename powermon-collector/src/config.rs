//! Configuration management
//!
//! Handles:
//! - TOML file with collector/serial/server/auth/data/logging sections
//! - OS-specific default location
//! - Validation and defaults
//! - Applying what the server hands back at registration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::client::{ClientSettings, Credentials, Registration};

const DEFAULT_MAX_CACHE_SIZE: i64 = 10_000;
const DEFAULT_BATCH_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("could not access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("could not find config directory")]
    NoConfigDir,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub collector: CollectorInfo,
    pub serial: SerialConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub data: DataConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Modbus slave address
    pub address: u8,
    /// Seconds between samples
    pub sample_interval: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub api_prefix: String,
    /// Seconds
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: String,
    pub registration_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub cache_db: PathBuf,
    pub max_cache_size: i64,
    pub batch_size: u32,
    /// Seconds between forwarding passes
    pub upload_interval: u64,
    pub auto_upload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, `RUST_LOG` wins when set
    pub level: String,
}

impl Default for CollectorInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: default_name(),
            description: String::new(),
            location: String::new(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            address: crate::device::DEFAULT_ADDRESS,
            sample_interval: 30,
            timeout_ms: 1000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_prefix: "/api/v1".to_string(),
            timeout: 30,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        let cache_db = dirs::data_local_dir()
            .map(|d| d.join("powermon-collector").join("cache.db"))
            .unwrap_or_else(|| PathBuf::from("cache.db"));
        Self {
            cache_db,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            upload_interval: 60,
            auto_upload: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// What the service needs to run its loops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub collector_id: String,
    pub sample_interval: Duration,
    pub upload_interval: Duration,
    pub batch_size: u32,
    pub auto_upload: bool,
}

/// Fixed cadences, overridable for tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTimings {
    pub heartbeat_interval: Duration,
    pub maintenance_interval: Duration,
    pub breaker_pause: Duration,
    pub retention: Duration,
    pub read_attempts: u32,
}

impl Default for ServiceTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5 * 60),
            maintenance_interval: Duration::from_secs(60 * 60),
            breaker_pause: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            read_attempts: 3,
        }
    }
}

impl CollectorConfig {
    /// Load from an explicit path, falling back to the default location
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        let mut config = Self::from_toml(&content)?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io { path: parent.to_path_buf(), source })?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Ok(())
    }

    /// `<config dir>/powermon-collector/config.toml`
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("powermon-collector");
        path.push("config.toml");
        Ok(path)
    }

    /// Rejects unusable settings, fills in size defaults
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.collector.name.trim().is_empty() {
            self.collector.name = default_name();
        }
        if self.collector.name.trim().is_empty() {
            return Err(ConfigError::Invalid("collector name is required".into()));
        }
        if self.serial.port.is_empty() {
            return Err(ConfigError::Invalid("serial port is required".into()));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("invalid baud rate: 0".into()));
        }
        if self.server.base_url.is_empty() {
            return Err(ConfigError::Invalid("server base URL is required".into()));
        }
        if self.auth.token.is_empty() && self.auth.registration_code.is_empty() {
            return Err(ConfigError::Invalid(
                "either token or registration code is required".into(),
            ));
        }
        if self.serial.sample_interval == 0 {
            return Err(ConfigError::Invalid("sample interval must be positive".into()));
        }
        if self.data.auto_upload && self.data.upload_interval == 0 {
            return Err(ConfigError::Invalid("upload interval must be positive".into()));
        }

        if self.data.max_cache_size <= 0 {
            self.data.max_cache_size = DEFAULT_MAX_CACHE_SIZE;
        }
        if self.data.batch_size == 0 {
            self.data.batch_size = DEFAULT_BATCH_SIZE;
        }
        Ok(())
    }

    /// A token alone is not enough, the collector id must be known too
    pub fn needs_registration(&self) -> bool {
        self.credentials().is_none()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        let credentials = Credentials {
            collector_id: self.collector.id.clone(),
            token: self.auth.token.clone(),
        };
        credentials.is_complete().then_some(credentials)
    }

    /// Store the issued token and take the server's settings where it sent any
    pub fn apply_registration(&mut self, registration: &Registration) {
        self.auth.token = registration.credentials.token.clone();
        self.collector.id = registration.credentials.collector_id.clone();

        if let Some(overrides) = &registration.overrides {
            if overrides.sample_interval > 0 {
                self.serial.sample_interval = overrides.sample_interval;
            }
            if overrides.upload_interval > 0 {
                self.data.upload_interval = overrides.upload_interval;
            }
            if overrides.max_cache_size > 0 {
                self.data.max_cache_size = overrides.max_cache_size;
            }
            self.data.auto_upload = overrides.auto_upload;
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.server.base_url.clone(),
            api_prefix: self.server.api_prefix.clone(),
            timeout: Duration::from_secs(self.server.timeout.max(1)),
        }
    }

    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial.timeout_ms)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            collector_id: self.collector.id.clone(),
            sample_interval: Duration::from_secs(self.serial.sample_interval),
            upload_interval: Duration::from_secs(self.data.upload_interval),
            batch_size: self.data.batch_size,
            auto_upload: self.data.auto_upload,
        }
    }
}
