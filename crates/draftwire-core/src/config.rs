// Configuration loading and parsing (draftwire.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::connection::{socket_origin, ReconnectPolicy, SyncOptions};
use crate::event_log::BackfillOrder;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "draftwire.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub poller: PollerConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Site origin, e.g. `https://dota.example.org`. The socket scheme is
    /// derived from it.
    pub origin: String,
    /// `sessionid` cookie for authenticated requests.
    pub session: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8000".into(),
            session: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 retries forever.
    pub max_attempts: u32,
    /// Extra random delay as a fraction of the nominal delay.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts.unwrap_or(0),
            jitter: policy.jitter,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Account the poll is made for. The poller stays idle without it.
    pub user_id: Option<i64>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 5,
            user_id: None,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub backfill_order: BackfillOrder,
}

impl Config {
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            reconnect: self.reconnect.policy(),
            backfill_order: self.events.backfill_order,
            ..SyncOptions::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load and validate `config/draftwire.toml` relative to `base_dir`.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    load_config_file(&base_dir.join("config").join(CONFIG_FILE))
}

/// Load and validate a specific config file.
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let text = read_file(path)?;
    let config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;

    validate(&config)?;

    Ok(config)
}

/// Look for `config/draftwire.toml` under the working directory, then in the
/// platform config directory. Falls back to built-in defaults when neither
/// exists.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    if cwd.join("config").join(CONFIG_FILE).exists() {
        return load_config_from(&cwd);
    }

    if let Some(path) = platform_config_path().filter(|p| p.exists()) {
        return load_config_file(&path);
    }

    let config = Config::default();
    validate(&config)?;
    Ok(config)
}

/// `draftwire.toml` in the per-user config directory, if one can be resolved.
pub fn platform_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "draftwire")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if let Err(e) = socket_origin(&config.server.origin) {
        return Err(ConfigError::ValidationError {
            field: "server.origin".into(),
            message: e.to_string(),
        });
    }

    let reconnect = &config.reconnect;
    if reconnect.base_delay_ms == 0 {
        return Err(ConfigError::ValidationError {
            field: "reconnect.base_delay_ms".into(),
            message: "must be greater than 0".into(),
        });
    }

    if reconnect.max_delay_ms < reconnect.base_delay_ms {
        return Err(ConfigError::ValidationError {
            field: "reconnect.max_delay_ms".into(),
            message: format!(
                "must be at least base_delay_ms ({}), got {}",
                reconnect.base_delay_ms, reconnect.max_delay_ms
            ),
        });
    }

    let jitter = reconnect.jitter;
    if !(0.0..=1.0).contains(&jitter) {
        return Err(ConfigError::ValidationError {
            field: "reconnect.jitter".into(),
            message: format!("must be between 0.0 and 1.0 inclusive, got {jitter}"),
        });
    }

    if config.poller.interval_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "poller.interval_secs".into(),
            message: "must be greater than 0".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
