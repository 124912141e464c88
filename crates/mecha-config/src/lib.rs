//! Mechafoord Configuration
//!
//! TOML configuration loading with environment variable support

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_LOG_DIR: &str = "log";
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_FFPROBE: &str = "ffprobe";
const DEFAULT_REPLY_INTERVAL_MS: u64 = 500;
/// Discord rejects attachments above this size for non-boosted guilds.
const DEFAULT_UPLOAD_LIMIT_BYTES: u64 = 8_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    Dev,
    Prod,
}

impl RuntimeMode {
    pub fn is_dev(self) -> bool {
        self == RuntimeMode::Dev
    }
}

impl FromStr for RuntimeMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DEV" => Ok(RuntimeMode::Dev),
            "PROD" => Ok(RuntimeMode::Prod),
            _ => Err(ConfigError::Invalid {
                key: "ENVIRONMENT",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeMode::Dev => f.write_str("DEV"),
            RuntimeMode::Prod => f.write_str("PROD"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Unset until configured, see `CoreConfig::mode`.
    #[serde(default)]
    pub environment: Option<RuntimeMode>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            environment: None,
            log_level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub token: String,
    /// Guild that receives command registrations in `Dev` mode.
    pub dev_guild_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub cached_file_dir: Option<String>,
    pub exported_file_dir: Option<String>,
    pub exported_file_url: Option<String>,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: String,
    /// Where per-run ffmpeg stdout/stderr files are written. Defaults to the core log dir.
    pub tool_log_dir: Option<String>,
    #[serde(default = "default_reply_interval_ms")]
    pub reply_interval_ms: u64,
    #[serde(default = "default_upload_limit_bytes")]
    pub upload_limit_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cached_file_dir: None,
            exported_file_dir: None,
            exported_file_url: None,
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
            tool_log_dir: None,
            reply_interval_ms: default_reply_interval_ms(),
            upload_limit_bytes: default_upload_limit_bytes(),
        }
    }
}

/// Fully validated media settings. Producing one is the init check every
/// media command must pass before it is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSettings {
    pub cached_file_dir: PathBuf,
    pub exported_file_dir: PathBuf,
    pub exported_file_url: String,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub tool_log_dir: PathBuf,
    pub reply_interval_ms: u64,
    pub upload_limit_bytes: u64,
}

impl CoreConfig {
    /// Media commands and command registration both need an explicit mode.
    pub fn mode(&self) -> Result<RuntimeMode, ConfigError> {
        self.environment.ok_or(ConfigError::Missing("ENVIRONMENT"))
    }
}

impl MediaConfig {
    pub fn resolve(&self, log_dir: &str) -> Result<MediaSettings, ConfigError> {
        let cached_file_dir = require(&self.cached_file_dir, "CACHED_FILE_DIR")?;
        let exported_file_dir = require(&self.exported_file_dir, "EXPORTED_FILE_DIR")?;
        let exported_file_url = require(&self.exported_file_url, "EXPORTED_FILE_URL")?;

        if self.reply_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "reply_interval_ms",
                value: "0".to_string(),
            });
        }

        let tool_log_dir = self
            .tool_log_dir
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(log_dir);

        Ok(MediaSettings {
            cached_file_dir: PathBuf::from(cached_file_dir),
            exported_file_dir: PathBuf::from(exported_file_dir),
            exported_file_url: exported_file_url.to_string(),
            ffmpeg_path: PathBuf::from(&self.ffmpeg_path),
            ffprobe_path: PathBuf::from(&self.ffprobe_path),
            tool_log_dir: PathBuf::from(tool_log_dir),
            reply_interval_ms: self.reply_interval_ms,
            upload_limit_bytes: self.upload_limit_bytes,
        })
    }
}

fn require<'a>(value: &'a Option<String>, key: &'static str) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_log_dir() -> String {
    DEFAULT_LOG_DIR.to_string()
}

fn default_ffmpeg() -> String {
    DEFAULT_FFMPEG.to_string()
}

fn default_ffprobe() -> String {
    DEFAULT_FFPROBE.to_string()
}

fn default_reply_interval_ms() -> u64 {
    DEFAULT_REPLY_INTERVAL_MS
}

fn default_upload_limit_bytes() -> u64 {
    DEFAULT_UPLOAD_LIMIT_BYTES
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration purely from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        config.apply_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mechafoord").join("config.toml"))
    }

    /// Environment values win over file values when set and non-empty.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get("DISCORD_API_KEY") {
            self.discord.token = token;
        }
        if let Some(mode) = get("ENVIRONMENT") {
            self.core.environment = Some(mode.parse()?);
        }
        if let Some(raw) = get("DEV_GUILD_ID") {
            let id = raw.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
                key: "DEV_GUILD_ID",
                value: raw.clone(),
            })?;
            self.discord.dev_guild_id = Some(id);
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.core.log_level = level;
        }
        if let Some(dir) = get("LOG_DIR") {
            self.core.log_dir = dir;
        }
        if let Some(dir) = get("CACHED_FILE_DIR") {
            self.media.cached_file_dir = Some(dir);
        }
        if let Some(dir) = get("EXPORTED_FILE_DIR") {
            self.media.exported_file_dir = Some(dir);
        }
        if let Some(url) = get("EXPORTED_FILE_URL") {
            self.media.exported_file_url = Some(url);
        }
        if let Some(path) = get("FFMPEG_PATH") {
            self.media.ffmpeg_path = path;
        }
        if let Some(path) = get("FFPROBE_PATH") {
            self.media.ffprobe_path = path;
        }
        Ok(())
    }

    /// Checks that the bot can start at all. Media settings are validated
    /// separately per command so a broken media section only disables those
    /// commands.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discord.token.trim().is_empty() {
            return Err(ConfigError::Missing("DISCORD_API_KEY"));
        }
        if self.core.log_dir.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "log_dir",
                value: self.core.log_dir.clone(),
            });
        }
        Ok(())
    }
}
