//! Service configuration.
//!
//! Values are layered: built-in defaults, an optional TOML file, then
//! `IMGSTREAM_*` environment variables (`__` separates nested keys, e.g.
//! `IMGSTREAM_STREAM__FRAMES_PER_SECOND=10`).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "imgstream";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub hostname: String,
    /// Port to listen on
    pub port: u16,
    /// Raise the default log level to debug
    pub debug: bool,
    /// Serve on the multi-threaded runtime
    pub threaded: bool,
    /// First path segment of every API route
    pub application_name: String,
    /// Second path segment of every API route
    pub api_version: String,
    /// Canonical base URL advertised to clients. Derived from hostname/port when empty.
    pub public_url: String,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 8385,
            debug: false,
            threaded: true,
            application_name: "image-streaming-service".to_string(),
            api_version: "v1".to_string(),
            public_url: String::new(),
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Path prefix shared by all API routes, e.g. `/image-streaming-service/v1`.
    pub fn base_path(&self) -> String {
        format!(
            "/{}/{}",
            self.application_name.trim_matches('/'),
            self.api_version.trim_matches('/')
        )
    }

    /// Canonical base URL used to build client-facing feed URLs.
    pub fn public_base_url(&self) -> String {
        let configured = self.public_url.trim();
        if !configured.is_empty() {
            return configured.trim_end_matches('/').to_string();
        }

        let host = match self.hostname.as_str() {
            "0.0.0.0" | "::" | "[::]" => "localhost",
            other => other,
        };
        format!("http://{}:{}{}", host, self.port, self.base_path())
    }
}

/// Streaming loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-attempt deadline for fetching one frame from an upstream
    pub frame_timeout_ms: u64,
    /// Deadline for handing one frame to a slow client
    pub write_timeout_ms: u64,
    /// Target frames per second; sets the fixed tick interval
    pub frames_per_second: u32,
    /// Frames buffered between a loop and its client connection
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 1000,
            write_timeout_ms: 5000,
            frames_per_second: 25,
            channel_capacity: 4,
        }
    }
}

impl StreamConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frames_per_second.max(1)))
    }
}

/// Session identity policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cookie carrying the session id
    pub cookie_name: String,
    /// Session used when the client sends no cookie
    pub fallback_session_id: String,
    /// Upstream the fallback session is bound to on first access
    pub fallback_upstream_uri: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "HBP".to_string(),
            fallback_session_id: "demo".to_string(),
            fallback_upstream_uri: "http://localhost:8383/snapshot".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn is_fallback(&self, session_id: &str) -> bool {
        session_id == self.fallback_session_id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Route persistence settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// SQLite database file. Defaults to `$XDG_DATA_HOME/imgstream/routes.db`.
    pub database_path: Option<String>,
}

impl StorageConfig {
    /// Resolve the database path, expanding `~` and environment variables.
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        match self.database_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => expand_str_path(path),
            None => Ok(default_data_dir()?.join("routes.db")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file plus the environment.
    ///
    /// An explicit path must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_file()?, false),
        };

        let built = Config::builder()
            .add_source(
                File::from(file.as_path())
                    .format(FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                Environment::with_prefix(&env_prefix())
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading configuration from {}", file.display()))?;

        built
            .try_deserialize()
            .context("parsing configuration")
    }

    /// Load configuration from a TOML string. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("parsing TOML configuration")
    }

    /// Render the configuration as TOML, prefixed with a short header.
    pub fn to_toml(&self) -> Result<String> {
        let body = toml::to_string_pretty(self).context("serializing config to TOML")?;
        Ok(format!("# Configuration for {APP_NAME}\n\n{body}"))
    }

    /// Write the default configuration to `path`, creating parent directories.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let body = Self::default().to_toml()?;
        std::fs::write(path, body)
            .with_context(|| format!("writing config file to {}", path.display()))
    }
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}
