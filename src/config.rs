use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::downloader::errors::{DownloadError, Result};
use crate::downloader::models::RetentionPolicy;
use crate::ytdlp::EngineConfig;

/// Directory name under the platform config dir
pub const APP_DIR: &str = "media-downloader";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Single root for every artifact the service writes
    pub output_dir: PathBuf,
    pub retention: RetentionPolicy,
    /// Entries a purge never removes, matched case-insensitively
    pub manifest_exceptions: Vec<String>,
    pub engine: EngineConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            retention: RetentionPolicy::Keep,
            manifest_exceptions: vec!["README.md".to_string()],
            engine: EngineConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DownloadError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// `<config dir>/media-downloader/config.toml`, when the platform has one
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load from `explicit`, else `./config.toml`, else the platform config
    /// file, else defaults. Returns the file that was used, if any.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        let candidates = std::iter::once(PathBuf::from(CONFIG_FILE)).chain(Self::default_path());
        for candidate in candidates {
            if candidate.is_file() {
                debug!(path = %candidate.display(), "loading config");
                return Ok((Self::from_file(&candidate)?, Some(candidate)));
            }
        }

        Ok((Self::default(), None))
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(DownloadError::Config("output_dir must not be empty".to_string()));
        }
        if self.engine.timeout_seconds == 0 {
            return Err(DownloadError::Config(
                "engine.timeout_seconds must be greater than zero".to_string(),
            ));
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Apply a command-line bind override and re-validate the result
    pub fn for_serving(mut self, bind: Option<String>) -> Result<Self> {
        if let Some(bind) = bind {
            self.server.bind = bind;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .map_err(|e| DownloadError::Config(format!("Invalid bind address '{}': {}", self.server.bind, e)))
    }
}
