//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::calling::rtc::DEFAULT_STUN_SERVER;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity this client registers with on the relay
    pub user_id: Option<String>,
    /// WebSocket URL of the signaling relay
    pub relay_url: String,
    /// Listen address for `matchcall relay`
    pub relay_listen: String,
    /// Base URL of the call-record REST service (records are skipped if unset)
    pub records_url: Option<String>,
    /// STUN/TURN URLs handed to every peer connection
    pub ice_servers: Vec<String>,
    /// Seconds an outgoing call rings before giving up (0 = forever)
    pub ring_timeout_secs: u64,
    pub media: MediaConfig,
}

/// Devices the synthetic capture source pretends to have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub microphone: bool,
    pub camera: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: None,
            relay_url: "ws://127.0.0.1:8787/".to_string(),
            relay_listen: "0.0.0.0:8787".to_string(),
            records_url: None,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            ring_timeout_secs: 45,
            media: MediaConfig::default(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "matchcall", "matchcall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Restrictive permissions: the file names the user and their services
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// The identity to use, or an error telling the user how to set one.
    pub fn require_user(&self) -> Result<&str> {
        self.user_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .context("No user id configured. Run `matchcall config --set-user <id>` or pass --user.")
    }
}
