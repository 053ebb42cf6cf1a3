use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uch_core::sysinfo::MINIMUM_SUPPORTED_BUILD;
use uch_core::{ApplicationIdentity, Failure};

pub const CONFIG_ENV: &str = "UCH_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub prog_id_prefix: String,
    pub install_suffix: String,
    /// Set when the install uses per-user suffixes; such ProgIds are new
    /// registrations and must fit in 39 characters.
    pub user_specific_suffix: Option<String>,
    pub write_threshold_ms: u64,
    pub minimum_build: u32,
    pub audit_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prog_id_prefix: String::new(),
            install_suffix: String::new(),
            user_specific_suffix: None,
            write_threshold_ms: 100,
            minimum_build: MINIMUM_SUPPORTED_BUILD,
            audit_log: None,
        }
    }
}

impl Config {
    /// `--prog-id` wins over the configured prefix and suffix.
    pub fn identity(&self, prog_id: Option<&str>) -> Result<ApplicationIdentity, Failure> {
        match prog_id {
            Some(p) => ApplicationIdentity::new(p),
            None => ApplicationIdentity::for_installation(
                &self.prog_id_prefix,
                &self.install_suffix,
                self.user_specific_suffix.as_deref(),
            ),
        }
    }

    pub fn write_threshold(&self) -> Duration {
        Duration::from_millis(self.write_threshold_ms)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(crate::logging::default_log_path)
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    if let Some(appdata) = std::env::var_os("APPDATA") {
        return PathBuf::from(appdata)
            .join("UserChoiceKit")
            .join("config.json");
    }
    PathBuf::from("config.json")
}

/// A missing file means defaults.
pub fn load_config(path: &Path) -> std::io::Result<Config> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(e),
    };

    serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
