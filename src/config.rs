//! Configuration for academy-storage

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::unlock::CriteriaPolicy;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("academy-storage")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Address the HTTP API binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// How stored unlock criteria that fail to parse are treated
    #[serde(default)]
    pub criteria_policy: CriteriaPolicy,

    /// Page size used when a list request gives no limit
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    /// XP granted once per completed course on top of the course's own reward
    #[serde(default)]
    pub course_completion_bonus_xp: i64,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8095
}

fn default_page_size() -> u32 {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            bind_host: default_bind_host(),
            http_port: default_http_port(),
            criteria_policy: CriteriaPolicy::default(),
            default_page_size: default_page_size(),
            course_completion_bonus_xp: 0,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// SQLite database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join("academy.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("http_port = 9000\n").unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.bind_host, "0.0.0.0");
        assert_eq!(config.criteria_policy, CriteriaPolicy::FailClosed);
        assert_eq!(config.default_page_size, 50);
    }

    #[test]
    fn test_fail_open_policy_parses() {
        let config: Config = toml::from_str("criteria_policy = \"fail_open\"\n").unwrap();
        assert_eq!(config.criteria_policy, CriteriaPolicy::FailOpen);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.course_completion_bonus_xp = 25;

        config.save(config.config_path()).unwrap();
        let loaded = Config::load(config.config_path()).unwrap();

        assert_eq!(loaded.storage_dir, dir.path());
        assert_eq!(loaded.course_completion_bonus_xp, 25);
        assert_eq!(loaded.database_path(), dir.path().join("academy.db"));
    }
}
