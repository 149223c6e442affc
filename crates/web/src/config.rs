//! Console configuration

use qmanager_common::Architecture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Console configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// HTTP listen address
    pub listen: String,

    /// Base URL used in menu and action links
    pub www: String,

    /// Directory holding `database.sqlite`
    pub data_dir: PathBuf,

    /// Root for disk and CDROM images
    pub images_dir: PathBuf,

    /// Emulator target for new machines
    pub default_arch: Architecture,

    /// Session lifetime in seconds
    pub session_ttl_secs: i64,

    /// Session cookie name
    pub cookie_name: String,

    /// Largest image the create form accepts, in MB
    pub image_size_max_mb: i64,

    /// bcrypt work factor for password hashes
    pub password_cost: u32,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            www: String::new(),
            data_dir: PathBuf::from("data"),
            images_dir: PathBuf::from("images"),
            default_arch: Architecture::X86_64,
            session_ttl_secs: 12 * 60 * 60,
            cookie_name: "qmanager_session".to_string(),
            image_size_max_mb: 1_048_576,
            password_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl ConsoleConfig {
    /// Load configuration from file, or defaults when the file is missing
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("database.sqlite")
    }

    /// Absolute link for a router path, e.g. `machine/manage/list`
    pub fn link(&self, q: &str) -> String {
        format!("{}/?q={}", self.www.trim_end_matches('/'), q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: ConsoleConfig = toml::from_str(
            r#"
            listen = "0.0.0.0:9000"
            default_arch = "aarch64"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.default_arch, Architecture::Aarch64);
        assert_eq!(config.cookie_name, "qmanager_session");
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("qmanager.toml");
        let config = ConsoleConfig {
            www: "http://localhost:8080".into(),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = ConsoleConfig::load(&path).unwrap();
        assert_eq!(loaded.www, "http://localhost:8080");
        assert_eq!(loaded.db_path(), PathBuf::from("data/database.sqlite"));
        assert_eq!(loaded.link("auth/login"), "http://localhost:8080/?q=auth/login");
    }

    #[test]
    fn missing_file_is_default() {
        let config = ConsoleConfig::load(Path::new("/nonexistent/qmanager.toml")).unwrap();
        assert_eq!(config.session_ttl_secs, 43_200);
    }
}
