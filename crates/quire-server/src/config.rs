//! Server configuration
//!
//! Loaded from:
//! 1. Default values
//! 2. Config file (~/.config/quire/server.toml, or QUIRE_SERVER_CONFIG)
//! 3. Environment variables (QUIRE_SERVER_* prefix)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "QUIRE_SERVER";

/// Document server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root directory for per-project stores
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Origins allowed to open document connections
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Session token to user identity
    #[serde(default)]
    pub sessions: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            allowed_origins: Vec::new(),
            sessions: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load from the default location with environment overrides
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from a specific path; a missing file yields defaults
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: ServerConfig =
            toml::from_str(toml_content).context("Failed to parse server config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // QUIRE_SERVER_BIND
        if let Ok(val) = std::env::var(format!("{}_BIND", ENV_PREFIX)) {
            self.bind_addr = val;
        }

        // QUIRE_SERVER_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // QUIRE_SERVER_ALLOWED_ORIGINS (comma separated, replaces the list)
        if let Ok(val) = std::env::var(format!("{}_ALLOWED_ORIGINS", ENV_PREFIX)) {
            self.allowed_origins = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Get the config file path
    ///
    /// Can be overridden with QUIRE_SERVER_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quire")
            .join("server.toml")
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:3030".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quire-server")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "QUIRE_SERVER_BIND",
        "QUIRE_SERVER_DATA_DIR",
        "QUIRE_SERVER_ALLOWED_ORIGINS",
    ];

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3030");
        assert!(config.allowed_origins.is_empty());
        assert!(config.sessions.is_empty());
        assert!(config.data_dir.ends_with("quire-server"));
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = ServerConfig::load_from_str(
            r#"
            bind_addr = "0.0.0.0:8080"
            data_dir = "/srv/quire"
            allowed_origins = ["https://app.example.com"]

            [sessions]
            "tok-alice" = "alice"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.data_dir, PathBuf::from("/srv/quire"));
        assert_eq!(config.allowed_origins, vec!["https://app.example.com"]);
        assert_eq!(config.sessions.get("tok-alice").map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_env_overrides() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("QUIRE_SERVER_BIND", "127.0.0.1:9999");
        env::set_var(
            "QUIRE_SERVER_ALLOWED_ORIGINS",
            "https://a.example.com, https://b.example.com,",
        );

        let config = ServerConfig::load_from_str("").unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9999");
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example.com", "https://b.example.com"]
        );
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let _guard = EnvGuard::new(ENV_VARS);
        let config =
            ServerConfig::load_from_path(Path::new("/nonexistent/server.toml")).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:3030");
    }
}
