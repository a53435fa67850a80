use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokenflow_common::Result;
use tracing::{debug, info};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub model: ModelConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When set, `/v1/*` routes require `Authorization: Bearer <key>`.
    pub api_key: Option<String>,
    /// Enables the cancel and active-request inspection endpoints.
    pub admin_endpoints: bool,
}

/// Upstream generation backend (llama.cpp-server compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
}

/// Identity and behavior of the single served model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Tool-call parser override; resolved from the model name when unset.
    pub tool_parser: Option<String>,
    /// Log normalized input messages at debug level.
    pub log_prompt_input: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8081,
                api_key: None,
                admin_endpoints: false,
            },
            backend: BackendConfig {
                url: "http://127.0.0.1:8080".to_string(),
                connect_timeout_secs: 5,
            },
            model: ModelConfig {
                name: "default".to_string(),
                tool_parser: None,
                log_prompt_input: false,
            },
        }
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<AppConfig> {
        if let Some(path) = path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let config: AppConfig = serde_json::from_str(&content)?;
                info!("loaded configuration from {}", path.display());
                return Ok(config);
            }
        }

        // Check default locations
        let default_paths = vec![
            PathBuf::from("tokenflow.json"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tokenflow/config.json"),
        ];

        for path in default_paths {
            if path.exists() {
                let content = std::fs::read_to_string(&path)?;
                let config: AppConfig = serde_json::from_str(&content)?;
                info!("loaded configuration from {}", path.display());
                return Ok(config);
            }
        }

        debug!("no configuration file found, using defaults");
        Ok(AppConfig::default())
    }

    /// Save configuration to file
    pub fn save(config: &AppConfig, path: &PathBuf) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
