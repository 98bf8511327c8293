//! Server configuration.
//!
//! One JSON file carries the HTTP settings, the API keys, the webhook targets and the
//! engine configuration under `engine`.

use crate::security::{self, ApiKeyConfig};
use crate::webhooks::WebhookConfig;
use anyhow::{Context, Result};
use fwcrypt_core::config::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    /// Largest accepted upload, in bytes
    pub max_upload_bytes: usize,
    pub api_keys: Vec<ApiKeyConfig>,
    pub webhooks: WebhookConfig,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: security::bind_address(),
            max_upload_bytes: security::MAX_UPLOAD_SIZE,
            api_keys: Vec::new(),
            webhooks: WebhookConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read server config {}", path.display()))?;
        let config: ServerConfig = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse server config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write server config {}", path.display()))?;
        Ok(())
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
