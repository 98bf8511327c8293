//! Engine configuration.
//!
//! Stored as JSON. Every field has a default, so a partial file (or none at all) is valid.

use crate::engine::analysis::disassembler::DEFAULT_MAX_FUNCTION_INSTRUCTIONS;
use crate::engine::arch::DEFAULT_ARCH_THRESHOLD;
use crate::engine::compliance::Ruleset;
use crate::engine::loader::LoaderOptions;
use crate::engine::pipeline::PipelineOptions;
use crate::engine::protocol::DEFAULT_HOP_BOUND;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "FWCRYPT_CONFIG";

/// Pick the configuration path: an explicit path wins over `FWCRYPT_CONFIG`.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Images analyzed concurrently
    pub workers: usize,
    /// Jobs admitted (queued or running) before submissions fail with `PoolSaturated`
    pub queue_capacity: usize,
    /// Wall-clock budget per job, from the start of processing
    pub job_timeout_secs: u64,
    /// Call-graph distance bound for protocol grouping
    pub hop_bound: u32,
    pub arch_threshold: f64,
    /// Load address of raw images
    pub raw_base_address: u64,
    pub max_function_instructions: usize,
    /// Directory for persisted reports; in-memory only when unset
    pub report_dir: Option<PathBuf>,
    /// Compliance ruleset file; the embedded ruleset when unset
    pub ruleset_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers: usize = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .clamp(1, 8);
        Self {
            workers,
            queue_capacity: 64,
            job_timeout_secs: 300,
            hop_bound: DEFAULT_HOP_BOUND,
            arch_threshold: DEFAULT_ARCH_THRESHOLD,
            raw_base_address: 0,
            max_function_instructions: DEFAULT_MAX_FUNCTION_INSTRUCTIONS,
            report_dir: None,
            ruleset_path: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Load from `path` if given, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs.max(1))
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            loader: LoaderOptions {
                raw_base_address: self.raw_base_address,
                arch_threshold: self.arch_threshold,
            },
            max_function_instructions: self.max_function_instructions,
            hop_bound: self.hop_bound,
        }
    }

    /// The configured ruleset, or the embedded one.
    pub fn ruleset(&self) -> Result<Ruleset> {
        let ruleset = match &self.ruleset_path {
            Some(path) => Ruleset::load(path)?,
            None => Ruleset::embedded().context("Embedded ruleset is invalid")?,
        };
        Ok(ruleset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"hop_bound": 7, "job_timeout_secs": 5}"#).unwrap();
        assert_eq!(config.hop_bound, 7);
        assert_eq!(config.job_timeout(), Duration::from_secs(5));
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.pipeline_options().loader.arch_threshold, DEFAULT_ARCH_THRESHOLD);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let config = EngineConfig {
            workers: 3,
            report_dir: Some(dir.path().join("reports")),
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_explicit_path_wins() {
        let explicit = PathBuf::from("/etc/fwcrypt.json");
        assert_eq!(config_path(Some(&explicit)), Some(explicit));
    }
}
