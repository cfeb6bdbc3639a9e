//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `INTRA_NODE_COMM_*` environment variables override config file values.
//! Example: `INTRA_NODE_COMM_ENABLED=0` disables the subsystem without code changes.

use crate::utils::error::{CommError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Runtime configuration for the intra-node transport.
///
/// The thresholds encode the measured crossover between handshake-dominated
/// and bandwidth-dominated payload regimes; override them only when profiling
/// a specific fabric says otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommConfig {
    /// Master switch. When false the selector refuses every payload.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Largest payload (bytes, post-alignment) routed to the one-shot kernel.
    #[serde(default = "default_one_shot_thresh")]
    pub one_shot_thresh_bytes: usize,

    /// Largest payload (bytes, post-alignment) routed to the two-shot kernel.
    #[serde(default = "default_two_shot_thresh")]
    pub two_shot_thresh_bytes: usize,

    /// Largest payload (bytes, post-alignment) routed to the hybrid-cube-mesh kernel.
    #[serde(default = "default_hcm_thresh")]
    pub hcm_thresh_bytes: usize,
}

fn default_enabled() -> bool {
    true
}
fn default_one_shot_thresh() -> usize {
    crate::comm::ONE_SHOT_THRESH_BYTES
}
fn default_two_shot_thresh() -> usize {
    crate::comm::TWO_SHOT_THRESH_BYTES
}
fn default_hcm_thresh() -> usize {
    crate::comm::HCM_THRESH_BYTES
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            one_shot_thresh_bytes: default_one_shot_thresh(),
            two_shot_thresh_bytes: default_two_shot_thresh(),
            hcm_thresh_bytes: default_hcm_thresh(),
        }
    }
}

impl CommConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| CommError::Configuration(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        for (key, value) in env::vars() {
            let Some(field) = key.strip_prefix("INTRA_NODE_COMM_") else {
                continue;
            };

            match field.to_lowercase().as_str() {
                "enabled" | "enable" => {
                    let v = value.to_lowercase();
                    self.enabled = v == "true" || v == "1";
                }
                "one_shot_thresh_bytes" => {
                    if let Ok(v) = value.parse() {
                        self.one_shot_thresh_bytes = v;
                    }
                }
                "two_shot_thresh_bytes" => {
                    if let Ok(v) = value.parse() {
                        self.two_shot_thresh_bytes = v;
                    }
                }
                "hcm_thresh_bytes" => {
                    if let Ok(v) = value.parse() {
                        self.hcm_thresh_bytes = v;
                    }
                }
                "log_format" => {} // consumed by utils::logging
                _ => {
                    debug!(key = %key, "Unknown config key");
                }
            }
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.one_shot_thresh_bytes > crate::comm::MAX_INTRA_NODE_SIZE
            || self.two_shot_thresh_bytes > crate::comm::MAX_INTRA_NODE_SIZE
        {
            return Err(CommError::Configuration(format!(
                "Thresholds ({}, {}) exceed peer buffer capacity ({})",
                self.one_shot_thresh_bytes,
                self.two_shot_thresh_bytes,
                crate::comm::MAX_INTRA_NODE_SIZE
            )));
        }
        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CommError::Configuration(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Process-wide configuration, resolved from the environment once.
    pub fn global() -> &'static CommConfig {
        static GLOBAL: OnceLock<CommConfig> = OnceLock::new();
        GLOBAL.get_or_init(CommConfig::from_env)
    }
}
