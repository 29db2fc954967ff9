//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use lyricline_core::Config as CoreConfig;
use serde::Deserialize;

/// Server configuration loaded from YAML with `LYRICLINE_*` environment
/// overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the WebSocket server to.
    /// Override: `LYRICLINE_BIND_PORT`
    pub bind_port: u16,

    /// The session-server tunables from spec §6's configuration table
    /// (rate limits, matcher thresholds, STT watchdog timers, debounce and
    /// cooldown windows, the mock-setlist fallback knob).
    #[serde(flatten)]
    pub core: CoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_port: 8765,
            core: CoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.core.validate();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LYRICLINE_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }
        if let Ok(val) = std::env::var("LYRICLINE_FALLBACK_TO_MOCK_SETLIST") {
            if let Ok(enabled) = val.parse() {
                self.core.fallback_to_mock_setlist = enabled;
            }
        }
        if let Ok(val) = std::env::var("LYRICLINE_MATCHER_SIMILARITY_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                self.core.matcher_similarity_threshold = threshold;
            }
        }
    }
}
