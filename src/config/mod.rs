//! Configuration module for visionflow
//!
//! The engine is configured through a single [`EngineConfig`] value that can be
//! built in code, or loaded from a TOML file:
//!
//! ```toml
//! [gpu]
//! polling = "per_frame"
//! frame_interval_ms = 16
//! max_fence_attempts = 240
//!
//! [reader]
//! buffers = 2
//!
//! [encoder]
//! initial_length = 16
//! max_chain_steps = 32
//!
//! [pyramid]
//! max_levels = 4
//! max_scale = 2.0
//! ```
//!
//! Every section and field is optional; missing values take their defaults.

pub mod settings;

pub use settings::*;

use crate::error::{Result, VisionError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Conventional file name for an engine config
pub const CONFIG_FILE_NAME: &str = "visionflow.toml";

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// GPU context and fence polling
    pub gpu: GpuSettings,

    /// Buffered pixel reader
    pub reader: ReaderSettings,

    /// Keypoint encoder
    pub encoder: EncoderSettings,

    /// Pyramid constants for keypoint decoding
    pub pyramid: PyramidSettings,
}

impl EngineConfig {
    /// Parse a config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| VisionError::Config(format!("Failed to parse engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            VisionError::Config(format!("Failed to read engine config {:?}: {}", path, e))
        })?;

        Self::from_toml_str(&content)
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load engine config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    VisionError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| VisionError::Config(format!("Failed to serialize engine config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            VisionError::Config(format!("Failed to write engine config {:?}: {}", path, e))
        })
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.reader.buffers < 2 {
            return Err(VisionError::Config(format!(
                "reader.buffers must be at least 2 (got {})",
                self.reader.buffers
            )));
        }
        if self.gpu.max_fence_attempts == 0 {
            return Err(VisionError::Config(
                "gpu.max_fence_attempts must be positive".to_string(),
            ));
        }
        if self.gpu.max_texture_size == 0 {
            return Err(VisionError::Config(
                "gpu.max_texture_size must be positive".to_string(),
            ));
        }
        if self.pyramid.max_scale <= 1.0 {
            return Err(VisionError::Config(format!(
                "pyramid.max_scale must be greater than 1 (got {})",
                self.pyramid.max_scale
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [gpu]
            polling = "per_frame"

            [reader]
            buffers = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.gpu.polling, PollingStrategy::PerFrame);
        assert_eq!(config.gpu.max_fence_attempts, DEFAULT_MAX_FENCE_ATTEMPTS);
        assert_eq!(config.reader.buffers, 3);
        assert_eq!(config.encoder, EncoderSettings::default());
    }

    #[test]
    fn test_rejects_single_reader_buffer() {
        let err = EngineConfig::from_toml_str("[reader]\nbuffers = 1\n").unwrap_err();
        assert!(err.to_string().contains("reader.buffers"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = EngineConfig::default();
        config.encoder.max_chain_steps = 64;
        config.gpu.polling = PollingStrategy::PerFrame;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load_or_default(dir.path().join("missing.toml"));
        assert_eq!(config, EngineConfig::default());
    }
}
