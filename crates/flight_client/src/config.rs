//! # Decoder Configuration
//!
//! ```toml
//! # decoder.toml
//! max_row_length = 16777216
//! read_buffer_size = 8192
//! ```

use std::path::Path;

use flight_wire::{ConfigError, ConfigResult, DEFAULT_MAX_ROW_LENGTH};
use serde::{Deserialize, Serialize};

/// Decoder tunables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Longest row, declared segment or outlined value accepted, in bytes.
    pub max_row_length: usize,
    /// Buffer size used by [`crate::Response::read_from`].
    pub read_buffer_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_row_length: DEFAULT_MAX_ROW_LENGTH,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl DecoderConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed documents,
    /// [`ConfigError::InvalidValue`] for zero sizes.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`DecoderConfig::from_toml_str`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, &e))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_row_length == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_row_length",
                reason: "must be greater than zero",
            });
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "read_buffer_size",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DecoderConfig::from_toml_str("").unwrap();
        assert_eq!(config, DecoderConfig::default());
        assert_eq!(config.max_row_length, DEFAULT_MAX_ROW_LENGTH);
    }

    #[test]
    fn test_override_and_validate() {
        let config = DecoderConfig::from_toml_str("max_row_length = 64").unwrap();
        assert_eq!(config.max_row_length, 64);
        assert_eq!(config.read_buffer_size, 8 * 1024);

        assert!(matches!(
            DecoderConfig::from_toml_str("read_buffer_size = 0"),
            Err(ConfigError::InvalidValue { key: "read_buffer_size", .. })
        ));
        assert!(matches!(
            DecoderConfig::from_toml_str("max_row_length = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            DecoderConfig::from_toml_file("/nonexistent/decoder.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
