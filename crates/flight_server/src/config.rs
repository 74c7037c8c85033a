//! # Encoder Configuration
//!
//! Tunables for a request and the client manifest that makes server
//! functions serializable. Both load from TOML; omitted keys take defaults.
//!
//! ```toml
//! # encoder.toml
//! outline_text_threshold = 1024
//! text_segment_size = 16384
//! redact_error_messages = true
//! max_pending_tasks = 512
//!
//! # manifest.toml
//! [functions.like]
//! locator = "actions/like.js"
//! export = "like"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use flight_wire::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

/// Message written instead of the real one when redaction is on.
pub const REDACTED_MESSAGE: &str =
    "an error occurred while rendering on the server; details were omitted";

/// Encoder tunables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Strings longer than this many bytes are outlined as text segments.
    pub outline_text_threshold: usize,
    /// Maximum payload of one `T`/`B` segment.
    pub text_segment_size: usize,
    /// Replace error messages with [`REDACTED_MESSAGE`], keeping digests.
    pub redact_error_messages: bool,
    /// Maximum deferred tasks outstanding at once.
    pub max_pending_tasks: Option<usize>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            outline_text_threshold: 1024,
            text_segment_size: 16 * 1024,
            redact_error_messages: false,
            max_pending_tasks: None,
        }
    }
}

impl EncoderConfig {
    /// Production settings: messages redacted.
    #[must_use]
    pub fn production() -> Self {
        Self {
            redact_error_messages: true,
            ..Self::default()
        }
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed documents,
    /// [`ConfigError::InvalidValue`] for out-of-range values.
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
    /// [`EncoderConfig::from_toml_str`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, &e))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.text_segment_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "text_segment_size",
                reason: "must be greater than zero",
            });
        }
        if self.max_pending_tasks == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "max_pending_tasks",
                reason: "must be greater than zero when set",
            });
        }
        Ok(())
    }
}

/// Where the client finds a server function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Module locator handed to the client's module loader.
    pub locator: String,
    /// Export within the module.
    #[serde(default)]
    pub export: Option<String>,
}

/// Registry of functions that may be serialized as client references.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientManifest {
    #[serde(default)]
    functions: BTreeMap<String, ManifestEntry>,
}

impl ClientManifest {
    /// Empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, replacing any previous entry.
    #[must_use]
    pub fn with_function(
        mut self,
        name: impl Into<String>,
        locator: impl Into<String>,
        export: Option<&str>,
    ) -> Self {
        self.functions.insert(
            name.into(),
            ManifestEntry {
                locator: locator.into(),
                export: export.map(str::to_owned),
            },
        );
        self
    }

    /// Entry for `name`.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&ManifestEntry> {
        self.functions.get(name)
    }

    /// Number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed documents.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`ClientManifest::from_toml_str`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, &e))?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_omitted_keys() {
        let config = EncoderConfig::from_toml_str("redact_error_messages = true").unwrap();
        assert!(config.redact_error_messages);
        assert_eq!(config.outline_text_threshold, 1024);
        assert_eq!(config.max_pending_tasks, None);
    }

    #[test]
    fn test_rejects_zero_segment_size() {
        assert!(matches!(
            EncoderConfig::from_toml_str("text_segment_size = 0"),
            Err(ConfigError::InvalidValue { key: "text_segment_size", .. })
        ));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            EncoderConfig::from_toml_str("outline_text_threshold = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EncoderConfig::from_toml_file("/nonexistent/encoder.toml"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_manifest_from_toml() {
        let manifest = ClientManifest::from_toml_str(
            r#"
            [functions.like]
            locator = "actions/like.js"
            export = "like"

            [functions.share]
            locator = "actions/share.js"
            "#,
        )
        .unwrap();

        assert_eq!(manifest.len(), 2);
        let like = manifest.resolve("like").unwrap();
        assert_eq!(like.locator, "actions/like.js");
        assert_eq!(like.export.as_deref(), Some("like"));
        assert_eq!(manifest.resolve("share").unwrap().export, None);
        assert!(manifest.resolve("delete").is_none());
    }

    #[test]
    fn test_manifest_builder() {
        let manifest = ClientManifest::new().with_function("like", "actions.js", Some("like"));
        assert_eq!(manifest.resolve("like").unwrap().locator, "actions.js");
    }
}
