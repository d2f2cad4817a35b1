#![forbid(unsafe_code)]

//! Runtime tunables, loadable from TOML or JSON with the `config` feature.
//!
//! ```toml
//! # wisp.toml
//! orphan_grace_reruns = 2
//! order_error_reload_threshold = 3
//! widen_conflicting_fragment_reruns = true
//! clear_stale_nodes = true
//! ```
//!
//! Omitted keys keep their defaults.

#[cfg(feature = "config")]
use std::path::Path;

#[cfg(feature = "config")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
pub struct RuntimeConfig {
    /// Reconciles an orphaned widget value survives before deletion.
    pub orphan_grace_reruns: u32,

    /// Consecutive out-of-order messages tolerated before the session
    /// requests a reload.
    pub order_error_reload_threshold: u32,

    /// Two queued reruns for different fragments merge into a full run.
    /// When false the newer fragment wins.
    pub widen_conflicting_fragment_reruns: bool,

    /// Remove nodes a successful run did not produce.
    pub clear_stale_nodes: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            orphan_grace_reruns: 1,
            order_error_reload_threshold: 3,
            widen_conflicting_fragment_reruns: true,
            clear_stale_nodes: true,
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML string.
    #[cfg(feature = "config")]
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str::<Self>(s)
            .map_err(ConfigError::Toml)?
            .validated()
    }

    /// Load from a TOML file on disk.
    #[cfg(feature = "config")]
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        Self::from_toml_str(&content)
    }

    /// Load from a JSON string.
    #[cfg(feature = "config")]
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<Self>(s)
            .map_err(ConfigError::Json)?
            .validated()
    }

    /// Validate parameter ranges. An empty list means the config is valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.orphan_grace_reruns == 0 {
            errors.push("orphan_grace_reruns must be at least 1".to_string());
        }
        if self.order_error_reload_threshold == 0 {
            errors.push("order_error_reload_threshold must be at least 1".to_string());
        }
        errors
    }

    /// Raise every out-of-range value to its minimum.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.orphan_grace_reruns = self.orphan_grace_reruns.max(1);
        self.order_error_reload_threshold = self.order_error_reload_threshold.max(1);
        self
    }

    #[cfg(feature = "config")]
    fn validated(self) -> Result<Self, ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Errors from loading a [`RuntimeConfig`].
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    #[cfg(feature = "config")]
    Toml(toml::de::Error),
    #[cfg(feature = "config")]
    Json(serde_json::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            #[cfg(feature = "config")]
            Self::Toml(e) => write!(f, "TOML parse error: {e}"),
            #[cfg(feature = "config")]
            Self::Json(e) => write!(f, "JSON parse error: {e}"),
            Self::Validation(errors) => write!(f, "validation errors: {}", errors.join("; ")),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            #[cfg(feature = "config")]
            Self::Toml(e) => Some(e),
            #[cfg(feature = "config")]
            Self::Json(e) => Some(e),
            Self::Validation(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validates_clean() {
        assert!(RuntimeConfig::default().validate().is_empty());
    }

    #[test]
    fn zero_values_rejected() {
        let config = RuntimeConfig {
            orphan_grace_reruns: 0,
            order_error_reload_threshold: 0,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.validate().len(), 2);
    }

    #[test]
    fn normalized_raises_zero_counts() {
        let config = RuntimeConfig {
            orphan_grace_reruns: 0,
            order_error_reload_threshold: 0,
            clear_stale_nodes: false,
            ..RuntimeConfig::default()
        }
        .normalized();
        assert!(config.validate().is_empty());
        assert_eq!(config.orphan_grace_reruns, 1);
        assert_eq!(config.order_error_reload_threshold, 1);
        assert!(!config.clear_stale_nodes);
    }

    #[cfg(feature = "config")]
    #[test]
    fn partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml_str("orphan_grace_reruns = 4\n").unwrap();
        assert_eq!(config.orphan_grace_reruns, 4);
        assert_eq!(config.order_error_reload_threshold, 3);
        assert!(config.clear_stale_nodes);
    }

    #[cfg(feature = "config")]
    #[test]
    fn json_validation_error() {
        let err = RuntimeConfig::from_json_str(r#"{"orphan_grace_reruns": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[cfg(feature = "config")]
    #[test]
    fn bad_toml_reports_parse_error() {
        let err = RuntimeConfig::from_toml_str("orphan_grace_reruns = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
