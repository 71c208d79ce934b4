//! Kernel configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty document is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors from loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings for one kernel instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Symlink expansions allowed in one path lookup.
    pub symlink_hop_limit: usize,

    /// Working directory of top-level processes.
    pub default_workdir: String,

    /// Keep compiled images by path. A file rewritten in place keeps running
    /// its old image until the entry is invalidated.
    pub cache_executables: bool,

    /// Environment of top-level processes.
    pub env: BTreeMap<String, String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let home = "/home/ant";
        let env = [
            ("PATH", "/usr/bin:/usr/local/bin"),
            ("PWD", home),
            ("OLDPWD", home),
            ("TMPDIR", "/tmp"),
            ("TERM", "xterm-256color"),
            ("HOME", home),
            ("SHELL", "/usr/bin/shell"),
            ("LANG", "en_US.UTF-8"),
            ("USER", "ant"),
            ("HOSTNAME", "browser"),
            ("PYTHONHOME", "/lib/python3.6"),
            ("PS1", "\x1b[1;34m\\u@\\h \x1b[1;33m\\w$\x1b[0m "),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            symlink_hop_limit: 40,
            default_workdir: home.to_string(),
            cache_executables: true,
            env,
        }
    }
}

impl KernelConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Set the symlink hop limit.
    pub fn with_hop_limit(mut self, limit: usize) -> Self {
        self.symlink_hop_limit = limit;
        self
    }

    /// Set or override one default environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = KernelConfig::from_toml_str("").unwrap();
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.symlink_hop_limit, 40);
        assert_eq!(config.env["HOME"], "/home/ant");
        assert!(config.cache_executables);
    }

    #[test]
    fn test_partial_override() {
        let config = KernelConfig::from_toml_str(
            r#"
            symlink_hop_limit = 8
            cache_executables = false

            [env]
            USER = "root"
            "#,
        )
        .unwrap();
        assert_eq!(config.symlink_hop_limit, 8);
        assert!(!config.cache_executables);
        assert_eq!(config.default_workdir, "/home/ant");
        // A table replaces the default environment wholesale.
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.env["USER"], "root");
    }

    #[test]
    fn test_parse_error() {
        let err = KernelConfig::from_toml_str("symlink_hop_limit = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = KernelConfig::load("/nonexistent/wasmux.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = KernelConfig::default().with_hop_limit(12).with_env("DEBUG", "1");
        let text = toml::to_string(&config).unwrap();
        assert_eq!(KernelConfig::from_toml_str(&text).unwrap(), config);
    }
}
