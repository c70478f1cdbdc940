//! Patch configuration types.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// How trampoline pages are protected between patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Made read+write+execute once at install and left that way
    Persistent,
    /// Writable only for the duration of each patch
    Conserve,
}

impl Default for PermissionMode {
    fn default() -> Self {
        if cfg!(feature = "conserve-permissions") {
            PermissionMode::Conserve
        } else {
            PermissionMode::Persistent
        }
    }
}

/// Whether to run the serializing stub after each patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushMode {
    Off,
    Serialize,
}

impl Default for FlushMode {
    fn default() -> Self {
        if cfg!(feature = "pipeline-flush") {
            FlushMode::Serialize
        } else {
            FlushMode::Off
        }
    }
}

/// Per-dispatcher patch behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    pub permissions: PermissionMode,
    pub flush: FlushMode,
}

impl PatchConfig {
    pub fn conserve_permissions(&self) -> bool {
        self.permissions == PermissionMode::Conserve
    }

    pub fn flush_pipeline(&self) -> bool {
        self.flush == FlushMode::Serialize
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Top-level layout of a configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    patch: PatchConfig,
}

impl PatchConfig {
    /// Parse the `[patch]` table of a TOML document. Missing keys fall back
    /// to the build defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.patch)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_follow_features() {
        let config = PatchConfig::default();
        assert_eq!(
            config.conserve_permissions(),
            cfg!(feature = "conserve-permissions")
        );
        assert_eq!(config.flush_pipeline(), cfg!(feature = "pipeline-flush"));
    }

    #[test]
    fn test_parse_patch_table() {
        let config = PatchConfig::from_toml_str(
            r#"
[patch]
permissions = "conserve"
flush = "off"
"#,
        )
        .unwrap();
        assert_eq!(config.permissions, PermissionMode::Conserve);
        assert_eq!(config.flush, FlushMode::Off);
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let config = PatchConfig::from_toml_str("[patch]\nflush = \"serialize\"\n").unwrap();
        assert_eq!(config.permissions, PermissionMode::default());
        assert!(config.flush_pipeline());

        assert_eq!(PatchConfig::from_toml_str("").unwrap(), PatchConfig::default());
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let err = PatchConfig::from_toml_str("[patch]\npermissions = \"sometimes\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[patch]\npermissions = \"persistent\"").unwrap();
        let config = PatchConfig::load(file.path()).unwrap();
        assert_eq!(config.permissions, PermissionMode::Persistent);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PatchConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }
}
