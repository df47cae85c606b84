//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which metadata backend stores node attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackendKind {
    /// One bincode sidecar file per node.
    File,
    /// Process-local map, lost on restart.
    Memory,
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            json: false,
        }
    }
}

/// Options for a decomposed filesystem instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Storage root holding `spaces/`, `indexes/` and `uploads/`.
    pub root: PathBuf,
    /// Upper bound on workers used by folder listings.
    pub max_concurrency: usize,
    /// Largest quota a space may be given, 0 for no limit.
    pub max_quota: u64,
    /// Finalize uploads only after a `PostprocessingFinished` event.
    pub async_uploads: bool,
    /// Metadata backend selection.
    pub metadata_backend: MetadataBackendKind,
    /// Alias template for personal spaces.
    pub personal_space_alias_template: String,
    /// Alias template for all other space types.
    pub general_space_alias_template: String,
    /// Home path template; empty disables `create_home`/`get_home`.
    pub user_layout: String,
    /// Prefix of the callback URL announced in `BytesReceived` events.
    pub data_gateway_url: String,
    /// Logging settings.
    pub log: LogConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/decomposedfs"),
            max_concurrency: 5,
            max_quota: 0,
            async_uploads: true,
            metadata_backend: MetadataBackendKind::File,
            personal_space_alias_template: String::from("{spacetype}/{user.username}"),
            general_space_alias_template: String::from("{spacetype}/{spacename}"),
            user_layout: String::from("{user.id}"),
            data_gateway_url: String::from("http://localhost:9300/data"),
            log: LogConfig::default(),
        }
    }
}

impl Options {
    /// Creates default options rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Loads options from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let options: Options = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        options.validate()?;
        Ok(options)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.root.as_os_str().is_empty() {
            anyhow::bail!("root must not be empty");
        }
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let o = Options::default();
        assert_eq!(o.max_concurrency, 5);
        assert_eq!(o.max_quota, 0);
        assert!(o.async_uploads);
        assert_eq!(o.metadata_backend, MetadataBackendKind::File);
        assert_eq!(o.log.level, "info");
        assert!(o.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
root = "/srv/dfs"
max_concurrency = 8
max_quota = 5000
metadata_backend = "memory"

[log]
level = "debug"
json = true
"#
        )
        .unwrap();

        let o = Options::from_file(file.path()).unwrap();
        assert_eq!(o.root, PathBuf::from("/srv/dfs"));
        assert_eq!(o.max_concurrency, 8);
        assert_eq!(o.max_quota, 5000);
        assert_eq!(o.metadata_backend, MetadataBackendKind::Memory);
        assert!(o.log.json);
        // unspecified keys keep their defaults
        assert!(o.async_uploads);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"root": "/data", "async_uploads": false}}"#).unwrap();

        let o = Options::from_file(file.path()).unwrap();
        assert_eq!(o.root, PathBuf::from("/data"));
        assert!(!o.async_uploads);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(Options::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"max_concurrency": 0}}"#).unwrap();
        assert!(Options::from_file(file.path()).is_err());
    }
}
