//! Configuration for the model pipeline.

use std::path::{Path, PathBuf};

use modelbridge_inference::SessionOptions;
use serde::{Deserialize, Serialize};

use crate::context::{FsHostContext, default_cache_dir};
use crate::error::{BridgeError, Result};

/// Largest buffer the pipeline reads into memory: the 31-bit signed size
/// limit of host array types.
pub const MAX_IN_MEMORY_BYTES: u64 = i32::MAX as u64;

/// How cache file names are derived from a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheKeyStrategy {
    /// Last path segment of the source, query stripped. Distinct sources
    /// with the same file name share one cache entry.
    #[default]
    Basename,
    /// Basename prefixed with a digest of the full source string.
    SourceHash,
}

/// Main configuration for the model pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Overrides the cache directory the host context provides.
    pub cache_dir: Option<PathBuf>,

    /// Root of bundled resources for filesystem hosts.
    pub bundle_dir: PathBuf,

    /// Ceiling for in-memory fetches, in bytes.
    pub max_in_memory_bytes: u64,

    /// Route http/https model loads through the on-disk cache.
    pub cache_remote_models: bool,

    /// Cache file naming.
    pub cache_key: CacheKeyStrategy,

    /// User agent sent by the default HTTP transport.
    pub user_agent: String,

    /// Options every load starts from; per-call options take precedence.
    pub default_session_options: SessionOptions,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            bundle_dir: PathBuf::from("assets"),
            max_in_memory_bytes: MAX_IN_MEMORY_BYTES,
            cache_remote_models: true,
            cache_key: CacheKeyStrategy::Basename,
            user_agent: concat!("modelbridge/", env!("CARGO_PKG_VERSION")).to_string(),
            default_session_options: SessionOptions::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BridgeError::io(path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| BridgeError::Config(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| BridgeError::io(path, e))
    }

    /// Filesystem host rooted at `bundle_dir`, caching into `cache_dir` or
    /// the platform cache directory.
    pub fn fs_host(&self) -> FsHostContext {
        let cache_dir = self.cache_dir.clone().unwrap_or_else(default_cache_dir);
        FsHostContext::new(&self.bundle_dir, cache_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelbridge_inference::ProviderSpec;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(
            &path,
            r#"{
                "cache_key": "source-hash",
                "default_session_options": {"executionProviders": ["xnnpack"]}
            }"#,
        )
        .unwrap();

        let config = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(config.cache_key, CacheKeyStrategy::SourceHash);
        assert_eq!(config.max_in_memory_bytes, 2_147_483_647);
        assert!(config.cache_remote_models);
        assert_eq!(
            config.default_session_options.execution_providers,
            vec![ProviderSpec::named("xnnpack")]
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        let config = BridgeConfig {
            cache_dir: Some(dir.path().join("cache")),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(BridgeConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_fs_host_uses_configured_dirs() {
        use crate::context::HostContext;

        let config = BridgeConfig {
            bundle_dir: PathBuf::from("/srv/models"),
            cache_dir: Some(PathBuf::from("/var/cache/models")),
            ..Default::default()
        };
        let host = config.fs_host();
        assert_eq!(host.bundle_root(), Path::new("/srv/models"));
        assert_eq!(host.cache_dir(), PathBuf::from("/var/cache/models"));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            BridgeConfig::from_file(&path),
            Err(BridgeError::Config(_))
        ));
    }
}
