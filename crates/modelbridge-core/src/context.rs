//! Host environment capabilities: bundled resources and a writable cache.
//!
//! The pipeline never owns the host. It keeps a [`ContextHandle`], a weak
//! reference that is upgraded on every use, so a host that has been torn
//! down surfaces as [`BridgeError::ContextUnavailable`] instead of dangling.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::error::{BridgeError, Result};

/// Services the host application provides.
pub trait HostContext: Send + Sync {
    /// Process-writable directory for cached model files.
    fn cache_dir(&self) -> PathBuf;

    /// Locate a bundled resource. Returns a human-readable locator, or
    /// `None` if the host has no such resource.
    fn resolve_resource(&self, id: &str) -> Option<String>;

    /// Read a bundled resource fully into memory.
    fn read_resource(&self, id: &str) -> io::Result<Vec<u8>>;

    /// Size of a bundled resource in bytes, if known without reading it.
    fn resource_len(&self, _id: &str) -> Option<u64> {
        None
    }
}

/// Weak, checked reference to the host context.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Weak<dyn HostContext>,
}

impl ContextHandle {
    pub fn new<C: HostContext + 'static>(context: &Arc<C>) -> Self {
        let inner: Weak<dyn HostContext> = Arc::downgrade(context) as Weak<dyn HostContext>;
        Self { inner }
    }

    pub fn from_dyn(context: &Arc<dyn HostContext>) -> Self {
        Self {
            inner: Arc::downgrade(context),
        }
    }

    /// A handle that was never attached to a host.
    pub fn detached() -> Self {
        let inner: Weak<dyn HostContext> = Weak::<FsHostContext>::new();
        Self { inner }
    }

    /// Upgrade to a live context.
    pub fn get(&self) -> Result<Arc<dyn HostContext>> {
        self.inner.upgrade().ok_or(BridgeError::ContextUnavailable)
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Resource identifiers are relative names inside the bundle; anything that
/// could escape the bundle root is treated as absent.
fn is_contained(id: &str) -> bool {
    !id.is_empty()
        && Path::new(id)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Host context backed by plain directories.
#[derive(Debug, Clone)]
pub struct FsHostContext {
    bundle_root: PathBuf,
    cache_dir: PathBuf,
}

impl FsHostContext {
    pub fn new(bundle_root: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundle_root: bundle_root.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Use the platform cache directory for downloaded models.
    pub fn with_default_cache(bundle_root: impl Into<PathBuf>) -> Self {
        Self::new(bundle_root, default_cache_dir())
    }

    pub fn bundle_root(&self) -> &Path {
        &self.bundle_root
    }

    fn resource_path(&self, id: &str) -> Option<PathBuf> {
        if !is_contained(id) {
            return None;
        }
        let path = self.bundle_root.join(id);
        path.is_file().then_some(path)
    }
}

impl HostContext for FsHostContext {
    fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    fn resolve_resource(&self, id: &str) -> Option<String> {
        self.resource_path(id).map(|p| p.display().to_string())
    }

    fn read_resource(&self, id: &str) -> io::Result<Vec<u8>> {
        match self.resource_path(id) {
            Some(path) => std::fs::read(path),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no bundled resource '{}'", id),
            )),
        }
    }

    fn resource_len(&self, id: &str) -> Option<u64> {
        let path = self.resource_path(id)?;
        std::fs::metadata(path).ok().map(|meta| meta.len())
    }
}

/// Host context whose bundle is compiled into the binary.
#[derive(Debug, Clone)]
pub struct EmbeddedBundle {
    resources: HashMap<String, &'static [u8]>,
    cache_dir: PathBuf,
}

impl EmbeddedBundle {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            resources: HashMap::new(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Register a resource, typically from `include_bytes!`.
    pub fn with_resource(mut self, id: impl Into<String>, data: &'static [u8]) -> Self {
        self.resources.insert(id.into(), data);
        self
    }
}

impl HostContext for EmbeddedBundle {
    fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    fn resolve_resource(&self, id: &str) -> Option<String> {
        self.resources
            .contains_key(id)
            .then(|| format!("embedded:{}", id))
    }

    fn read_resource(&self, id: &str) -> io::Result<Vec<u8>> {
        self.resources
            .get(id)
            .map(|data| data.to_vec())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no embedded resource '{}'", id),
                )
            })
    }

    fn resource_len(&self, id: &str) -> Option<u64> {
        self.resources.get(id).map(|data| data.len() as u64)
    }
}

/// Platform cache directory for model files.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("modelbridge")
        .join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_fails_after_host_dropped() {
        let host = Arc::new(EmbeddedBundle::new("/tmp/cache"));
        let handle = ContextHandle::new(&host);
        assert!(handle.get().is_ok());

        drop(host);
        assert!(!handle.is_alive());
        assert!(matches!(handle.get(), Err(BridgeError::ContextUnavailable)));
    }

    #[test]
    fn test_detached_handle_is_unavailable() {
        assert!(matches!(
            ContextHandle::detached().get(),
            Err(BridgeError::ContextUnavailable)
        ));
    }

    #[test]
    fn test_fs_context_rejects_escaping_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.onnx"), b"abc").unwrap();
        let host = FsHostContext::new(dir.path(), dir.path().join("cache"));

        assert!(host.resolve_resource("model.onnx").is_some());
        assert!(host.resolve_resource("../model.onnx").is_none());
        assert!(host.resolve_resource("missing.onnx").is_none());
        assert_eq!(host.read_resource("model.onnx").unwrap(), b"abc");
        assert_eq!(host.resource_len("model.onnx"), Some(3));
        assert_eq!(host.resource_len("../model.onnx"), None);
        assert_eq!(
            host.read_resource("missing.onnx").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_embedded_bundle_lookup() {
        static MODEL: &[u8] = b"\x08\x07";
        let host = EmbeddedBundle::new("/tmp/cache").with_resource("tiny.onnx", MODEL);
        assert_eq!(host.resolve_resource("tiny.onnx").as_deref(), Some("embedded:tiny.onnx"));
        assert_eq!(host.read_resource("tiny.onnx").unwrap(), MODEL);
        assert!(host.read_resource("other").is_err());
        assert_eq!(host.resource_len("tiny.onnx"), Some(2));
        assert_eq!(host.resource_len("other"), None);
    }
}
