//! Model sources and their canonical, scheme-tagged form.

use std::fmt;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::ContextHandle;
use crate::error::{BridgeError, Result};

const SCHEME_SEPARATOR: &str = "://";
const BUNDLE_PREFIX: &str = "bundle://";

/// Where a model's bytes come from, as the caller described it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireSource", into = "WireSource")]
pub enum ModelSource {
    /// Resource shipped with the host application.
    BundleResource { id: String },
    /// File on the local filesystem.
    LocalFile { path: PathBuf },
    /// URL string; `file`, `http` and `https` schemes are understood.
    RemoteUrl { url: String },
}

impl ModelSource {
    /// Interpret a bare string.
    ///
    /// Strings with a scheme separator are URLs, absolute paths are local
    /// files and everything else names a bundled resource.
    pub fn parse(source: &str) -> Self {
        if source.contains(SCHEME_SEPARATOR) {
            ModelSource::RemoteUrl {
                url: source.to_string(),
            }
        } else if Path::new(source).is_absolute() {
            ModelSource::LocalFile {
                path: PathBuf::from(source),
            }
        } else {
            ModelSource::BundleResource {
                id: source.to_string(),
            }
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        ModelSource::RemoteUrl { url: url.into() }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        ModelSource::LocalFile { path: path.into() }
    }

    pub fn resource(id: impl Into<String>) -> Self {
        ModelSource::BundleResource { id: id.into() }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::BundleResource { id } => write!(f, "{}", id),
            ModelSource::LocalFile { path } => write!(f, "{}", path.display()),
            ModelSource::RemoteUrl { url } => write!(f, "{}", url),
        }
    }
}

impl From<&str> for ModelSource {
    fn from(source: &str) -> Self {
        ModelSource::parse(source)
    }
}

impl From<String> for ModelSource {
    fn from(source: String) -> Self {
        ModelSource::parse(&source)
    }
}

impl From<PathBuf> for ModelSource {
    fn from(path: PathBuf) -> Self {
        ModelSource::LocalFile { path }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireSource {
    Bare(String),
    Url { url: String },
    Path { path: PathBuf },
    Resource { resource: String },
}

impl From<WireSource> for ModelSource {
    fn from(wire: WireSource) -> Self {
        match wire {
            WireSource::Bare(source) => ModelSource::parse(&source),
            WireSource::Url { url } => ModelSource::RemoteUrl { url },
            WireSource::Path { path } => ModelSource::LocalFile { path },
            WireSource::Resource { resource } => ModelSource::BundleResource { id: resource },
        }
    }
}

impl From<ModelSource> for WireSource {
    fn from(source: ModelSource) -> Self {
        match source {
            ModelSource::BundleResource { id } => WireSource::Resource { resource: id },
            ModelSource::LocalFile { path } => WireSource::Path { path },
            ModelSource::RemoteUrl { url } => WireSource::Url { url },
        }
    }
}

/// Scheme tag of a canonical URI. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    File,
    Http,
    Https,
    Bundle,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Bundle => "bundle",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved model location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalUri {
    File { path: PathBuf },
    Http { url: Url },
    Https { url: Url },
    Bundle { id: String, locator: String },
}

impl CanonicalUri {
    pub fn scheme(&self) -> Scheme {
        match self {
            CanonicalUri::File { .. } => Scheme::File,
            CanonicalUri::Http { .. } => Scheme::Http,
            CanonicalUri::Https { .. } => Scheme::Https,
            CanonicalUri::Bundle { .. } => Scheme::Bundle,
        }
    }

    /// Last path segment, without any query string.
    pub fn file_name(&self) -> Option<String> {
        match self {
            CanonicalUri::File { path } => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            CanonicalUri::Http { url } | CanonicalUri::Https { url } => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|segment| !segment.is_empty())
                .map(str::to_string),
            CanonicalUri::Bundle { id, .. } => Path::new(id)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        }
    }
}

impl fmt::Display for CanonicalUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalUri::File { path } => write!(f, "file://{}", path.display()),
            CanonicalUri::Http { url } | CanonicalUri::Https { url } => write!(f, "{}", url),
            CanonicalUri::Bundle { id, .. } => write!(f, "bundle://{}", id),
        }
    }
}

/// Turns [`ModelSource`]s into [`CanonicalUri`]s.
///
/// Only bundle lookups touch the host; everything else is string and path
/// manipulation.
#[derive(Debug, Clone)]
pub struct SourceResolver {
    context: ContextHandle,
}

impl SourceResolver {
    pub fn new(context: ContextHandle) -> Self {
        Self { context }
    }

    pub fn resolve(&self, source: &ModelSource) -> Result<CanonicalUri> {
        let uri = match source {
            ModelSource::RemoteUrl { url } => self.resolve_url(url)?,
            ModelSource::LocalFile { path } => CanonicalUri::File {
                path: std::path::absolute(path).map_err(|e| BridgeError::io(path, e))?,
            },
            ModelSource::BundleResource { id } => self.resolve_bundle(id)?,
        };
        debug!("Resolved {} to {}", source, uri);
        Ok(uri)
    }

    fn resolve_url(&self, raw: &str) -> Result<CanonicalUri> {
        if !raw.contains(SCHEME_SEPARATOR) {
            return self.resolve_bundle(raw);
        }
        // Bundle ids are host names, not URL components; take them verbatim.
        if raw
            .get(..BUNDLE_PREFIX.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(BUNDLE_PREFIX))
        {
            return self.resolve_bundle(&raw[BUNDLE_PREFIX.len()..]);
        }

        let url = Url::parse(raw).map_err(|e| BridgeError::InvalidSource {
            source_ref: raw.to_string(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "file" => {
                let path = url.to_file_path().map_err(|_| BridgeError::InvalidSource {
                    source_ref: raw.to_string(),
                    reason: "file URL does not name a local path".to_string(),
                })?;
                Ok(CanonicalUri::File { path })
            }
            "http" => Ok(CanonicalUri::Http { url }),
            "https" => Ok(CanonicalUri::Https { url }),
            other => Err(BridgeError::UnsupportedScheme(other.to_string())),
        }
    }

    fn resolve_bundle(&self, id: &str) -> Result<CanonicalUri> {
        let context = self.context.get()?;
        let locator = context
            .resolve_resource(id)
            .ok_or_else(|| BridgeError::ResourceNotFound(id.to_string()))?;
        Ok(CanonicalUri::Bundle {
            id: id.to_string(),
            locator,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::EmbeddedBundle;
    use pretty_assertions::assert_eq;

    static MODEL: &[u8] = b"model";

    fn host() -> Arc<EmbeddedBundle> {
        Arc::new(EmbeddedBundle::new("/tmp/cache").with_resource("squeezenet.onnx", MODEL))
    }

    #[test]
    fn test_parse_source_forms() {
        assert_eq!(
            ModelSource::parse("https://host/model.onnx"),
            ModelSource::url("https://host/model.onnx")
        );
        assert_eq!(
            ModelSource::parse("/data/model.onnx"),
            ModelSource::file("/data/model.onnx")
        );
        assert_eq!(
            ModelSource::parse("model.onnx"),
            ModelSource::resource("model.onnx")
        );
    }

    #[test]
    fn test_wire_forms() {
        let sources: Vec<ModelSource> = serde_json::from_str(
            r#"["a.onnx", {"url": "http://h/b.onnx"}, {"path": "/c.onnx"}, {"resource": "d"}]"#,
        )
        .unwrap();
        assert_eq!(
            sources,
            vec![
                ModelSource::resource("a.onnx"),
                ModelSource::url("http://h/b.onnx"),
                ModelSource::file("/c.onnx"),
                ModelSource::resource("d"),
            ]
        );
    }

    #[test]
    fn test_resolve_schemes() {
        let host = host();
        let resolver = SourceResolver::new(ContextHandle::new(&host));

        let uri = resolver.resolve(&ModelSource::url("https://host/m.onnx?sig=1")).unwrap();
        assert_eq!(uri.scheme(), Scheme::Https);
        assert_eq!(uri.file_name().as_deref(), Some("m.onnx"));

        let uri = resolver.resolve(&ModelSource::url("http://host/dir/x.onnx")).unwrap();
        assert_eq!(uri.scheme(), Scheme::Http);

        let uri = resolver.resolve(&ModelSource::url("file:///tmp/local.onnx")).unwrap();
        assert_eq!(
            uri,
            CanonicalUri::File {
                path: PathBuf::from("/tmp/local.onnx")
            }
        );

        let uri = resolver.resolve(&ModelSource::resource("squeezenet.onnx")).unwrap();
        assert_eq!(uri.scheme(), Scheme::Bundle);
        assert_eq!(uri.to_string(), "bundle://squeezenet.onnx");

        let uri = resolver.resolve(&ModelSource::url("bundle://squeezenet.onnx")).unwrap();
        assert_eq!(uri.scheme(), Scheme::Bundle);
    }

    #[test]
    fn test_bundle_url_keeps_id_verbatim() {
        let host = Arc::new(
            EmbeddedBundle::new("/tmp/cache")
                .with_resource("my model.onnx", MODEL)
                .with_resource("v2/Face#Mesh.onnx", MODEL),
        );
        let resolver = SourceResolver::new(ContextHandle::new(&host));

        let uri = resolver.resolve(&ModelSource::url("bundle://my model.onnx")).unwrap();
        assert_eq!(
            uri,
            CanonicalUri::Bundle {
                id: "my model.onnx".to_string(),
                locator: "embedded:my model.onnx".to_string(),
            }
        );

        let uri = resolver.resolve(&ModelSource::url("BUNDLE://v2/Face#Mesh.onnx")).unwrap();
        assert!(matches!(uri, CanonicalUri::Bundle { ref id, .. } if id == "v2/Face#Mesh.onnx"));

        let err = resolver.resolve(&ModelSource::url("bundle://my%20model.onnx")).unwrap_err();
        assert!(matches!(err, BridgeError::ResourceNotFound(ref id) if id == "my%20model.onnx"));
    }

    #[test]
    fn test_url_without_scheme_is_bundle_id() {
        let host = host();
        let resolver = SourceResolver::new(ContextHandle::new(&host));
        let uri = resolver.resolve(&ModelSource::url("squeezenet.onnx")).unwrap();
        assert_eq!(uri.scheme(), Scheme::Bundle);
    }

    #[test]
    fn test_unsupported_scheme() {
        let host = host();
        let resolver = SourceResolver::new(ContextHandle::new(&host));
        let err = resolver.resolve(&ModelSource::url("ftp://host/m.onnx")).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedScheme(ref s) if s == "ftp"));
    }

    #[test]
    fn test_missing_bundle_resource() {
        let host = host();
        let resolver = SourceResolver::new(ContextHandle::new(&host));
        let err = resolver.resolve(&ModelSource::resource("nope.onnx")).unwrap_err();
        assert!(matches!(err, BridgeError::ResourceNotFound(ref id) if id == "nope.onnx"));
    }

    #[test]
    fn test_bundle_needs_live_context() {
        let resolver = SourceResolver::new(ContextHandle::detached());
        let err = resolver.resolve(&ModelSource::resource("squeezenet.onnx")).unwrap_err();
        assert!(matches!(err, BridgeError::ContextUnavailable));

        // URL and file sources never consult the host.
        assert!(resolver.resolve(&ModelSource::url("https://h/m.onnx")).is_ok());
    }

    #[test]
    fn test_relative_local_file_becomes_absolute() {
        let resolver = SourceResolver::new(ContextHandle::detached());
        let uri = resolver.resolve(&ModelSource::file("models/m.onnx")).unwrap();
        match uri {
            CanonicalUri::File { path } => {
                assert!(path.is_absolute());
                assert!(path.ends_with("models/m.onnx"));
            }
            other => panic!("unexpected uri: {other}"),
        }
    }
}
