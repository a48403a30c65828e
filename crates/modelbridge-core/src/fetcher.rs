//! Fetching model bytes and materializing them into the on-disk cache.
//!
//! Two paths exist on purpose. [`AssetFetcher::fetch_bytes`] buffers the
//! whole resource in memory and is bounded by the in-memory ceiling.
//! [`AssetFetcher::materialize_to_cache`] streams file-to-file or
//! network-to-file into a temporary file next to the destination and renames
//! it into place only once the copy has completed, so a failed copy never
//! leaves a partial cache entry behind.
//!
//! A cache entry that exists is trusted: there is no checksum and no
//! staleness check. Concurrent materializations of the same key may both
//! fetch; each rename is atomic and the last one wins.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use modelbridge_inference::InferenceError;

use crate::config::{CacheKeyStrategy, MAX_IN_MEMORY_BYTES};
use crate::context::ContextHandle;
use crate::error::{BridgeError, Result};
use crate::source::CanonicalUri;

/// Response of a GET request, body not yet consumed.
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Minimal HTTP client surface the fetcher needs.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<HttpResponse>;
}

/// [`HttpTransport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build a client with the given user agent and library defaults
    /// otherwise (no timeout is imposed here).
    pub fn with_user_agent(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| BridgeError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(HttpResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: response.bytes_stream().map_err(io::Error::other).boxed(),
        })
    }
}

/// A model file persisted in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    /// Cache key; the source's file name unless hashing is configured.
    pub filename: String,
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
}

/// Initial buffer reservation for in-memory downloads.
const INITIAL_BUFFER_BYTES: usize = 1 << 20;

fn reserve(buffer: &mut Vec<u8>, additional: usize) -> Result<()> {
    buffer
        .try_reserve(additional)
        .map_err(|_| InferenceError::Allocation(buffer.len().saturating_add(additional)).into())
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(path: &Path, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BridgeError::io(path, io::Error::other(e)))?
        .map_err(|e| BridgeError::io(path, e))
}

enum BundleRead {
    Data(Vec<u8>),
    Oversized(u64),
}

enum CopySource<'a> {
    File(&'a Path),
    Remote(&'a Url),
}

/// Produces model bytes for canonical URIs.
pub struct AssetFetcher {
    context: ContextHandle,
    transport: Arc<dyn HttpTransport>,
    max_in_memory_bytes: u64,
    cache_key: CacheKeyStrategy,
    cache_dir: Option<PathBuf>,
}

impl AssetFetcher {
    pub fn new(context: ContextHandle, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            context,
            transport,
            max_in_memory_bytes: MAX_IN_MEMORY_BYTES,
            cache_key: CacheKeyStrategy::Basename,
            cache_dir: None,
        }
    }

    pub fn with_max_in_memory_bytes(mut self, limit: u64) -> Self {
        self.max_in_memory_bytes = limit;
        self
    }

    pub fn with_cache_key(mut self, strategy: CacheKeyStrategy) -> Self {
        self.cache_key = strategy;
        self
    }

    /// Use a fixed cache directory instead of asking the host.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Read the whole resource into memory.
    pub async fn fetch_bytes(&self, uri: &CanonicalUri) -> Result<Vec<u8>> {
        let bytes = match uri {
            CanonicalUri::File { path } => self.read_file(path).await?,
            CanonicalUri::Http { url } | CanonicalUri::Https { url } => {
                self.download_to_memory(url).await?
            }
            CanonicalUri::Bundle { id, .. } => self.read_bundle(id).await?,
        };
        debug!("Fetched {} bytes from {}", bytes.len(), uri);
        Ok(bytes)
    }

    /// Ensure the resource exists in the cache directory and describe it.
    ///
    /// Returns immediately if the destination already exists. Bundle
    /// resources are never cached and fail with `UnsupportedScheme`.
    pub async fn materialize_to_cache(&self, uri: &CanonicalUri) -> Result<CachedAsset> {
        let source = match uri {
            CanonicalUri::File { path } => CopySource::File(path),
            CanonicalUri::Http { url } | CanonicalUri::Https { url } => CopySource::Remote(url),
            CanonicalUri::Bundle { .. } => {
                return Err(BridgeError::UnsupportedScheme(format!(
                    "{} (bundled resources are read in memory, not cached)",
                    uri.scheme()
                )));
            }
        };

        let filename = self.cache_file_name(uri)?;
        let dir = self.cache_dir()?;
        let destination = dir.join(&filename);

        match tokio::fs::metadata(&destination).await {
            Ok(meta) => {
                debug!("File already exists at destination: {}", destination.display());
                return Ok(CachedAsset {
                    filename,
                    absolute_path: destination,
                    size_bytes: meta.len(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BridgeError::io(&destination, e)),
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BridgeError::io(&dir, e))?;

        info!("Copying {} to {}", uri, destination.display());

        let size_bytes = match source {
            CopySource::File(path) => self.copy_file(path, &dir, &destination).await?,
            CopySource::Remote(url) => self.download_to_file(url, &dir, &destination).await?,
        };

        info!("Cached {} bytes at {}", size_bytes, destination.display());

        Ok(CachedAsset {
            filename,
            absolute_path: destination,
            size_bytes,
        })
    }

    /// Cache file name for a URI under the configured strategy.
    pub fn cache_file_name(&self, uri: &CanonicalUri) -> Result<String> {
        let base = uri.file_name().ok_or_else(|| BridgeError::InvalidSource {
            source_ref: uri.to_string(),
            reason: "source has no file name to cache under".to_string(),
        })?;
        Ok(match self.cache_key {
            CacheKeyStrategy::Basename => base,
            CacheKeyStrategy::SourceHash => {
                let digest = hex::encode(Sha256::digest(uri.to_string().as_bytes()));
                format!("{}-{}", &digest[..16], base)
            }
        })
    }

    /// Directory cache entries are written to.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.context.get()?.cache_dir()),
        }
    }

    fn check_size(&self, what: &dyn std::fmt::Display, size: u64) -> Result<()> {
        if size > self.max_in_memory_bytes {
            return Err(BridgeError::TooLarge {
                what: what.to_string(),
                size,
                limit: self.max_in_memory_bytes,
            });
        }
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| BridgeError::io(path, e))?;
        if !meta.is_file() {
            return Err(BridgeError::io(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        self.check_size(&path.display(), meta.len())?;
        tokio::fs::read(path).await.map_err(|e| BridgeError::io(path, e))
    }

    async fn read_bundle(&self, id: &str) -> Result<Vec<u8>> {
        let context = self.context.get()?;
        let owned_id = id.to_string();
        let limit = self.max_in_memory_bytes;
        let read = tokio::task::spawn_blocking(move || match context.resource_len(&owned_id) {
            Some(len) if len > limit => Ok(BundleRead::Oversized(len)),
            _ => context.read_resource(&owned_id).map(BundleRead::Data),
        })
        .await
        .map_err(|e| BridgeError::io(id, io::Error::other(e)))?
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BridgeError::ResourceNotFound(id.to_string()),
            _ => BridgeError::io(id, e),
        })?;

        match read {
            BundleRead::Oversized(len) => Err(BridgeError::TooLarge {
                what: id.to_string(),
                size: len,
                limit,
            }),
            BundleRead::Data(bytes) => {
                self.check_size(&id, bytes.len() as u64)?;
                Ok(bytes)
            }
        }
    }

    async fn get_success(&self, url: &Url) -> Result<HttpResponse> {
        let response = self.transport.get(url).await?;
        if !response.is_success() {
            return Err(BridgeError::Http {
                status: response.status,
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    async fn download_to_memory(&self, url: &Url) -> Result<Vec<u8>> {
        let mut response = self.get_success(url).await?;
        if let Some(length) = response.content_length {
            self.check_size(url, length)?;
        }

        // The declared length is only a hint; never reserve more than a
        // megabyte up front.
        let hint = response
            .content_length
            .map_or(0, |len| len.min(INITIAL_BUFFER_BYTES as u64) as usize);
        let mut buffer = Vec::new();
        reserve(&mut buffer, hint)?;
        while let Some(chunk) = response.body.next().await {
            let chunk = chunk.map_err(|e| BridgeError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            self.check_size(url, (buffer.len() + chunk.len()) as u64)?;
            reserve(&mut buffer, chunk.len())?;
            buffer.extend_from_slice(&chunk);
        }

        if buffer.is_empty() {
            return Err(BridgeError::EmptyBody(url.to_string()));
        }
        Ok(buffer)
    }

    async fn temp_file(dir: &Path) -> Result<(tokio::fs::File, tempfile::TempPath)> {
        let owned = dir.to_path_buf();
        let (file, path) = blocking(dir, move || {
            tempfile::Builder::new()
                .prefix(".")
                .suffix(".part")
                .tempfile_in(&owned)
                .map(tempfile::NamedTempFile::into_parts)
        })
        .await?;
        Ok((tokio::fs::File::from_std(file), path))
    }

    async fn finish(
        mut file: tokio::fs::File,
        temp: tempfile::TempPath,
        destination: &Path,
    ) -> Result<()> {
        file.flush()
            .await
            .map_err(|e| BridgeError::io(&*temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| BridgeError::io(&*temp, e))?;
        drop(file);
        let target = destination.to_path_buf();
        // A failed persist hands the temp path back; dropping it removes the file.
        blocking(destination, move || temp.persist(&target).map_err(|e| e.error)).await
    }

    async fn copy_file(&self, source: &Path, dir: &Path, destination: &Path) -> Result<u64> {
        let mut input = tokio::fs::File::open(source)
            .await
            .map_err(|e| BridgeError::io(source, e))?;
        let (mut output, temp) = Self::temp_file(dir).await?;

        let copied = tokio::io::copy(&mut input, &mut output)
            .await
            .map_err(|e| BridgeError::io(source, e))?;

        Self::finish(output, temp, destination).await?;
        Ok(copied)
    }

    async fn download_to_file(&self, url: &Url, dir: &Path, destination: &Path) -> Result<u64> {
        let mut response = self.get_success(url).await?;
        let (mut output, temp) = Self::temp_file(dir).await?;

        let mut downloaded: u64 = 0;
        while let Some(chunk) = response.body.next().await {
            let chunk = chunk.map_err(|e| BridgeError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            output
                .write_all(&chunk)
                .await
                .map_err(|e| BridgeError::io(&*temp, e))?;
            downloaded += chunk.len() as u64;
        }

        if downloaded == 0 {
            return Err(BridgeError::EmptyBody(url.to_string()));
        }

        Self::finish(output, temp, destination).await?;
        Ok(downloaded)
    }
}
