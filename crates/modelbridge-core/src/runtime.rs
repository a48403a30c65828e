//! The application-facing entry point.

use std::sync::Arc;

use modelbridge_inference::{
    BufferAdapter, ExternalData, InferenceEngine, InferenceError, LoadRequest, NativeBuffer,
    SessionOptions,
};
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::context::{ContextHandle, HostContext};
use crate::error::{BridgeError, Result};
use crate::fetcher::{AssetFetcher, CachedAsset, HttpTransport, ReqwestTransport};
use crate::session::Session;
use crate::source::{CanonicalUri, ModelSource, SourceResolver};

/// Resolves, fetches and loads models into an inference engine.
///
/// All collaborators are injected: the engine, the host context handle and
/// the HTTP transport. Nothing here is process-global.
pub struct ModelRuntime {
    engine: Arc<dyn InferenceEngine>,
    resolver: SourceResolver,
    fetcher: AssetFetcher,
    config: BridgeConfig,
}

impl ModelRuntime {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        context: ContextHandle,
        transport: Arc<dyn HttpTransport>,
        config: BridgeConfig,
    ) -> Self {
        let mut fetcher = AssetFetcher::new(context.clone(), transport)
            .with_max_in_memory_bytes(config.max_in_memory_bytes)
            .with_cache_key(config.cache_key);
        if let Some(dir) = &config.cache_dir {
            fetcher = fetcher.with_cache_dir(dir);
        }

        Self {
            engine,
            resolver: SourceResolver::new(context),
            fetcher,
            config,
        }
    }

    /// Runtime on the given engine with the default `reqwest` transport.
    pub fn with_engine<C: HostContext + 'static>(
        engine: Arc<dyn InferenceEngine>,
        host: &Arc<C>,
        config: BridgeConfig,
    ) -> Result<Self> {
        let transport = ReqwestTransport::with_user_agent(&config.user_agent)?;
        Ok(Self::new(
            engine,
            ContextHandle::new(host),
            Arc::new(transport),
            config,
        ))
    }

    /// Runtime on the pure-Rust tract engine.
    #[cfg(feature = "tract")]
    pub fn tract<C: HostContext + 'static>(host: &Arc<C>, config: BridgeConfig) -> Result<Self> {
        Self::with_engine(Arc::new(modelbridge_inference::TractEngine::new()), host, config)
    }

    /// Runtime on ONNX Runtime.
    #[cfg(feature = "native")]
    pub fn native<C: HostContext + 'static>(host: &Arc<C>, config: BridgeConfig) -> Result<Self> {
        Self::with_engine(Arc::new(modelbridge_inference::OrtEngine::new()), host, config)
    }

    /// Engine name and version.
    pub fn version(&self) -> String {
        self.engine.version()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn resolver(&self) -> &SourceResolver {
        &self.resolver
    }

    pub fn fetcher(&self) -> &AssetFetcher {
        &self.fetcher
    }

    /// Resolve a source, fetch its bytes and load it.
    ///
    /// Remote models go through the on-disk cache unless
    /// `cache_remote_models` is off, so a second load of the same file name
    /// does not touch the network.
    pub async fn load_model(
        &self,
        source: impl Into<ModelSource>,
        options: Option<SessionOptions>,
    ) -> Result<Session> {
        let source = source.into();
        let uri = self.resolver.resolve(&source)?;
        let bytes = self.read_model_bytes(&uri).await?;
        info!("Loading model from {} ({} bytes)", uri, bytes.len());
        self.load_model_from_buffer(BufferAdapter::wrap_owned(bytes), options)
            .await
    }

    async fn read_model_bytes(&self, uri: &CanonicalUri) -> Result<Vec<u8>> {
        match uri {
            CanonicalUri::Http { .. } | CanonicalUri::Https { .. } if self.config.cache_remote_models => {
                let asset = self.fetcher.materialize_to_cache(uri).await?;
                let cached = CanonicalUri::File {
                    path: asset.absolute_path,
                };
                self.fetcher.fetch_bytes(&cached).await
            }
            _ => self.fetcher.fetch_bytes(uri).await,
        }
    }

    /// Load a model from bytes already in memory.
    ///
    /// Per-call options are merged over the configured defaults. Unknown
    /// execution providers fail here, before the engine is invoked.
    pub async fn load_model_from_buffer(
        &self,
        buffer: NativeBuffer,
        options: Option<SessionOptions>,
    ) -> Result<Session> {
        if buffer.is_empty() {
            return Err(InferenceError::ModelParse("model buffer is empty".to_string()).into());
        }

        let options = options
            .unwrap_or_default()
            .merged_over(&self.config.default_session_options);
        options.validate()?;
        if let Some(provider) = options
            .execution_providers
            .iter()
            .find(|p| !self.engine.supports_provider(p))
        {
            return Err(InferenceError::Options(format!(
                "execution provider '{}' is not supported by {}",
                provider.name(),
                self.engine.version()
            ))
            .into());
        }

        let external_data = self.fetch_external_data(&options).await?;

        let mut request = LoadRequest::new(buffer, options);
        request.external_data = external_data;

        let engine = self.engine.clone();
        let engine_session = tokio::task::spawn_blocking(move || engine.load(request))
            .await
            .map_err(|e| InferenceError::ModelParse(format!("engine load task failed: {}", e)))??;

        let session = Session::new(engine_session);
        info!(
            "Model loaded: inputs {:?}, outputs {:?}",
            session.input_names(),
            session.output_names()
        );
        Ok(session)
    }

    async fn fetch_external_data(&self, options: &SessionOptions) -> Result<Vec<ExternalData>> {
        let mut external = Vec::with_capacity(options.external_data_paths.len());
        for location in &options.external_data_paths {
            let uri = self.resolver.resolve(&ModelSource::parse(location))?;
            let path = uri.file_name().ok_or_else(|| BridgeError::InvalidSource {
                source_ref: location.clone(),
                reason: "external data location has no file name".to_string(),
            })?;
            let data = BufferAdapter::wrap_owned(self.fetcher.fetch_bytes(&uri).await?);
            debug!("External data {} ({} bytes)", path, data.len());
            external.push(ExternalData { path, data });
        }
        Ok(external)
    }

    /// Copy a file or remote model into the cache directory.
    pub async fn copy_file(&self, source: impl Into<ModelSource>) -> Result<CachedAsset> {
        let uri = self.resolver.resolve(&source.into())?;
        self.fetcher.materialize_to_cache(&uri).await
    }

    /// Read a model source fully into an engine buffer without caching.
    pub async fn fetch_byte_data_from_url(&self, source: impl Into<ModelSource>) -> Result<NativeBuffer> {
        let uri = self.resolver.resolve(&source.into())?;
        let bytes = self.fetcher.fetch_bytes(&uri).await?;
        Ok(BufferAdapter::wrap_owned(bytes))
    }
}
