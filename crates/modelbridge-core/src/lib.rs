//! Model acquisition and typed inference sessions.
//!
//! This crate provides:
//! - Source resolution from bare strings, URLs, paths and bundled resources
//! - Asset fetching into memory or into an on-disk model cache
//! - Sessions that validate feeds against declared inputs before running
//! - A [`ModelRuntime`] facade tying these to an inference engine

pub mod config;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod runtime;
pub mod session;
pub mod source;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{BridgeConfig, CacheKeyStrategy, MAX_IN_MEMORY_BYTES};
pub use context::{ContextHandle, EmbeddedBundle, FsHostContext, HostContext, default_cache_dir};
pub use error::{BridgeError, Result};
pub use fetcher::{AssetFetcher, CachedAsset, HttpResponse, HttpTransport, ReqwestTransport};
pub use runtime::ModelRuntime;
pub use session::{Session, SessionOutputs};
pub use source::{CanonicalUri, ModelSource, Scheme, SourceResolver};

/// Re-export inference types.
pub use modelbridge_inference::{
    BufferAdapter, DataType, EncodedTensor, EngineSession, InferenceEngine, InferenceError,
    LoadRequest, NativeBuffer, ProviderSpec, SessionOptions, TensorDescriptor,
};

#[cfg(feature = "native")]
pub use modelbridge_inference::OrtEngine;

#[cfg(feature = "tract")]
pub use modelbridge_inference::TractEngine;
