//! Inference engine implementations.

#[cfg(feature = "native")]
pub mod ort;

#[cfg(feature = "tract")]
pub mod tract;

use crate::{EncodedTensor, NativeBuffer, ProviderSpec, Result, SessionOptions, TensorDescriptor};

/// An external weight file handed to the engine alongside the model.
#[derive(Debug, Clone)]
pub struct ExternalData {
    /// Location the model graph refers to (relative file name).
    pub path: String,
    pub data: NativeBuffer,
}

/// Everything an engine needs to create a session.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub model: NativeBuffer,
    pub options: SessionOptions,
    pub external_data: Vec<ExternalData>,
}

impl LoadRequest {
    pub fn new(model: NativeBuffer, options: SessionOptions) -> Self {
        Self {
            model,
            options,
            external_data: Vec::new(),
        }
    }
}

/// Trait for ONNX inference engines.
///
/// The engine is treated as an opaque service: it turns model bytes into a
/// session and knows which execution providers it can drive. Implementations
/// are synchronous; callers move them onto a blocking worker.
pub trait InferenceEngine: Send + Sync {
    /// Engine name and version, e.g. `tract 0.21`.
    fn version(&self) -> String;

    /// Whether this build recognizes the provider at all.
    ///
    /// Providers that are recognized but not available on the running
    /// platform still return `true`; the engine skips them at load time.
    fn supports_provider(&self, provider: &ProviderSpec) -> bool;

    /// Parse the model and create a session.
    fn load(&self, request: LoadRequest) -> Result<Box<dyn EngineSession>>;
}

/// A loaded model inside an engine.
pub trait EngineSession: Send {
    /// Declared inputs, in model order.
    fn inputs(&self) -> &[TensorDescriptor];

    /// Declared outputs, in model order.
    fn outputs(&self) -> &[TensorDescriptor];

    /// Run inference.
    ///
    /// Feeds have already been validated against [`inputs`](Self::inputs).
    /// Returns one freshly allocated buffer per declared output.
    fn run(&mut self, feeds: &[EncodedTensor]) -> Result<Vec<(String, NativeBuffer)>>;
}
