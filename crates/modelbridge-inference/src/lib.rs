//! Engine-facing half of modelbridge.
//!
//! This crate owns everything that touches an inference engine directly:
//! - [`NativeBuffer`] and the [`BufferAdapter`] that produces it
//! - encoded tensors and declared tensor descriptors
//! - [`SessionOptions`] and execution-provider selection
//! - the [`InferenceEngine`] / [`EngineSession`] seam, with engines for
//!   `tract` (pure Rust, default) and `ort` (ONNX Runtime, `native` feature)

mod backend;
mod buffer;
mod error;
mod options;
mod tensor;

pub use backend::{EngineSession, ExternalData, InferenceEngine, LoadRequest};
pub use buffer::{BufferAdapter, NativeBuffer};
pub use error::InferenceError;
pub use options::{
    CoreMlOptions, ExecutionMode, GraphOptimizationLevel, LogSeverityLevel, NnapiOptions,
    ProviderSpec, SessionOptions, XnnpackOptions,
};
pub use tensor::{decode, encode, DataType, Element, EncodedTensor, TensorDescriptor};

#[cfg(feature = "native")]
pub use backend::ort::{OrtEngine, OrtSession};

#[cfg(feature = "tract")]
pub use backend::tract::{TractEngine, TractSession};

/// Result type for inference operations.
pub type Result<T> = std::result::Result<T, InferenceError>;
