//! Error types for the engine-facing layer.

use thiserror::Error;

/// Errors raised while loading a model into an engine or running it.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// The platform could not allocate a buffer of the requested size.
    #[error("failed to allocate {0} bytes")]
    Allocation(usize),

    /// The model bytes are empty or not a parseable model.
    #[error("failed to parse model: {0}")]
    ModelParse(String),

    /// The model graph uses an operator this engine build does not implement.
    #[error("unsupported operator: {0}")]
    UnsupportedOp(String),

    /// Session options were rejected (unknown provider, unusable setting).
    #[error("invalid session options: {0}")]
    Options(String),

    /// A fed tensor's dims do not fit the declared input.
    #[error("shape mismatch for '{name}': {reason}")]
    ShapeMismatch { name: String, reason: String },

    /// A fed tensor's dtype differs from the declared input.
    #[error("type mismatch for '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A declared model input was not supplied.
    #[error("missing required input '{name}'")]
    MissingInput { name: String },

    /// A feed names an input the model does not declare.
    #[error("model has no input named '{name}'")]
    UnknownInput { name: String },

    /// Inference execution failed inside the engine.
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    /// Output tensor extraction failed.
    #[error("failed to extract output: {0}")]
    OutputExtraction(String),
}
