// src/core/errors.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImlError {
    /// The model returned a prediction table whose shape does not match the input.
    #[error("Adapter shape mismatch: expected {expected}, got {actual}")]
    AdapterShape { expected: String, actual: String },

    #[error("Feature importance needs ground truth; attach it with Predictor::with_target")]
    MissingGroundTruth,

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Degenerate fit: {0}")]
    DegenerateFit(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model prediction error: {0}")]
    ModelPrediction(String),

    #[error("ndarray shape error: {0}")]
    Ndarray(#[from] ndarray::ShapeError),
}

// Convenience type alias for Result
pub type Result<T> = std::result::Result<T, ImlError>;
