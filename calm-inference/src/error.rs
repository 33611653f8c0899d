use thiserror::Error;

use crate::tensors::DType;

pub type CalmResult<T> = Result<T, CalmError>;

/// Errors produced while loading a checkpoint or preparing a model for inference.
#[derive(Error, Debug)]
pub enum CalmError {
    /// The container header or tensor table is malformed. Nothing from the file is usable.
    #[error("Malformed container: {0}")]
    Format(String),

    /// A metadata key required to build the model configuration is missing or invalid.
    #[error("Invalid model configuration: {0}")]
    Config(String),

    #[error("Missing tensor '{0}'")]
    MissingTensor(String),

    #[error("Tensor '{name}' is {actual_dtype:?} {actual_shape:?}, expected {expected_dtype:?} {expected_shape:?}")]
    TensorMismatch {
        name: String,
        expected_dtype: DType,
        expected_shape: [usize; 4],
        actual_dtype: DType,
        actual_shape: [usize; 4],
    },

    /// Weight quantization width outside of the supported {4, 8, 16} bits.
    #[error("Unsupported weight quantization width: {0} bits (expected 4, 8 or 16)")]
    UnsupportedDbits(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CalmError {
    pub(crate) fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
