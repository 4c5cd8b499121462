//! Error taxonomy for building and running the thought generator.

use thiserror::Error;

/// Errors raised by the fusion model.
///
/// Configuration errors are detected when the model is built; shape and
/// bounds errors are detected during a forward pass. Nothing is recovered
/// internally: a failed forward pass returns no partial results.
#[derive(Debug, Error)]
pub enum FusionError {
    /// The configuration cannot describe a valid model.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Tensor shapes do not line up (token counts, channels, stage count).
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A spatial size needs relative offsets the bias table cannot hold.
    #[error(
        "relative offset out of range: {height}x{width} needs offsets up to {needed}, \
         table supports at most {supported} (max_relative_position = {max_relative_position})"
    )]
    Bounds {
        height: usize,
        width: usize,
        needed: usize,
        supported: usize,
        max_relative_position: usize,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, FusionError>;

macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::FusionError::Config(format!($($arg)*)))
    };
}

macro_rules! shape_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::FusionError::ShapeMismatch(format!($($arg)*)))
    };
}

pub(crate) use config_bail;
pub(crate) use shape_bail;
