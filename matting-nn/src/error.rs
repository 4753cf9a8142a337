use std::path::PathBuf;

use thiserror::Error;

/// The error type for matting encoder construction and weight handling.
#[derive(Error, Debug)]
pub enum EncoderError {
    /// A residual block type that has no implementation was requested.
    #[error("{block} is not implemented.")]
    NotImplemented {
        /// The requested block type name.
        block: String,
    },

    /// The weight source was neither a path nor empty.
    #[error("\"pretrained\" must be a str or None. But received {received}.")]
    TypeMismatch {
        /// Type of the value that was received instead.
        received: String,
    },

    /// Configuration parameters are logically inconsistent.
    #[error("Invalid encoder configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration is invalid.
        reason: String,
    },

    /// A checkpoint could not be read into the module.
    #[error("Failed to load weights from {path}: {reason}")]
    WeightLoading {
        /// The checkpoint path.
        path: PathBuf,
        /// The underlying recorder message.
        reason: String,
    },

    /// An encoder description could not be parsed.
    #[error("Failed to parse encoder config: {reason}")]
    ConfigParse {
        /// The parser message.
        reason: String,
    },
}

/// A specialized `Result` type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;
