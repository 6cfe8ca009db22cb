//! Error types for coding and container operations.

use thiserror::Error;

/// Result type alias for McQuic operations.
pub type Result<T> = core::result::Result<T, Error>;

/// McQuic error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing configuration value.
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    /// Declared shape does not match the data actually present.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Bitstream was produced by an incompatible model.
    #[error("codebook fingerprint mismatch: model is 0x{expected:016x}, stream is 0x{found:016x}")]
    FingerprintMismatch { expected: u64, found: u64 },

    /// Container version is not understood by this build.
    #[error("unsupported container version {found} (supported: {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },

    /// Decoded indices do not hash to the recorded checksum.
    #[error("checksum mismatch at level {level}: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch { level: usize, expected: u32, actual: u32 },

    /// Input data is corrupted or invalid.
    #[error("corrupted data: {message}")]
    CorruptedData {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unexpected end of input stream.
    #[error("unexpected EOF after {bytes_read} bytes")]
    UnexpectedEof { bytes_read: usize },

    /// A code index fell outside its codebook.
    #[error("index {index} out of range for codebook of size {k}")]
    IndexOutOfRange { index: usize, k: usize },

    /// I/O error from underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::ConfigValidation(message.into())
    }

    /// Create a shape mismatch error from anything printable.
    pub fn shape(expected: impl ToString, actual: impl ToString) -> Self {
        Error::ShapeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create a corrupted data error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Error::CorruptedData {
            message: message.into(),
            source: None,
        }
    }

    /// Create a corrupted data error with offset context.
    pub fn corrupted_at(message: impl Into<String>, offset: usize) -> Self {
        Error::CorruptedData {
            message: format!("{} at offset {}", message.into(), offset),
            source: None,
        }
    }

    /// Wrap a foreign decode error as corrupted data.
    pub fn corrupted_by(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::CorruptedData {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an unexpected EOF error.
    pub fn unexpected_eof(bytes_read: usize) -> Self {
        Error::UnexpectedEof { bytes_read }
    }

    /// Create an I/O error with a custom message.
    pub fn io(message: impl Into<String>) -> Self {
        Error::Io(std::io::Error::other(message.into()))
    }

    /// Transient failures worth retrying (data loading only).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Other
            ),
            _ => false,
        }
    }

    /// True when the stream was made by a model we cannot decode with.
    pub fn is_incompatible_stream(&self) -> bool {
        matches!(
            self,
            Error::FingerprintMismatch { .. } | Error::UnsupportedVersion { .. }
        )
    }

    /// Get error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Error::ConfigValidation(_) => "config_validation",
            Error::ShapeMismatch { .. } => "shape_mismatch",
            Error::FingerprintMismatch { .. } => "fingerprint_mismatch",
            Error::UnsupportedVersion { .. } => "unsupported_version",
            Error::ChecksumMismatch { .. } => "checksum_mismatch",
            Error::CorruptedData { .. } => "corrupted_data",
            Error::UnexpectedEof { .. } => "unexpected_eof",
            Error::IndexOutOfRange { .. } => "index_out_of_range",
            Error::Io(_) => "io_error",
        }
    }
}
