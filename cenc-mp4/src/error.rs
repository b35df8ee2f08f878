//! Error types for parsing, encrypting and decrypting operations.

use thiserror::Error;

/// The errors that may occur while processing protected mp4 data.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed box contents, declared lengths exceeding buffer bounds or bad golomb codes.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Unknown scheme type or version, unsupported IV size or an unsupported file layout.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Missing key or IV, bad key length or an absent constant IV.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Sample index beyond the table size or a buffer which is too short.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid hex string.
    #[error("invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// I/O error (for file operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_format<T: Into<String>>(reason: T) -> Self {
        Self::InvalidFormat(reason.into())
    }

    pub fn not_supported<T: Into<String>>(reason: T) -> Self {
        Self::NotSupported(reason.into())
    }

    pub fn invalid_parameters<T: Into<String>>(reason: T) -> Self {
        Self::InvalidParameters(reason.into())
    }

    pub fn out_of_range<T: Into<String>>(reason: T) -> Self {
        Self::OutOfRange(reason.into())
    }

    pub fn internal<T: Into<String>>(reason: T) -> Self {
        Self::Internal(reason.into())
    }

    /// Returns true if the error is an [`Error::InvalidFormat`].
    pub fn is_invalid_format(&self) -> bool {
        matches!(self, Self::InvalidFormat(_))
    }

    /// Returns true if the error is an [`Error::NotSupported`].
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }
}
