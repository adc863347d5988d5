//! Error types for the tarsink library.
//!
//! Every fallible operation returns [`Result<T>`], an alias for
//! `Result<T, Error>`. The variants map directly onto the failure classes a
//! caller can meaningfully distinguish: bad input, a missing source, an
//! entry the selected tar format cannot express, a writer used outside its
//! legal state, and the two underlying failure domains (I/O and the
//! compressor).

use std::path::PathBuf;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for archive-writing operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller supplied something the writer cannot encode: forbidden
    /// path components, an empty target path, the archive's own output
    /// file, a contiguous-file entry, or a ustar name too long for
    /// prefix splitting to represent.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// The source path does not exist.
    #[error("not found: {0:?}")]
    NotFound(PathBuf),

    /// The entry kind is not representable in the active tar format, or
    /// the filesystem object is a socket or of unknown type.
    #[error("unsupported entry: {0}")]
    Unsupported(String),

    /// An admission method was called in a state that forbids it, for
    /// example while a streaming entry is in progress or after `close`.
    #[error("illegal writer state: {0}")]
    IllegalState(&'static str),

    /// I/O failure in the sink, a source file, or a host capability.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The compressor reported a failure.
    #[error("compressor error: {0}")]
    Codec(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }
}
