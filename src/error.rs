use std::path::PathBuf;

/// Custom Result type for GTS operations, wrapping the crate [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the GTS library.
///
/// Variants follow the failure domains of the engine: archive I/O, on-disk
/// format validation, schema consistency, API lifecycle, and codec failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Archive read/write failures.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, truncated directory, unknown stream and other structural
    /// problems with an archive being opened or read.
    #[error("archive format error: {0}")]
    Format(String),

    /// Key table, sample or genotype arity mismatches.
    #[error("schema error: {0}")]
    Schema(String),

    /// A public operation was invoked in the wrong lifecycle state.
    #[error("invalid operation: {0}")]
    State(String),

    /// The entropy coder rejected input, or codec dimensions do not match.
    #[error("codec error: {0}")]
    Codec(String),

    /// The archive path for writing already exists.
    #[error("archive already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
}

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub(crate) fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }
}
