//! Aggregated error surface for the whole indexing core.
//!
//! Every layer defines its own `thiserror` enum (`seekable::StreamError`,
//! `tar::TarError`, `index::IndexError`, ...); this module only wires them
//! into one top-level type so the public API has a single `Result` alias,
//! mirroring how the teacher's `io_stream` boundary wraps `CodecError` into
//! `io::Error` rather than leaking every layer's error type to callers.

use std::io;
use thiserror::Error;

use crate::index::IndexError;
use crate::seekable::StreamError;
use crate::tar::TarError;

pub type Result<T> = std::result::Result<T, RatarError>;

/// Tier-1 (fatal at mount time) and tier-3 (per-request) errors collapse
/// into this enum. Tier-2 (recoverable during indexing) conditions are
/// reported out-of-band as `IndexWarning`s alongside a successful build —
/// see `tar::indexer::IndexWarning`.
#[derive(Error, Debug)]
pub enum RatarError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Tar(#[from] TarError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// §6 recoverable-error → FUSE errno-class mapping. The real `errno`
/// constants are assigned by the (out-of-scope) FUSE host adapter; this
/// crate only classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrnoClass {
    NotFound,
    PermissionDenied,
    Io,
    Unsupported,
}

impl RatarError {
    pub fn errno_class(&self) -> ErrnoClass {
        match self {
            RatarError::NotFound(_) => ErrnoClass::NotFound,
            RatarError::PermissionDenied(_) => ErrnoClass::PermissionDenied,
            RatarError::Stream(StreamError::Corrupt { .. })
            | RatarError::Stream(StreamError::CrcMismatch { .. })
            | RatarError::Stream(StreamError::Truncated) => ErrnoClass::Io,
            RatarError::Stream(StreamError::Unsupported { .. }) => ErrnoClass::Unsupported,
            RatarError::Stream(StreamError::Io(_)) | RatarError::Stream(StreamError::Cancelled) => {
                ErrnoClass::Io
            }
            RatarError::Tar(_) => ErrnoClass::Io,
            RatarError::Index(_) => ErrnoClass::Io,
            RatarError::Unsupported(_) => ErrnoClass::Unsupported,
            RatarError::Io(_) => ErrnoClass::Io,
        }
    }
}
