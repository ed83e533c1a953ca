//! Error surface shared by the write path, the read cache and the handle API.
//!
//! Adapters below this layer speak `anyhow`; everything that reaches a caller
//! of [`crate::vfs::Vfs`] is folded into [`VfsError`].

use crate::chuck::chunk::ObjectKey;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

/// An error observed once and handed to several waiters.
pub type SharedError = Arc<anyhow::Error>;

#[derive(Error, Debug)]
pub enum VfsError {
    /// The write starts before bytes that were already handed to the uploader.
    #[error("out of order write at offset {offset}, flushed boundary is {boundary}")]
    OutOfOrderWrite { offset: u64, boundary: u64 },

    #[error("upload failed: {0}")]
    UploadFailure(SharedError),

    #[error("download of {object} {range:?} failed: {cause}")]
    DownloadFailure {
        object: ObjectKey,
        range: Range<u64>,
        cause: SharedError,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("stale file handle")]
    StaleHandle,

    #[error("write handle already finalized")]
    Finalized,

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl VfsError {
    pub(crate) fn download(
        object: ObjectKey,
        range: Range<u64>,
        cause: SharedError,
    ) -> Self {
        VfsError::DownloadFailure {
            object,
            range,
            cause,
        }
    }

    /// Whether the caller aborted the operation, as opposed to a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VfsError::Cancelled)
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = VfsError::OutOfOrderWrite {
            offset: 3,
            boundary: 1024,
        };
        assert_eq!(
            err.to_string(),
            "out of order write at offset 3, flushed boundary is 1024"
        );

        let err = VfsError::download(
            ObjectKey::new("a/b", 7),
            0..10,
            Arc::new(anyhow::anyhow!("boom")),
        );
        assert_eq!(err.to_string(), "download of a/b#7 0..10 failed: boom");
        assert!(!err.is_cancelled());
        assert!(VfsError::Cancelled.is_cancelled());
    }
}
