//! Error types for store operations.

use std::io;
use std::path::Path;
use thiserror::Error;

use crate::config::Durability;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while opening or operating a [`crate::SharedStore`].
#[derive(Debug, Error)]
pub enum Error {
    /// The lock file was written by an incompatible build (layout version or
    /// pthread primitive sizes differ).
    #[error("incompatible lock file: {0}")]
    IncompatibleLockFile(String),

    /// The requested snapshot version is no longer held in the ringbuffer,
    /// or a specific-version request tried to move backwards in time.
    #[error("snapshot version is no longer available")]
    BadVersion,

    /// The operation is not valid in the current transaction stage.
    #[error("operation not valid in the current transaction stage")]
    WrongTransactionState,

    /// The data or lock file could not be grown.
    #[error("out of disk space")]
    OutOfDiskSpace,

    /// A file size or offset exceeded the addressable range.
    #[error("file size or offset exceeds the addressable range")]
    Range,

    /// The session was created with a different durability level.
    #[error("inconsistent durability level: session uses {session:?}, caller requested {requested:?}")]
    InconsistentDurability {
        /// Durability fixed when the session was created.
        session: Durability,
        /// Durability the caller asked for.
        requested: Durability,
    },

    /// An encrypted store may only be shared within the initiating process.
    #[error("{path}: encrypted interprocess sharing is unsupported")]
    EncryptedSharingUnsupported {
        /// Path of the store being opened.
        path: String,
    },

    /// The data file header failed validation.
    #[error("data file is corrupted: {0}")]
    Corrupt(String),

    /// The data file carries a format tag this build cannot handle, or an
    /// upgradable tag while upgrades were not allowed.
    #[error("unsupported data file format tag {found} (this build writes tag {supported})")]
    UnsupportedFileFormat {
        /// Tag found in the file header.
        found: u16,
        /// Tag this build writes.
        supported: u16,
    },

    /// The file did not exist and creation was disallowed.
    #[error("{path}: no such file")]
    FileNotFound {
        /// Path of the missing file.
        path: String,
    },

    /// Access to a file was denied.
    #[error("{path}: permission denied")]
    PermissionDenied {
        /// Path of the file.
        path: String,
    },

    /// A file unexpectedly already existed.
    #[error("{path}: file already exists")]
    FileAlreadyExists {
        /// Path of the offending file.
        path: String,
    },

    /// The store has already been closed.
    #[error("store is closed")]
    Closed,

    /// Any other file-level failure.
    #[error("file operation failed: {0}")]
    Io(#[from] io::Error),

    /// The replication hook refused the commit.
    #[error("replication rejected the commit: {0}")]
    Replication(String),
}

impl Error {
    /// Maps an `io::Error` onto the boundary taxonomy, attaching the path
    /// for the kinds where it matters.
    pub(crate) fn from_io(err: io::Error, path: &Path) -> Self {
        let path_str = || path.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound { path: path_str() },
            io::ErrorKind::PermissionDenied => Error::PermissionDenied { path: path_str() },
            io::ErrorKind::AlreadyExists => Error::FileAlreadyExists { path: path_str() },
            _ => {
                if err.raw_os_error() == Some(libc::ENOSPC) {
                    Error::OutOfDiskSpace
                } else {
                    Error::Io(err)
                }
            }
        }
    }

    /// Returns `true` if retrying the same call can ever succeed
    /// (e.g. the requested snapshot may be re-pinned from a fresh version).
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BadVersion | Self::WrongTransactionState)
    }

    /// Returns `true` if the attachment is permanently unusable.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::IncompatibleLockFile(_)
                | Self::Closed
                | Self::UnsupportedFileFormat { .. }
                | Self::Corrupt(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_mapping_picks_taxonomy_kind() {
        let err = Error::from_io(
            io::Error::new(io::ErrorKind::NotFound, "gone"),
            Path::new("/tmp/db"),
        );
        assert!(matches!(err, Error::FileNotFound { .. }));

        let err = Error::from_io(
            io::Error::from_raw_os_error(libc::ENOSPC),
            Path::new("/tmp/db"),
        );
        assert!(matches!(err, Error::OutOfDiskSpace));
    }

    #[test]
    fn classification_helpers() {
        assert!(Error::BadVersion.is_recoverable());
        assert!(!Error::BadVersion.is_terminal());
        assert!(Error::IncompatibleLockFile("size".into()).is_terminal());
    }
}
