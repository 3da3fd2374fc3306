//! Crate-wide error type.
//!
//! One flat enum, one variant family per external error code, grounded in
//! `valaphee-hyrax`'s `fs`/`ds` crates (`thiserror = "1.0"`) rather than the
//! teacher's per-module `FatError`/`DirError`/`FileError` enums — the VFS
//! surface needs a single error type callers can match on regardless of
//! which layer raised it.

/// Result alias used throughout the crate.
pub type FsResult<T> = Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,

    #[error("file or directory already exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotADir,

    #[error("not a file")]
    NotAFile,

    #[error("no space left on device")]
    NoSpace,

    #[error("filesystem is mounted read-only")]
    PermissionDenied,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unexpected end of file")]
    Eof,

    #[error("corrupt filesystem: {0}")]
    CorruptFilesystem(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("filesystem is unmounted")]
    Unmounted,
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptFilesystem(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

/// Outcome of a write that may legitimately transfer fewer bytes than
/// requested because the device ran out of space partway through. Directory
/// operations never produce a partial write (see the node layer invariants);
/// only file content writes do.
#[derive(Debug)]
pub struct WriteOutcome {
    pub bytes_written: usize,
    pub error: Option<Error>,
}

impl WriteOutcome {
    pub(crate) fn complete(bytes_written: usize) -> Self {
        WriteOutcome {
            bytes_written,
            error: None,
        }
    }

    pub(crate) fn partial(bytes_written: usize, error: Error) -> Self {
        WriteOutcome {
            bytes_written,
            error: Some(error),
        }
    }

    /// Turns a partial write with an error into `Err`, a complete write into
    /// `Ok(bytes_written)`.
    pub fn into_result(self) -> FsResult<usize> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.bytes_written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_do_not_panic() {
        let variants: Vec<Error> = vec![
            Error::NotFound,
            Error::AlreadyExists,
            Error::NotEmpty,
            Error::NotADir,
            Error::NotAFile,
            Error::NoSpace,
            Error::PermissionDenied,
            Error::InvalidArgument("bad path".into()),
            Error::Eof,
            Error::CorruptFilesystem("bad signature".into()),
            Error::Unmounted,
        ];
        for e in variants {
            let _ = format!("{e}");
        }
    }

    #[test]
    fn write_outcome_complete_round_trips() {
        let outcome = WriteOutcome::complete(42);
        assert_eq!(outcome.into_result().unwrap(), 42);
    }

    #[test]
    fn write_outcome_partial_surfaces_error_but_keeps_count() {
        let outcome = WriteOutcome::partial(10, Error::NoSpace);
        assert_eq!(outcome.bytes_written, 10);
        assert!(outcome.into_result().is_err());
    }
}
