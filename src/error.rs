//! # Error Taxonomy
//!
//! Every fallible operation in hammock returns `eyre::Result`, so errors
//! carry context collected on the way up (file paths, page ids, offsets).
//! The root cause of any engine-originated failure is always an [`Error`]
//! kind from this module, which callers can recover with [`Error::kind_of`]
//! to branch on the failure class without string matching.
//!
//! Each kind has a stable numeric code; a CLI wrapper exits with that code
//! (0 is success).

use thiserror::Error;

/// The failure classes surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("short read")]
    ShortRead,
    #[error("short write")]
    ShortWrite,
    #[error("invalid key size")]
    InvalidKeySize,
    #[error("invalid page size")]
    InvalidPageSize,
    #[error("database already open")]
    AlreadyOpen,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid backend")]
    InvalidBackend,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid database file header")]
    InvalidFileHeader,
    #[error("invalid database file version")]
    InvalidFileVersion,
    #[error("key not found")]
    KeyNotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("integrity violated")]
    IntegrityViolated,
    #[error("internal error")]
    Internal,
    #[error("database opened read-only")]
    ReadOnly,
    #[error("data blob not found")]
    BlobNotFound,
}

impl Error {
    /// Stable numeric code, suitable as a process exit code.
    pub fn code(self) -> i32 {
        match self {
            Error::ShortRead => 1,
            Error::ShortWrite => 2,
            Error::InvalidKeySize => 3,
            Error::InvalidPageSize => 4,
            Error::AlreadyOpen => 5,
            Error::OutOfMemory => 6,
            Error::InvalidBackend => 7,
            Error::InvalidParameter => 8,
            Error::InvalidFileHeader => 9,
            Error::InvalidFileVersion => 10,
            Error::KeyNotFound => 11,
            Error::DuplicateKey => 12,
            Error::IntegrityViolated => 13,
            Error::Internal => 14,
            Error::ReadOnly => 15,
            Error::BlobNotFound => 16,
        }
    }

    /// Extracts the engine error kind from an `eyre` report, if the report
    /// was raised by the engine (as opposed to a bare I/O or parse error).
    pub fn kind_of(report: &eyre::Report) -> Option<Error> {
        if let Some(kind) = report.downcast_ref::<Error>() {
            return Some(*kind);
        }
        report
            .chain()
            .find_map(|cause| cause.downcast_ref::<Error>().copied())
    }
}

/// Shorthand for raising an [`Error`] kind as an `eyre` failure.
macro_rules! raise {
    ($kind:expr) => {
        return Err(::eyre::Report::new($kind))
    };
    ($kind:expr, $($ctx:tt)*) => {
        return Err(::eyre::Report::new($kind).wrap_err(format!($($ctx)*)))
    };
}

pub(crate) use raise;

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    #[test]
    fn kind_survives_context_wrapping() {
        let report = eyre::Report::new(Error::KeyNotFound)
            .wrap_err("searching for key")
            .wrap_err("find failed");

        assert_eq!(Error::kind_of(&report), Some(Error::KeyNotFound));
    }

    #[test]
    fn kind_of_foreign_error_is_none() {
        let report: eyre::Report =
            std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        let report = report.wrap_err("wrapped");

        assert_eq!(Error::kind_of(&report), None);
    }

    #[test]
    fn codes_are_distinct_and_nonzero() {
        let all = [
            Error::ShortRead,
            Error::ShortWrite,
            Error::InvalidKeySize,
            Error::InvalidPageSize,
            Error::AlreadyOpen,
            Error::OutOfMemory,
            Error::InvalidBackend,
            Error::InvalidParameter,
            Error::InvalidFileHeader,
            Error::InvalidFileVersion,
            Error::KeyNotFound,
            Error::DuplicateKey,
            Error::IntegrityViolated,
            Error::Internal,
            Error::ReadOnly,
            Error::BlobNotFound,
        ];

        let mut codes: Vec<i32> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(codes.iter().all(|&c| c != 0));
    }
}
