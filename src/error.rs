// src/error.rs

//! Error types for the installer
//!
//! Every failure in the installation engine is carried as a kind plus a
//! human-readable message. Tasks report the kind to the facade unchanged, so
//! callers can tell a user abort (`Cancelled`) from a broken package
//! (`PackageError`) or a filesystem problem (`IoError`).

use std::fmt;
use thiserror::Error;

/// Installer error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed manifest, report, configuration or metadata
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Structural, ordering or policy violation in a package
    #[error("Package error: {0}")]
    PackageError(String),

    /// Filesystem or privileged-operation failure
    #[error("I/O error: {0}")]
    IoError(String),

    /// User-initiated abort before the commit point
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Process, privilege or environment failure
    #[error("System error: {0}")]
    SystemError(String),

    /// Download failure
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Corrupt or unreadable archive stream
    #[error("Archive error: {0}")]
    ArchiveError(String),

    /// A removable installation medium is not mounted
    #[error("Medium not available: {0}")]
    MediumNotAvailable(String),

    /// Not enough free space on the installation device
    #[error("Storage space error: {0}")]
    StorageSpace(String),
}

/// The kind of an [`Error`], without its message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    Package,
    Io,
    Cancelled,
    System,
    Network,
    Archive,
    MediumNotAvailable,
    StorageSpace,
}

impl Error {
    /// Get the kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ParseError(_) => ErrorKind::Parse,
            Error::PackageError(_) => ErrorKind::Package,
            Error::IoError(_) => ErrorKind::Io,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::SystemError(_) => ErrorKind::System,
            Error::NetworkError(_) => ErrorKind::Network,
            Error::ArchiveError(_) => ErrorKind::Archive,
            Error::MediumNotAvailable(_) => ErrorKind::MediumNotAvailable,
            Error::StorageSpace(_) => ErrorKind::StorageSpace,
        }
    }

    /// Get the message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            Error::ParseError(m)
            | Error::PackageError(m)
            | Error::IoError(m)
            | Error::Cancelled(m)
            | Error::SystemError(m)
            | Error::NetworkError(m)
            | Error::ArchiveError(m)
            | Error::MediumNotAvailable(m)
            | Error::StorageSpace(m) => m,
        }
    }

    /// Whether this error is a user-initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Package => "package",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::System => "system",
            ErrorKind::Network => "network",
            ErrorKind::Archive => "archive",
            ErrorKind::MediumNotAvailable => "medium-not-available",
            ErrorKind::StorageSpace => "storage-space",
        };
        f.write_str(name)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::NetworkError(err.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::SystemError(err.to_string())
    }
}

/// Result type alias using the installer error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_message() {
        let err = Error::PackageError("wrong first entry".to_string());
        assert_eq!(err.kind(), ErrorKind::Package);
        assert_eq!(err.message(), "wrong first entry");
        assert_eq!(err.to_string(), "Package error: wrong first entry");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::Cancelled.to_string(), "cancelled");
        assert_eq!(ErrorKind::MediumNotAvailable.to_string(), "medium-not-available");
    }
}
