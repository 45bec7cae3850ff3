//! Error types for the Domla archive
//!
//! Provides the unified error taxonomy raised by the storage core.

use thiserror::Error;

/// Result type alias using the archive's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the archive core
#[derive(Error, Debug)]
pub enum Error {
    /// An id or a row that must exist is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Locked by another user, or the operation is not valid in the
    /// document's current state (already deleted, not deleted, ...)
    #[error("lock conflict: {0}")]
    Lock(String),

    /// The reserved read-only user attempted a mutation, or
    /// authentication is missing
    #[error("authentication failure: {0}")]
    Auth(String),

    /// Malformed input: bad patch header, empty separator, empty meta tags
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Underlying SQL or compression failure, with diagnostic location
    #[error("engine error {code}: {message} ({file}:{line})")]
    Engine {
        message: String,
        code: i32,
        file: &'static str,
        line: u32,
    },

    /// A structural invariant was found broken at read time
    #[error("integrity violation: {0}")]
    Integrity(String),

    // Configuration Errors
    #[error("configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an `Engine` error carrying the caller's source location.
    #[track_caller]
    pub fn engine(message: impl Into<String>, code: i32) -> Self {
        let location = std::panic::Location::caller();
        Error::Engine {
            message: message.into(),
            code,
            file: location.file(),
            line: location.line(),
        }
    }

    #[track_caller]
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_carry_location() {
        let error = Error::engine("disk I/O error", 10);
        match error {
            Error::Engine {
                message,
                code,
                file,
                line,
            } => {
                assert_eq!(message, "disk I/O error");
                assert_eq!(code, 10);
                assert!(file.ends_with("error.rs"));
                assert!(line > 0);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn messages_are_short_and_human() {
        let error = Error::Lock("locked by otto".into());
        assert_eq!(error.to_string(), "lock conflict: locked by otto");
    }
}
