//! Error types for command execution

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::result::CommandResult;

/// Result type for command execution operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running a command
#[derive(Error, Debug)]
pub enum Error {
    /// An option key outside the enumerated set, or a known key given a
    /// value of the wrong shape. Raised synchronously at configuration time.
    #[error("{0}")]
    InvalidCommandOption(String),

    /// The program could not be found or executed. The failed child is
    /// always reaped before this surfaces.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// The child closed its stdin (or died) while the input payload was
    /// still being delivered.
    #[error("broken pipe while writing input to child stdin")]
    BrokenPipe(#[source] io::Error),

    /// The command outlived its timeout and was escalated TERM-then-KILL.
    /// Output captured up to termination rides along in `result`.
    #[error("command timed out after {timeout:?}")]
    CommandTimeout {
        timeout: Duration,
        result: Box<CommandResult>,
    },

    /// Exit-status validation failure, only ever produced by the explicit
    /// `check_error`/`invalid` calls on a result.
    #[error("{0}")]
    ShellCommandFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid_option(key: &str) -> Self {
        Error::InvalidCommandOption(format!(
            "option '{key}' is not a valid option for ShellOut"
        ))
    }

    pub(crate) fn invalid_option_value(key: &str, expected: &str) -> Self {
        Error::InvalidCommandOption(format!("option '{key}' expects {expected}"))
    }

    /// Partial result captured before a timeout was declared, if this is a
    /// `CommandTimeout`.
    pub fn timeout_result(&self) -> Option<&CommandResult> {
        match self {
            Error::CommandTimeout { result, .. } => Some(result),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_option_names_the_key() {
        let err = Error::invalid_option("frab");
        assert_eq!(
            err.to_string(),
            "option 'frab' is not a valid option for ShellOut"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_timeout_result_on_other_variants() {
        let err = Error::CommandNotFound("nope".to_string());
        assert!(err.timeout_result().is_none());
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}
