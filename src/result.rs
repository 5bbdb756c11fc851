//! Captured output and exit-status evaluation

use std::borrow::Cow;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use crate::errors::{Error, Result};

/// Outcome of a single run: the captured streams, the exit status, and the
/// elapsed wall time. Produced exactly once per run and immutable afterward.
///
/// Exit-status validation is never applied implicitly; callers opt in with
/// [`CommandResult::check_error`] or [`CommandResult::invalid`].
#[derive(Debug, Clone)]
pub struct CommandResult {
    command: String,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    status: ExitStatus,
    elapsed: Duration,
    valid_exit_codes: Vec<i32>,
}

impl CommandResult {
    pub(crate) fn new(
        command: String,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        status: ExitStatus,
        elapsed: Duration,
        valid_exit_codes: Vec<i32>,
    ) -> Self {
        Self {
            command,
            stdout,
            stderr,
            status,
            elapsed,
            valid_exit_codes,
        }
    }

    /// Display form of the command that produced this result.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Everything the child wrote to stdout, byte-exact.
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    /// Everything the child wrote to stderr, byte-exact.
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    pub fn status(&self) -> ExitStatus {
        self.status
    }

    /// Exit code, or `None` when the child was terminated by a signal.
    pub fn exitstatus(&self) -> Option<i32> {
        self.status.code()
    }

    /// Signal that terminated the child, if it did not exit normally.
    pub fn termsig(&self) -> Option<i32> {
        self.status.signal()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// True iff the exit code is outside the acceptable set, or the child
    /// died by signal.
    pub fn is_error(&self) -> bool {
        match self.status.code() {
            Some(code) => !self.valid_exit_codes.contains(&code),
            None => true,
        }
    }

    /// Fails with `ShellCommandFailed` when [`is_error`](Self::is_error)
    /// holds; otherwise passes the result through for chaining.
    pub fn check_error(&self) -> Result<&Self> {
        if self.is_error() {
            Err(Error::ShellCommandFailed(format!(
                "Expected process to exit with {:?}, but received '{}'\n{}",
                self.valid_exit_codes,
                self.status_display(),
                self.format_for_exception()
            )))
        } else {
            Ok(self)
        }
    }

    /// Builds an unconditional `ShellCommandFailed` carrying `reason`, for
    /// callers applying validation beyond the exit code:
    ///
    /// ```ignore
    /// if !result.stdout_lossy().contains("ok") {
    ///     return Err(result.invalid("expected an ok marker in the output"));
    /// }
    /// ```
    pub fn invalid(&self, reason: &str) -> Error {
        Error::ShellCommandFailed(format!("{}\n{}", reason, self.format_for_exception()))
    }

    /// Renders the captured output for inclusion in failure messages, one
    /// prefixed line per line of content:
    ///
    /// ```text
    /// ---- Begin output of <command> ----
    /// STDOUT: <each stdout line>
    /// STDERR: <each stderr line>
    /// ---- End output of <command> ----
    /// Ran <command> returned <exitstatus>
    /// ```
    pub fn format_for_exception(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("---- Begin output of {} ----", self.command));
        for line in self.stdout_lossy().lines() {
            lines.push(format!("STDOUT: {line}"));
        }
        for line in self.stderr_lossy().lines() {
            lines.push(format!("STDERR: {line}"));
        }
        lines.push(format!("---- End output of {} ----", self.command));
        lines.push(format!(
            "Ran {} returned {}",
            self.command,
            self.status_display()
        ));
        lines.join("\n")
    }

    fn status_display(&self) -> String {
        match self.status.code() {
            Some(code) => code.to_string(),
            None => match self.status.signal() {
                Some(sig) => format!("signal {sig}"),
                None => "unknown".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signaled(sig: i32) -> ExitStatus {
        ExitStatus::from_raw(sig)
    }

    fn result_with(status: ExitStatus, valid: Vec<i32>) -> CommandResult {
        CommandResult::new(
            "apt-get install chef".to_string(),
            b"msg_in_stdout\n".to_vec(),
            b"msg_in_stderr\n".to_vec(),
            status,
            Duration::from_millis(5),
            valid,
        )
    }

    #[test]
    fn zero_is_acceptable_by_default() {
        let result = result_with(exited(0), vec![0]);
        assert!(!result.is_error());
        assert!(result.check_error().is_ok());
    }

    #[test]
    fn nonzero_exit_is_an_error_by_default() {
        let result = result_with(exited(2), vec![0]);
        assert!(result.is_error());
        let err = result.check_error().unwrap_err();
        assert!(matches!(err, Error::ShellCommandFailed(_)));
        let message = err.to_string();
        assert!(message.contains("Expected process to exit with [0]"));
        assert!(message.contains("received '2'"));
        assert!(message.contains(&result.format_for_exception()));
    }

    #[test]
    fn configured_codes_are_acceptable() {
        let result = result_with(exited(42), vec![0, 1, 42]);
        assert!(!result.is_error());
    }

    #[test]
    fn zero_is_an_error_when_not_configured() {
        let result = result_with(exited(0), vec![42]);
        assert!(result.is_error());
    }

    #[test]
    fn signal_termination_is_always_an_error() {
        let result = result_with(signaled(9), vec![0]);
        assert!(result.is_error());
        assert_eq!(result.exitstatus(), None);
        assert_eq!(result.termsig(), Some(9));
    }

    #[test]
    fn invalid_fails_regardless_of_exit_status() {
        let result = result_with(exited(0), vec![0]);
        let err = result.invalid("I expected this to exit 42, not 0");
        assert!(matches!(err, Error::ShellCommandFailed(_)));
        let message = err.to_string();
        assert!(message.starts_with("I expected this to exit 42, not 0\n"));
        assert!(message.contains("---- Begin output of"));
    }

    #[test]
    fn format_for_exception_matches_template() {
        let result = result_with(exited(0), vec![0]);
        let expected = [
            "---- Begin output of apt-get install chef ----",
            "STDOUT: msg_in_stdout",
            "STDERR: msg_in_stderr",
            "---- End output of apt-get install chef ----",
            "Ran apt-get install chef returned 0",
        ]
        .join("\n");
        assert_eq!(result.format_for_exception(), expected);
    }

    #[test]
    fn format_for_exception_skips_empty_streams() {
        let result = CommandResult::new(
            "true".to_string(),
            Vec::new(),
            Vec::new(),
            exited(0),
            Duration::ZERO,
            vec![0],
        );
        let expected = [
            "---- Begin output of true ----",
            "---- End output of true ----",
            "Ran true returned 0",
        ]
        .join("\n");
        assert_eq!(result.format_for_exception(), expected);
    }

    #[test]
    fn format_for_exception_prefixes_every_line() {
        let result = CommandResult::new(
            "script".to_string(),
            b"one\ntwo\n".to_vec(),
            Vec::new(),
            exited(1),
            Duration::ZERO,
            vec![0],
        );
        let formatted = result.format_for_exception();
        assert!(formatted.contains("STDOUT: one\nSTDOUT: two\n"));
        assert!(formatted.ends_with("Ran script returned 1"));
    }

    #[test]
    fn signal_status_renders_in_trailer() {
        let result = result_with(signaled(9), vec![0]);
        assert!(result
            .format_for_exception()
            .ends_with("returned signal 9"));
    }
}
