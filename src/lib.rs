//! shellout: controlled execution of external commands
//!
//! Runs a single command with full control over its working directory,
//! identity, environment, and standard streams. All three streams are
//! serviced concurrently through one readiness-multiplexed loop, so a child
//! flooding stdout, stderr, and stdin at once can never deadlock the parent.
//! A wall-clock timeout is enforced with TERM-then-KILL escalation against
//! the child's whole process group, and every failure path reaps the child.
//!
//! # Modules
//!
//! - **command**: command specification, validated options, run entry point
//! - **execution**: process launching, stream pumping, timeout escalation
//! - **result**: captured output and exit-status evaluation
//! - **errors**: crate error types
//!
//! # Example
//!
//! ```ignore
//! use shellout::ShellOut;
//!
//! let mut cmd = ShellOut::new("ls -l /tmp");
//! cmd.set_timeout(std::time::Duration::from_secs(30));
//! let result = cmd.run_command()?;
//! result.check_error()?;
//! println!("{}", result.stdout_lossy());
//! ```
//!
//! Running a command never raises on a "bad" exit code by itself;
//! validation is always the explicit [`CommandResult::check_error`] call.

// Core modules
pub mod command;
pub mod errors;
pub mod result;

// Engine internals: pipe handles and signal delivery are owned exclusively
// by the run loop and are not part of the public surface.
mod execution;

// Public API
pub use command::{
    CommandLine, EnvironmentOverlay, GroupSpec, LiveStream, Logger, OptionValue, ShellOut,
    UmaskValue, UserSpec, DEFAULT_TIMEOUT_SECS,
};
pub use errors::{Error, Result};
pub use result::CommandResult;

#[cfg(test)]
mod tests {
    use crate::ShellOut;

    #[test]
    fn test_module_imports() {
        // Verify core API is accessible
        let _cmd = ShellOut::new("true");
    }
}
