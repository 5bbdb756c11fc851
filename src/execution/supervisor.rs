//! Timeout escalation against the child's process group

use std::process::ExitStatus;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

use crate::errors::Result;

pub(crate) const TERM_MESSAGE: &str = "Command exceeded allowed execution time, sending TERM";
pub(crate) const KILL_MESSAGE: &str = "Command exceeded allowed execution time, sending KILL";

/// Signal delivery to a whole process tree: graceful termination, forceful
/// kill, and a liveness query. The production backend addresses the
/// child's process group so forked descendants are covered too; tests
/// substitute a recording mock, and a non-Unix process-tree backend would
/// plug in here.
pub(crate) trait GroupSignaler {
    fn terminate(&mut self);
    fn kill(&mut self);
    fn alive(&mut self) -> bool;
}

/// Signals the child's process group, falling back to the direct child pid
/// when the group id was unavailable at spawn time.
pub(crate) struct PgidSignaler {
    pgid: Option<Pid>,
    pid: Pid,
}

impl PgidSignaler {
    pub fn new(pgid: Option<Pid>, pid: Pid) -> Self {
        Self { pgid, pid }
    }

    fn send(&self, signal: Option<Signal>) -> nix::Result<()> {
        match self.pgid {
            Some(pgid) => killpg(pgid, signal),
            None => kill(self.pid, signal),
        }
    }
}

impl GroupSignaler for PgidSignaler {
    fn terminate(&mut self) {
        // ESRCH just means everyone is already gone.
        let _ = self.send(Some(Signal::SIGTERM));
    }

    fn kill(&mut self) {
        let _ = self.send(Some(Signal::SIGKILL));
    }

    fn alive(&mut self) -> bool {
        !matches!(self.send(None), Err(Errno::ESRCH))
    }
}

/// The TERM-grace-KILL state machine: Running → TermSent, then either the
/// child exits within the grace interval or KillSent follows. `step`
/// services the streams and reports the exit status once the child has
/// been reaped, so output produced after TERM (a trap acknowledgment, say)
/// still lands in the capture buffers.
pub(crate) struct Escalation {
    pub grace: Duration,
    pub poll_interval: Duration,
}

impl Default for Escalation {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl Escalation {
    pub fn run<S, F>(
        &self,
        signaler: &mut S,
        log: &mut dyn FnMut(&str),
        mut step: F,
    ) -> Result<ExitStatus>
    where
        S: GroupSignaler,
        F: FnMut(Duration) -> Result<Option<ExitStatus>>,
    {
        log(TERM_MESSAGE);
        signaler.terminate();

        let grace_end = Instant::now() + self.grace;
        while Instant::now() < grace_end {
            if let Some(status) = step(self.poll_interval)? {
                return Ok(status);
            }
        }

        if signaler.alive() {
            log(KILL_MESSAGE);
            signaler.kill();
        }
        loop {
            if let Some(status) = step(self.poll_interval)? {
                return Ok(status);
            }
        }
    }
}
