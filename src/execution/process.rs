//! Process launching with pipes, identity, and process-group setup

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::Instant;

use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, Pid};

use crate::command::{CommandLine, ShellOut};
use crate::errors::{Error, Result};

/// A spawned child with its pipes, pid, and process-group id. Owned by
/// exactly one run; dropping it before the status has been collected kills
/// the group and reaps, so aborted runs leave no zombie behind.
#[derive(Debug)]
pub(crate) struct RunningProcess {
    child: Child,
    pid: Pid,
    pgid: Option<Pid>,
    started: Instant,
    status: Option<ExitStatus>,
}

/// Spawns the configured command with piped streams, a fresh process group,
/// and the requested cwd, environment, umask, and identity in place before
/// the program starts executing.
pub(crate) fn launch(config: &ShellOut) -> Result<RunningProcess> {
    let mut cmd = build_command(config)?;
    let uid = config.uid()?;
    let gid = config.gid()?;
    let umask = config.umask();

    // SAFETY: the hook runs between fork and exec and restricts itself to
    // async-signal-safe libc calls.
    unsafe {
        cmd.pre_exec(move || child_setup(uid, gid, umask));
    }

    let mut child = cmd.spawn().map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::CommandNotFound(config.command.to_string()),
        _ => Error::Io(err),
    })?;
    let pid = Pid::from_raw(child.id() as i32);

    // The child may already be gone by the time we ask for its group; that
    // race only costs us group-directed signals later, not the run.
    let pgid = match getpgid(Some(pid)) {
        Ok(pgid) => Some(pgid),
        Err(Errno::ESRCH) => None,
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Io(err.into()));
        }
    };

    debug!("spawned pid {pid} (pgid {pgid:?})");
    Ok(RunningProcess {
        child,
        pid,
        pgid,
        started: Instant::now(),
        status: None,
    })
}

fn build_command(config: &ShellOut) -> Result<Command> {
    let mut cmd = match &config.command {
        CommandLine::Shell(line) => {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(line);
            cmd
        }
        CommandLine::Argv(argv) => {
            let (program, args) = argv.split_first().ok_or_else(|| {
                Error::InvalidCommandOption(
                    "an argv command requires at least one element".to_string(),
                )
            })?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    };

    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }
    // Overlay onto the inherited environment: untouched variables pass
    // through, Some overrides, None unsets.
    for (key, value) in &config.environment {
        match value {
            Some(value) => {
                cmd.env(key, value);
            }
            None => {
                cmd.env_remove(key);
            }
        }
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    Ok(cmd)
}

/// Runs in the child between fork and exec: group leadership first, then
/// umask, then gid before uid so privileges drop in the right order. The
/// parent's own identity is never touched.
fn child_setup(uid: Option<u32>, gid: Option<u32>, umask: Option<u32>) -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(mask) = umask {
        unsafe { libc::umask(mask as libc::mode_t) };
    }
    if let Some(gid) = gid {
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if let Some(uid) = uid {
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl RunningProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pgid(&self) -> Option<Pid> {
        self.pgid
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Hands the parent-side pipe ends to the pump. Each end is owned by
    /// exactly one mover from here on.
    pub fn take_pipes(
        &mut self,
    ) -> (
        Option<ChildStdin>,
        Option<ChildStdout>,
        Option<ChildStderr>,
    ) {
        (
            self.child.stdin.take(),
            self.child.stdout.take(),
            self.child.stderr.take(),
        )
    }

    /// Non-blocking reap; the collected status is cached so later calls
    /// (and Drop) see the process as already accounted for.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match self.child.try_wait()? {
            Some(status) => {
                self.status = Some(status);
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if self.status.is_some() {
            return;
        }
        // Aborted run: take the whole group down and reap so no failure
        // path leaks a zombie.
        if let Some(pgid) = self.pgid {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
