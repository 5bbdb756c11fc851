//! Command specification and run orchestration

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::{Error, Result};
use crate::execution::process::{self, RunningProcess};
use crate::execution::pump::IoPump;
use crate::execution::supervisor::{Escalation, PgidSignaler};
use crate::result::CommandResult;

/// Default wall-clock timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// How long the run loop waits on the streams before rechecking the child
/// and the deadline.
const IO_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait used while draining streams after the child has been reaped. A
/// forked descendant may hold the pipe ends open forever, so draining stops
/// after the first pass that produces nothing.
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Shared sink receiving captured output incrementally as it is produced,
/// in addition to the buffered capture.
pub type LiveStream = Arc<Mutex<dyn Write + Send>>;

/// Environment overlay applied on top of the inherited environment.
/// `Some` overrides a variable, `None` unsets it; untouched variables are
/// inherited unchanged.
pub type EnvironmentOverlay = HashMap<String, Option<String>>;

/// Sink notified when timeout escalation signals the child. Any
/// `FnMut(&str) + Send` closure qualifies.
pub trait Logger: Send {
    fn warn(&mut self, message: &str);
}

impl<F> Logger for F
where
    F: FnMut(&str) + Send,
{
    fn warn(&mut self, message: &str) {
        self(message)
    }
}

/// What to execute: a single string handed to `/bin/sh -c` (pipes,
/// redirection, and operators work), or an argv list executed directly,
/// bypassing shell interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Shell(line) => f.write_str(line),
            CommandLine::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        CommandLine::Shell(line.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(line: String) -> Self {
        CommandLine::Shell(line)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(argv: Vec<String>) -> Self {
        CommandLine::Argv(argv)
    }
}

impl From<Vec<&str>> for CommandLine {
    fn from(argv: Vec<&str>) -> Self {
        CommandLine::Argv(argv.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for CommandLine {
    fn from(argv: &[&str]) -> Self {
        CommandLine::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

/// User to run as: a name resolved against the identity database at spawn
/// time, or a numeric uid used verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSpec {
    Name(String),
    Id(u32),
}

impl From<&str> for UserSpec {
    fn from(name: &str) -> Self {
        UserSpec::Name(name.to_string())
    }
}

impl From<String> for UserSpec {
    fn from(name: String) -> Self {
        UserSpec::Name(name)
    }
}

impl From<u32> for UserSpec {
    fn from(uid: u32) -> Self {
        UserSpec::Id(uid)
    }
}

/// Group to run as, by name or numeric gid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupSpec {
    Name(String),
    Id(u32),
}

impl From<&str> for GroupSpec {
    fn from(name: &str) -> Self {
        GroupSpec::Name(name.to_string())
    }
}

impl From<String> for GroupSpec {
    fn from(name: String) -> Self {
        GroupSpec::Name(name)
    }
}

impl From<u32> for GroupSpec {
    fn from(gid: u32) -> Self {
        GroupSpec::Id(gid)
    }
}

/// Umask input: an integer mode used as-is (masked to 0o7777), or a numeric
/// string parsed as octal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UmaskValue {
    Mode(u32),
    Text(String),
}

impl From<u32> for UmaskValue {
    fn from(mode: u32) -> Self {
        UmaskValue::Mode(mode)
    }
}

impl From<&str> for UmaskValue {
    fn from(text: &str) -> Self {
        UmaskValue::Text(text.to_string())
    }
}

impl From<String> for UmaskValue {
    fn from(text: String) -> Self {
        UmaskValue::Text(text)
    }
}

fn normalize_umask(value: UmaskValue) -> Result<u32> {
    match value {
        UmaskValue::Mode(mode) => Ok(mode & 0o7777),
        UmaskValue::Text(text) => u32::from_str_radix(text.trim(), 8)
            .map(|mode| mode & 0o7777)
            .map_err(|_| Error::invalid_option_value("umask", "an octal mode string")),
    }
}

/// Loosely-typed option value for the string-keyed configuration surface.
/// Each known key accepts the shapes its accessor accepts.
pub enum OptionValue {
    Str(String),
    Int(i64),
    Codes(Vec<i32>),
    Bytes(Vec<u8>),
    Env(Option<EnvironmentOverlay>),
    Stream(LiveStream),
    Logger(Box<dyn Logger>),
    Null,
}

/// Specification of one external command: what to run and under which
/// working directory, identity, environment, timeout, and stream wiring.
///
/// Accessors may mutate the configuration freely between runs. `run_command`
/// takes `&mut self`, so a second concurrent run on one instance is rejected
/// at compile time; sequential reruns are fine.
pub struct ShellOut {
    pub(crate) command: CommandLine,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) user: Option<UserSpec>,
    pub(crate) group: Option<GroupSpec>,
    pub(crate) domain: Option<String>,
    pub(crate) with_logon: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) umask: Option<u32>,
    pub(crate) timeout: Duration,
    pub(crate) valid_exit_codes: Vec<i32>,
    pub(crate) environment: EnvironmentOverlay,
    pub(crate) input: Option<Vec<u8>>,
    pub(crate) live_stdout: Option<LiveStream>,
    pub(crate) live_stderr: Option<LiveStream>,
    pub(crate) logger: Option<Box<dyn Logger>>,
}

impl fmt::Debug for ShellOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellOut")
            .field("command", &self.command)
            .field("cwd", &self.cwd)
            .field("user", &self.user)
            .field("group", &self.group)
            .field("umask", &self.umask)
            .field("timeout", &self.timeout)
            .field("valid_exit_codes", &self.valid_exit_codes)
            .field("environment", &self.environment)
            .field("input_len", &self.input.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

impl ShellOut {
    /// Builds a configuration with the defaults: 600 s timeout, acceptable exit
    /// codes `{0}`, empty environment overlay, no input, no live sinks.
    pub fn new(command: impl Into<CommandLine>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            user: None,
            group: None,
            domain: None,
            with_logon: None,
            password: None,
            umask: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            valid_exit_codes: vec![0],
            environment: EnvironmentOverlay::new(),
            input: None,
            live_stdout: None,
            live_stderr: None,
            logger: None,
        }
    }

    /// Builds a configuration and applies a list of string-keyed options through the
    /// validated [`set_option`](Self::set_option) path.
    pub fn with_options<K, I>(command: impl Into<CommandLine>, options: I) -> Result<Self>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, OptionValue)>,
    {
        let mut cmd = Self::new(command);
        for (key, value) in options {
            cmd.set_option(key.as_ref(), value)?;
        }
        Ok(cmd)
    }

    /// Applies one option from the enumerated set. Unknown keys, and known
    /// keys given a value of the wrong shape, fail with
    /// `InvalidCommandOption` naming the key.
    pub fn set_option(&mut self, key: &str, value: OptionValue) -> Result<&mut Self> {
        match (key, value) {
            ("cwd", OptionValue::Str(dir)) => self.cwd = Some(PathBuf::from(dir)),
            ("user", OptionValue::Str(name)) => self.user = Some(UserSpec::Name(name)),
            ("user", OptionValue::Int(uid)) => self.user = Some(UserSpec::Id(uid as u32)),
            ("group", OptionValue::Str(name)) => self.group = Some(GroupSpec::Name(name)),
            ("group", OptionValue::Int(gid)) => self.group = Some(GroupSpec::Id(gid as u32)),
            ("domain", OptionValue::Str(domain)) => self.domain = Some(domain),
            ("with_logon", OptionValue::Str(logon)) => self.with_logon = Some(logon),
            ("password", OptionValue::Str(password)) => self.password = Some(password),
            ("umask", OptionValue::Int(mode)) => {
                self.umask = Some(normalize_umask(UmaskValue::Mode(mode as u32))?)
            }
            ("umask", OptionValue::Str(text)) => {
                self.umask = Some(normalize_umask(UmaskValue::Text(text))?)
            }
            ("timeout", OptionValue::Int(secs)) if secs >= 0 => {
                self.timeout = Duration::from_secs(secs as u64)
            }
            ("environment" | "env", OptionValue::Env(overlay)) => {
                self.environment = overlay.unwrap_or_default()
            }
            ("environment" | "env", OptionValue::Null) => {
                self.environment = EnvironmentOverlay::new()
            }
            ("returns", OptionValue::Int(code)) => self.valid_exit_codes = vec![code as i32],
            ("returns", OptionValue::Codes(codes)) => self.valid_exit_codes = codes,
            ("live_stream", OptionValue::Stream(sink)) => {
                self.set_live_stream(sink);
            }
            ("live_stdout", OptionValue::Stream(sink)) => self.live_stdout = Some(sink),
            ("live_stdout", OptionValue::Null) => self.live_stdout = None,
            ("live_stderr", OptionValue::Stream(sink)) => self.live_stderr = Some(sink),
            ("live_stderr", OptionValue::Null) => self.live_stderr = None,
            ("input", OptionValue::Bytes(payload)) => self.input = Some(payload),
            ("input", OptionValue::Str(payload)) => self.input = Some(payload.into_bytes()),
            ("input", OptionValue::Null) => self.input = None,
            ("logger", OptionValue::Logger(logger)) => self.logger = Some(logger),
            (
                key @ ("cwd" | "user" | "group" | "domain" | "with_logon" | "password"
                | "umask" | "timeout" | "environment" | "env" | "returns" | "live_stream"
                | "live_stdout" | "live_stderr" | "input" | "logger"),
                _,
            ) => return Err(Error::invalid_option_value(key, "a value of a supported shape")),
            (key, _) => return Err(Error::invalid_option(key)),
        }
        Ok(self)
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn set_cwd(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn set_user(&mut self, user: impl Into<UserSpec>) -> &mut Self {
        self.user = Some(user.into());
        self
    }

    pub fn user(&self) -> Option<&UserSpec> {
        self.user.as_ref()
    }

    /// Numeric uid the child will run as: a configured id verbatim, or a
    /// configured name resolved against the identity database.
    pub fn uid(&self) -> Result<Option<u32>> {
        match &self.user {
            None => Ok(None),
            Some(UserSpec::Id(uid)) => Ok(Some(*uid)),
            Some(UserSpec::Name(name)) => {
                let entry = nix::unistd::User::from_name(name)
                    .map_err(io::Error::from)?
                    .ok_or_else(|| {
                        Error::Io(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("unknown user: {name}"),
                        ))
                    })?;
                Ok(Some(entry.uid.as_raw()))
            }
        }
    }

    pub fn set_group(&mut self, group: impl Into<GroupSpec>) -> &mut Self {
        self.group = Some(group.into());
        self
    }

    pub fn group(&self) -> Option<&GroupSpec> {
        self.group.as_ref()
    }

    /// Numeric gid the child will run as, resolving names like
    /// [`uid`](Self::uid) does.
    pub fn gid(&self) -> Result<Option<u32>> {
        match &self.group {
            None => Ok(None),
            Some(GroupSpec::Id(gid)) => Ok(Some(*gid)),
            Some(GroupSpec::Name(name)) => {
                let entry = nix::unistd::Group::from_name(name)
                    .map_err(io::Error::from)?
                    .ok_or_else(|| {
                        Error::Io(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("unknown group: {name}"),
                        ))
                    })?;
                Ok(Some(entry.gid.as_raw()))
            }
        }
    }

    pub fn set_domain(&mut self, domain: impl Into<String>) -> &mut Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn set_with_logon(&mut self, logon: impl Into<String>) -> &mut Self {
        self.with_logon = Some(logon.into());
        self
    }

    pub fn with_logon(&self) -> Option<&str> {
        self.with_logon.as_deref()
    }

    pub fn set_password(&mut self, password: impl Into<String>) -> &mut Self {
        self.password = Some(password.into());
        self
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Sets the umask. Integer values are taken as the mode they denote
    /// (masked to 0o7777); strings are parsed as octal, so `"7777"` becomes
    /// 0o7777.
    pub fn set_umask(&mut self, umask: impl Into<UmaskValue>) -> Result<&mut Self> {
        self.umask = Some(normalize_umask(umask.into())?);
        Ok(self)
    }

    pub fn umask(&self) -> Option<u32> {
        self.umask
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_valid_exit_codes(&mut self, codes: Vec<i32>) -> &mut Self {
        self.valid_exit_codes = codes;
        self
    }

    pub fn valid_exit_codes(&self) -> &[i32] {
        &self.valid_exit_codes
    }

    /// Replaces the environment overlay wholesale; `None` clears it so the
    /// child sees exactly the inherited environment.
    pub fn set_environment(&mut self, overlay: Option<EnvironmentOverlay>) -> &mut Self {
        self.environment = overlay.unwrap_or_default();
        self
    }

    /// Alias for [`set_environment`](Self::set_environment).
    pub fn set_env(&mut self, overlay: Option<EnvironmentOverlay>) -> &mut Self {
        self.set_environment(overlay)
    }

    pub fn environment(&self) -> &EnvironmentOverlay {
        &self.environment
    }

    pub fn set_input(&mut self, input: impl Into<Vec<u8>>) -> &mut Self {
        self.input = Some(input.into());
        self
    }

    pub fn input(&self) -> Option<&[u8]> {
        self.input.as_deref()
    }

    /// Attaches one sink to both live stdout and live stderr.
    pub fn set_live_stream(&mut self, sink: LiveStream) -> &mut Self {
        self.live_stdout = Some(sink.clone());
        self.live_stderr = Some(sink);
        self
    }

    /// The combined sink, as long as both streams still share it. Setting
    /// either side individually detaches the pair.
    pub fn live_stream(&self) -> Option<LiveStream> {
        match (&self.live_stdout, &self.live_stderr) {
            (Some(out), Some(err)) if Arc::ptr_eq(out, err) => Some(out.clone()),
            _ => None,
        }
    }

    pub fn set_live_stdout(&mut self, sink: Option<LiveStream>) -> &mut Self {
        self.live_stdout = sink;
        self
    }

    pub fn live_stdout(&self) -> Option<LiveStream> {
        self.live_stdout.clone()
    }

    pub fn set_live_stderr(&mut self, sink: Option<LiveStream>) -> &mut Self {
        self.live_stderr = sink;
        self
    }

    pub fn live_stderr(&self) -> Option<LiveStream> {
        self.live_stderr.clone()
    }

    pub fn set_logger(&mut self, logger: Box<dyn Logger>) -> &mut Self {
        self.logger = Some(logger);
        self
    }

    /// Spawns the command and services its streams until it exits or the
    /// timeout escalation has run its course.
    ///
    /// Returns the result without judging the exit status; call
    /// [`CommandResult::check_error`] to validate it. On timeout the error
    /// is `CommandTimeout` with the partial result inside; on a lookup
    /// failure it is `CommandNotFound`. No path leaves the child unreaped.
    pub fn run_command(&mut self) -> Result<CommandResult> {
        debug!("running command: {}", self.command);
        let timeout = self.timeout;

        let mut child = process::launch(self)?;
        let deadline = child.started() + timeout;
        let (stdin, stdout, stderr) = child.take_pipes();
        let mut pump = IoPump::new(
            stdin,
            stdout,
            stderr,
            self.input.clone(),
            self.live_stdout.clone(),
            self.live_stderr.clone(),
        )?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            let now = Instant::now();
            if now >= deadline {
                return self.escalate(child, pump, timeout);
            }
            let step = IO_POLL_INTERVAL.min(deadline - now);
            if pump.finished() {
                thread::sleep(step);
            } else {
                pump.service(step)?;
            }
        };

        drain_after_exit(&mut pump)?;
        Ok(self.build_result(pump, status, child.started()))
    }

    /// Deadline expired: TERM the group, give it a grace interval while
    /// still capturing output, KILL whatever survives, then report the run
    /// as a timeout with the partial result attached.
    fn escalate(
        &mut self,
        mut child: RunningProcess,
        mut pump: IoPump,
        timeout: Duration,
    ) -> Result<CommandResult> {
        pump.close_stdin();
        let mut signaler = PgidSignaler::new(child.pgid(), child.pid());
        let logger = &mut self.logger;
        let status = Escalation::default().run(
            &mut signaler,
            &mut |message| {
                warn!("{message}");
                if let Some(logger) = logger.as_mut() {
                    logger.warn(message);
                }
            },
            |wait| {
                if pump.finished() {
                    thread::sleep(wait);
                } else {
                    // Stream errors take a back seat once the run is
                    // already a timeout; close-outs still drain.
                    let _ = pump.service(wait);
                }
                child.try_wait()
            },
        )?;
        let _ = drain_after_exit(&mut pump);
        let result = self.build_result(pump, status, child.started());
        Err(Error::CommandTimeout {
            timeout,
            result: Box::new(result),
        })
    }

    fn build_result(
        &self,
        pump: IoPump,
        status: std::process::ExitStatus,
        started: Instant,
    ) -> CommandResult {
        debug!("command {} exited with {:?}", self.command, status);
        let (stdout, stderr) = pump.into_buffers();
        CommandResult::new(
            self.command.to_string(),
            stdout,
            stderr,
            status,
            started.elapsed(),
            self.valid_exit_codes.clone(),
        )
    }
}

/// The child is gone; EOF normally follows at once, but a forked descendant
/// may keep the pipe ends open indefinitely, so stop after the first pass
/// that moves nothing instead of waiting for EOF.
fn drain_after_exit(pump: &mut IoPump) -> Result<()> {
    while !pump.finished() {
        if pump.service(DRAIN_INTERVAL)? == 0 {
            break;
        }
    }
    Ok(())
}
