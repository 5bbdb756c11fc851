//! Readiness-multiplexed I/O between the parent and the child's streams
//!
//! One poll wait covers every still-open endpoint, so backpressure on one
//! stream can never stall progress on another. An endpoint that reaches
//! EOF (or that the child closes) leaves the wait set permanently and is
//! never polled again.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::command::LiveStream;
use crate::errors::{Error, Result};

const READ_CHUNK: usize = 4096;

pub(crate) trait ReadFd: Read + AsFd + Send {}
impl<T: Read + AsFd + Send> ReadFd for T {}

pub(crate) trait WriteFd: Write + AsFd + Send {}
impl<T: Write + AsFd + Send> WriteFd for T {}

/// Moves bytes between the parent and the three child streams. Captured
/// output accumulates in unbounded per-stream buffers and is teed to the
/// live sinks as it arrives; the input payload is written as the child
/// drains it and stdin is closed the moment the payload is fully delivered.
pub(crate) struct IoPump {
    stdin: Option<Box<dyn WriteFd>>,
    input: Vec<u8>,
    written: usize,
    stdout: Option<Box<dyn ReadFd>>,
    stderr: Option<Box<dyn ReadFd>>,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    live_stdout: Option<LiveStream>,
    live_stderr: Option<LiveStream>,
}

impl IoPump {
    pub fn new(
        stdin: Option<impl Write + AsFd + Send + 'static>,
        stdout: Option<impl Read + AsFd + Send + 'static>,
        stderr: Option<impl Read + AsFd + Send + 'static>,
        input: Option<Vec<u8>>,
        live_stdout: Option<LiveStream>,
        live_stderr: Option<LiveStream>,
    ) -> Result<Self> {
        let input = input.unwrap_or_default();
        // With nothing to deliver the child must see EOF right away, so
        // the write end is dropped before the first poll round.
        let stdin: Option<Box<dyn WriteFd>> = match stdin {
            Some(_) if input.is_empty() => None,
            Some(fd) => {
                set_nonblocking(&fd)?;
                Some(Box::new(fd))
            }
            None => None,
        };
        let stdout: Option<Box<dyn ReadFd>> = match stdout {
            Some(fd) => {
                set_nonblocking(&fd)?;
                Some(Box::new(fd))
            }
            None => None,
        };
        let stderr: Option<Box<dyn ReadFd>> = match stderr {
            Some(fd) => {
                set_nonblocking(&fd)?;
                Some(Box::new(fd))
            }
            None => None,
        };
        Ok(Self {
            stdin,
            input,
            written: 0,
            stdout,
            stderr,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            live_stdout,
            live_stderr,
        })
    }

    /// True once every endpoint has closed.
    pub fn finished(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }

    /// Drops the write end regardless of how much payload was delivered.
    /// Used when escalation starts; feeding a dying process is pointless.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    pub fn into_buffers(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout_buf, self.stderr_buf)
    }

    /// One multiplexed round: waits up to `timeout` for any open endpoint,
    /// then moves at most one chunk per ready endpoint (bounded transfers
    /// keep one flooding stream from starving the others). Returns the
    /// number of bytes moved; zero means the wait timed out or only
    /// endpoint closures happened.
    pub fn service(&mut self, timeout: Duration) -> Result<usize> {
        let (stdin_ready, stdout_ready, stderr_ready) = self.wait_ready(timeout)?;
        let mut moved = 0;
        if stdout_ready {
            moved += Self::drain(
                &mut self.stdout,
                &mut self.stdout_buf,
                self.live_stdout.as_ref(),
            )?;
        }
        if stderr_ready {
            moved += Self::drain(
                &mut self.stderr,
                &mut self.stderr_buf,
                self.live_stderr.as_ref(),
            )?;
        }
        if stdin_ready {
            moved += self.feed_stdin()?;
        }
        Ok(moved)
    }

    fn wait_ready(&self, timeout: Duration) -> Result<(bool, bool, bool)> {
        let mut fds = Vec::with_capacity(3);
        let mut tags = Vec::with_capacity(3);
        if let Some(fd) = &self.stdin {
            fds.push(PollFd::new(fd.as_fd(), PollFlags::POLLOUT));
            tags.push(0usize);
        }
        if let Some(fd) = &self.stdout {
            fds.push(PollFd::new(fd.as_fd(), PollFlags::POLLIN));
            tags.push(1);
        }
        if let Some(fd) = &self.stderr {
            fds.push(PollFd::new(fd.as_fd(), PollFlags::POLLIN));
            tags.push(2);
        }
        if fds.is_empty() {
            return Ok((false, false, false));
        }

        let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => return Ok((false, false, false)),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok((false, false, false)),
            Err(err) => return Err(Error::Io(io::Error::from(err))),
        }

        let mut ready = [false; 3];
        for (fd, tag) in fds.iter().zip(&tags) {
            // POLLHUP/POLLERR also mean "act now": the read will return
            // EOF and the write will surface the pipe error.
            if fd.revents().is_some_and(|revents| !revents.is_empty()) {
                ready[*tag] = true;
            }
        }
        Ok((ready[0], ready[1], ready[2]))
    }

    fn drain(
        slot: &mut Option<Box<dyn ReadFd>>,
        buf: &mut Vec<u8>,
        live: Option<&LiveStream>,
    ) -> Result<usize> {
        let Some(stream) = slot.as_mut() else {
            return Ok(0);
        };
        let mut chunk = [0u8; READ_CHUNK];
        match stream.read(&mut chunk) {
            // EOF: the endpoint leaves the wait set for good.
            Ok(0) => {
                *slot = None;
                Ok(0)
            }
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Some(sink) = live {
                    let mut sink = sink.lock().unwrap_or_else(|poison| poison.into_inner());
                    sink.write_all(&chunk[..n])?;
                }
                Ok(n)
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(err) => {
                *slot = None;
                Err(err.into())
            }
        }
    }

    fn feed_stdin(&mut self) -> Result<usize> {
        let Some(writer) = self.stdin.as_mut() else {
            return Ok(0);
        };
        let pending = &self.input[self.written..];
        match writer.write(pending) {
            Ok(n) => {
                self.written += n;
                if self.written == self.input.len() {
                    // Fully delivered: close so the child sees EOF.
                    self.stdin = None;
                }
                Ok(n)
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                // The child vanished mid-payload. A fully delivered payload
                // already closed this endpoint, so that case never lands
                // here and is treated as success by construction.
                self.stdin = None;
                Err(Error::BrokenPipe(err))
            }
            Err(err) => {
                self.stdin = None;
                Err(err.into())
            }
        }
    }
}

fn set_nonblocking(fd: &impl AsFd) -> Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}
