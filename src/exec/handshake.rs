//! Pipes and the byte protocol between supervisor and sandbox child.
//!
//! Every pipe is created close-on-exec so concurrent launches never leak
//! each other's descriptors into a payload. The child reports on a status
//! pipe: `R` when the sandbox side of setup is done, `E` followed by a
//! message on failure, and nothing at all when execve succeeds (the pipe
//! closes on exec).

use crate::config::types::{JailError, Result};
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Supervisor -> child: continue with the next setup round
pub const GO: u8 = b'G';
/// Child -> supervisor: sandbox-side setup up to the limits phase is done
pub const READY: u8 = b'R';
/// Child -> supervisor: setup failed, message follows
pub const FAILED: u8 = b'E';

#[derive(Debug)]
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl Pipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds has room for the two descriptors pipe2 returns.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(JailError::Process(format!(
                "pipe2 failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: both descriptors were just created and are owned by nobody else.
        Ok(unsafe {
            Pipe {
                read: OwnedFd::from_raw_fd(fds[0]),
                write: OwnedFd::from_raw_fd(fds[1]),
            }
        })
    }
}

/// Write all of `buf`, retrying on EINTR. Used in the child, so no allocation.
pub fn write_raw(fd: RawFd, mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        // SAFETY: buf is a valid slice for its length.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return false;
        }
        buf = &buf[n as usize..];
    }
    true
}

/// Read a single byte; `None` on EOF or error.
pub fn read_byte_raw(fd: RawFd) -> Option<u8> {
    let mut byte = 0u8;
    loop {
        // SAFETY: reading one byte into a stack variable.
        let n = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        match n {
            1 => return Some(byte),
            0 => return None,
            _ if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted => {
                continue
            }
            _ => return None,
        }
    }
}

/// Wait up to `timeout` for `fd` to become readable. Hang-up counts as
/// readable so a closed pipe is reported by the next read.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool> {
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: pfd is a single valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc >= 0 {
            return Ok(rc > 0);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(JailError::Io(err));
        }
    }
}

/// What the child said on the status pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildReport {
    Ready,
    /// Pipe closed without a message
    Closed,
    Failed(String),
}

pub fn read_report(status: &mut File) -> Result<ChildReport> {
    let mut byte = [0u8; 1];
    let n = loop {
        match status.read(&mut byte) {
            Ok(n) => break n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(JailError::Io(e)),
        }
    };
    if n == 0 {
        return Ok(ChildReport::Closed);
    }

    match byte[0] {
        READY => Ok(ChildReport::Ready),
        FAILED => {
            let mut message = Vec::new();
            status.read_to_end(&mut message)?;
            Ok(ChildReport::Failed(
                String::from_utf8_lossy(&message).into_owned(),
            ))
        }
        other => Ok(ChildReport::Failed(format!(
            "unexpected handshake byte {:#04x}",
            other
        ))),
    }
}
