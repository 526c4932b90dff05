//! Session operations abstraction
//!
//! This module provides the session operations pattern that keeps the HTTP/2
//! engine independent of the transport it runs on.
//!
//! The connection handler never blocks inside a read while holding the frame
//! emission lock: it waits for readability with [`poll_fd`] first, and only
//! then takes the lock to pull bytes through [`SessionOps::read`].

use super::{Error, Result};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Session operations trait
///
/// This trait defines the operations that can be performed on a session.
pub trait SessionOps {
    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush buffered data to the peer
    fn flush(&mut self) -> Result<()>;

    /// Close the session
    fn close(&mut self) -> Result<()>;

    /// Write the whole buffer, looping over short writes
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..])?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            written += n;
        }
        self.flush()
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Wait until a raw file descriptor is ready for `events`
///
/// A `None` timeout waits forever. Hang-ups and errors count as ready so the
/// caller's next read observes them.
pub fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1); // -1 = infinite

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::Io(err));
    }

    Ok(result > 0)
}
