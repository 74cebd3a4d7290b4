// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

// Everything in this file may be called from a signal handler: only raw `read`, `write`,
// `waitpid` and `_exit` are used, and nothing allocates.

use super::errors::ReapError;
use libc::{_exit, EXIT_FAILURE};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::RawFd;

/// Blocks until `pid` terminates, retrying when interrupted by a signal.
/// Returns true iff the child exited normally with status 0.
// Note: `waitpid()` is characterized as async-signal safe by POSIX.
pub fn reap_child_blocking(pid: Pid) -> Result<bool, ReapError> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code == 0),
            Ok(WaitStatus::Signaled(..)) => return Ok(false),
            // Stopped or continued, keep waiting for the real exit.
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ReapError::WaitError(e)),
        }
    }
}

/// Kills the program without raising an abort or calling at_exit
pub fn terminate() -> ! {
    // Safety: No preconditions
    unsafe { _exit(EXIT_FAILURE) }
}

/// Writes all of `bytes` to `fd` with raw `write(2)` calls.
pub fn write_all(fd: RawFd, mut bytes: &[u8]) -> Result<(), Errno> {
    while !bytes.is_empty() {
        // SAFETY: the pointer and length come from a valid slice.
        let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        match written {
            n if n > 0 => bytes = &bytes[n as usize..],
            0 => return Err(Errno::EIO),
            _ => match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => continue,
                errno => return Err(errno),
            },
        }
    }
    Ok(())
}

/// Reads from `fd` until `buf` is full or end of file. Returns the number of bytes read, which is
/// short only at end of file.
pub fn read_full(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let mut filled = 0;
    while filled < buf.len() {
        let rest = &mut buf[filled..];
        // SAFETY: the pointer and length come from a valid mutable slice.
        let read = unsafe { libc::read(fd, rest.as_mut_ptr().cast(), rest.len()) };
        match read {
            0 => break,
            n if n > 0 => filled += n as usize,
            _ => match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => continue,
                errno => return Err(errno),
            },
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::process::Command;

    #[test]
    fn test_reap_exit_codes() {
        let child = Command::new("/bin/sh").args(["-c", "exit 0"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        assert_eq!(reap_child_blocking(pid), Ok(true));

        let child = Command::new("/bin/sh").args(["-c", "exit 3"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        assert_eq!(reap_child_blocking(pid), Ok(false));
    }

    #[test]
    fn test_reap_nonexistent_child() {
        assert_eq!(
            reap_child_blocking(Pid::from_raw(999_999)),
            Err(ReapError::WaitError(Errno::ECHILD))
        );
    }

    #[test]
    fn test_raw_io_over_socketpair() {
        let (a, b) = UnixStream::pair().unwrap();
        write_all(a.as_raw_fd(), b"hello").unwrap();
        drop(a);
        let mut buf = [0u8; 16];
        assert_eq!(read_full(b.as_raw_fd(), &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(read_full(b.as_raw_fd(), &mut buf), Ok(0));
    }

    #[test]
    fn test_write_to_bad_fd() {
        assert_eq!(write_all(-1, b"x"), Err(Errno::EBADF));
    }
}
