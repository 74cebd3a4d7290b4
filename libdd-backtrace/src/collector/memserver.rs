// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(target_os = "linux")]

//! The crashed process's half of the memory server.
//!
//! While the backtracer runs, the crash handler answers its memory requests on a socketpair.
//! Memory is copied with `process_vm_readv` on our own pid, so the kernel validates every range:
//! asking for unmapped memory yields an error response rather than a second fault.

use super::crash_scope::CrashScope;
use crate::shared::constants::DD_BACKTRACE_MEMSERVER_MAX_REQUEST;
use crate::shared::memserver::{MemserverRequest, MemserverResponse, REQUEST_SIZE};
use crate::unix_utils::{read_full, write_all};
use std::os::fd::RawFd;

/// Both ends of the memory server socketpair. The server end stays with the crashed process;
/// the client end is handed to the backtracer and closed here once it has been spawned.
#[derive(Debug)]
pub struct MemserverChannel {
    server: RawFd,
    client: RawFd,
}

impl MemserverChannel {
    /// Both descriptors are close-on-exec: the backtracer receives the client end only through
    /// an explicit `dup2`, and never inherits the server end, so the server sees end of file as
    /// soon as the backtracer exits.
    pub fn open(_scope: &CrashScope) -> Option<Self> {
        let mut fds = [-1; 2];
        // SAFETY: `fds` has room for the two descriptors.
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        (rc == 0).then_some(Self {
            server: fds[0],
            client: fds[1],
        })
    }

    pub fn server_fd(&self) -> RawFd {
        self.server
    }

    /// The client end, or -1 once it has been closed.
    pub fn client_fd(&self) -> RawFd {
        self.client
    }

    pub fn close_client(&mut self) {
        if self.client >= 0 {
            // SAFETY: we own the descriptor.
            unsafe { libc::close(self.client) };
            self.client = -1;
        }
    }
}

impl Drop for MemserverChannel {
    fn drop(&mut self) {
        self.close_client();
        // SAFETY: we own the descriptor.
        unsafe { libc::close(self.server) };
    }
}

/// Answers memory requests until the peer closes the connection.
pub struct MemoryServer {
    fd: RawFd,
}

impl MemoryServer {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Serves until end of file, a short request frame, or a write error.
    pub fn serve(&self, scope: &CrashScope) {
        let mut frame = [0u8; REQUEST_SIZE];
        loop {
            match read_full(self.fd, &mut frame) {
                Ok(REQUEST_SIZE) => (),
                _ => return,
            }
            let request = MemserverRequest::from_bytes(&frame);
            if !self.answer(scope, request) {
                return;
            }
        }
    }

    fn answer(&self, _scope: &CrashScope, request: MemserverRequest) -> bool {
        let mut data = [0u8; DD_BACKTRACE_MEMSERVER_MAX_REQUEST];
        let len = if request.len > DD_BACKTRACE_MEMSERVER_MAX_REQUEST as u64 {
            -(libc::EINVAL as i64)
        } else {
            read_own_memory(request.addr, &mut data[..request.len as usize])
        };
        let response = MemserverResponse {
            addr: request.addr,
            len,
        };
        if write_all(self.fd, &response.to_bytes()).is_err() {
            return false;
        }
        len <= 0 || write_all(self.fd, &data[..len as usize]).is_ok()
    }
}

/// Remote ranges are split on 4 KiB boundaries, which are page boundaries for every page size we
/// support, so a range running into unmapped memory still yields its readable prefix.
const SPLIT_GRANULE: u64 = 4096;
const MAX_REMOTE_IOVECS: usize = DD_BACKTRACE_MEMSERVER_MAX_REQUEST / SPLIT_GRANULE as usize + 1;

/// Copies memory at `addr` into `out`. Returns the number of bytes copied, which is short when the
/// range runs into unmapped memory, or `-errno` when nothing at all could be read.
fn read_own_memory(addr: u64, out: &mut [u8]) -> i64 {
    if out.is_empty() {
        return 0;
    }
    let local = libc::iovec {
        iov_base: out.as_mut_ptr().cast(),
        iov_len: out.len(),
    };
    let mut remote = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; MAX_REMOTE_IOVECS];
    let mut count = 0;
    let mut cursor = addr;
    let end = addr.saturating_add(out.len() as u64);
    while cursor < end && count < remote.len() {
        let boundary = (cursor / SPLIT_GRANULE + 1).saturating_mul(SPLIT_GRANULE);
        let chunk_end = boundary.min(end);
        remote[count] = libc::iovec {
            iov_base: cursor as usize as *mut libc::c_void,
            iov_len: (chunk_end - cursor) as usize,
        };
        count += 1;
        cursor = chunk_end;
    }
    // SAFETY: `local` describes a writable buffer of our own; the kernel checks `remote`.
    let copied = unsafe {
        libc::process_vm_readv(
            libc::getpid(),
            &local,
            1,
            remote.as_ptr(),
            count as libc::c_ulong,
            0,
        )
    };
    if copied < 0 {
        -(errno::errno().0 as i64)
    } else if copied == 0 {
        -(libc::EFAULT as i64)
    } else {
        copied as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::memserver::{MemserverClient, MemserverError};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn with_server<T>(f: impl FnOnce(&mut MemserverClient<UnixStream>) -> T) -> T {
        let (client, server) = UnixStream::pair().unwrap();
        let worker = std::thread::spawn(move || {
            // SAFETY: the responder only uses async-signal-safe calls.
            let scope = unsafe { CrashScope::enter() };
            MemoryServer::new(server.as_raw_fd()).serve(&scope);
        });
        let mut client = MemserverClient::new(client);
        let result = f(&mut client);
        drop(client);
        worker.join().unwrap();
        result
    }

    #[test]
    fn test_reads_mapped_memory() {
        let secret: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let addr = secret.as_ptr() as u64;
        let data = with_server(|client| client.read(addr, secret.len()).unwrap());
        assert_eq!(data, secret);
    }

    #[test]
    fn test_unmapped_memory_is_an_error() {
        let result = with_server(|client| client.fetch(0x10, 64));
        match result {
            Err(MemserverError::Remote { errno, .. }) => assert_eq!(errno, libc::EFAULT),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_partial_range_returns_prefix() {
        let page = page_size::get();
        // SAFETY: anonymous mapping, unmapped again at the end of the test.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                2 * page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED);
        // SAFETY: the first page is mapped read/write.
        unsafe { std::ptr::write_bytes(base.cast::<u8>(), 0x5a, page) };
        // SAFETY: the second page belongs to our mapping.
        assert_eq!(unsafe { libc::munmap(base.cast::<u8>().add(page).cast(), page) }, 0);

        let start = base as u64 + page as u64 - 16;
        let data = with_server(|client| client.fetch(start, 64).unwrap());
        assert_eq!(data, vec![0x5a; 16]);

        // SAFETY: unmapping the page mapped above.
        unsafe { libc::munmap(base, page) };
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let buffer = vec![0u8; DD_BACKTRACE_MEMSERVER_MAX_REQUEST + 1];
        let addr = buffer.as_ptr() as u64;
        let result = with_server(|client| {
            let rejected = client.fetch(addr, DD_BACKTRACE_MEMSERVER_MAX_REQUEST + 1);
            // The server keeps going after a bad request.
            let ok = client.fetch(addr, 8).unwrap();
            (rejected, ok)
        });
        assert!(matches!(
            result.0,
            Err(MemserverError::Remote { errno, .. }) if errno == libc::EINVAL
        ));
        assert_eq!(result.1, vec![0u8; 8]);
    }

    #[test]
    fn test_channel_eof_after_client_close() {
        // SAFETY: test stands in for the signal handler.
        let scope = unsafe { CrashScope::enter() };
        let mut channel = MemserverChannel::open(&scope).unwrap();
        assert!(channel.client_fd() >= 0);
        channel.close_client();
        assert_eq!(channel.client_fd(), -1);
        // With no client left, serving ends immediately.
        MemoryServer::new(channel.server_fd()).serve(&scope);
    }
}
