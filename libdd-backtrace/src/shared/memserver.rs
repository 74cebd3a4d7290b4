// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire format of the memory server, and the client half used by backtracers.
//!
//! The backtracer writes a [`MemserverRequest`] and the crashed process answers with a
//! [`MemserverResponse`]. A non-negative `len` is followed by exactly that many bytes of memory;
//! a negative `len` is `-errno`. Both frames are native-endian `u64` pairs.

use super::constants::{DD_BACKTRACE_MEMSERVER_FD, DD_BACKTRACE_MEMSERVER_MAX_REQUEST};
use std::io::{Read, Write};
use std::mem::size_of;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemserverRequest {
    pub addr: u64,
    pub len: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemserverResponse {
    pub addr: u64,
    pub len: i64,
}

pub const REQUEST_SIZE: usize = size_of::<MemserverRequest>();
pub const RESPONSE_SIZE: usize = size_of::<MemserverResponse>();

fn split(bytes: &[u8; 16]) -> ([u8; 8], [u8; 8]) {
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&bytes[..8]);
    second.copy_from_slice(&bytes[8..]);
    (first, second)
}

fn join(first: [u8; 8], second: [u8; 8]) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&first);
    bytes[8..].copy_from_slice(&second);
    bytes
}

impl MemserverRequest {
    pub fn to_bytes(&self) -> [u8; REQUEST_SIZE] {
        join(self.addr.to_ne_bytes(), self.len.to_ne_bytes())
    }

    pub fn from_bytes(bytes: &[u8; REQUEST_SIZE]) -> Self {
        let (addr, len) = split(bytes);
        Self {
            addr: u64::from_ne_bytes(addr),
            len: u64::from_ne_bytes(len),
        }
    }
}

impl MemserverResponse {
    pub fn to_bytes(&self) -> [u8; RESPONSE_SIZE] {
        join(self.addr.to_ne_bytes(), self.len.to_ne_bytes())
    }

    pub fn from_bytes(bytes: &[u8; RESPONSE_SIZE]) -> Self {
        let (addr, len) = split(bytes);
        Self {
            addr: u64::from_ne_bytes(addr),
            len: i64::from_ne_bytes(len),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemserverError {
    #[error("memory server I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("memory server answered for {got:#x}, expected {expected:#x}")]
    AddressMismatch { expected: u64, got: u64 },
    #[error("memory server sent {got} bytes for a {requested} byte request")]
    OversizedResponse { requested: u64, got: i64 },
    #[error("unable to read {len} bytes at {addr:#x}: errno {errno}")]
    Remote { addr: u64, len: u64, errno: i32 },
    #[error("only {got} of {requested} bytes at {addr:#x} are readable")]
    Short {
        addr: u64,
        requested: usize,
        got: usize,
    },
}

/// Reads memory of a crashed process through its memory server.
#[derive(Debug)]
pub struct MemserverClient<S> {
    stream: S,
}

#[cfg(unix)]
impl MemserverClient<std::os::unix::net::UnixStream> {
    /// Connects to the memory server on the descriptor the crashed process handed us.
    ///
    /// # Safety
    /// The descriptor must be open and owned by nothing else in this process.
    pub unsafe fn from_inherited_fd() -> Self {
        use std::os::fd::FromRawFd;
        Self::new(std::os::unix::net::UnixStream::from_raw_fd(
            DD_BACKTRACE_MEMSERVER_FD,
        ))
    }
}

impl<S: Read + Write> MemserverClient<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Issues one request of at most `DD_BACKTRACE_MEMSERVER_MAX_REQUEST` bytes. The answer may be
    /// shorter than requested when the end of the range is unmapped.
    pub fn fetch(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, MemserverError> {
        let request = MemserverRequest {
            addr,
            len: len as u64,
        };
        self.stream.write_all(&request.to_bytes())?;

        let mut header = [0u8; RESPONSE_SIZE];
        self.stream.read_exact(&mut header)?;
        let response = MemserverResponse::from_bytes(&header);
        if response.addr != addr {
            return Err(MemserverError::AddressMismatch {
                expected: addr,
                got: response.addr,
            });
        }
        if response.len < 0 {
            return Err(MemserverError::Remote {
                addr,
                len: request.len,
                errno: response
                    .len
                    .checked_neg()
                    .and_then(|e| i32::try_from(e).ok())
                    .unwrap_or(i32::MAX),
            });
        }
        if response.len as u64 > request.len {
            return Err(MemserverError::OversizedResponse {
                requested: request.len,
                got: response.len,
            });
        }
        let mut data = vec![0u8; response.len as usize];
        self.stream.read_exact(&mut data)?;
        Ok(data)
    }

    /// Reads up to `len` bytes, splitting the range into server-sized requests. Stops early at the
    /// first chunk that comes back short; fails only if nothing at all could be read.
    pub fn read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, MemserverError> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk_addr = addr.wrapping_add(out.len() as u64);
            let want = (len - out.len()).min(DD_BACKTRACE_MEMSERVER_MAX_REQUEST);
            match self.fetch(chunk_addr, want) {
                Ok(chunk) => {
                    let short = chunk.len() < want;
                    out.extend_from_slice(&chunk);
                    if short {
                        break;
                    }
                }
                Err(MemserverError::Remote { .. }) if !out.is_empty() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Fills `buf` from `addr`, failing unless every byte was readable.
    pub fn read_exact(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), MemserverError> {
        let data = self.read(addr, buf.len())?;
        if data.len() != buf.len() {
            return Err(MemserverError::Short {
                addr,
                requested: buf.len(),
                got: data.len(),
            });
        }
        buf.copy_from_slice(&data);
        Ok(())
    }
}
