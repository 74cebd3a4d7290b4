// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The fault description handed to the backtracer.
//!
//! The crashed process writes a [`CrashContext`] at a fixed address and passes that address to
//! the backtracer on its command line. The backtracer may be a different binary, built for a
//! different pointer width, so every field is a `u64` in native byte order and pointers are
//! stored as plain addresses.

use std::mem::size_of;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrashContext {
    pub crashing_thread: u64,
    pub signal: u64,
    pub fault_address: u64,
    /// Address of the first [`ThreadRecord`]; the crashing thread comes first.
    #[cfg(not(target_os = "macos"))]
    pub thread_list: u64,
    /// Address of the crashing thread's machine context.
    #[cfg(target_os = "macos")]
    pub mctx: u64,
}

/// One entry of the linked list of threads alive at crash time.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRecord {
    /// Address of the next record, 0 at the end of the list.
    pub next: u64,
    pub tid: u64,
    /// Address of the thread's `ucontext_t`; only known for the crashing thread, 0 otherwise.
    pub uctx: u64,
}

pub const CRASH_CONTEXT_SIZE: usize = size_of::<CrashContext>();
pub const THREAD_RECORD_SIZE: usize = size_of::<ThreadRecord>();

const _: () = assert!(CRASH_CONTEXT_SIZE == 4 * size_of::<u64>());
const _: () = assert!(THREAD_RECORD_SIZE == 3 * size_of::<u64>());

fn read_u64(bytes: &[u8], index: usize) -> Option<u64> {
    let start = index * size_of::<u64>();
    let chunk = bytes.get(start..start + size_of::<u64>())?;
    Some(u64::from_ne_bytes(chunk.try_into().ok()?))
}

impl CrashContext {
    /// Decodes a context read out of the crashed process.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            crashing_thread: read_u64(bytes, 0)?,
            signal: read_u64(bytes, 1)?,
            fault_address: read_u64(bytes, 2)?,
            #[cfg(not(target_os = "macos"))]
            thread_list: read_u64(bytes, 3)?,
            #[cfg(target_os = "macos")]
            mctx: read_u64(bytes, 3)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; CRASH_CONTEXT_SIZE] {
        #[cfg(not(target_os = "macos"))]
        let trailer = self.thread_list;
        #[cfg(target_os = "macos")]
        let trailer = self.mctx;
        let mut bytes = [0u8; CRASH_CONTEXT_SIZE];
        for (i, field) in [self.crashing_thread, self.signal, self.fault_address, trailer]
            .into_iter()
            .enumerate()
        {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&field.to_ne_bytes());
        }
        bytes
    }
}

impl ThreadRecord {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            next: read_u64(bytes, 0)?,
            tid: read_u64(bytes, 1)?,
            uctx: read_u64(bytes, 2)?,
        })
    }
}

/// Walks a remote thread list, reading each record through `read`. Stops at the end of the list,
/// on a read failure, or after `max` records so a corrupted list cannot loop forever.
pub fn walk_thread_list<E>(
    head: u64,
    max: usize,
    mut read: impl FnMut(u64, &mut [u8]) -> Result<(), E>,
) -> Result<Vec<ThreadRecord>, E> {
    let mut records = vec![];
    let mut next = head;
    while next != 0 && records.len() < max {
        let mut bytes = [0u8; THREAD_RECORD_SIZE];
        read(next, &mut bytes)?;
        let Some(record) = ThreadRecord::from_bytes(&bytes) else {
            break;
        };
        next = record.next;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_stable() {
        assert_eq!(std::mem::align_of::<CrashContext>(), 8);
        assert_eq!(std::mem::offset_of!(CrashContext, crashing_thread), 0);
        assert_eq!(std::mem::offset_of!(CrashContext, signal), 8);
        assert_eq!(std::mem::offset_of!(CrashContext, fault_address), 16);
        assert_eq!(std::mem::offset_of!(ThreadRecord, next), 0);
        assert_eq!(std::mem::offset_of!(ThreadRecord, tid), 8);
        assert_eq!(std::mem::offset_of!(ThreadRecord, uctx), 16);
    }

    #[test]
    fn test_decode_matches_memory() {
        let context = CrashContext {
            crashing_thread: 1234,
            signal: libc::SIGSEGV as u64,
            fault_address: 0xdead_0000,
            ..Default::default()
        };
        // SAFETY: CrashContext is repr(C) and made of u64s only.
        let raw = unsafe {
            std::slice::from_raw_parts(
                (&context as *const CrashContext).cast::<u8>(),
                CRASH_CONTEXT_SIZE,
            )
        };
        assert_eq!(CrashContext::from_bytes(raw), Some(context));
        assert_eq!(context.to_bytes().as_slice(), raw);
        assert_eq!(CrashContext::from_bytes(&raw[..20]), None);
    }

    #[test]
    fn test_walk_thread_list() {
        let records = [
            ThreadRecord {
                next: 2,
                tid: 10,
                uctx: 0x1000,
            },
            ThreadRecord {
                next: 0,
                tid: 11,
                uctx: 0,
            },
        ];
        let read = |addr: u64, out: &mut [u8]| -> Result<(), ()> {
            let record = records.get(addr as usize - 1).ok_or(())?;
            out[..8].copy_from_slice(&record.next.to_ne_bytes());
            out[8..16].copy_from_slice(&record.tid.to_ne_bytes());
            out[16..].copy_from_slice(&record.uctx.to_ne_bytes());
            Ok(())
        };
        assert_eq!(walk_thread_list(1, 16, read), Ok(records.to_vec()));
        assert_eq!(walk_thread_list(0, 16, read), Ok(vec![]));
        assert_eq!(walk_thread_list(1, 1, read).map(|r| r.len()), Ok(1));
    }
}
