// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(target_os = "linux")]

//! Enumerates the threads of the crashing process into a static linked list the backtracer can
//! walk through the memory server. Uses `open`, `getdents64` and `close` directly; no allocation.

use super::crash_gate::FiringToken;
use super::crash_scope::CrashScope;
use crate::shared::constants::DD_BACKTRACE_MAX_THREADS;
use crate::shared::crash_context::ThreadRecord;
use std::cell::UnsafeCell;

struct ThreadTable(UnsafeCell<[ThreadRecord; DD_BACKTRACE_MAX_THREADS]>);

// SAFETY: only written by the holder of the crash gate's token.
unsafe impl Sync for ThreadTable {}

static THREADS: ThreadTable = ThreadTable(UnsafeCell::new(
    [ThreadRecord {
        next: 0,
        tid: 0,
        uctx: 0,
    }; DD_BACKTRACE_MAX_THREADS],
));

const DIRENT_BUFFER_SIZE: usize = 4096;
// Offsets into `struct linux_dirent64`.
const DIRENT_RECLEN_OFFSET: usize = 16;
const DIRENT_NAME_OFFSET: usize = 19;

/// Fills the static thread table and returns the address of its head. The crashing thread comes
/// first and is the only one with a context; other threads are not suspended, so their
/// registers are not captured.
pub(crate) fn capture_thread_list(
    _token: &FiringToken<'_>,
    _scope: &CrashScope,
    crashing_thread: u64,
    uctx: u64,
) -> u64 {
    // SAFETY: the firing token makes us the only thread touching the table.
    let table = unsafe { &mut *THREADS.0.get() };
    table[0] = ThreadRecord {
        next: 0,
        tid: crashing_thread,
        uctx,
    };
    let mut count = 1;
    for_each_task(|tid| {
        if tid == crashing_thread || count == table.len() {
            return;
        }
        table[count] = ThreadRecord { next: 0, tid, uctx: 0 };
        count += 1;
    });
    for i in 0..count - 1 {
        table[i].next = &table[i + 1] as *const ThreadRecord as u64;
    }
    table.as_ptr() as u64
}

fn for_each_task(mut f: impl FnMut(u64)) {
    // SAFETY: the path is a valid C string; the returned fd is closed below.
    let fd = unsafe {
        libc::open(
            c"/proc/self/task".as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return;
    }
    let mut buffer = [0u8; DIRENT_BUFFER_SIZE];
    loop {
        // SAFETY: `buffer` is valid for writes of its full length.
        let read = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                buffer.as_mut_ptr(),
                buffer.len(),
            )
        };
        if read <= 0 {
            break;
        }
        parse_dirents(&buffer[..read as usize], &mut f);
    }
    // SAFETY: `fd` was opened above.
    unsafe { libc::close(fd) };
}

fn parse_dirents(mut entries: &[u8], f: &mut impl FnMut(u64)) {
    while entries.len() > DIRENT_NAME_OFFSET {
        let reclen = u16::from_ne_bytes([
            entries[DIRENT_RECLEN_OFFSET],
            entries[DIRENT_RECLEN_OFFSET + 1],
        ]) as usize;
        if reclen == 0 || reclen > entries.len() {
            return;
        }
        if let Some(tid) = parse_tid(&entries[DIRENT_NAME_OFFSET..reclen]) {
            f(tid);
        }
        entries = &entries[reclen..];
    }
}

/// Decimal name up to its NUL; `.` and `..` yield nothing.
fn parse_tid(name: &[u8]) -> Option<u64> {
    let mut tid: u64 = 0;
    let mut digits = 0;
    for byte in name.iter().take_while(|b| **b != 0) {
        if !byte.is_ascii_digit() {
            return None;
        }
        tid = tid.checked_mul(10)?.checked_add(u64::from(byte - b'0'))?;
        digits += 1;
    }
    (digits > 0).then_some(tid)
}
