// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A process-wide, append-only text buffer for crash-log collectors.
//!
//! Messages are appended by reserving a byte range with an atomic cursor and then copying into
//! it, so appending never allocates or locks and is safe from a signal handler. The last byte is
//! never handed out, which keeps the contents NUL terminated for readers outside the process.

use crate::shared::constants::DD_BACKTRACE_ANNOTATION_SIZE;
use std::cell::UnsafeCell;
use std::ffi::c_char;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct CrashAnnotation<const N: usize = DD_BACKTRACE_ANNOTATION_SIZE> {
    cursor: AtomicUsize,
    buffer: UnsafeCell<[u8; N]>,
}

// SAFETY: every writer copies into a range it reserved exclusively through `cursor`.
unsafe impl<const N: usize> Sync for CrashAnnotation<N> {}

static CRASH_ANNOTATION: CrashAnnotation = CrashAnnotation::new();

/// The buffer shared by the crash handler and [`report_fatal_error`].
pub fn crash_annotation() -> &'static CrashAnnotation {
    &CRASH_ANNOTATION
}

impl<const N: usize> Default for CrashAnnotation<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> CrashAnnotation<N> {
    pub const fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            buffer: UnsafeCell::new([0; N]),
        }
    }

    /// Bytes available to messages; one is kept back for the terminator.
    pub const fn capacity(&self) -> usize {
        N.saturating_sub(1)
    }

    /// Appends as much of `message` as still fits. Returns the number of bytes stored.
    pub fn append(&self, message: &[u8]) -> usize {
        let capacity = self.capacity();
        let reserved = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |start| {
                (start < capacity).then(|| start.saturating_add(message.len()).min(capacity))
            });
        let Ok(start) = reserved else {
            return 0;
        };
        let len = message.len().min(capacity - start);
        // SAFETY: `start..start + len` lies within the buffer and was reserved by us alone.
        unsafe {
            let dst = self.buffer.get().cast::<u8>().add(start);
            std::ptr::copy_nonoverlapping(message.as_ptr(), dst, len);
        }
        len
    }

    pub fn len(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Everything appended so far. A message that is still being copied in may show up
    /// partially.
    pub fn contents(&self) -> &[u8] {
        let len = self.len().min(self.capacity());
        // SAFETY: the buffer lives as long as `self`, and bytes are only ever written once.
        unsafe { std::slice::from_raw_parts(self.buffer.get().cast::<u8>(), len) }
    }

    /// The contents as a C string, for crash reporters that read our memory.
    pub fn as_c_ptr(&self) -> *const c_char {
        self.buffer.get().cast::<c_char>().cast_const()
    }
}

/// Reports a fatal runtime error: the message goes to stderr and to the crash annotation.
/// Does not terminate the process. Not for use from a signal handler.
pub fn report_fatal_error(message: &str) {
    use std::io::Write;

    let mut stderr = std::io::stderr().lock();
    // Nothing sensible to do if stderr is gone.
    let _ = stderr.write_all(message.as_bytes());
    let _ = stderr.flush();
    crash_annotation().append(message.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_append_accumulates() {
        let annotation = CrashAnnotation::<64>::new();
        assert!(annotation.is_empty());
        assert_eq!(annotation.append(b"first "), 6);
        assert_eq!(annotation.append(b"second"), 6);
        assert_eq!(annotation.contents(), b"first second");
        // SAFETY: the buffer always ends with a NUL byte.
        let c_str = unsafe { CStr::from_ptr(annotation.as_c_ptr()) };
        assert_eq!(c_str.to_bytes(), b"first second");
    }

    #[test]
    fn test_truncates_at_capacity() {
        let annotation = CrashAnnotation::<16>::new();
        assert_eq!(annotation.capacity(), 15);
        assert_eq!(annotation.append(b"0123456789"), 10);
        assert_eq!(annotation.append(b"abcdefghij"), 5);
        assert!(annotation.is_full());
        assert_eq!(annotation.append(b"more"), 0);
        assert_eq!(annotation.contents(), b"0123456789abcde");
        // SAFETY: the buffer always ends with a NUL byte.
        let c_str = unsafe { CStr::from_ptr(annotation.as_c_ptr()) };
        assert_eq!(c_str.to_bytes().len(), 15);
    }

    #[test]
    fn test_concurrent_appends_do_not_overlap() {
        let annotation = CrashAnnotation::<4096>::new();
        std::thread::scope(|s| {
            for byte in b'a'..b'i' {
                let annotation = &annotation;
                s.spawn(move || {
                    for _ in 0..50 {
                        annotation.append(&[byte; 4]);
                    }
                });
            }
        });
        let contents = annotation.contents();
        assert_eq!(contents.len(), 8 * 50 * 4);
        for chunk in contents.chunks(4) {
            assert!(chunk.iter().all(|b| *b == chunk[0]), "{chunk:?}");
        }
    }

    #[test]
    fn test_report_fatal_error_feeds_annotation() {
        report_fatal_error("Fatal error: index out of range\n");
        let contents = String::from_utf8_lossy(crash_annotation().contents()).into_owned();
        assert!(contents.contains("Fatal error: index out of range\n"), "{contents}");
    }
}
