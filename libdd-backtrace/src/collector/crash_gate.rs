// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_scope::CrashScope;
use crate::shared::crash_context::CrashContext;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// One-shot gate deciding which faulting thread gets to report the crash.
///
/// Unlike a reentrancy guard this is never released: once a thread has started reporting, the
/// process is going down, and any other thread that faults must not touch the crash context.
pub struct CrashGate {
    state: AtomicU64,
}

/// Held by the single thread that won the gate.
pub struct FiringToken<'a> {
    gate: &'a CrashGate,
}

impl Default for CrashGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashGate {
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    pub fn try_fire(&self) -> Option<FiringToken<'_>> {
        // CAS from 0 to 1 so exactly one caller ever succeeds.
        self.state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| FiringToken { gate: self })
    }

    pub fn is_firing(&self) -> bool {
        self.state.load(Ordering::SeqCst) != 0
    }
}

/// Statically allocated storage for the [`CrashContext`], writable only by the gate's winner.
pub struct CrashContextSlot {
    gate: CrashGate,
    context: UnsafeCell<CrashContext>,
}

// SAFETY: `context` is written only through `capture`, which requires the unique `FiringToken`
// of this slot's gate. Reads happen after the write, from the same thread or from another
// process.
unsafe impl Sync for CrashContextSlot {}

impl Default for CrashContextSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashContextSlot {
    pub const fn new() -> Self {
        Self {
            gate: CrashGate::new(),
            context: UnsafeCell::new(CrashContext {
                crashing_thread: 0,
                signal: 0,
                fault_address: 0,
                #[cfg(not(target_os = "macos"))]
                thread_list: 0,
                #[cfg(target_os = "macos")]
                mctx: 0,
            }),
        }
    }

    pub fn try_fire(&self) -> Option<FiringToken<'_>> {
        self.gate.try_fire()
    }

    pub fn is_firing(&self) -> bool {
        self.gate.is_firing()
    }

    /// Records the crash. Returns the address the backtracer should read the context from, or
    /// `None` if `token` was issued by a different slot.
    pub fn capture(
        &self,
        token: &FiringToken<'_>,
        _scope: &CrashScope,
        context: CrashContext,
    ) -> Option<*const CrashContext> {
        if !ptr::eq(token.gate, &self.gate) {
            return None;
        }
        // SAFETY: the token proves we are the only writer.
        unsafe { ptr::write_volatile(self.context.get(), context) };
        Some(self.as_ptr())
    }

    pub fn as_ptr(&self) -> *const CrashContext {
        self.context.get()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> CrashContext {
        // SAFETY: the only writer is `capture`, which completes before the winner does anything
        // else.
        unsafe { ptr::read_volatile(self.context.get()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(signal: i32, tid: u64) -> CrashContext {
        CrashContext {
            crashing_thread: tid,
            signal: signal as u64,
            fault_address: 0x1000 + tid,
            ..Default::default()
        }
    }

    #[test]
    fn test_gate_fires_once() {
        let gate = CrashGate::new();
        assert!(!gate.is_firing());
        assert!(gate.try_fire().is_some());
        assert!(gate.is_firing());
        assert!(gate.try_fire().is_none());
    }

    #[test]
    fn test_second_fault_cannot_overwrite() {
        let slot = CrashContextSlot::new();
        // SAFETY: test stands in for the signal handler.
        let scope = unsafe { CrashScope::enter() };

        let first = slot.try_fire().unwrap();
        let ptr = slot
            .capture(&first, &scope, context(libc::SIGSEGV, 1))
            .unwrap();
        assert_eq!(ptr, slot.as_ptr());

        // A second "fault" sees the slot already firing and gets nothing to write with.
        assert!(slot.is_firing());
        assert!(slot.try_fire().is_none());
        assert_eq!(slot.snapshot(), context(libc::SIGSEGV, 1));
    }

    #[test]
    fn test_foreign_token_rejected() {
        let slot = CrashContextSlot::new();
        let other = CrashContextSlot::new();
        // SAFETY: test stands in for the signal handler.
        let scope = unsafe { CrashScope::enter() };
        let token = other.try_fire().unwrap();
        assert!(slot
            .capture(&token, &scope, context(libc::SIGBUS, 2))
            .is_none());
        assert_eq!(slot.snapshot(), CrashContext::default());
    }

    #[test]
    fn test_concurrent_faults_have_one_winner() {
        let slot = CrashContextSlot::new();
        let winners = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|tid| {
                    let slot = &slot;
                    s.spawn(move || {
                        let Some(token) = slot.try_fire() else {
                            return 0;
                        };
                        // SAFETY: test stands in for the signal handler.
                        let scope = unsafe { CrashScope::enter() };
                        slot.capture(&token, &scope, context(libc::SIGILL, tid));
                        1
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .sum::<u32>()
        });
        assert_eq!(winners, 1);
        assert_eq!(slot.snapshot().signal, libc::SIGILL as u64);
    }
}
