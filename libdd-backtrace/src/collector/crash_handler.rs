// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_gate::{CrashContextSlot, FiringToken};
use super::crash_scope::CrashScope;
use super::emergency::EmergencyReporter;
#[cfg(target_os = "linux")]
use super::memserver::MemserverChannel;
use super::signal_handler_manager::{exit_with_default_action, register_crash_handlers};
use crate::shared::crash_context::CrashContext;
use crate::BacktraceState;
use libc::{c_void, siginfo_t, ucontext_t};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicPtr, AtomicU64};

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - getdents64 / open / close (thread enumeration, Linux)
// - gettid (Linux) / pthread_threadid_np (macOS)
// - pause
// - raise
// - sigaction
// - socketpair
// - write
// plus everything the launcher uses.

// Set once by `install`, never freed. Using mutexes inside a signal handler is not allowed, so
// use `AtomicPtr` instead.
static STATE: AtomicPtr<BacktraceState> = AtomicPtr::new(ptr::null_mut());

static CRASH_CONTEXT: CrashContextSlot = CrashContextSlot::new();

// Thread id of the gate's winner, so a fault inside the handler itself is recognised.
static CRASHING_THREAD: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum CrashHandlerError {
    #[error("No backtrace state available")]
    NoState,
    #[error("Backtracing is disabled")]
    Disabled,
    #[error("Crash context was already captured")]
    AlreadyCaptured,
    #[error("Backtracer did not complete successfully")]
    BacktracerFailed,
}

/// Makes `state` visible to the crash handler and registers it for `signals`.
/// Only the first call succeeds.
pub fn install(
    state: &'static BacktraceState,
    signals: &[i32],
    create_alt_stack: bool,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        STATE
            .compare_exchange(
                ptr::null_mut(),
                state as *const BacktraceState as *mut BacktraceState,
                SeqCst,
                SeqCst,
            )
            .is_ok(),
        "Attempted to install the crash handler twice"
    );
    register_crash_handlers(signals, create_alt_stack)
}

/// What a thread entering the crash handler does next.
enum GateOutcome<'a> {
    /// First fault in the process: capture and report it.
    Report(FiringToken<'a>),
    /// The reporting thread faulted again inside the handler.
    ExitNow,
    /// Another thread is reporting and will take the process down.
    Wait,
}

fn enter_gate<'a>(
    slot: &'a CrashContextSlot,
    crashing_thread: &AtomicU64,
    thread: u64,
) -> GateOutcome<'a> {
    match slot.try_fire() {
        Some(token) => {
            crashing_thread.store(thread, SeqCst);
            GateOutcome::Report(token)
        }
        None if crashing_thread.load(SeqCst) == thread => GateOutcome::ExitNow,
        None => GateOutcome::Wait,
    }
}

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    // SAFETY: this is the signal handler.
    let scope = unsafe { CrashScope::enter() };
    let thread = current_thread_id();

    match enter_gate(&CRASH_CONTEXT, &CRASHING_THREAD, thread) {
        GateOutcome::Report(token) => {
            let _ = handle_posix_signal_impl(
                &token,
                &scope,
                thread,
                signum,
                sig_info,
                ucontext as *const ucontext_t,
            );
        }
        GateOutcome::ExitNow => (),
        GateOutcome::Wait => loop {
            // SAFETY: no preconditions.
            unsafe { libc::pause() };
        },
    }
    // SAFETY: called from the signal handler with the signal being handled.
    unsafe { exit_with_default_action(signum) }
}

fn handle_posix_signal_impl(
    token: &FiringToken<'_>,
    scope: &CrashScope,
    thread: u64,
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
) -> Result<(), CrashHandlerError> {
    let state = STATE.load(SeqCst);
    if state.is_null() {
        return Err(CrashHandlerError::NoState);
    }
    // SAFETY: `install` only stores `&'static` references.
    let state = unsafe { &*state };
    let launcher = state.launcher().ok_or(CrashHandlerError::Disabled)?;

    let fault_address = if sig_info.is_null() {
        0
    } else {
        // SAFETY: the kernel hands us a valid siginfo.
        unsafe { (*sig_info).si_addr() as usize as u64 }
    };

    let context = CrashContext {
        crashing_thread: thread,
        signal: signum as u64,
        fault_address,
        #[cfg(target_os = "linux")]
        thread_list: super::thread_list::capture_thread_list(
            token,
            scope,
            thread,
            ucontext as usize as u64,
        ),
        #[cfg(target_os = "macos")]
        mctx: machine_context_address(ucontext),
    };
    let context = CRASH_CONTEXT
        .capture(token, scope, context)
        .ok_or(CrashHandlerError::AlreadyCaptured)?;

    EmergencyReporter::new(launcher.settings()).report(scope, signum, program_counter(ucontext));

    #[cfg(target_os = "linux")]
    let completed = launcher.spawn_backtracer(scope, context, MemserverChannel::open(scope));
    #[cfg(not(target_os = "linux"))]
    let completed = launcher.spawn_backtracer(scope, context);

    if completed {
        Ok(())
    } else {
        Err(CrashHandlerError::BacktracerFailed)
    }
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> u64 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(target_os = "macos")]
fn current_thread_id() -> u64 {
    let mut tid = 0u64;
    // SAFETY: `tid` is a valid out pointer.
    unsafe { libc::pthread_threadid_np(libc::pthread_self(), &mut tid) };
    tid
}

#[cfg(target_os = "macos")]
fn machine_context_address(ucontext: *const ucontext_t) -> u64 {
    if ucontext.is_null() {
        return 0;
    }
    // SAFETY: the kernel hands us a valid ucontext.
    unsafe { (*ucontext).uc_mcontext as usize as u64 }
}

/// Where the fault happened, or 0 if unknown.
fn program_counter(ucontext: *const ucontext_t) -> usize {
    if ucontext.is_null() {
        return 0;
    }
    // SAFETY: the kernel hands us a valid ucontext, and on macOS a valid mcontext pointer.
    unsafe { read_program_counter(ucontext) }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn read_program_counter(ucontext: *const ucontext_t) -> usize {
    (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as usize
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn read_program_counter(ucontext: *const ucontext_t) -> usize {
    (*ucontext).uc_mcontext.pc as usize
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn read_program_counter(ucontext: *const ucontext_t) -> usize {
    (*(*ucontext).uc_mcontext).__ss.__rip as usize
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn read_program_counter(ucontext: *const ucontext_t) -> usize {
    (*(*ucontext).uc_mcontext).__ss.__pc as usize
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
)))]
unsafe fn read_program_counter(_ucontext: *const ucontext_t) -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_context_has_no_program_counter() {
        assert_eq!(program_counter(ptr::null()), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_thread_id_is_per_thread() {
        let main = current_thread_id();
        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(main, 0);
        assert_ne!(main, other);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_program_counter_reads_rip() {
        // SAFETY: all-zero is a valid ucontext_t.
        let mut uc: ucontext_t = unsafe { std::mem::zeroed() };
        uc.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x4010_2030;
        assert_eq!(program_counter(&uc), 0x4010_2030);
    }

    #[test]
    fn test_recursive_fault_exits_immediately() {
        let slot = CrashContextSlot::new();
        let crashing = AtomicU64::new(0);

        assert!(matches!(
            enter_gate(&slot, &crashing, 42),
            GateOutcome::Report(_)
        ));
        assert_eq!(crashing.load(SeqCst), 42);
        // The same thread faulting inside the handler does not wait on itself.
        assert!(matches!(
            enter_gate(&slot, &crashing, 42),
            GateOutcome::ExitNow
        ));
        assert_eq!(crashing.load(SeqCst), 42);
    }

    #[test]
    fn test_other_threads_wait_for_the_reporter() {
        let slot = CrashContextSlot::new();
        let crashing = AtomicU64::new(0);
        let reporter = current_thread_id();

        assert!(matches!(
            enter_gate(&slot, &crashing, reporter),
            GateOutcome::Report(_)
        ));
        let outcome_is_wait = std::thread::scope(|s| {
            s.spawn(|| {
                matches!(
                    enter_gate(&slot, &crashing, current_thread_id()),
                    GateOutcome::Wait
                )
            })
            .join()
            .unwrap()
        });
        assert!(outcome_is_wait);
        assert_eq!(crashing.load(SeqCst), reporter);
    }

    #[test]
    fn test_handler_without_state_is_an_error() {
        let slot = CrashContextSlot::new();
        let token = slot.try_fire().unwrap();
        // SAFETY: test stands in for the signal handler.
        let scope = unsafe { CrashScope::enter() };
        // No test installs state, so the handler bails out before touching anything.
        let result = handle_posix_signal_impl(
            &token,
            &scope,
            1,
            libc::SIGSEGV,
            ptr::null(),
            ptr::null(),
        );
        assert!(matches!(result, Err(CrashHandlerError::NoState)));
        assert!(!CRASH_CONTEXT.is_firing());
    }
}
