// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::crash_handler::handle_posix_sigaction;
use crate::unix_utils::terminate;
use libc::{
    mmap, sigaltstack, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
    SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

/// The fatal signals backtraced by default.
pub const DEFAULT_SIGNALS: [i32; 8] = [
    libc::SIGQUIT,
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGSEGV,
    libc::SIGTRAP,
    libc::SIGSYS,
];

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;
static mut HANDLERS: [Option<(Signal, SigAction)>; MAX_SIGNALS] = [None; MAX_SIGNALS];
static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_FINISHED: AtomicBool = AtomicBool::new(false);

/// Registers the crash handler for `signals`, remembering the actions it replaces. With
/// `alt_stack`, the calling thread also gets a guarded alternate signal stack.
/// Only the first call does anything; later calls return an error.
///
/// ATOMICITY:
///     Handlers are registered one signal at a time. A crash while this runs may see some
///     signals handled and others not; the handler itself does not depend on the remembered
///     actions, so this is harmless.
pub fn register_crash_handlers(signals: &[i32], alt_stack: bool) -> anyhow::Result<()> {
    anyhow::ensure!(
        INIT_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register crash handlers"
    );

    for signum in signals {
        anyhow::ensure!(
            *signum > 0 && *signum < MAX_SIGNALS as i32,
            "Signal {signum} out of range"
        );
    }

    if alt_stack {
        // Safety: This function has no documented preconditions.
        unsafe { create_alt_stack()? };
    }

    let mut errors = vec![];
    for signum in signals {
        let index = *signum as usize;
        // Safety: This function has no documented preconditions.
        match unsafe { register_signal_handler(*signum) } {
            // SAFETY: `INIT_STARTED` makes this the only writer, and readers wait for
            // `INIT_FINISHED`.
            Ok(handler) => unsafe { HANDLERS[index] = Some(handler) },
            Err(e) => errors.push(format!("Unable to register signal for {signum}: {e:?}")),
        };
    }
    INIT_FINISHED.store(true, SeqCst);
    anyhow::ensure!(
        errors.is_empty(),
        "Errors registering signal handlers {errors:?}"
    );
    Ok(())
}

/// Puts back every action replaced by [`register_crash_handlers`]. Crashes are no longer
/// backtraced afterwards; registration cannot be repeated.
pub fn restore_previous_handlers() -> anyhow::Result<()> {
    anyhow::ensure!(
        INIT_FINISHED.load(SeqCst),
        "Crash handlers were never registered"
    );
    let mut errors = vec![];
    for index in 0..MAX_SIGNALS {
        // SAFETY: registration has finished, so nothing writes `HANDLERS` any more.
        let entry = unsafe { HANDLERS[index] };
        if let Some((signal, action)) = entry {
            // SAFETY: restoring an action that was installed before ours.
            if let Err(e) = unsafe { signal::sigaction(signal, &action) } {
                errors.push(format!("Unable to restore {signal}: {e}"));
            }
        }
    }
    anyhow::ensure!(errors.is_empty(), "Errors restoring handlers {errors:?}");
    Ok(())
}

/// Lets the signal take its default effect, so the process dies the way it would have without
/// us: restores `SIG_DFL`, unblocks the signal and raises it again. If the process somehow
/// survives, it exits with a failure status.
pub(crate) unsafe fn exit_with_default_action(signum: i32) -> ! {
    if let Ok(signal) = Signal::try_from(signum) {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // Nothing to fall back to if these fail; `terminate` below still ends the process.
        let _ = signal::sigaction(signal, &default);
        let mut unblock = SigSet::empty();
        unblock.add(signal);
        let _ = unblock.thread_unblock();
        let _ = signal::raise(signal);
    }
    terminate()
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    // At least 16 pages: the handler formats text and sets up a spawn on this stack, which does
    // not fit in the default SIGSTKSZ on every platform.
    let page_size = page_size::get();
    let sigalstack_base_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        sigalstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigalstack_base_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

unsafe fn register_signal_handler(signum: i32) -> anyhow::Result<(Signal, SigAction)> {
    let signal_type = Signal::try_from(signum)?;

    // SA_NODEFER: a fault inside the handler must reach it again, so a recursive crash is
    // noticed instead of blocking the signal. SA_ONSTACK: stack overflows can only be handled
    // on the alternate stack; without one it has no effect.
    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        SaFlags::SA_NODEFER | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    );

    let old_handler = signal::sigaction(signal_type, &sig_action)?;
    Ok((signal_type, old_handler))
}
