// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Backtrace-on-crash.
//!
//! When a process that called [`init`] receives a fatal signal, it captures a small
//! [`CrashContext`](shared::crash_context::CrashContext) describing the fault and launches an
//! out-of-process backtracer (`dd-backtrace`) to symbolicate and print the crashing process's
//! stacks.
//!
//! Architecturally, it consists of two parts:
//! 1. Initialisation, which runs in ordinary code. It parses the `DD_BACKTRACE` settings
//!    variable, resolves them against the host (terminals, privilege, location of the
//!    backtracer), copies everything the crash handler will need into write-protected static
//!    buffers, and registers the signal handler.
//! 2. The crash handler, which runs under a constrained environment where many standard
//!    operations are illegal. <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//!    It records the fault, writes a one-line notice, and spawns the backtracer with
//!    `clone(CLONE_VM | CLONE_VFORK)` (Linux) or `posix_spawn` (macOS). On Linux it then serves
//!    the backtracer's requests to read its memory over a socketpair until the backtracer exits.
//!    Finally, it lets the signal take its default effect, so the process dies the way it would
//!    have without us.
//!
//! Settings are a comma separated list of `key=value` pairs, e.g.
//! `DD_BACKTRACE=enable=on,timeout=5m,format=json,output-to=/tmp/crash.json`.

#[cfg(unix)]
pub mod collector;
pub mod demangle;
pub mod settings;
pub mod shared;
mod state;
#[cfg(unix)]
pub mod unix_utils;

pub use demangle::{demangle_into, demangle_symbol, is_thunk_function};
pub use settings::{BacktraceSettings, FrozenSettings};
pub use state::BacktraceState;

#[cfg(backtrace_on_crash)]
pub use collector::{crash_annotation, report_fatal_error};

use serde::{Deserialize, Serialize};
use shared::constants::DD_BACKTRACE_SETTINGS_VAR;
use shared::host::{ProcessEnv, SystemHost};
use std::sync::OnceLock;

/// Longest accepted settings variable name.
const MAX_SETTINGS_VAR_LEN: usize = 128;

/// How [`init`] reads its settings and installs the crash handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitOptions {
    /// Environment variable holding the settings.
    pub settings_var: String,
    /// Optional prefix for setting keys, for settings variables shared with other components.
    pub namespace: Option<String>,
    /// Creates an alternate signal stack, so stack overflows can be reported.
    pub create_alt_stack: bool,
    /// Signals to backtrace.
    pub signals: Vec<i32>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            settings_var: DD_BACKTRACE_SETTINGS_VAR.to_string(),
            namespace: None,
            create_alt_stack: true,
            #[cfg(backtrace_on_crash)]
            signals: collector::DEFAULT_SIGNALS.to_vec(),
            #[cfg(not(backtrace_on_crash))]
            signals: vec![],
        }
    }
}

impl InitOptions {
    pub fn validate(&self) -> anyhow::Result<()> {
        let name = &self.settings_var;
        anyhow::ensure!(!name.is_empty(), "settings variable name is empty");
        anyhow::ensure!(
            name.len() <= MAX_SETTINGS_VAR_LEN,
            "settings variable name is longer than {MAX_SETTINGS_VAR_LEN} bytes"
        );
        anyhow::ensure!(
            !name.contains(['=', '\0']),
            "settings variable name {name:?} contains '=' or NUL"
        );
        if let Some(namespace) = &self.namespace {
            anyhow::ensure!(
                !namespace.contains([',', '=']),
                "settings namespace {namespace:?} contains ',' or '='"
            );
        }
        Ok(())
    }
}

static STATE: OnceLock<&'static BacktraceState> = OnceLock::new();

/// Initialises backtrace-on-crash for this process.
///
/// Only the first call does any work; later calls, including concurrent ones, return the state
/// it produced. Problems with the settings or the host never fail initialisation: they are
/// logged and backtracing is turned off. Errors are returned only for invalid `options`.
pub fn init(options: InitOptions) -> anyhow::Result<&'static BacktraceState> {
    options.validate()?;
    Ok(*STATE.get_or_init(|| initialize(&options)))
}

/// Whether a fatal signal will launch the backtracer. Runtimes use this to skip their own
/// in-process backtraces.
pub fn is_enabled() -> bool {
    STATE.get().is_some_and(|state| state.is_enabled())
}

/// The state produced by [`init`], if it has run.
pub fn state() -> Option<&'static BacktraceState> {
    STATE.get().copied()
}

#[cfg(backtrace_on_crash)]
fn initialize(options: &InitOptions) -> &'static BacktraceState {
    let storage = collector::VaultStorage::process();
    let state: &'static BacktraceState = Box::leak(Box::new(BacktraceState::resolve(
        options,
        &ProcessEnv,
        &SystemHost,
        storage,
    )));
    if !state.is_enabled() {
        return state;
    }
    match collector::install(state, &options.signals, options.create_alt_stack) {
        Ok(()) => state,
        Err(e) => {
            tracing::warn!("unable to install the crash handler: {e:#}; backtracing disabled");
            // Best effort: some signals may have been registered before the failure.
            let _ = collector::restore_previous_handlers();
            Box::leak(Box::new(state.to_disabled()))
        }
    }
}

#[cfg(not(backtrace_on_crash))]
fn initialize(options: &InitOptions) -> &'static BacktraceState {
    Box::leak(Box::new(BacktraceState::resolve(
        options,
        &ProcessEnv,
        &SystemHost,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = InitOptions::default();
        options.validate().unwrap();
        assert_eq!(options.settings_var, "DD_BACKTRACE");
        #[cfg(backtrace_on_crash)]
        assert!(options.signals.contains(&libc::SIGSEGV));
    }

    #[test]
    fn test_invalid_options() {
        let bad_names = [
            String::new(),
            "A=B".to_string(),
            "NUL\0".to_string(),
            "X".repeat(MAX_SETTINGS_VAR_LEN + 1),
        ];
        for settings_var in bad_names {
            let options = InitOptions {
                settings_var: settings_var.clone(),
                ..Default::default()
            };
            assert!(options.validate().is_err(), "{settings_var:?}");
            assert!(init(options).is_err());
        }

        let options = InitOptions {
            namespace: Some("a,b".to_string()),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_not_enabled_before_init() {
        // `init` is never run successfully by the unit tests.
        assert!(state().is_none());
        assert!(!is_enabled());
    }
}
