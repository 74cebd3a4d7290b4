// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(backtrace_on_crash)]
mod annotation;
mod crash_gate;
mod crash_handler;
mod crash_scope;
mod emergency;
mod launcher;
mod memserver;
mod signal_handler_manager;
mod thread_list;
mod vault;

pub use annotation::{crash_annotation, report_fatal_error, CrashAnnotation};
pub use crash_gate::{CrashContextSlot, CrashGate, FiringToken};
pub use crash_handler::{install, CrashHandlerError};
pub use crash_scope::CrashScope;
pub use emergency::EmergencyReporter;
pub use launcher::{Launcher, SpawnError, ARGV_CAPACITY, ENVP_CAPACITY};
#[cfg(target_os = "linux")]
pub use memserver::{MemoryServer, MemserverChannel};
pub use signal_handler_manager::{restore_previous_handlers, DEFAULT_SIGNALS};
pub use vault::{EnvironmentEntries, FrozenVault, VaultError, VaultStorage, VaultWarning, VaultWriter};
