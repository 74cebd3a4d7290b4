// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{
    BacktraceSettings, FrozenSettings, OnOffTty, OutputTo, Preset, ResolvedOutput,
    UnwindAlgorithm,
};
use crate::shared::constants::DD_BACKTRACER_EXECUTABLE;
use crate::shared::host::HostProbe;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveWarning {
    #[error("unable to locate the dd-backtrace executable; backtracing disabled")]
    BacktracerNotFound,
    #[error("backtrace-on-crash is not supported on this platform")]
    UnsupportedPlatform,
    #[error("backtrace-on-crash is not supported for privileged executables")]
    PrivilegedProcess,
}

/// Outcome of [`BacktraceSettings::freeze`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub settings: FrozenSettings,
    pub backtracer_path: Option<String>,
    pub output_path: Option<String>,
    pub warnings: Vec<ResolveWarning>,
}

#[cfg(backtrace_on_crash)]
const PLATFORM_SUPPORTED: bool = true;
#[cfg(not(backtrace_on_crash))]
const PLATFORM_SUPPORTED: bool = false;

fn platform_default_enabled() -> OnOffTty {
    if cfg!(target_os = "linux") {
        OnOffTty::On
    } else if cfg!(target_os = "macos") {
        OnOffTty::Tty
    } else {
        OnOffTty::Off
    }
}

impl BacktraceSettings {
    /// Resolves every tri-state and `Auto` value against `host`.
    ///
    /// Never fails: anything that prevents backtracing from working turns it off, with a warning
    /// when the user explicitly asked for it.
    pub fn freeze(self, host: &impl HostProbe) -> Resolution {
        self.freeze_for_platform(host, PLATFORM_SUPPORTED)
    }

    pub(crate) fn freeze_for_platform(
        mut self,
        host: &impl HostProbe,
        platform_supported: bool,
    ) -> Resolution {
        let mut warnings = vec![];
        let privileged = host.is_privileged();
        let requested = self.enabled;

        if privileged {
            self.enabled = OnOffTty::Off;
        }

        if self.backtracer_path.is_none() {
            self.backtracer_path = host.find_auxiliary_executable(DD_BACKTRACER_EXECUTABLE);
            if self.backtracer_path.is_none() {
                if self.enabled == OnOffTty::On {
                    warnings.push(ResolveWarning::BacktracerNotFound);
                }
                self.enabled = OnOffTty::Off;
            }
        }

        if self.enabled == OnOffTty::Default {
            self.enabled = platform_default_enabled();
        }

        if !platform_supported && self.enabled != OnOffTty::Off {
            warnings.push(ResolveWarning::UnsupportedPlatform);
            self.enabled = OnOffTty::Off;
        }

        // `enabled` was already forced off above; only complain if the user asked for it.
        if privileged && requested == OnOffTty::On {
            warnings.push(ResolveWarning::PrivilegedProcess);
            self.enabled = OnOffTty::Off;
        }

        if self.output_to == OutputTo::File {
            if self.interactive == OnOffTty::Tty {
                self.interactive = OnOffTty::Off;
            }
            if self.color == OnOffTty::Tty {
                self.color = OnOffTty::Off;
            }
            if self.enabled == OnOffTty::Tty {
                self.enabled = OnOffTty::On;
            }
        }

        let stdout_tty = host.stdout_is_tty();
        let stdin_tty = host.stdin_is_tty();
        let enabled = resolve_tty(self.enabled, stdout_tty);
        let interactive = resolve_tty(self.interactive, stdout_tty && stdin_tty);
        let color = resolve_tty(self.color, stdout_tty);

        let preset = match self.preset {
            Preset::Auto if interactive => Preset::Friendly,
            Preset::Auto => Preset::Full,
            preset => preset,
        };

        let output = match self.output_to {
            OutputTo::Auto if interactive => ResolvedOutput::Stdout,
            OutputTo::Auto => ResolvedOutput::Stderr,
            OutputTo::Stdout => ResolvedOutput::Stdout,
            OutputTo::Stderr => ResolvedOutput::Stderr,
            OutputTo::File => ResolvedOutput::File,
        };

        let algorithm = match self.algorithm {
            UnwindAlgorithm::Auto if enabled => UnwindAlgorithm::Precise,
            algorithm => algorithm,
        };

        let output_path = match output {
            ResolvedOutput::File => self.output_path,
            _ => None,
        };

        Resolution {
            settings: FrozenSettings {
                algorithm,
                enabled,
                demangle: self.demangle,
                interactive,
                color,
                timeout: self.timeout,
                threads: self.threads,
                registers: self.registers,
                images: self.images,
                limit: self.limit,
                top: self.top,
                sanitize: self.sanitize,
                preset,
                cache: self.cache,
                output,
                symbolicate: self.symbolicate,
                suppress_warnings: self.suppress_warnings,
                format: self.format,
            },
            backtracer_path: self.backtracer_path,
            output_path,
            warnings,
        }
    }
}

/// `Default` has been replaced for `enabled` by now, and `interactive` and `color` never start
/// out as `Default`. A stray one counts as off.
fn resolve_tty(value: OnOffTty, is_tty: bool) -> bool {
    match value {
        OnOffTty::On => true,
        OnOffTty::Off | OnOffTty::Default => false,
        OnOffTty::Tty => is_tty,
    }
}
