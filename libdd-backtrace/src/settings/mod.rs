// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backtracing settings.
//!
//! Settings start life as a mutable [`BacktraceSettings`], filled in from the `DD_BACKTRACE`
//! environment variable by the [`parser`]. Before the crash handler is installed they are
//! resolved against the host (terminal state, privilege, location of the backtracer) by
//! [`BacktraceSettings::freeze`], which produces a [`FrozenSettings`]. Only the frozen form is
//! reachable from the crash handler: it is `Copy`, contains no heap data, and reading it never
//! allocates or locks.

pub mod parser;
pub mod resolve;

pub use parser::{SettingWarning, SettingsParser};
pub use resolve::{Resolution, ResolveWarning};

use crate::shared::constants::*;
use serde::{Deserialize, Serialize};

/// A setting that can be forced on or off, follow whether the relevant stream is a terminal, or
/// be left to the platform default.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnOffTty {
    Default,
    On,
    Off,
    Tty,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnwindAlgorithm {
    Auto,
    Fast,
    Precise,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadsToShow {
    Preset,
    All,
    Crashed,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistersToShow {
    Preset,
    None,
    All,
    Crashed,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagesToShow {
    Preset,
    None,
    All,
    Mentioned,
}

/// Whether the backtracer should redact local filesystem paths.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SanitizePaths {
    Preset,
    On,
    Off,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    Auto,
    Friendly,
    Medium,
    Full,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputTo {
    Auto,
    Stdout,
    Stderr,
    File,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symbolication {
    Off,
    Fast,
    Full,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Where the report goes once `OutputTo::Auto` has been resolved.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedOutput {
    Stdout,
    Stderr,
    File,
}

/// Mutable settings, as parsed from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktraceSettings {
    pub algorithm: UnwindAlgorithm,
    pub enabled: OnOffTty,
    pub demangle: bool,
    pub interactive: OnOffTty,
    pub color: OnOffTty,
    /// Seconds; 0 means no limit.
    pub timeout: u32,
    pub threads: ThreadsToShow,
    pub registers: RegistersToShow,
    pub images: ImagesToShow,
    /// Maximum number of frames; -1 means unbounded.
    pub limit: i32,
    pub top: u32,
    pub sanitize: SanitizePaths,
    pub preset: Preset,
    pub cache: bool,
    pub output_to: OutputTo,
    pub symbolicate: Symbolication,
    pub suppress_warnings: bool,
    pub format: OutputFormat,
    pub backtracer_path: Option<String>,
    pub output_path: Option<String>,
}

impl Default for BacktraceSettings {
    fn default() -> Self {
        Self {
            algorithm: UnwindAlgorithm::Auto,
            enabled: OnOffTty::Default,
            demangle: true,
            interactive: if cfg!(any(target_os = "linux", target_os = "macos")) {
                OnOffTty::Tty
            } else {
                OnOffTty::Off
            },
            color: OnOffTty::Tty,
            timeout: DD_BACKTRACE_DEFAULT_TIMEOUT_SECS,
            threads: ThreadsToShow::Preset,
            registers: RegistersToShow::Preset,
            images: ImagesToShow::Preset,
            limit: DD_BACKTRACE_DEFAULT_LIMIT,
            top: DD_BACKTRACE_DEFAULT_TOP,
            sanitize: SanitizePaths::Preset,
            preset: Preset::Auto,
            cache: true,
            output_to: OutputTo::Auto,
            symbolicate: Symbolication::Full,
            suppress_warnings: false,
            format: OutputFormat::Text,
            backtracer_path: None,
            output_path: None,
        }
    }
}

/// Settings after resolution. Every tri-state has become a boolean and every `Auto` has been
/// replaced, so the crash handler never has to consult the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenSettings {
    algorithm: UnwindAlgorithm,
    enabled: bool,
    demangle: bool,
    interactive: bool,
    color: bool,
    timeout: u32,
    threads: ThreadsToShow,
    registers: RegistersToShow,
    images: ImagesToShow,
    limit: i32,
    top: u32,
    sanitize: SanitizePaths,
    preset: Preset,
    cache: bool,
    output: ResolvedOutput,
    symbolicate: Symbolication,
    suppress_warnings: bool,
    format: OutputFormat,
}

impl FrozenSettings {
    pub fn algorithm(&self) -> UnwindAlgorithm {
        self.algorithm
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn demangle(&self) -> bool {
        self.demangle
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    pub fn color(&self) -> bool {
        self.color
    }

    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    pub fn threads(&self) -> ThreadsToShow {
        self.threads
    }

    pub fn registers(&self) -> RegistersToShow {
        self.registers
    }

    pub fn images(&self) -> ImagesToShow {
        self.images
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    pub fn top(&self) -> u32 {
        self.top
    }

    pub fn sanitize(&self) -> SanitizePaths {
        self.sanitize
    }

    pub fn preset(&self) -> Preset {
        self.preset
    }

    pub fn cache(&self) -> bool {
        self.cache
    }

    pub fn output(&self) -> ResolvedOutput {
        self.output
    }

    pub fn symbolicate(&self) -> Symbolication {
        self.symbolicate
    }

    pub fn suppress_warnings(&self) -> bool {
        self.suppress_warnings
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Turns backtracing off after the fact. Used during initialisation when a later step (vault
    /// population, write protection, handler installation) fails.
    pub(crate) fn disable(&mut self) {
        self.enabled = false;
    }

    /// Falls back to the terminal streams when the output file cannot be stored.
    pub(crate) fn drop_output_file(&mut self) {
        if self.output == ResolvedOutput::File {
            self.output = if self.interactive {
                ResolvedOutput::Stdout
            } else {
                ResolvedOutput::Stderr
            };
        }
    }
}
