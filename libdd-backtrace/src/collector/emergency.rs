// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::annotation::crash_annotation;
use super::crash_scope::CrashScope;
use crate::settings::{FrozenSettings, ResolvedOutput};
use crate::shared::fmt::{FixedBuf, NumberBuf};
use crate::unix_utils::write_all;
use std::os::fd::RawFd;

const LINE_CAPACITY: usize = 128;

/// Writes the one-line "program crashed" notice before the backtracer takes over, so there is
/// something on the terminal even if the backtracer never runs.
#[derive(Debug, Clone, Copy)]
pub struct EmergencyReporter {
    color: bool,
    output: ResolvedOutput,
}

impl EmergencyReporter {
    pub fn new(settings: &FrozenSettings) -> Self {
        Self {
            color: settings.color(),
            output: settings.output(),
        }
    }

    fn fd(&self) -> RawFd {
        match self.output {
            ResolvedOutput::Stdout => libc::STDOUT_FILENO,
            ResolvedOutput::Stderr | ResolvedOutput::File => libc::STDERR_FILENO,
        }
    }

    pub fn line(&self, signal: i32, pc: usize) -> FixedBuf<LINE_CAPACITY> {
        let mut line = FixedBuf::new();
        if self.color {
            line.push("\n💣 \x1b[91mProgram crashed: ".as_bytes());
        } else {
            line.push(b"\n*** ");
        }
        line.push(b"Signal ")
            .push_number(&NumberBuf::signed(i64::from(signal)));
        if pc == 0 {
            line.push(b": Backtracing");
        } else {
            line.push(b": Backtracing from 0x")
                .push_number(&NumberBuf::address(pc as u64));
        }
        if self.color {
            line.push(b"...\x1b[0m");
        } else {
            line.push(b"...");
        }
        line
    }

    /// Writes the notice with raw `write(2)` and appends it to the crash annotation.
    pub fn report(&self, _scope: &CrashScope, signal: i32, pc: usize) {
        let line = self.line(signal, pc);
        // Best effort; the backtracer still runs if the terminal is gone.
        let _ = write_all(self.fd(), line.as_bytes());
        crash_annotation().append(line.as_bytes());
    }
}
