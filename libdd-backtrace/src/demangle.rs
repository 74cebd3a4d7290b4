// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Symbol demangling for backtracers and other tools built on this crate.

use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

/// Demangles `mangled`. Returns `None` if it is not a mangled name we understand.
pub fn demangle_symbol(mangled: &str) -> Option<String> {
    match Name::from(mangled).demangle(DemangleOptions::complete()) {
        Some(demangled) if demangled != mangled => Some(demangled),
        _ => None,
    }
}

/// Demangles `mangled` into `buffer`, truncating if needed and always NUL terminating a
/// non-empty buffer. Returns the full length of the demangled name, excluding the terminator,
/// so callers can retry with a larger buffer.
pub fn demangle_into(mangled: &str, buffer: &mut [u8]) -> Option<usize> {
    let demangled = demangle_symbol(mangled)?;
    if let Some(room) = buffer.len().checked_sub(1) {
        let copied = demangled.len().min(room);
        buffer[..copied].copy_from_slice(&demangled.as_bytes()[..copied]);
        buffer[copied] = 0;
    }
    Some(demangled.len())
}

// Itanium special names for this-adjusting, virtual and covariant-return thunks.
const ITANIUM_THUNK_PREFIXES: [&str; 3] = ["ZTh", "ZTv", "ZTc"];

// How thunks and compiler shims read once demangled.
const DEMANGLED_THUNK_MARKERS: [&str; 5] = [
    "virtual thunk to ",
    "covariant return thunk to ",
    "{vtable.shim}",
    "{reify.shim}",
    "{shim:",
];

/// Whether `mangled` names a thunk or compiler-generated shim. Backtraces usually hide such
/// frames: they only forward to the function that follows them on the stack.
pub fn is_thunk_function(mangled: &str) -> bool {
    // Mach-O symbols carry one more leading underscore than ELF ones.
    let itanium = mangled.trim_start_matches('_');
    if mangled.starts_with('_')
        && ITANIUM_THUNK_PREFIXES
            .iter()
            .any(|prefix| itanium.starts_with(prefix))
    {
        return true;
    }
    demangle_symbol(mangled).is_some_and(|demangled| is_thunk_name(&demangled))
}

fn is_thunk_name(demangled: &str) -> bool {
    DEMANGLED_THUNK_MARKERS
        .iter()
        .any(|marker| demangled.contains(marker))
}
