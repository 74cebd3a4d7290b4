// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Environment variable holding the `key=value,...` backtracing settings.
pub const DD_BACKTRACE_SETTINGS_VAR: &str = "DD_BACKTRACE";

/// Environment variable overriding the discovered installation root.
pub const DD_BACKTRACE_ROOT_VAR: &str = "DD_BACKTRACE_ROOT";

/// Name of the out-of-process backtracer executable.
pub const DD_BACKTRACER_EXECUTABLE: &str = "dd-backtrace";

/// Vault buffers are write-protected page by page, so their sizes must be a multiple of the
/// largest page size we run on (16k pages on Apple silicon and some arm64 Linux kernels).
pub const DD_BACKTRACE_MAX_PAGE_SIZE: usize = 16384;
pub const DD_BACKTRACE_PATH_SIZE: usize = 16384;
pub const DD_BACKTRACE_ENVIRONMENT_SIZE: usize = 32768;
pub const DD_BACKTRACE_OUTPUT_PATH_SIZE: usize = 16384;

const _: () = assert!(DD_BACKTRACE_PATH_SIZE % DD_BACKTRACE_MAX_PAGE_SIZE == 0);
const _: () = assert!(DD_BACKTRACE_ENVIRONMENT_SIZE % DD_BACKTRACE_MAX_PAGE_SIZE == 0);
const _: () = assert!(DD_BACKTRACE_OUTPUT_PATH_SIZE % DD_BACKTRACE_MAX_PAGE_SIZE == 0);

/// The only environment variables forwarded to the backtracer. They are copied at startup and
/// write protected along with the rest of the vault.
pub const DD_BACKTRACE_FORWARDED_ENV_VARS: [&str; 7] = [
    "LD_LIBRARY_PATH",
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    "PATH",
    "TERM",
    "LANG",
    "HOME",
];

/// Setting placed first in the backtracer's environment so it never backtraces itself.
pub const DD_BACKTRACE_RECURSION_GUARD: &str = "enable=no";

/// The backtracer finds the memory server on this descriptor.
pub const DD_BACKTRACE_MEMSERVER_FD: i32 = 4;

/// Largest memory range the memory server answers in one response.
pub const DD_BACKTRACE_MEMSERVER_MAX_REQUEST: usize = 4096;

/// Upper bound on the number of threads described in a crash context.
pub const DD_BACKTRACE_MAX_THREADS: usize = 512;

/// Size of the crash-log annotation buffer.
pub const DD_BACKTRACE_ANNOTATION_SIZE: usize = 4096;

/// Defaults, mirrored by `BacktraceSettings::default()`.
pub const DD_BACKTRACE_DEFAULT_TIMEOUT_SECS: u32 = 30;
pub const DD_BACKTRACE_DEFAULT_LIMIT: i32 = 64;
pub const DD_BACKTRACE_DEFAULT_TOP: u32 = 16;
