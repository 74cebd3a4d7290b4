// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Write-protected storage for what the crash handler hands to the backtracer.
//!
//! The backtracer path, its environment and the report output path are the only inputs to an
//! `execve` performed from a signal handler. An attacker able to overwrite them (for example
//! through a heap overflow that precedes the crash) could make a crashing process run an
//! arbitrary program. They are therefore copied into static, page-aligned buffers at startup and
//! the pages are made read-only before the crash handler is installed.
//!
//! The lifecycle is encoded in types: a claimed [`VaultStorage`] is filled by
//! [`VaultWriter::populate`], and [`VaultWriter::freeze`] consumes the writer and returns a
//! [`FrozenVault`], which only hands out shared views.

use crate::shared::constants::*;
use crate::shared::host::EnvSource;
use std::cell::UnsafeCell;
use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicBool, Ordering};

#[repr(C, align(16384))]
struct PageAligned<const N: usize>([u8; N]);

const _: () = assert!(std::mem::align_of::<PageAligned<1>>() == DD_BACKTRACE_MAX_PAGE_SIZE);

/// The three vault buffers. Each is page aligned and a whole number of pages long, so protecting
/// one never affects unrelated data.
#[repr(C)]
pub struct VaultStorage {
    path: PageAligned<DD_BACKTRACE_PATH_SIZE>,
    environment: PageAligned<DD_BACKTRACE_ENVIRONMENT_SIZE>,
    output_path: PageAligned<DD_BACKTRACE_OUTPUT_PATH_SIZE>,
}

struct ProcessVault {
    claimed: AtomicBool,
    storage: UnsafeCell<VaultStorage>,
}

// SAFETY: `storage` is handed out at most once, guarded by `claimed`.
unsafe impl Sync for ProcessVault {}

static PROCESS_VAULT: ProcessVault = ProcessVault {
    claimed: AtomicBool::new(false),
    storage: UnsafeCell::new(VaultStorage {
        path: PageAligned([0; DD_BACKTRACE_PATH_SIZE]),
        environment: PageAligned([0; DD_BACKTRACE_ENVIRONMENT_SIZE]),
        output_path: PageAligned([0; DD_BACKTRACE_OUTPUT_PATH_SIZE]),
    }),
};

impl VaultStorage {
    /// Claims the process-wide vault. Only the first call succeeds.
    pub fn process() -> Option<&'static mut VaultStorage> {
        PROCESS_VAULT
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        // SAFETY: the CAS above guarantees this is the only reference ever created.
        Some(unsafe { &mut *PROCESS_VAULT.storage.get() })
    }

    /// Fresh zeroed storage on the heap, never freed. Lets tests run several vaults in one
    /// process.
    #[cfg(test)]
    pub(crate) fn leaked() -> &'static mut VaultStorage {
        let layout = std::alloc::Layout::new::<VaultStorage>();
        // SAFETY: the layout has a non-zero size; all-zero bytes are a valid VaultStorage.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) }.cast::<VaultStorage>();
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        // SAFETY: freshly allocated, properly aligned and initialised, and never freed.
        unsafe { &mut *ptr }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultWarning {
    #[error("backtracer path is too long ({len} bytes, limit {limit})")]
    BacktracerPathTooLong { len: usize, limit: usize },
    #[error("backtracer path contains a NUL byte")]
    BacktracerPathInvalid,
    #[error("output path is too long ({len} bytes, limit {limit}); using the default output")]
    OutputPathTooLong { len: usize, limit: usize },
    #[error("output path contains a NUL byte; using the default output")]
    OutputPathInvalid,
    #[error("environment variable {name} does not fit in the backtracer environment; skipped")]
    EnvironmentTooLong { name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("page size {0} does not divide the vault buffer size")]
    UnsupportedPageSize(usize),
    #[error("unable to write protect the {buffer} buffer: {source}")]
    WriteProtect {
        buffer: &'static str,
        source: nix::Error,
    },
}

/// Exclusive access to the vault while it is being filled.
pub struct VaultWriter {
    storage: &'static mut VaultStorage,
    path_len: Option<usize>,
    environment_len: usize,
    output_path_len: Option<usize>,
}

/// Copies `value` plus a NUL terminator, refusing values that would not leave room for it.
fn copy_c_string(buffer: &mut [u8], value: &str) -> Result<usize, (usize, usize)> {
    let limit = buffer.len() - 1;
    if value.len() > limit {
        return Err((value.len(), limit));
    }
    buffer[..value.len()].copy_from_slice(value.as_bytes());
    buffer[value.len()] = 0;
    Ok(value.len())
}

impl VaultWriter {
    /// Fills the vault. Problems never abort population: they are reported as warnings and the
    /// affected field is left empty.
    pub fn populate(
        storage: &'static mut VaultStorage,
        backtracer_path: &str,
        env: &(impl EnvSource + ?Sized),
        output_path: Option<&str>,
        settings_var: &str,
    ) -> (VaultWriter, Vec<VaultWarning>) {
        let mut warnings = vec![];
        storage.path.0.fill(0);
        storage.environment.0.fill(0);
        storage.output_path.0.fill(0);

        let path_len = if backtracer_path.contains('\0') {
            warnings.push(VaultWarning::BacktracerPathInvalid);
            None
        } else {
            match copy_c_string(&mut storage.path.0, backtracer_path) {
                Ok(len) => Some(len),
                Err((len, limit)) => {
                    warnings.push(VaultWarning::BacktracerPathTooLong { len, limit });
                    None
                }
            }
        };

        let environment_len = fill_environment(
            &mut storage.environment.0,
            env,
            settings_var,
            &mut warnings,
        );

        let output_path_len = output_path.and_then(|output_path| {
            if output_path.contains('\0') {
                warnings.push(VaultWarning::OutputPathInvalid);
                return None;
            }
            match copy_c_string(&mut storage.output_path.0, output_path) {
                Ok(len) => Some(len),
                Err((len, limit)) => {
                    warnings.push(VaultWarning::OutputPathTooLong { len, limit });
                    None
                }
            }
        });

        let writer = VaultWriter {
            storage,
            path_len,
            environment_len,
            output_path_len,
        };
        (writer, warnings)
    }

    pub fn has_backtracer_path(&self) -> bool {
        self.path_len.is_some()
    }

    pub fn has_output_path(&self) -> bool {
        self.output_path_len.is_some()
    }

    /// Makes every buffer read-only. On failure the vault is unusable and backtracing must be
    /// turned off.
    pub fn freeze(self) -> Result<FrozenVault, VaultError> {
        let page_size = page_size::get();
        if page_size == 0 || DD_BACKTRACE_MAX_PAGE_SIZE % page_size != 0 {
            return Err(VaultError::UnsupportedPageSize(page_size));
        }
        let storage: &'static VaultStorage = self.storage;
        protect("path", &storage.path.0)?;
        protect("environment", &storage.environment.0)?;
        protect("output path", &storage.output_path.0)?;
        Ok(FrozenVault {
            storage,
            path_len: self.path_len,
            environment_len: self.environment_len,
            output_path_len: self.output_path_len,
        })
    }
}

fn fill_environment(
    buffer: &mut [u8],
    env: &(impl EnvSource + ?Sized),
    settings_var: &str,
    warnings: &mut Vec<VaultWarning>,
) -> usize {
    // One byte is always kept back for the terminating empty entry.
    let capacity = buffer.len() - 1;
    let mut len = 0;
    let mut append = |name: &str, value: &str, warnings: &mut Vec<VaultWarning>| {
        let entry_len = name.len() + 1 + value.len();
        if name.contains('\0') || value.contains('\0') || len + entry_len + 1 > capacity {
            warnings.push(VaultWarning::EnvironmentTooLong {
                name: name.to_string(),
            });
            return;
        }
        let entry = &mut buffer[len..len + entry_len + 1];
        entry[..name.len()].copy_from_slice(name.as_bytes());
        entry[name.len()] = b'=';
        entry[name.len() + 1..entry_len].copy_from_slice(value.as_bytes());
        entry[entry_len] = 0;
        len += entry_len + 1;
    };

    append(settings_var, DD_BACKTRACE_RECURSION_GUARD, warnings);
    for name in DD_BACKTRACE_FORWARDED_ENV_VARS {
        if let Some(value) = env.var(name) {
            append(name, &value, warnings);
        }
    }
    buffer[len] = 0;
    len + 1
}

fn protect(buffer: &'static str, bytes: &[u8]) -> Result<(), VaultError> {
    // SAFETY: `bytes` is a whole number of pages at a page-aligned address, owned by the vault.
    let rc = unsafe {
        libc::mprotect(
            bytes.as_ptr() as *mut libc::c_void,
            bytes.len(),
            libc::PROT_READ,
        )
    };
    if rc != 0 {
        return Err(VaultError::WriteProtect {
            buffer,
            source: nix::Error::last(),
        });
    }
    Ok(())
}

/// Read-only view of a populated, write-protected vault.
#[derive(Clone, Copy)]
pub struct FrozenVault {
    storage: &'static VaultStorage,
    path_len: Option<usize>,
    environment_len: usize,
    output_path_len: Option<usize>,
}

impl std::fmt::Debug for FrozenVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenVault")
            .field("backtracer_path", &self.backtracer_path())
            .field("output_path", &self.output_path())
            .field("environment_len", &self.environment_len)
            .finish()
    }
}

impl FrozenVault {
    /// The backtracer path, NUL terminated.
    pub fn backtracer_path(&self) -> Option<&'static CStr> {
        let len = self.path_len?;
        CStr::from_bytes_with_nul(&self.storage.path.0[..=len]).ok()
    }

    pub fn backtracer_path_ptr(&self) -> *const c_char {
        match self.path_len {
            Some(_) => self.storage.path.0.as_ptr().cast(),
            None => std::ptr::null(),
        }
    }

    pub fn output_path(&self) -> Option<&'static CStr> {
        let len = self.output_path_len?;
        CStr::from_bytes_with_nul(&self.storage.output_path.0[..=len]).ok()
    }

    pub fn output_path_ptr(&self) -> *const c_char {
        match self.output_path_len {
            Some(_) => self.storage.output_path.0.as_ptr().cast(),
            None => std::ptr::null(),
        }
    }

    /// The raw environment block, including the terminating empty entry.
    pub fn environment_block(&self) -> &'static [u8] {
        &self.storage.environment.0[..self.environment_len]
    }

    /// The `NAME=value` entries. Each yielded slice is followed by a NUL byte in memory, so its
    /// pointer can be passed to `execve` as is.
    pub fn environment(&self) -> EnvironmentEntries {
        EnvironmentEntries {
            rest: self.environment_block(),
        }
    }
}

pub struct EnvironmentEntries {
    rest: &'static [u8],
}

impl Iterator for EnvironmentEntries {
    type Item = &'static [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.rest.iter().position(|b| *b == 0)?;
        if end == 0 {
            return None;
        }
        let entry = &self.rest[..end];
        self.rest = &self.rest[end + 1..];
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS_VAR: &str = "DD_BACKTRACE";

    fn env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PATH", "/usr/bin:/bin"),
            ("HOME", "/home/dd"),
            ("SECRET_TOKEN", "hunter2"),
            ("LD_PRELOAD", "/tmp/evil.so"),
            ("TERM", "xterm"),
        ]
    }

    fn populate(
        path: &str,
        output: Option<&str>,
        env: &[(&str, &str)],
    ) -> (VaultWriter, Vec<VaultWarning>) {
        VaultWriter::populate(VaultStorage::leaked(), path, env, output, SETTINGS_VAR)
    }

    #[test]
    fn test_environment_block() {
        let (writer, warnings) = populate("/opt/dd-backtrace", None, &env());
        assert!(warnings.is_empty(), "{warnings:?}");
        let vault = writer.freeze().unwrap();

        let entries: Vec<&[u8]> = vault.environment().collect();
        assert_eq!(
            entries,
            vec![
                b"DD_BACKTRACE=enable=no".as_slice(),
                b"PATH=/usr/bin:/bin",
                b"TERM=xterm",
                b"HOME=/home/dd",
            ]
        );
        assert!(vault.environment_block().ends_with(b"HOME=/home/dd\0\0"));
    }

    #[test]
    fn test_paths_are_nul_terminated() {
        let (writer, _) = populate("/opt/dd-backtrace", Some("/tmp/report.json"), &[]);
        assert!(writer.has_backtracer_path());
        assert!(writer.has_output_path());
        let vault = writer.freeze().unwrap();
        assert_eq!(
            vault.backtracer_path().unwrap().to_bytes(),
            b"/opt/dd-backtrace"
        );
        assert_eq!(vault.output_path().unwrap().to_bytes(), b"/tmp/report.json");
        // SAFETY: the pointer refers to a NUL terminated string in the vault.
        let from_ptr = unsafe { CStr::from_ptr(vault.backtracer_path_ptr()) };
        assert_eq!(from_ptr.to_bytes(), b"/opt/dd-backtrace");
    }

    #[test]
    fn test_overlong_path_leaves_neighbours_intact() {
        let long_path = "x".repeat(DD_BACKTRACE_PATH_SIZE);
        let (writer, warnings) = populate(&long_path, Some("/tmp/out"), &env());
        assert_eq!(
            warnings,
            vec![VaultWarning::BacktracerPathTooLong {
                len: DD_BACKTRACE_PATH_SIZE,
                limit: DD_BACKTRACE_PATH_SIZE - 1
            }]
        );
        assert!(!writer.has_backtracer_path());
        let vault = writer.freeze().unwrap();
        assert!(vault.backtracer_path().is_none());
        assert!(vault.backtracer_path_ptr().is_null());
        assert_eq!(vault.output_path().unwrap().to_bytes(), b"/tmp/out");
        assert!(vault
            .environment_block()
            .starts_with(b"DD_BACKTRACE=enable=no\0"));
    }

    #[test]
    fn test_path_at_capacity() {
        let path = "p".repeat(DD_BACKTRACE_PATH_SIZE - 1);
        let (writer, warnings) = populate(&path, None, &[]);
        assert!(warnings.is_empty());
        let vault = writer.freeze().unwrap();
        assert_eq!(
            vault.backtracer_path().unwrap().to_bytes().len(),
            DD_BACKTRACE_PATH_SIZE - 1
        );
    }

    #[test]
    fn test_overlong_output_path() {
        let long_path = "o".repeat(DD_BACKTRACE_OUTPUT_PATH_SIZE + 10);
        let (writer, warnings) = populate("/bt", Some(&long_path), &[]);
        assert!(matches!(
            warnings.as_slice(),
            [VaultWarning::OutputPathTooLong { .. }]
        ));
        assert!(!writer.has_output_path());
        assert!(writer.freeze().unwrap().output_path().is_none());
    }

    #[test]
    fn test_oversized_variable_is_skipped() {
        let huge = "v".repeat(DD_BACKTRACE_ENVIRONMENT_SIZE);
        let env = [("PATH", huge.as_str()), ("LANG", "C.UTF-8")];
        let (writer, warnings) = populate("/bt", None, &env);
        assert_eq!(
            warnings,
            vec![VaultWarning::EnvironmentTooLong {
                name: "PATH".to_string()
            }]
        );
        let vault = writer.freeze().unwrap();
        let entries: Vec<&[u8]> = vault.environment().collect();
        assert_eq!(
            entries,
            vec![b"DD_BACKTRACE=enable=no".as_slice(), b"LANG=C.UTF-8"]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_frozen_pages_are_read_only() {
        let (writer, _) = populate("/bt", None, &[]);
        let vault = writer.freeze().unwrap();
        let addr = vault.backtracer_path_ptr() as usize;
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
        let perms = maps
            .lines()
            .find_map(|line| {
                let mut fields = line.split_whitespace();
                let range = fields.next()?;
                let perms = fields.next()?;
                let (start, end) = range.split_once('-')?;
                let start = usize::from_str_radix(start, 16).ok()?;
                let end = usize::from_str_radix(end, 16).ok()?;
                (start..end).contains(&addr).then(|| perms.to_string())
            })
            .unwrap();
        assert!(perms.starts_with("r-"), "{perms}");
    }
}
