// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::constants::DD_BACKTRACE_ROOT_VAR;
use super::host::EnvSource;
use std::path::{Path, PathBuf};

/// The installation root: `DD_BACKTRACE_ROOT` if set, else the parent of the directory holding
/// the running executable (`<root>/bin/app` gives `<root>`).
pub fn root_path(env: &(impl EnvSource + ?Sized)) -> Option<PathBuf> {
    if let Some(root) = env.var(DD_BACKTRACE_ROOT_VAR).filter(|r| !r.is_empty()) {
        return Some(PathBuf::from(root));
    }
    let exe = std::env::current_exe().ok()?;
    let bin_dir = exe.parent()?;
    Some(bin_dir.parent().unwrap_or(bin_dir).to_path_buf())
}

/// Looks for `name` in the places an installation puts auxiliary executables, most specific
/// first. Returns the first candidate that exists and is executable.
pub fn find_auxiliary_executable(name: &str, env: &(impl EnvSource + ?Sized)) -> Option<PathBuf> {
    let root = root_path(env)?;
    candidate_dirs(&root)
        .into_iter()
        .map(|dir| dir.join(name))
        .find(|path| is_executable(path))
}

fn candidate_dirs(root: &Path) -> Vec<PathBuf> {
    let libexec = root.join("libexec").join("dd-backtrace");
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    vec![
        libexec.join(os),
        libexec.join(os).join(arch),
        libexec.clone(),
        libexec.join(arch),
        root.join("bin"),
        root.join("bin").join(arch),
        root.to_path_buf(),
    ]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
