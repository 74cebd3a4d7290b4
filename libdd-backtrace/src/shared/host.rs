// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Queries about the process environment that settings resolution depends on.
//!
//! These are traits so that resolution and vault population can be exercised with simulated
//! terminals, privileged processes and environments, without touching the real process state.

use std::collections::HashMap;

/// Source of environment variable values.
pub trait EnvSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads the real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl EnvSource for [(&str, &str)] {
    fn var(&self, name: &str) -> Option<String> {
        self.iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    }
}

pub trait HostProbe {
    fn stdin_is_tty(&self) -> bool;
    fn stdout_is_tty(&self) -> bool;
    /// Whether the process runs with elevated privileges it did not get from its invoker
    /// (setuid/setgid, file capabilities). Such processes must never exec helpers on our behalf.
    fn is_privileged(&self) -> bool;
    /// Locates an auxiliary executable shipped alongside the runtime.
    fn find_auxiliary_executable(&self, name: &str) -> Option<String>;
}

/// Probes the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl HostProbe for SystemHost {
    #[cfg(unix)]
    fn stdin_is_tty(&self) -> bool {
        // SAFETY: isatty has no preconditions.
        unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
    }

    #[cfg(unix)]
    fn stdout_is_tty(&self) -> bool {
        // SAFETY: isatty has no preconditions.
        unsafe { libc::isatty(libc::STDOUT_FILENO) == 1 }
    }

    #[cfg(not(unix))]
    fn stdin_is_tty(&self) -> bool {
        use std::io::IsTerminal;
        std::io::stdin().is_terminal()
    }

    #[cfg(not(unix))]
    fn stdout_is_tty(&self) -> bool {
        use std::io::IsTerminal;
        std::io::stdout().is_terminal()
    }

    fn is_privileged(&self) -> bool {
        is_privileged_process()
    }

    fn find_auxiliary_executable(&self, name: &str) -> Option<String> {
        super::paths::find_auxiliary_executable(name, &ProcessEnv)
            .and_then(|path| path.into_os_string().into_string().ok())
    }
}

#[cfg(target_os = "linux")]
fn is_privileged_process() -> bool {
    // SAFETY: getauxval has no preconditions.
    unsafe { libc::getauxval(libc::AT_SECURE) != 0 }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
fn is_privileged_process() -> bool {
    // SAFETY: issetugid has no preconditions.
    unsafe { libc::issetugid() != 0 }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
)))]
fn is_privileged_process() -> bool {
    false
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A host whose answers are fixed up front.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeHost {
        pub stdin_tty: bool,
        pub stdout_tty: bool,
        pub privileged: bool,
        pub backtracer: Option<String>,
    }

    impl FakeHost {
        pub(crate) fn with_backtracer() -> Self {
            Self {
                backtracer: Some("/opt/dd/libexec/dd-backtrace".to_string()),
                ..Default::default()
            }
        }
    }

    impl HostProbe for FakeHost {
        fn stdin_is_tty(&self) -> bool {
            self.stdin_tty
        }

        fn stdout_is_tty(&self) -> bool {
            self.stdout_tty
        }

        fn is_privileged(&self) -> bool {
            self.privileged
        }

        fn find_auxiliary_executable(&self, _name: &str) -> Option<String> {
            self.backtracer.clone()
        }
    }

    #[test]
    fn test_slice_env_source() {
        let env: &[(&str, &str)] = &[("PATH", "/bin"), ("HOME", "/root")];
        assert_eq!(env.var("HOME").as_deref(), Some("/root"));
        assert_eq!(env.var("TERM"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_test_runner_is_not_privileged() {
        assert!(!SystemHost.is_privileged());
    }
}
