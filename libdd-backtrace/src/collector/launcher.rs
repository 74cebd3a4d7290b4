// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - clone (Linux) / posix_spawn (macOS)
// - close
// - dup2
// - execve
// - fcntl
// - sigaction
// - sigprocmask
// - waitpid
// - _exit

use super::crash_scope::CrashScope;
#[cfg(target_os = "linux")]
use super::memserver::{MemoryServer, MemserverChannel};
use super::vault::FrozenVault;
use crate::settings::{
    FrozenSettings, ImagesToShow, OutputFormat, Preset, RegistersToShow, ResolvedOutput,
    SanitizePaths, Symbolication, ThreadsToShow, UnwindAlgorithm,
};
use crate::shared::constants::DD_BACKTRACE_FORWARDED_ENV_VARS;
use crate::shared::crash_context::CrashContext;
use crate::shared::fmt::NumberBuf;
use crate::unix_utils::{reap_child_blocking, ReapError};
use nix::unistd::Pid;
use std::ffi::{c_char, CStr};
use std::ptr;

/// Program name, 17 flag/value pairs and the terminating null.
pub const ARGV_CAPACITY: usize = 36;
/// The recursion guard, every forwarded variable and the terminating null.
pub const ENVP_CAPACITY: usize = DD_BACKTRACE_FORWARDED_ENV_VARS.len() + 2;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("No backtracer path available")]
    NoBacktracerPath,
    #[error("Another backtracer spawn is in progress")]
    Busy,
    #[error("Failed to spawn the backtracer: {0}")]
    Spawn(nix::Error),
    #[error("Failed to reap the backtracer: {0}")]
    Reap(#[from] ReapError),
}

/// Spawns the backtracer from the crash handler.
///
/// Holds nothing but frozen settings and a frozen vault, so it is `Copy` and every read it does
/// is a plain memory load.
#[derive(Debug, Clone, Copy)]
pub struct Launcher {
    settings: FrozenSettings,
    vault: FrozenVault,
}

/// Stack storage for the numeric arguments; `argv` points into it.
pub struct ArgvNumbers {
    timeout: NumberBuf,
    limit: NumberBuf,
    top: NumberBuf,
    crashinfo: NumberBuf,
}

fn true_or_false(value: bool) -> &'static CStr {
    if value {
        c"true"
    } else {
        c"false"
    }
}

impl Launcher {
    pub fn new(settings: FrozenSettings, vault: FrozenVault) -> Self {
        Self { settings, vault }
    }

    pub fn settings(&self) -> &FrozenSettings {
        &self.settings
    }

    pub fn vault(&self) -> &FrozenVault {
        &self.vault
    }

    pub fn argv_numbers(&self, crash_context: *const CrashContext) -> ArgvNumbers {
        let settings = &self.settings;
        ArgvNumbers {
            timeout: NumberBuf::unsigned(u64::from(settings.timeout())),
            limit: NumberBuf::signed(i64::from(settings.limit())),
            top: NumberBuf::unsigned(u64::from(settings.top())),
            crashinfo: NumberBuf::address(crash_context as usize as u64),
        }
    }

    /// Builds the backtracer's command line. The result borrows `numbers` and the vault.
    pub fn argv(&self, numbers: &ArgvNumbers) -> [*const c_char; ARGV_CAPACITY] {
        let settings = &self.settings;
        let unwind = match settings.algorithm() {
            UnwindAlgorithm::Auto => c"auto",
            UnwindAlgorithm::Fast => c"fast",
            UnwindAlgorithm::Precise => c"precise",
        };
        let timeout = if settings.timeout() == 0 {
            c"none".as_ptr()
        } else {
            numbers.timeout.as_c_ptr()
        };
        let preset = match settings.preset() {
            // Resolution replaces Auto; if it survives, let the backtracer pick.
            Preset::Auto | Preset::Full => c"full",
            Preset::Friendly => c"friendly",
            Preset::Medium => c"medium",
        };
        let threads = match settings.threads() {
            ThreadsToShow::Preset => c"preset",
            ThreadsToShow::All => c"all",
            ThreadsToShow::Crashed => c"crashed",
        };
        let registers = match settings.registers() {
            RegistersToShow::Preset => c"preset",
            RegistersToShow::None => c"none",
            RegistersToShow::All => c"all",
            RegistersToShow::Crashed => c"crashed",
        };
        let images = match settings.images() {
            ImagesToShow::Preset => c"preset",
            ImagesToShow::None => c"none",
            ImagesToShow::All => c"all",
            ImagesToShow::Mentioned => c"mentioned",
        };
        let limit = if settings.limit() < 0 {
            c"none".as_ptr()
        } else {
            numbers.limit.as_c_ptr()
        };
        let sanitize = match settings.sanitize() {
            SanitizePaths::Preset => c"preset",
            SanitizePaths::On => c"true",
            SanitizePaths::Off => c"false",
        };
        let output_to = match settings.output() {
            ResolvedOutput::Stdout => c"stdout".as_ptr(),
            ResolvedOutput::Stderr => c"stderr".as_ptr(),
            ResolvedOutput::File => {
                let path = self.vault.output_path_ptr();
                if path.is_null() {
                    c"stderr".as_ptr()
                } else {
                    path
                }
            }
        };
        let symbolicate = match settings.symbolicate() {
            Symbolication::Off => c"off",
            Symbolication::Fast => c"fast",
            Symbolication::Full => c"full",
        };
        let format = match settings.format() {
            OutputFormat::Text => c"text",
            OutputFormat::Json => c"json",
        };

        [
            c"dd-backtrace".as_ptr(),
            c"--unwind".as_ptr(),
            unwind.as_ptr(),
            c"--demangle".as_ptr(),
            true_or_false(settings.demangle()).as_ptr(),
            c"--interactive".as_ptr(),
            true_or_false(settings.interactive()).as_ptr(),
            c"--color".as_ptr(),
            true_or_false(settings.color()).as_ptr(),
            c"--timeout".as_ptr(),
            timeout,
            c"--preset".as_ptr(),
            preset.as_ptr(),
            c"--crashinfo".as_ptr(),
            numbers.crashinfo.as_c_ptr(),
            c"--threads".as_ptr(),
            threads.as_ptr(),
            c"--registers".as_ptr(),
            registers.as_ptr(),
            c"--images".as_ptr(),
            images.as_ptr(),
            c"--limit".as_ptr(),
            limit,
            c"--top".as_ptr(),
            numbers.top.as_c_ptr(),
            c"--sanitize".as_ptr(),
            sanitize.as_ptr(),
            c"--cache".as_ptr(),
            true_or_false(settings.cache()).as_ptr(),
            c"--output-to".as_ptr(),
            output_to,
            c"--symbolicate".as_ptr(),
            symbolicate.as_ptr(),
            c"--format".as_ptr(),
            format.as_ptr(),
            ptr::null(),
        ]
    }

    /// Splits the frozen environment block into `execve`'s `envp`.
    pub fn envp(&self) -> [*const c_char; ENVP_CAPACITY] {
        let mut envp = [ptr::null(); ENVP_CAPACITY];
        for (slot, entry) in envp[..ENVP_CAPACITY - 1]
            .iter_mut()
            .zip(self.vault.environment())
        {
            *slot = entry.as_ptr().cast();
        }
        envp
    }

    /// Runs the backtracer against `crash_context` and waits for it. On Linux the backtracer
    /// reads our memory through `memserver`, which is served until it closes its end.
    ///
    /// Returns true iff the backtracer exited with status 0. Never fails loudly: whatever goes
    /// wrong, the caller carries on with the default fatal-signal behaviour.
    pub fn spawn_backtracer(
        &self,
        scope: &CrashScope,
        crash_context: *const CrashContext,
        #[cfg(target_os = "linux")] memserver: Option<MemserverChannel>,
    ) -> bool {
        #[cfg(target_os = "linux")]
        let result = self.try_spawn_backtracer(scope, crash_context, memserver);
        #[cfg(not(target_os = "linux"))]
        let result = self.try_spawn_backtracer(scope, crash_context);
        matches!(result, Ok(true))
    }

    #[cfg(target_os = "linux")]
    fn try_spawn_backtracer(
        &self,
        scope: &CrashScope,
        crash_context: *const CrashContext,
        mut memserver: Option<MemserverChannel>,
    ) -> Result<bool, SpawnError> {
        let path = self.vault.backtracer_path_ptr();
        if path.is_null() {
            return Err(SpawnError::NoBacktracerPath);
        }
        let numbers = self.argv_numbers(crash_context);
        let argv = self.argv(&numbers);
        let envp = self.envp();
        let memserver_fd = memserver.as_ref().map_or(-1, |m| m.client_fd());

        let pid = linux_spawn::spawn(scope, path, &argv, &envp, memserver_fd)?;

        if let Some(channel) = memserver.as_mut() {
            // The child has exec'd (or died), so our copy of its end can go; once the backtracer
            // exits the server sees end of file.
            channel.close_client();
            MemoryServer::new(channel.server_fd()).serve(scope);
        }
        drop(memserver);

        Ok(reap_child_blocking(pid)?)
    }

    #[cfg(not(target_os = "linux"))]
    fn try_spawn_backtracer(
        &self,
        _scope: &CrashScope,
        crash_context: *const CrashContext,
    ) -> Result<bool, SpawnError> {
        let path = self.vault.backtracer_path_ptr();
        if path.is_null() {
            return Err(SpawnError::NoBacktracerPath);
        }
        let numbers = self.argv_numbers(crash_context);
        let argv = self.argv(&numbers);
        let envp = self.envp();

        let mut pid: libc::pid_t = 0;
        // SAFETY: argv and envp are null terminated arrays of C strings that outlive the call.
        let rc = unsafe {
            libc::posix_spawn(
                &mut pid,
                path,
                ptr::null(),
                ptr::null(),
                argv.as_ptr() as *const *mut c_char,
                envp.as_ptr() as *const *mut c_char,
            )
        };
        if rc != 0 {
            return Err(SpawnError::Spawn(nix::Error::from_raw(rc)));
        }
        Ok(reap_child_blocking(Pid::from_raw(pid))?)
    }
}

#[cfg(target_os = "linux")]
mod linux_spawn {
    use super::*;
    use crate::shared::constants::DD_BACKTRACE_MEMSERVER_FD;
    use std::cell::UnsafeCell;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SPAWN_STACK_SIZE: usize = 64 * 1024;

    #[repr(C, align(16384))]
    struct SpawnStack(UnsafeCell<[u8; SPAWN_STACK_SIZE]>);

    // SAFETY: only used while `STACK_IN_USE` is held.
    unsafe impl Sync for SpawnStack {}

    static SPAWN_STACK: SpawnStack = SpawnStack(UnsafeCell::new([0; SPAWN_STACK_SIZE]));
    static STACK_IN_USE: AtomicBool = AtomicBool::new(false);

    struct SpawnInfo {
        path: *const c_char,
        argv: *const *const c_char,
        envp: *const *const c_char,
        memserver_fd: i32,
    }

    /// Starts the child with `clone(CLONE_VM | CLONE_VFORK)`: no atfork handlers run, no memory
    /// is copied, and we do not resume until the child has exec'd or exited, so it may read
    /// `info` from our stack.
    pub(super) fn spawn(
        _scope: &CrashScope,
        path: *const c_char,
        argv: &[*const c_char; ARGV_CAPACITY],
        envp: &[*const c_char; ENVP_CAPACITY],
        memserver_fd: i32,
    ) -> Result<Pid, SpawnError> {
        if STACK_IN_USE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SpawnError::Busy);
        }
        let mut info = SpawnInfo {
            path,
            argv: argv.as_ptr(),
            envp: envp.as_ptr(),
            memserver_fd,
        };
        // SAFETY: the stack is ours while `STACK_IN_USE` is held; stacks grow down on every
        // supported architecture, so the child starts at the top.
        let pid = unsafe {
            let stack_top = SPAWN_STACK.0.get().cast::<u8>().add(SPAWN_STACK_SIZE);
            libc::clone(
                spawn_child,
                stack_top.cast(),
                libc::CLONE_VM | libc::CLONE_VFORK | libc::SIGCHLD,
                (&mut info as *mut SpawnInfo).cast(),
            )
        };
        let errno = nix::Error::last();
        STACK_IN_USE.store(false, Ordering::SeqCst);
        if pid < 0 {
            return Err(SpawnError::Spawn(errno));
        }
        Ok(Pid::from_raw(pid))
    }

    extern "C" fn spawn_child(arg: *mut libc::c_void) -> libc::c_int {
        // SAFETY: `arg` is the `SpawnInfo` on the suspended parent's stack.
        let info = unsafe { &*(arg as *const SpawnInfo) };
        // SAFETY: plain syscalls on descriptors and signal state private to this child.
        unsafe {
            if info.memserver_fd >= 0 {
                if info.memserver_fd == DD_BACKTRACE_MEMSERVER_FD {
                    // Already in place; just make sure it survives the exec.
                    libc::fcntl(DD_BACKTRACE_MEMSERVER_FD, libc::F_SETFD, 0);
                } else {
                    libc::dup2(info.memserver_fd, DD_BACKTRACE_MEMSERVER_FD);
                }
            }

            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut mask);
            libc::sigprocmask(libc::SIG_UNBLOCK, &mask, ptr::null_mut());

            // Handlers do not survive exec, but an ignored SIGCHLD would.
            libc::signal(libc::SIGCHLD, libc::SIG_DFL);

            libc::execve(info.path, info.argv, info.envp);
            libc::_exit(127)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::vault::{VaultStorage, VaultWriter};
    use crate::settings::{BacktraceSettings, SettingsParser};
    use crate::shared::host::tests::FakeHost;
    use std::sync::Mutex;

    // The launcher has one static spawn stack; tests that spawn take turns.
    static SPAWN_LOCK: Mutex<()> = Mutex::new(());

    fn launcher(settings: &str, path: &str, env: &[(&str, &str)]) -> Launcher {
        let mut parsed = BacktraceSettings::default();
        let warnings = SettingsParser::new().parse(settings, &mut parsed);
        assert!(warnings.is_empty(), "{warnings:?}");
        parsed.backtracer_path = Some(path.to_string());
        let resolution = parsed.freeze_for_platform(&FakeHost::default(), true);
        let (writer, warnings) = VaultWriter::populate(
            VaultStorage::leaked(),
            path,
            env,
            resolution.output_path.as_deref(),
            "DD_BACKTRACE",
        );
        assert!(warnings.is_empty(), "{warnings:?}");
        Launcher::new(resolution.settings, writer.freeze().unwrap())
    }

    fn strings<const N: usize>(ptrs: &[*const c_char; N]) -> Vec<String> {
        ptrs.iter()
            .take_while(|p| !p.is_null())
            // SAFETY: every non-null entry is a NUL terminated string.
            .map(|p| unsafe { CStr::from_ptr(*p) }.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_argv_shape() {
        let launcher = launcher(
            "enable=on,timeout=5m,threads=all,limit=none,top=3,format=json,output-to=/tmp/r.json",
            "/opt/dd-backtrace",
            &[],
        );
        let context = 0x7f00_dead_beef_usize as *const CrashContext;
        let numbers = launcher.argv_numbers(context);
        let argv = launcher.argv(&numbers);
        assert!(argv[ARGV_CAPACITY - 1].is_null());
        assert_eq!(
            strings(&argv),
            [
                "dd-backtrace",
                "--unwind",
                "precise",
                "--demangle",
                "true",
                "--interactive",
                "false",
                "--color",
                "false",
                "--timeout",
                "300",
                "--preset",
                "full",
                "--crashinfo",
                "00007f00deadbeef",
                "--threads",
                "all",
                "--registers",
                "preset",
                "--images",
                "preset",
                "--limit",
                "none",
                "--top",
                "3",
                "--sanitize",
                "preset",
                "--cache",
                "true",
                "--output-to",
                "/tmp/r.json",
                "--symbolicate",
                "full",
                "--format",
                "json",
            ]
        );
    }

    #[test]
    fn test_argv_numbers_and_flags() {
        let launcher = launcher(
            "enable=on,timeout=none,limit=12,unwind=fast,demangle=off,sanitize=off,\
             output-to=stdout,symbolicate=fast,cache=no",
            "/opt/dd-backtrace",
            &[],
        );
        let numbers = launcher.argv_numbers(ptr::null());
        let args = strings(&launcher.argv(&numbers));
        let value = |flag: &str| {
            let at = args.iter().position(|a| a == flag).unwrap();
            args[at + 1].clone()
        };
        assert_eq!(value("--unwind"), "fast");
        assert_eq!(value("--demangle"), "false");
        assert_eq!(value("--timeout"), "none");
        assert_eq!(value("--limit"), "12");
        assert_eq!(value("--sanitize"), "false");
        assert_eq!(value("--output-to"), "stdout");
        assert_eq!(value("--symbolicate"), "fast");
        assert_eq!(value("--cache"), "false");
        assert_eq!(value("--crashinfo"), "0000000000000000");
    }

    #[test]
    fn test_envp_from_vault() {
        let launcher = launcher(
            "enable=on",
            "/opt/dd-backtrace",
            &[("HOME", "/root"), ("PATH", "/bin"), ("AWS_SECRET", "x")],
        );
        let envp = launcher.envp();
        assert_eq!(
            strings(&envp),
            ["DD_BACKTRACE=enable=no", "PATH=/bin", "HOME=/root"]
        );
    }

    #[test]
    fn test_nonexistent_backtracer() {
        let _guard = SPAWN_LOCK.lock().unwrap();
        let launcher = launcher("enable=on", "/nonexistent/dd-backtrace", &[]);
        // SAFETY: test stands in for the signal handler.
        let scope = unsafe { CrashScope::enter() };
        #[cfg(target_os = "linux")]
        let ok = launcher.spawn_backtracer(&scope, ptr::null(), MemserverChannel::open(&scope));
        #[cfg(not(target_os = "linux"))]
        let ok = launcher.spawn_backtracer(&scope, ptr::null());
        assert!(!ok);
    }

    #[test]
    fn test_exit_status() {
        let _guard = SPAWN_LOCK.lock().unwrap();
        // SAFETY: test stands in for the signal handler.
        let scope = unsafe { CrashScope::enter() };
        for (path, expected) in [("/bin/true", true), ("/bin/false", false)] {
            if !std::path::Path::new(path).exists() {
                continue;
            }
            let launcher = launcher("enable=on", path, &[]);
            #[cfg(target_os = "linux")]
            let ok = launcher.spawn_backtracer(&scope, ptr::null(), None);
            #[cfg(not(target_os = "linux"))]
            let ok = launcher.spawn_backtracer(&scope, ptr::null());
            assert_eq!(ok, expected, "{path}");
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_backtracer_reads_memory_through_fd_4() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let _guard = SPAWN_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args");
        let script = dir.path().join("backtracer.sh");
        {
            let mut f = std::fs::File::create(&script).unwrap();
            writeln!(f, "#!/bin/sh").unwrap();
            writeln!(f, "printf '%s\\n' \"$@\" > '{}'", args_file.display()).unwrap();
            writeln!(f, "[ -S /proc/self/fd/4 ] || [ -e /proc/self/fd/4 ] || exit 3").unwrap();
            writeln!(f, "exit 0").unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = launcher(
            "enable=on",
            script.to_str().unwrap(),
            &[("PATH", "/usr/bin:/bin")],
        );
        // SAFETY: test stands in for the signal handler.
        let scope = unsafe { CrashScope::enter() };
        let context = CrashContext::default();
        let ok = launcher.spawn_backtracer(&scope, &context, MemserverChannel::open(&scope));
        assert!(ok);

        let args = std::fs::read_to_string(&args_file).unwrap();
        let expected = format!("{:016x}", &context as *const CrashContext as usize);
        assert!(args.lines().any(|l| l == expected), "{args}");
    }
}
