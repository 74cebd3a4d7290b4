// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stands in for `dd-backtrace` in the end-to-end tests. Instead of printing a backtrace, it
//! writes a [`BacktracerReport`] describing how it was launched.

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn main() {}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod unix {
    use anyhow::Context;
    use bin_tests::{parse_backtracer_args, BacktracerReport};
    use libdd_backtrace::shared::constants::DD_BACKTRACE_SETTINGS_VAR;
    use std::env;
    use std::io::Write;

    pub fn main() -> anyhow::Result<()> {
        let (program, args) = parse_backtracer_args(env::args())?;
        let mut report = BacktracerReport {
            program,
            settings_env: env::var(DD_BACKTRACE_SETTINGS_VAR).ok(),
            env_names: env::vars_os()
                .map(|(name, _)| name.to_string_lossy().into_owned())
                .collect(),
            ..Default::default()
        };

        #[cfg(target_os = "linux")]
        if let Some(crashinfo) = args.get("--crashinfo") {
            match linux::read_crash_context(bin_tests::parse_address(crashinfo)?) {
                Ok(context) => report.context = Some(context),
                Err(e) => report.memserver_error = Some(format!("{e:#}")),
            }
        }
        report.args = args;

        let json = serde_json::to_string_pretty(&report)?;
        match report.args.get("--output-to").map(String::as_str) {
            Some("stdout") => writeln!(std::io::stdout(), "{json}")?,
            Some("stderr") | None => writeln!(std::io::stderr(), "{json}")?,
            Some(path) => {
                std::fs::write(path, json).with_context(|| format!("writing report to {path}"))?
            }
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    mod linux {
        use bin_tests::{ReportedContext, ReportedThread};
        use libdd_backtrace::shared::constants::DD_BACKTRACE_MAX_THREADS;
        use libdd_backtrace::shared::crash_context::{
            walk_thread_list, CrashContext, CRASH_CONTEXT_SIZE,
        };
        use libdd_backtrace::shared::memserver::MemserverClient;

        pub fn read_crash_context(address: u64) -> anyhow::Result<ReportedContext> {
            anyhow::ensure!(address != 0, "no crash context address");
            // SAFETY: the crash handler hands us the memory server socket on this descriptor and
            // nothing else in this process uses it.
            let mut client = unsafe { MemserverClient::from_inherited_fd() };

            let mut bytes = [0u8; CRASH_CONTEXT_SIZE];
            client.read_exact(address, &mut bytes)?;
            let context = CrashContext::from_bytes(&bytes)
                .ok_or_else(|| anyhow::anyhow!("short crash context"))?;

            let threads =
                walk_thread_list(context.thread_list, DD_BACKTRACE_MAX_THREADS, |addr, buf| {
                    client.read_exact(addr, buf)
                })?;

            Ok(ReportedContext {
                signal: context.signal,
                crashing_thread: context.crashing_thread,
                fault_address: context.fault_address,
                threads: threads
                    .into_iter()
                    .map(|record| ReportedThread {
                        tid: record.tid,
                        uctx: record.uctx,
                    })
                    .collect(),
            })
        }
    }
}
