// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn main() {}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod unix {
    use anyhow::Context;
    use bin_tests::CrashMode;
    use libdd_backtrace::InitOptions;
    use std::env;
    use std::io::Write;

    #[inline(never)]
    unsafe fn fn3() {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            std::arch::asm!("mov eax, [0]", options(nostack));
        }

        #[cfg(target_arch = "aarch64")]
        {
            std::arch::asm!("mov x0, #0", "ldr x1, [x0]", options(nostack));
        }
    }

    #[inline(never)]
    fn fn2() {
        unsafe { fn3() }
    }

    #[inline(never)]
    fn fn1() {
        fn2()
    }

    #[inline(never)]
    pub fn main() -> anyhow::Result<()> {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(tracing::Level::DEBUG)
            .init();

        let mut args = env::args().skip(1);
        let mode: CrashMode = args
            .next()
            .context("Unexpected number of arguments 1")?
            .parse()?;
        anyhow::ensure!(args.next().is_none(), "unexpected extra arguments");

        let state = libdd_backtrace::init(InitOptions::default())?;
        {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "backtracing enabled: {}", state.is_enabled())?;
            stdout.flush()?;
        }

        match mode {
            CrashMode::Segv => fn1(),
            CrashMode::Abort => std::process::abort(),
            CrashMode::FatalError => {
                libdd_backtrace::report_fatal_error("fatal error: crashing on purpose\n");
                std::process::abort()
            }
        }
        Ok(())
    }
}
