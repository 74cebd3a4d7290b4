// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

// Backtrace-on-crash needs a way to spawn a process from a signal handler and a way for that
// process to read our memory afterwards. Only Linux and macOS provide both today; everywhere else
// the collector is compiled out and backtracing resolves to disabled.
fn main() {
    println!("cargo::rustc-check-cfg=cfg(backtrace_on_crash)");
    println!("cargo:rerun-if-changed=build.rs");

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let collector = std::env::var_os("CARGO_FEATURE_COLLECTOR").is_some();
    if collector && (target_os == "linux" || target_os == "macos") {
        println!("cargo:rustc-cfg=backtrace_on_crash");
    }
}
