// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared pieces of the end-to-end tests.
//!
//! `crashing_test_app` installs backtrace-on-crash and then crashes. The crash handler launches
//! `test_backtracer` in place of the real `dd-backtrace`; it records what it was given (arguments,
//! environment and, on Linux, the crash context read back through the memory server) as a
//! [`BacktracerReport`] in the file named by `--output-to`.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ways `crashing_test_app` can die.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashMode {
    /// Null pointer dereference (SIGSEGV).
    Segv,
    /// `abort()` (SIGABRT).
    Abort,
    /// A fatal error message followed by `abort()`.
    FatalError,
}

impl CrashMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CrashMode::Segv => "segv",
            CrashMode::Abort => "abort",
            CrashMode::FatalError => "fatal-error",
        }
    }
}

impl std::str::FromStr for CrashMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "segv" => Ok(CrashMode::Segv),
            "abort" => Ok(CrashMode::Abort),
            "fatal-error" => Ok(CrashMode::FatalError),
            other => anyhow::bail!("unknown crash mode {other:?}"),
        }
    }
}

/// What `test_backtracer` observed when the crash handler launched it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktracerReport {
    pub program: String,
    pub args: BTreeMap<String, String>,
    /// Value of the settings variable in the backtracer's environment.
    pub settings_env: Option<String>,
    /// Names of the variables in the backtracer's environment.
    pub env_names: Vec<String>,
    pub context: Option<ReportedContext>,
    pub memserver_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedContext {
    pub signal: u64,
    pub crashing_thread: u64,
    pub fault_address: u64,
    pub threads: Vec<ReportedThread>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedThread {
    pub tid: u64,
    pub uctx: u64,
}

/// Splits a backtracer command line into the program name and its `--flag value` pairs.
pub fn parse_backtracer_args(
    mut args: impl Iterator<Item = String>,
) -> anyhow::Result<(String, BTreeMap<String, String>)> {
    let program = args.next().context("missing program name")?;
    let mut flags = BTreeMap::new();
    while let Some(flag) = args.next() {
        anyhow::ensure!(flag.starts_with("--"), "expected a flag, got {flag:?}");
        let value = args
            .next()
            .with_context(|| format!("flag {flag} has no value"))?;
        anyhow::ensure!(
            flags.insert(flag.clone(), value).is_none(),
            "flag {flag} given twice"
        );
    }
    Ok((program, flags))
}

/// Parses the hexadecimal address passed with `--crashinfo`.
pub fn parse_address(value: &str) -> anyhow::Result<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .with_context(|| format!("invalid address {value:?}"))
}

#[macro_export]
macro_rules! timeit {
    ($op_name:literal, $op:block) => {{
        let start = std::time::Instant::now();
        let res = $op;
        let delta = start.elapsed();
        eprintln!(
            concat!($op_name, " took {} ms"),
            delta.as_secs_f64() * 1000.0
        );
        res
    }};
}
