// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

mod errors;
mod process;

pub use errors::ReapError;
pub use process::{read_full, reap_child_blocking, terminate, write_all};
