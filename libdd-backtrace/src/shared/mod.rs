// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Types and helpers shared between the crashing process and the backtracer.

pub mod constants;
pub mod crash_context;
pub mod fmt;
pub mod host;
pub mod memserver;
pub mod paths;
