// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::marker::PhantomData;

/// Proof that the caller is running on the crash path.
///
/// Every operation that may run inside the fatal-signal handler takes a `&CrashScope`. Such
/// operations must not allocate or take locks, and may only read state that is frozen or static.
/// The scope cannot be sent to another thread.
pub struct CrashScope<'a> {
    _not_send: PhantomData<*const ()>,
    _lifetime: PhantomData<&'a ()>,
}

impl CrashScope<'_> {
    /// # Safety
    /// The caller must be the fatal-signal handler (or a test standing in for it), and everything
    /// done while the scope is alive must be async-signal-safe.
    pub unsafe fn enter() -> Self {
        Self {
            _not_send: PhantomData,
            _lifetime: PhantomData,
        }
    }
}
