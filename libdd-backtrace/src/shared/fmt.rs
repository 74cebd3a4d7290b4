// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Number formatting and string assembly that is safe to use inside a signal handler.
//! Nothing here allocates or takes a lock; everything works on fixed-size stack buffers.

use std::ffi::c_char;

const NUMBER_CAPACITY: usize = 24;
const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// A formatted integer, NUL terminated so it can be handed to `execve` directly.
#[derive(Clone, Copy)]
pub struct NumberBuf {
    bytes: [u8; NUMBER_CAPACITY],
    len: usize,
}

impl NumberBuf {
    pub fn unsigned(mut value: u64) -> Self {
        let mut digits = [0u8; NUMBER_CAPACITY];
        let mut count = 0;
        loop {
            digits[count] = b'0' + (value % 10) as u8;
            count += 1;
            value /= 10;
            if value == 0 {
                break;
            }
        }
        let mut this = Self::empty();
        for i in 0..count {
            this.bytes[i] = digits[count - 1 - i];
        }
        this.len = count;
        this
    }

    pub fn signed(value: i64) -> Self {
        let magnitude = Self::unsigned(value.unsigned_abs());
        if value >= 0 {
            return magnitude;
        }
        let mut this = Self::empty();
        this.bytes[0] = b'-';
        this.bytes[1..=magnitude.len].copy_from_slice(magnitude.as_bytes());
        this.len = magnitude.len + 1;
        this
    }

    /// Lowercase hex without a `0x` prefix, zero padded to at least `width` digits.
    pub fn hex(value: u64, width: usize) -> Self {
        let significant = (16 - value.leading_zeros() as usize / 4).max(1);
        let count = significant.max(width.min(16));
        let mut this = Self::empty();
        for i in 0..count {
            let shift = (count - 1 - i) * 4;
            this.bytes[i] = HEX_DIGITS[((value >> shift) & 0xf) as usize];
        }
        this.len = count;
        this
    }

    /// Hex formatting of an address: always 16 digits.
    pub fn address(value: u64) -> Self {
        Self::hex(value, 16)
    }

    fn empty() -> Self {
        Self {
            bytes: [0; NUMBER_CAPACITY],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Pointer to the NUL-terminated representation. Valid for as long as `self` is not moved.
    pub fn as_c_ptr(&self) -> *const c_char {
        self.bytes.as_ptr().cast()
    }
}

/// Appends byte strings into a fixed buffer, silently truncating once it is full.
pub struct FixedBuf<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FixedBuf<N> {
    pub const fn new() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> &mut Self {
        let take = bytes.len().min(N - self.len);
        self.bytes[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        self
    }

    pub fn push_number(&mut self, number: &NumberBuf) -> &mut Self {
        self.push(number.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }
}
