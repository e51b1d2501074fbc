// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bit and word sized read-modify-write primitives.
//!
//! These are building blocks only: nothing here queues, blocks or gives any
//! fairness guarantee beyond what the hardware does.

use core::sync::atomic::{AtomicUsize, Ordering};

#[inline]
fn mask(bit: u32) -> usize {
    assert!(bit < usize::BITS, "bit {} out of range", bit);
    1 << bit
}

/// Sets `bit` in `word`, returns whether it was set before.
#[inline]
pub fn test_and_set(bit: u32, word: &AtomicUsize) -> bool {
    let m = mask(bit);
    word.fetch_or(m, Ordering::AcqRel) & m != 0
}

/// Clears `bit` in `word`, returns whether it was set before.
#[inline]
pub fn test_and_clear(bit: u32, word: &AtomicUsize) -> bool {
    let m = mask(bit);
    word.fetch_and(!m, Ordering::AcqRel) & m != 0
}

/// Flips `bit` in `word`, returns whether it was set before.
#[inline]
pub fn test_and_change(bit: u32, word: &AtomicUsize) -> bool {
    let m = mask(bit);
    word.fetch_xor(m, Ordering::AcqRel) & m != 0
}

/// Stores `new` in `word` if it currently holds `expected`.
#[inline]
pub fn compare_and_swap(expected: usize, new: usize, word: &AtomicUsize) -> bool {
    word.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}
