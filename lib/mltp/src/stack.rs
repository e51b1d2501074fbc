// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::cmp;
use std::alloc::{alloc, dealloc, Layout};

use crate::error::MltpError;

/// Default stack size in bytes.
pub const DEFAULT_STACK_SIZE_BYTES: usize = 32 * 4096;

/// Smallest stack we hand out.
pub const MIN_STACK_SIZE_BYTES: usize = 4 * 4096;

const STACK_ALIGNMENT: usize = 16;

/// ThreadStack holds a non-guarded, heap-allocated stack.
#[derive(Debug, PartialEq)]
pub struct ThreadStack {
    base_ptr: *mut u8,
    layout: Layout,
}

// Only the thread owning the stack runs on it.
unsafe impl Send for ThreadStack {}

impl ThreadStack {
    /// Allocates a new stack with at least `size` accessible bytes and
    /// alignment appropriate for the current platform.
    pub fn from_size(size: usize) -> Result<ThreadStack, MltpError> {
        let aligned_size = cmp::max(size, MIN_STACK_SIZE_BYTES) & !(STACK_ALIGNMENT - 1);
        let layout = Layout::from_size_align(aligned_size, STACK_ALIGNMENT)
            .map_err(|_| MltpError::OutOfMemory)?;

        let base_ptr = unsafe { alloc(layout) };
        if base_ptr.is_null() {
            return Err(MltpError::OutOfMemory);
        }

        Ok(ThreadStack { base_ptr, layout })
    }

    /// The (exclusive) upper end, where the stack starts growing down.
    #[inline(always)]
    pub fn base(&self) -> *mut u8 {
        // Cannot wrap, the allocation doesn't.
        unsafe { self.limit().add(self.layout.size()) }
    }

    #[inline(always)]
    pub fn limit(&self) -> *mut u8 {
        self.base_ptr
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for ThreadStack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base_ptr, self.layout) }
    }
}
