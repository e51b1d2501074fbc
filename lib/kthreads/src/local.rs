// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per kernel thread state: identity, kill flag, error number and an
//! optional zeroed memory block.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::KthreadError;
use crate::thread::{self, KthreadId};

thread_local! {
    static IDENTITY: Cell<KthreadId> = const { Cell::new(KthreadId::NONE) };
    static ERRNO: Cell<i32> = const { Cell::new(0) };
    static KILLED: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
    static EXIT_NOTICE: RefCell<Option<ExitNotice>> = const { RefCell::new(None) };
    static LOCAL: RefCell<Option<Box<[u8]>>> = const { RefCell::new(None) };
    static KILL_MASK: Cell<usize> = const { Cell::new(0) };
}

/// Tells the reaper about our death once thread-local storage goes away.
struct ExitNotice(KthreadId);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        if let Some(k) = thread::kernel_if_initialized() {
            k.notify_exit(self.0);
        }
    }
}

pub(crate) fn identity() -> Option<KthreadId> {
    let id = IDENTITY.with(Cell::get);
    if id.is_none() {
        None
    } else {
        Some(id)
    }
}

/// Attaches `id` to the calling kernel thread.
pub(crate) fn bind(id: KthreadId, killed: Option<Arc<AtomicBool>>, notify_exit: bool) {
    IDENTITY.with(|i| i.set(id));
    if let Some(flag) = killed {
        let _ = KILLED.try_with(|k| *k.borrow_mut() = Some(flag));
    }
    if notify_exit {
        let _ = EXIT_NOTICE.try_with(|n| *n.borrow_mut() = Some(ExitNotice(id)));
    }
}

pub(crate) fn kill_requested() -> bool {
    if KILL_MASK.try_with(Cell::get).unwrap_or(0) > 0 {
        return false;
    }
    KILLED
        .try_with(|k| {
            k.borrow()
                .as_ref()
                .map_or(false, |f| f.load(Ordering::Acquire))
        })
        .unwrap_or(false)
}

struct MaskGuard;

impl Drop for MaskGuard {
    fn drop(&mut self) {
        KILL_MASK.with(|m| m.set(m.get() - 1));
    }
}

/// Runs `f` with kills of the calling kernel thread held back.
///
/// Kernel waits inside `f` don't unwind; a pending kill is honored at the
/// first wait after `f` returned. For code that must not unwind, like
/// functions called from assembly.
pub fn without_kill<R, F: FnOnce() -> R>(f: F) -> R {
    KILL_MASK.with(|m| m.set(m.get() + 1));
    let _g = MaskGuard;
    f()
}

/// Error number of the last failed kernel thread layer call on this thread.
pub fn errno() -> i32 {
    ERRNO.with(Cell::get)
}

pub fn set_errno(errno: i32) {
    ERRNO.with(|e| e.set(errno));
}

/// Allocates `size` zeroed bytes of memory private to the calling kernel
/// thread. Can only be done once per thread.
pub fn alloc_local(size: usize) -> Result<(), KthreadError> {
    LOCAL.with(|l| {
        let mut l = l.borrow_mut();
        if l.is_some() {
            set_errno(KthreadError::LocalAlreadyAllocated.errno());
            return Err(KthreadError::LocalAlreadyAllocated);
        }
        *l = Some(vec![0u8; size].into_boxed_slice());
        Ok(())
    })
}

/// Runs `f` on the memory from [`alloc_local`], if there is any.
pub fn with_local<R, F: FnOnce(&mut [u8]) -> R>(f: F) -> Option<R> {
    LOCAL.with(|l| l.borrow_mut().as_deref_mut().map(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread as os;

    #[test]
    fn local_memory_is_zeroed_and_private() {
        assert_eq!(with_local(|m| m.len()), None);
        alloc_local(64).unwrap();
        assert_eq!(
            alloc_local(64),
            Err(KthreadError::LocalAlreadyAllocated)
        );
        assert!(with_local(|m| m.iter().all(|b| *b == 0)).unwrap());
        with_local(|m| m[0] = 0xaa);

        os::spawn(|| {
            assert_eq!(with_local(|m| m.len()), None);
            alloc_local(8).unwrap();
            assert_eq!(with_local(|m| m[0]), Some(0));
        })
        .join()
        .unwrap();

        assert_eq!(with_local(|m| m[0]), Some(0xaa));
    }

    #[test]
    fn errno_is_per_thread() {
        set_errno(libc::ENOMEM);
        os::spawn(|| assert_eq!(errno(), 0)).join().unwrap();
        assert_eq!(errno(), libc::ENOMEM);
    }
}
