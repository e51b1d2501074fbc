// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Counting semaphores that remember their owner.
//!
//! The owner is the kernel thread that last acquired the semaphore. Only the
//! owner may release it; a release from anyone else while an owner is set is
//! ignored. When the owner dies, the reaper takes ownership and releases the
//! semaphore on its behalf.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::*;

use crate::error::KthreadError;
use crate::local;
use crate::thread::{self, current, kernel, KthreadId, WAIT_POLL};
use crate::MAX_SEMS;

/// Identifies a semaphore in the registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SemId(pub u64);

impl SemId {
    /// The semaphore serializing kernel thread creation. Not in the registry.
    pub(crate) const SYSTEM: SemId = SemId(0);
}

#[derive(Debug)]
pub struct Semaphore {
    id: SemId,
    count: Mutex<isize>,
    changed: Condvar,
    owner: AtomicU64,
    /// Recursion depth of the owner (`rget`/`rrelease`).
    usage: AtomicUsize,
    /// Bumped every time the count drops to zero, under the count lock.
    zeroed: AtomicU64,
    destroyed: AtomicBool,
}

impl Semaphore {
    pub(crate) fn new(id: SemId, initial: isize) -> Semaphore {
        Semaphore {
            id,
            count: Mutex::new(initial),
            changed: Condvar::new(),
            owner: AtomicU64::new(KthreadId::NONE.0),
            usage: AtomicUsize::new(0),
            zeroed: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Creates a semaphore with a count of `initial`.
    pub fn create(initial: isize) -> Result<Arc<Semaphore>, KthreadError> {
        let k = kernel();
        let mut sems = k.semaphores.lock();
        if sems.len() >= MAX_SEMS {
            drop(sems);
            let e = KthreadError::OutOfSemaphores;
            local::set_errno(e.errno());
            return Err(e);
        }

        let sem = Arc::new(Semaphore::new(k.allocate_sem_id(), initial));
        sems.insert(sem.id, Arc::downgrade(&sem));
        Ok(sem)
    }

    pub fn id(&self) -> SemId {
        self.id
    }

    /// Kernel thread currently holding the semaphore, if any.
    pub fn owner(&self) -> KthreadId {
        KthreadId(self.owner.load(Ordering::Acquire))
    }

    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    pub fn value(&self) -> isize {
        *self.lock_count()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn lock_count(&self) -> MutexGuard<'_, isize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps until the count changes (or a poll interval passed).
    fn wait<'a>(&self, count: MutexGuard<'a, isize>) -> MutexGuard<'a, isize> {
        let (count, _timeout) = self
            .changed
            .wait_timeout(count, WAIT_POLL)
            .unwrap_or_else(PoisonError::into_inner);

        if local::kill_requested() {
            drop(count);
            thread::die();
        }
        count
    }

    fn decrement(&self, count: &mut MutexGuard<'_, isize>) {
        **count -= 1;
        if **count == 0 {
            self.zeroed.fetch_add(1, Ordering::Relaxed);
            self.changed.notify_all();
        }
    }

    // Ownership is only ever written by the thread that just won the count,
    // so it lives outside the count lock.
    fn take_ownership(&self) {
        self.owner.store(current().0, Ordering::Release);
        self.usage.store(1, Ordering::Relaxed);
    }

    /// Decrements the count, waiting for it to become positive.
    ///
    /// Returns right away on a destroyed semaphore.
    pub fn get(&self) {
        let mut count = self.lock_count();
        loop {
            if self.is_destroyed() {
                return;
            }
            if *count > 0 {
                self.decrement(&mut count);
                break;
            }
            count = self.wait(count);
        }
        drop(count);

        self.take_ownership();
    }

    /// Decrements the count if that is possible without waiting.
    pub fn try_get(&self) -> bool {
        let mut count = self.lock_count();
        if *count <= 0 {
            drop(count);
            local::set_errno(libc::EAGAIN);
            return false;
        }
        self.decrement(&mut count);
        drop(count);

        self.take_ownership();
        true
    }

    /// Increments the count.
    ///
    /// Does nothing if another kernel thread owns the semaphore.
    pub fn release(&self) {
        let owner = self.owner();
        let me = current();
        if !owner.is_none() && owner != me {
            trace!("{:?} release by {} ignored, owned by {}", self.id, me, owner);
            return;
        }

        self.owner.store(KthreadId::NONE.0, Ordering::Release);
        let mut count = self.lock_count();
        *count += 1;
        drop(count);
        self.changed.notify_all();
    }

    /// Waits until the count reaches zero without touching it.
    ///
    /// Also returns if the count was zero only briefly while we slept.
    pub fn block_until_zero(&self) {
        let mut count = self.lock_count();
        let seen = self.zeroed.load(Ordering::Relaxed);
        while *count != 0 && !self.is_destroyed() {
            if self.zeroed.load(Ordering::Relaxed) != seen {
                break;
            }
            count = self.wait(count);
        }
    }

    /// Like [`Semaphore::get`], but the owner can re-enter.
    ///
    /// Inspects the owner without synchronization, so it must not be used
    /// from the reaper or a termination callback.
    pub fn rget(&self) {
        if self.owner() == current() {
            self.usage.fetch_add(1, Ordering::Relaxed);
        } else {
            self.get();
        }
    }

    /// Like [`Semaphore::try_get`], but the owner can re-enter.
    pub fn rtry_get(&self) -> bool {
        if self.owner() == current() {
            self.usage.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.try_get()
        }
    }

    /// Undoes one [`Semaphore::rget`]; the last one releases.
    pub fn rrelease(&self) {
        if self.owner() == current() {
            let usage = self.usage.load(Ordering::Relaxed);
            if usage > 1 {
                self.usage.store(usage - 1, Ordering::Relaxed);
                return;
            }
            self.usage.store(0, Ordering::Relaxed);
        }
        self.release();
    }

    /// Forgets the owner so the next release is accepted from anyone.
    pub fn disown(&self) {
        self.owner.store(KthreadId::NONE.0, Ordering::Release);
    }

    /// Releases the semaphore on behalf of `dead` if it still owns it.
    pub(crate) fn reclaim(&self, dead: KthreadId, reaper: KthreadId) -> bool {
        if self.owner() != dead {
            return false;
        }
        self.owner.store(reaper.0, Ordering::Release);
        self.usage.store(0, Ordering::Relaxed);
        self.release();
        true
    }

    /// Removes the semaphore; waiters return and nobody blocks on it anymore.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.unregister();
        let _count = self.lock_count();
        self.changed.notify_all();
    }

    fn unregister(&self) {
        if self.id == SemId::SYSTEM {
            return;
        }
        if let Some(k) = thread::kernel_if_initialized() {
            k.semaphores.lock().remove(&self.id);
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.unregister();
    }
}
