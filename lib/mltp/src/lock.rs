// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Mutual exclusion locks.
//!
//! A lock is one of four classes:
//!
//! * `Spin`: a ticket lock, FIFO by ticket. Works for any thread.
//! * `Block`: CAS on an occupied flag, yields to the back of the run queue
//!   while somebody else holds it. Unbound threads only.
//! * `BlockFront`: like `Block` but yields to the front of the run queue.
//! * `Semaphore`: a kernel semaphore. Works for any thread but blocks the
//!   whole virtual processor while waiting.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use kthreads::Semaphore;
use log::*;
use static_assertions::const_assert;

use crate::atomic;
use crate::error::MltpError;
use crate::tls::{yield_now, yield_to_first};

#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockClass {
    Spin = 0,
    Block = 1,
    BlockFront = 2,
    Semaphore = 3,
}

impl LockClass {
    /// Blocking classes yield the unbound thread while they wait.
    pub const fn is_blocking(self) -> bool {
        matches!(self, LockClass::Block | LockClass::BlockFront)
    }

    pub fn from_raw(raw: u32) -> Option<LockClass> {
        match raw {
            0 => Some(LockClass::Spin),
            1 => Some(LockClass::Block),
            2 => Some(LockClass::BlockFront),
            3 => Some(LockClass::Semaphore),
            _ => None,
        }
    }
}

/// Lock class protecting run queues and condition wait queues.
pub const LOCK_STD: LockClass = LockClass::Spin;

// A queue lock runs in switch landing functions, those can't yield.
const_assert!(!LOCK_STD.is_blocking());

#[derive(Debug)]
pub struct Lock {
    inner: LockInner,
}

#[derive(Debug)]
enum LockInner {
    Spin {
        next_available: CachePadded<AtomicUsize>,
        now_serving: CachePadded<AtomicUsize>,
    },
    Block {
        occupied: CachePadded<AtomicUsize>,
        front: bool,
    },
    Semaphore(Arc<Semaphore>),
    Unknown(u32),
}

impl Default for Lock {
    fn default() -> Self {
        Self::new_spin()
    }
}

impl Lock {
    pub fn new(class: LockClass) -> Result<Lock, MltpError> {
        Ok(match class {
            LockClass::Spin => Lock::new_spin(),
            LockClass::Block => Lock::new_block(),
            LockClass::BlockFront => Lock::new_block_front(),
            LockClass::Semaphore => Lock::new_semaphore()?,
        })
    }

    /// Creates a lock from a raw class number.
    ///
    /// Unknown classes are reported but produce a lock on which every
    /// operation does nothing.
    pub fn from_raw_class(raw: u32) -> Result<Lock, MltpError> {
        match LockClass::from_raw(raw) {
            Some(class) => Lock::new(class),
            None => {
                error!("Creating lock of unknown class {}.", raw);
                Ok(Lock {
                    inner: LockInner::Unknown(raw),
                })
            }
        }
    }

    pub fn new_spin() -> Lock {
        Lock {
            inner: LockInner::Spin {
                next_available: CachePadded::new(AtomicUsize::new(0)),
                now_serving: CachePadded::new(AtomicUsize::new(0)),
            },
        }
    }

    pub fn new_block() -> Lock {
        Lock::new_block_with(false)
    }

    pub fn new_block_front() -> Lock {
        Lock::new_block_with(true)
    }

    fn new_block_with(front: bool) -> Lock {
        Lock {
            inner: LockInner::Block {
                occupied: CachePadded::new(AtomicUsize::new(0)),
                front,
            },
        }
    }

    pub fn new_semaphore() -> Result<Lock, MltpError> {
        Ok(Lock {
            inner: LockInner::Semaphore(Semaphore::create(1)?),
        })
    }

    /// The class of this lock, `None` for an unknown class.
    pub fn class(&self) -> Option<LockClass> {
        match &self.inner {
            LockInner::Spin { .. } => Some(LockClass::Spin),
            LockInner::Block { front: false, .. } => Some(LockClass::Block),
            LockInner::Block { front: true, .. } => Some(LockClass::BlockFront),
            LockInner::Semaphore(_) => Some(LockClass::Semaphore),
            LockInner::Unknown(_) => None,
        }
    }

    pub fn acquire(&self) {
        self.acquire_ticketed();
    }

    /// Acquires the lock, returns the ticket for spin locks.
    pub(crate) fn acquire_ticketed(&self) -> Option<usize> {
        match &self.inner {
            LockInner::Spin {
                next_available,
                now_serving,
            } => {
                let ticket = take_ticket(next_available);

                #[cfg(feature = "latency")]
                let start = std::time::Instant::now();

                while now_serving.load(Ordering::Acquire) != ticket {
                    spin_loop();
                }

                #[cfg(feature = "latency")]
                if start.elapsed() > core::time::Duration::from_nanos(200) {
                    warn!("spun for {:?}", start.elapsed());
                }

                Some(ticket)
            }
            LockInner::Block { occupied, front } => {
                while !atomic::compare_and_swap(0, 1, occupied) {
                    if *front {
                        yield_to_first();
                    } else {
                        yield_now();
                    }
                }
                None
            }
            LockInner::Semaphore(sem) => {
                sem.get();
                None
            }
            LockInner::Unknown(class) => {
                error!("Accessing lock of unknown class {}.", class);
                None
            }
        }
    }

    /// Acquires the lock if that is possible without waiting.
    pub fn try_acquire(&self) -> bool {
        match &self.inner {
            LockInner::Spin {
                next_available,
                now_serving,
            } => {
                let ticket = now_serving.load(Ordering::Acquire);
                atomic::compare_and_swap(ticket, ticket.wrapping_add(1), next_available)
            }
            LockInner::Block { occupied, .. } => atomic::compare_and_swap(0, 1, occupied),
            LockInner::Semaphore(sem) => sem.try_get(),
            LockInner::Unknown(class) => {
                error!("Accessing lock of unknown class {}.", class);
                false
            }
        }
    }

    pub fn release(&self) {
        match &self.inner {
            LockInner::Spin { now_serving, .. } => {
                now_serving.fetch_add(1, Ordering::Release);
            }
            LockInner::Block { occupied, .. } => occupied.store(0, Ordering::Release),
            LockInner::Semaphore(sem) => sem.release(),
            LockInner::Unknown(class) => error!("Accessing lock of unknown class {}.", class),
        }
    }

    /// Acquires the lock, it gets released when the guard goes away.
    pub fn lock(&self) -> LockGuard<'_> {
        self.acquire();
        LockGuard { lock: self }
    }

    #[cfg(test)]
    fn tickets_issued(&self) -> usize {
        match &self.inner {
            LockInner::Spin { next_available, .. } => next_available.load(Ordering::SeqCst),
            _ => 0,
        }
    }
}

/// Draws the next ticket of a spin lock.
fn take_ticket(next_available: &AtomicUsize) -> usize {
    loop {
        let ticket = next_available.load(Ordering::Relaxed);
        if atomic::compare_and_swap(ticket, ticket.wrapping_add(1), next_available) {
            return ticket;
        }
        idle_spin();
    }
}

#[cfg(feature = "idle-spin")]
fn idle_spin() {
    use rand::Rng;

    let rounds = rand::thread_rng().gen_range(1..=10);
    for _ in 0..rounds {
        spin_loop();
    }
}

#[cfg(not(feature = "idle-spin"))]
fn idle_spin() {
    spin_loop();
}

#[must_use]
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::UnsafeCell;
    use std::thread;

    use crossbeam_queue::ArrayQueue;

    use crate::scheduler::Scheduler;

    // Silly unsafe cell that is sync to test mutual exclusion of locks
    struct UnsafeSyncCell<T: ?Sized> {
        inner: UnsafeCell<T>,
    }
    impl<T> UnsafeSyncCell<T> {
        fn new(v: T) -> Self {
            UnsafeSyncCell {
                inner: UnsafeCell::new(v),
            }
        }
    }
    unsafe impl<T: ?Sized + Send> Send for UnsafeSyncCell<T> {}
    unsafe impl<T: ?Sized + Send> Sync for UnsafeSyncCell<T> {}

    #[test]
    fn spin_lock_is_fifo() {
        let _r = env_logger::try_init();

        let n = 6;
        let lock = Arc::new(Lock::new_spin());
        let order = Arc::new(ArrayQueue::new(n));

        assert_eq!(lock.acquire_ticketed(), Some(0));
        let contenders: Vec<_> = (0..n)
            .map(|_| {
                let lock = lock.clone();
                let order = order.clone();
                thread::spawn(move || {
                    let ticket = lock.acquire_ticketed().unwrap();
                    order.push(ticket).unwrap();
                    lock.release();
                })
            })
            .collect();

        // Everyone holds a ticket before the first one gets served.
        while lock.tickets_issued() != n + 1 {
            thread::yield_now();
        }
        lock.release();
        for c in contenders {
            c.join().unwrap();
        }

        let served: Vec<usize> = std::iter::from_fn(|| order.pop()).collect();
        assert_eq!(served, (1..=n).collect::<Vec<_>>());
    }

    #[test]
    fn try_acquire() {
        for lock in [
            Lock::new_spin(),
            Lock::new_block(),
            Lock::new_block_front(),
            Lock::new_semaphore().unwrap(),
        ]
        .iter()
        {
            assert!(lock.try_acquire());
            assert!(!lock.try_acquire());
            lock.release();
            let _g = lock.lock();
            assert!(!lock.try_acquire());
        }
    }

    #[test]
    fn classes() {
        for class in [
            LockClass::Spin,
            LockClass::Block,
            LockClass::BlockFront,
            LockClass::Semaphore,
        ]
        .iter()
        {
            assert_eq!(Lock::new(*class).unwrap().class(), Some(*class));
            assert_eq!(LockClass::from_raw(*class as u32), Some(*class));
        }
        assert!(LockClass::Block.is_blocking());
        assert!(!LockClass::Semaphore.is_blocking());
    }

    #[test]
    fn unknown_class_is_a_noop() {
        let _r = env_logger::try_init();

        let lock = Lock::from_raw_class(42).unwrap();
        assert_eq!(lock.class(), None);
        lock.acquire();
        lock.acquire();
        lock.release();
        assert!(!lock.try_acquire());
    }

    /// 4 unbound threads on 3 virtual processors increment a counter
    /// protected by a lock of `class`.
    fn mutual_exclusion(class: LockClass) {
        let _r = env_logger::try_init();

        let n = 4;
        let increments = 500;
        let s = Scheduler::new();
        let lock = Arc::new(Lock::new(class).unwrap());
        let counter: Arc<UnsafeSyncCell<usize>> = Arc::new(UnsafeSyncCell::new(0));

        for _idx in 0..n {
            let lock = lock.clone();
            let counter = counter.clone();
            s.create(move || {
                for i in 0..increments {
                    lock.acquire();
                    unsafe {
                        *counter.inner.get() += 1;
                    }
                    lock.release();
                    if i % 50 == 0 {
                        yield_now();
                    }
                }
            })
            .expect("can't create thread");
        }

        s.start(3).expect("can't start scheduler");
        assert_eq!(unsafe { *counter.inner.get() }, n * increments);
    }

    #[test]
    fn spin_lock_smp() {
        mutual_exclusion(LockClass::Spin);
    }

    #[test]
    fn block_lock_smp() {
        mutual_exclusion(LockClass::Block);
    }

    #[test]
    fn block_front_lock_smp() {
        mutual_exclusion(LockClass::BlockFront);
    }

    #[test]
    fn semaphore_lock_smp() {
        mutual_exclusion(LockClass::Semaphore);
    }
}
