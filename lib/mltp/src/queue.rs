// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Intrusive FIFO of thread descriptors.
//!
//! The list is circular and closed by a sentinel descriptor: an empty queue
//! is a sentinel that points to itself. A queued thread is owned by the
//! queue (one strong reference, kept as a raw pointer in the links).

use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::*;

use crate::error::MltpError;
use crate::lock::{Lock, LockClass};
use crate::threads::{Thread, ThreadId};

pub(crate) struct ThreadQueue {
    sentinel: Box<Thread>,
    /// Last element (or the sentinel), protected by `lock`.
    tail: UnsafeCell<*mut Thread>,
    len: AtomicUsize,
    lock: Lock,
}

unsafe impl Send for ThreadQueue {}
unsafe impl Sync for ThreadQueue {}

impl ThreadQueue {
    pub(crate) fn new() -> ThreadQueue {
        ThreadQueue::with_lock(Lock::new_spin())
    }

    /// A queue guarded by a lock of `class`.
    ///
    /// # Panics
    /// If `class` is blocking: queues are manipulated from switch landing
    /// functions which must not yield.
    pub(crate) fn with_class(class: LockClass) -> Result<ThreadQueue, MltpError> {
        if class.is_blocking() {
            panic!("A {:?} lock can't guard a thread queue.", class);
        }
        Ok(ThreadQueue::with_lock(Lock::new(class)?))
    }

    fn with_lock(lock: Lock) -> ThreadQueue {
        let sentinel = Box::new(Thread::pseudo(ThreadId::SENTINEL));
        let s = &*sentinel as *const Thread as *mut Thread;
        sentinel.next.store(s, Ordering::Relaxed);

        ThreadQueue {
            sentinel,
            tail: UnsafeCell::new(s),
            len: AtomicUsize::new(0),
            lock,
        }
    }

    #[inline]
    fn sentinel(&self) -> *mut Thread {
        &*self.sentinel as *const Thread as *mut Thread
    }

    /// Appends `thread` at the tail.
    pub(crate) fn enqueue(&self, thread: Arc<Thread>) {
        let t = Arc::into_raw(thread) as *mut Thread;
        let _g = self.lock.lock();
        unsafe {
            let tail = self.tail.get();
            (*t).next.store(self.sentinel(), Ordering::Relaxed);
            (**tail).next.store(t, Ordering::Relaxed);
            *tail = t;
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Inserts `thread` behind the current head, or at the tail of an empty
    /// queue.
    pub(crate) fn enqueue_front(&self, thread: Arc<Thread>) {
        let t = Arc::into_raw(thread) as *mut Thread;
        let s = self.sentinel();
        let _g = self.lock.lock();
        unsafe {
            let tail = self.tail.get();
            let first = (*s).next.load(Ordering::Relaxed);
            let after = if first == s { s } else { first };

            let next = (*after).next.load(Ordering::Relaxed);
            (*t).next.store(next, Ordering::Relaxed);
            (*after).next.store(t, Ordering::Relaxed);
            if next == s {
                *tail = t;
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes the head.
    pub(crate) fn dequeue(&self) -> Option<Arc<Thread>> {
        let s = self.sentinel();
        let _g = self.lock.lock();
        unsafe {
            let first = (*s).next.load(Ordering::Relaxed);
            if first == s {
                return None;
            }

            let next = (*first).next.load(Ordering::Relaxed);
            (*s).next.store(next, Ordering::Relaxed);
            if next == s {
                *self.tail.get() = s;
            }
            (*first).next.store(ptr::null_mut(), Ordering::Relaxed);
            self.len.fetch_sub(1, Ordering::Relaxed);
            Some(Arc::from_raw(first))
        }
    }

    /// Detaches all queued threads at once.
    pub(crate) fn take_all(&self) -> Option<Chain> {
        let s = self.sentinel();
        let _g = self.lock.lock();
        unsafe {
            let first = (*s).next.load(Ordering::Relaxed);
            if first == s {
                return None;
            }

            let tail = self.tail.get();
            let chain = Chain {
                first,
                last: *tail,
                len: self.len.swap(0, Ordering::Relaxed),
            };
            (*s).next.store(s, Ordering::Relaxed);
            *tail = s;
            Some(chain)
        }
    }

    /// Appends a chain taken from another queue in one step.
    pub(crate) fn append(&self, chain: Chain) {
        let chain = ManuallyDrop::new(chain);
        let _g = self.lock.lock();
        unsafe {
            let tail = self.tail.get();
            (*chain.last).next.store(self.sentinel(), Ordering::Relaxed);
            (**tail).next.store(chain.first, Ordering::Relaxed);
            *tail = chain.last;
        }
        self.len.fetch_add(chain.len, Ordering::Relaxed);
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logs the ids of all queued threads.
    pub(crate) fn dump(&self) {
        let s = self.sentinel();
        let mut ids = Vec::with_capacity(self.len());
        {
            let _g = self.lock.lock();
            let mut t = unsafe { (*s).next.load(Ordering::Relaxed) };
            while t != s {
                unsafe {
                    ids.push((*t).id.0);
                    t = (*t).next.load(Ordering::Relaxed);
                }
            }
        }
        debug!("queue {:p}: {:?}", self, ids);
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        while let Some(t) = self.dequeue() {
            trace!("dropping queued {}", t.id);
        }
    }
}

/// A run of threads detached from a queue by [`ThreadQueue::take_all`].
pub(crate) struct Chain {
    first: *mut Thread,
    last: *mut Thread,
    len: usize,
}

impl Chain {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Visits every thread in queue order.
    pub(crate) fn for_each<F: FnMut(&Thread)>(&self, mut f: F) {
        let mut t = self.first;
        for _ in 0..self.len {
            unsafe {
                f(&*t);
                t = (*t).next.load(Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn into_threads(self) -> Vec<Arc<Thread>> {
        let chain = ManuallyDrop::new(self);
        let mut threads = Vec::with_capacity(chain.len);
        let mut t = chain.first;
        for _ in 0..chain.len {
            unsafe {
                let next = (*t).next.load(Ordering::Relaxed);
                (*t).next.store(ptr::null_mut(), Ordering::Relaxed);
                threads.push(Arc::from_raw(t as *const Thread));
                t = next;
            }
        }
        threads
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        let chain = Chain {
            first: self.first,
            last: self.last,
            len: self.len,
        };
        self.len = 0;
        drop(chain.into_threads());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn thread(id: usize) -> Arc<Thread> {
        Arc::new(Thread::pseudo(ThreadId(id)))
    }

    fn drain(q: &ThreadQueue) -> Vec<usize> {
        std::iter::from_fn(|| q.dequeue()).map(|t| t.id.0).collect()
    }

    #[test]
    fn fifo() {
        let q = ThreadQueue::new();
        assert!(q.dequeue().is_none());
        q.enqueue(thread(1));
        q.enqueue(thread(2));
        q.enqueue(thread(3));
        assert_eq!(q.len(), 3);
        assert_eq!(drain(&q), vec![1, 2, 3]);
        assert!(q.dequeue().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn front_insertion() {
        let q = ThreadQueue::new();
        q.enqueue(thread(1));
        q.enqueue(thread(2));
        q.enqueue_front(thread(3));
        assert_eq!(drain(&q), vec![1, 3, 2]);

        // Behaves like enqueue on empty and single element queues.
        q.enqueue_front(thread(4));
        q.enqueue_front(thread(5));
        q.enqueue(thread(6));
        assert_eq!(drain(&q), vec![4, 5, 6]);
    }

    #[test]
    fn splice() {
        let a = ThreadQueue::new();
        let b = ThreadQueue::new();
        assert!(a.take_all().is_none());

        a.enqueue(thread(1));
        a.enqueue(thread(2));
        b.enqueue(thread(3));

        let chain = a.take_all().unwrap();
        assert_eq!(chain.len(), 2);
        assert!(a.is_empty());
        b.append(chain);
        a.enqueue(thread(7));

        assert_eq!(b.len(), 3);
        assert_eq!(drain(&b), vec![3, 1, 2]);
        assert_eq!(drain(&a), vec![7]);
    }

    #[test]
    fn dropped_chain_releases_threads() {
        let q = ThreadQueue::new();
        let t = thread(1);
        q.enqueue(t.clone());
        assert_eq!(Arc::strong_count(&t), 2);
        drop(q.take_all());
        assert_eq!(Arc::strong_count(&t), 1);
    }

    #[test]
    fn dropped_queue_releases_threads() {
        let t = thread(1);
        {
            let q = ThreadQueue::new();
            q.enqueue(t.clone());
            q.dump();
        }
        assert_eq!(Arc::strong_count(&t), 1);
    }

    #[test]
    fn semaphore_guarded_queue() {
        let q = ThreadQueue::with_class(LockClass::Semaphore).unwrap();
        q.enqueue(thread(1));
        assert_eq!(drain(&q), vec![1]);
    }

    #[test]
    #[should_panic(expected = "can't guard a thread queue")]
    fn blocking_queue_lock_is_rejected() {
        let _q = ThreadQueue::with_class(LockClass::Block);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(usize),
        EnqueueFront(usize),
        Dequeue,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..1000usize).prop_map(Op::Enqueue),
            (0..1000usize).prop_map(Op::EnqueueFront),
            Just(Op::Dequeue),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_model(ops in proptest::collection::vec(op(), 0..64)) {
            let q = ThreadQueue::new();
            let mut model: VecDeque<usize> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Enqueue(id) => {
                        q.enqueue(thread(id));
                        model.push_back(id);
                    }
                    Op::EnqueueFront(id) => {
                        q.enqueue_front(thread(id));
                        if model.is_empty() {
                            model.push_back(id);
                        } else {
                            model.insert(1, id);
                        }
                    }
                    Op::Dequeue => {
                        prop_assert_eq!(q.dequeue().map(|t| t.id.0), model.pop_front());
                    }
                }
                prop_assert_eq!(q.len(), model.len());
            }
            prop_assert_eq!(drain(&q), Vec::from(model));
        }
    }
}
