// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::any::Any;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use kthreads::{KthreadId, Semaphore};
use log::*;

use crate::atomic;
use crate::error::MltpError;
use crate::lock::Lock;
use crate::queue::ThreadQueue;
use crate::stack::{ThreadStack, DEFAULT_STACK_SIZE_BYTES};
use crate::threads::{Entry, Thread, ThreadId, UnboundHandle};
use crate::tls::{self, VpLocal};

/// Stack of the kernel thread running a virtual processor.
const VP_STACK_SIZE_BYTES: usize = 64 * 4096;

/// Runs unbound threads on a set of virtual processors (VPs).
///
/// Threads are created Ready on a shared run queue. [`Scheduler::start`]
/// spawns the VPs, each of which takes threads from the queue and runs them
/// until they yield, block or finish. A VP retires once there are more VPs
/// than live threads, `start` returns after all of them retired.
pub struct Scheduler {
    myself: Weak<Scheduler>,
    run_queue: ThreadQueue,
    tid_counter: AtomicUsize,
    /// Unbound threads created but not yet terminated.
    uthreads: CachePadded<AtomicUsize>,
    /// VPs that did not retire yet.
    num_vps: CachePadded<AtomicUsize>,
    start_lock: Lock,
}

impl Scheduler {
    pub fn new() -> Arc<Scheduler> {
        Arc::new_cyclic(|myself| Scheduler {
            myself: myself.clone(),
            run_queue: ThreadQueue::new(),
            tid_counter: AtomicUsize::new(1),
            uthreads: CachePadded::new(AtomicUsize::new(0)),
            num_vps: CachePadded::new(AtomicUsize::new(0)),
            start_lock: Lock::new_spin(),
        })
    }

    pub(crate) fn run_queue(&self) -> &ThreadQueue {
        &self.run_queue
    }

    /// Number of unbound threads that did not terminate yet.
    pub fn live_threads(&self) -> usize {
        self.uthreads.load(Ordering::Acquire)
    }

    /// Number of VPs that did not retire yet.
    pub fn live_vps(&self) -> usize {
        self.num_vps.load(Ordering::Acquire)
    }

    /// Creates an unbound thread running `f` with the default stack size.
    pub fn create<F, T>(&self, f: F) -> Result<UnboundHandle<T>, MltpError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.create_with_stack(DEFAULT_STACK_SIZE_BYTES, f)
    }

    /// Creates an unbound thread running `f(arg)`.
    pub fn create_with_arg<A, T>(
        &self,
        f: fn(A) -> T,
        arg: A,
    ) -> Result<UnboundHandle<T>, MltpError>
    where
        A: Send + 'static,
        T: Send + 'static,
    {
        self.create(move || f(arg))
    }

    pub fn create_with_stack<F, T>(
        &self,
        stack_size: usize,
        f: F,
    ) -> Result<UnboundHandle<T>, MltpError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let stack = ThreadStack::from_size(stack_size)?;
        let tid = ThreadId(self.tid_counter.fetch_add(1, Ordering::Relaxed));
        let entry: Entry = Box::new(move || Box::new(f()) as Box<dyn Any + Send>);
        let thread = Thread::unbound(tid, stack, entry, self.myself.clone());

        self.thread_created();
        self.run_queue.enqueue(thread.clone());
        trace!("created {}", tid);

        Ok(UnboundHandle::new(thread))
    }

    fn thread_created(&self) {
        let mut live = self.uthreads.load(Ordering::Acquire);
        while !atomic::compare_and_swap(live, live + 1, &self.uthreads) {
            live = self.uthreads.load(Ordering::Acquire);
        }
    }

    pub(crate) fn thread_exited(&self) {
        let mut live = self.uthreads.load(Ordering::Acquire);
        while !atomic::compare_and_swap(live, live.saturating_sub(1), &self.uthreads) {
            live = self.uthreads.load(Ordering::Acquire);
        }
    }

    /// Runs all threads on `num_vps` virtual processors and returns once
    /// every VP retired.
    ///
    /// Concurrent calls are serialized.
    pub fn start(self: &Arc<Self>, num_vps: usize) -> Result<(), MltpError> {
        if num_vps == 0 {
            return Err(MltpError::InvalidVpCount);
        }

        let _guard = self.start_lock.lock();
        kthreads::init();
        let start_sem = Semaphore::create(1)?;
        self.num_vps.store(num_vps, Ordering::Release);
        debug!(
            "starting {} VPs for {} threads",
            num_vps,
            self.live_threads()
        );
        self.run_queue.dump();

        // VP 0 goes last, the others wait for it.
        let mut vps: Vec<KthreadId> = Vec::with_capacity(num_vps);
        let mut failure = None;
        for vp_id in (0..num_vps).rev() {
            let s = self.clone();
            let sem = start_sem.clone();
            let vp = kthreads::create(move || s.vp_body(vp_id, &sem), VP_STACK_SIZE_BYTES, None);
            match vp {
                Ok(id) => vps.push(id),
                Err(e) => {
                    error!("Unable to create VP {}: {}", vp_id, e);
                    failure = Some(e);
                    break;
                }
            }
        }

        if failure.is_some() {
            // VP 0 doesn't exist, let the others go on our own.
            self.num_vps.store(vps.len(), Ordering::Release);
            start_sem.get();
            start_sem.disown();
        }

        for vp in vps {
            kthreads::join(vp);
        }
        start_sem.destroy();

        match failure {
            Some(e) => Err(e.into()),
            None => {
                debug!("all VPs retired");
                Ok(())
            }
        }
    }

    fn vp_body(&self, vp_id: usize, start_sem: &Semaphore) {
        let vp = VpLocal::new(vp_id, self);
        tls::install(&vp);

        if vp_id == 0 {
            // Nobody releases it: it stays at zero until `start` is done.
            start_sem.get();
            start_sem.disown();
        } else {
            start_sem.block_until_zero();
        }
        debug!("VP {} running", vp_id);

        loop {
            match self.run_queue.dequeue() {
                Some(thread) => unsafe { tls::run(&vp, thread) },
                None => {
                    let vps = self.num_vps.load(Ordering::Acquire);
                    let new_vps = vps.saturating_sub(1);
                    if new_vps >= self.live_threads()
                        && atomic::compare_and_swap(vps, new_vps, &self.num_vps)
                    {
                        break;
                    }
                    spin_loop();
                }
            }
        }

        tls::install(core::ptr::null());
        debug!("VP {} retired", vp_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::ThreadState;
    use crate::tls::{abort, yield_now};

    use crossbeam_queue::ArrayQueue;

    #[test]
    fn thread_lifecycle() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let h = s.create(|| 42usize).unwrap();
        assert_eq!(h.state(), ThreadState::Ready);
        assert_eq!(s.live_threads(), 1);
        assert!(h.thread.has_resources());
        assert_eq!(h.take_result(), None);

        s.start(1).unwrap();
        assert_eq!(h.state(), ThreadState::Done);
        assert!(!h.thread.has_resources());
        assert_eq!(s.live_threads(), 0);
        assert_eq!(s.live_vps(), 0);
        assert_eq!(h.take_result(), Some(42));
        assert_eq!(h.take_result(), None);
    }

    #[test]
    fn fifo_on_one_vp() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let order = Arc::new(ArrayQueue::new(16));
        for i in 0..10 {
            let o = order.clone();
            s.create(move || o.push(i).unwrap()).unwrap();
        }

        s.start(1).unwrap();
        let ran: Vec<usize> = std::iter::from_fn(|| order.pop()).collect();
        assert_eq!(ran, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn abort_mid_function() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let trace = Arc::new(ArrayQueue::new(4));
        let t = trace.clone();
        let h = s
            .create(move || -> usize {
                t.push("before").unwrap();
                abort();
            })
            .unwrap();

        s.start(2).unwrap();
        assert!(h.is_done());
        assert_eq!(h.take_result(), None);
        assert!(!h.thread.has_resources());
        assert_eq!(trace.pop(), Some("before"));
        assert_eq!(trace.pop(), None);
    }

    #[test]
    fn panicking_thread_terminates() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let bad = s.create(|| -> u32 { panic!("expected panic") }).unwrap();
        let good = s.create(|| 7u32).unwrap();

        s.start(2).unwrap();
        assert!(bad.is_done());
        assert_eq!(bad.take_result(), None);
        assert_eq!(good.take_result(), Some(7));
    }

    #[test]
    fn create_from_unbound_thread() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let s2 = s.clone();
        let h = s
            .create(move || {
                let child = s2.create_with_arg(|x: u64| x * 2, 21).unwrap();
                while !child.is_done() {
                    yield_now();
                }
                child.take_result()
            })
            .unwrap();

        s.start(3).unwrap();
        assert_eq!(h.take_result(), Some(Some(42)));
    }

    #[test]
    fn many_threads_few_vps() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let handles: Vec<_> = (0..64usize)
            .map(|i| {
                s.create_with_stack(8 * 4096, move || {
                    for _ in 0..i % 5 {
                        yield_now();
                    }
                    i
                })
                .unwrap()
            })
            .collect();

        s.start(4).unwrap();
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(h.take_result(), Some(i));
        }
    }

    #[test]
    fn start_without_threads() {
        let s = Scheduler::new();
        s.start(3).unwrap();
        assert_eq!(s.live_vps(), 0);
        assert_eq!(s.start(0), Err(MltpError::InvalidVpCount));
    }

    #[test]
    fn restart() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let a = s.create(|| 1).unwrap();
        s.start(2).unwrap();
        let b = s.create(|| 2).unwrap();
        s.start(2).unwrap();
        assert_eq!(a.take_result(), Some(1));
        assert_eq!(b.take_result(), Some(2));
    }
}
