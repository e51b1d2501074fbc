// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Virtual processor local state and the switch protocol.
//!
//! Every virtual processor (VP) has a main context running the scheduling
//! loop and at most one unbound thread running on it. An unbound thread
//! always switches back to its VP's main context, never directly to another
//! thread. Since threads move between VPs, VP local state is looked up again
//! after every switch, through accessors that are never inlined.

use core::cell::Cell;
use core::ptr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::*;

use crate::arch;
use crate::queue::ThreadQueue;
use crate::scheduler::Scheduler;
use crate::threads::{Thread, ThreadId, ThreadState};

/// State of one virtual processor, lives on the stack of its VP body.
pub(crate) struct VpLocal {
    pub(crate) vp_id: usize,
    /// Stands in for the scheduling loop when it's switched away from.
    main: Thread,
    /// Thread running on this VP, null while `main` runs. Owns one reference.
    current: Cell<*const Thread>,
    scheduler: *const Scheduler,
}

impl VpLocal {
    pub(crate) fn new(vp_id: usize, scheduler: &Scheduler) -> VpLocal {
        VpLocal {
            vp_id,
            main: Thread::pseudo(ThreadId::vp_main(vp_id)),
            current: Cell::new(ptr::null()),
            scheduler,
        }
    }
}

thread_local! {
    static VP: Cell<*const VpLocal> = const { Cell::new(ptr::null()) };
}

/// Makes `vp` the VP local state of the calling kernel thread.
pub(crate) fn install(vp: *const VpLocal) {
    VP.with(|v| v.set(vp));
}

#[inline(never)]
fn current_vp() -> *const VpLocal {
    VP.with(Cell::get)
}

/// VP local state of the caller, which has to be an unbound thread.
///
/// # Panics
/// When called from anything but an unbound thread.
#[inline(never)]
fn running_vp() -> &'static VpLocal {
    let vp = current_vp();
    assert!(
        !vp.is_null(),
        "Thread switch attempted outside of a virtual processor."
    );
    let vp = unsafe { &*vp };
    assert!(
        !vp.current.get().is_null(),
        "Thread switch attempted from the main context of VP {}.",
        vp.vp_id
    );
    vp
}

/// Queries about the thread executing the caller.
pub struct Environment;

impl Environment {
    /// Id of the calling unbound thread.
    ///
    /// # Panics
    /// When not called from an unbound thread.
    pub fn tid() -> ThreadId {
        unsafe { (*Environment::thread()).id }
    }

    /// Index of the virtual processor we're on, if any.
    pub fn vp_id() -> Option<usize> {
        let vp = current_vp();
        if vp.is_null() {
            None
        } else {
            Some(unsafe { (*vp).vp_id })
        }
    }

    /// Are we an unbound thread?
    pub fn is_unbound() -> bool {
        let vp = current_vp();
        !vp.is_null() && unsafe { !(*vp).current.get().is_null() }
    }

    pub(crate) fn thread() -> *const Thread {
        running_vp().current.get()
    }
}

/// Id of the calling unbound thread.
pub fn current_id() -> ThreadId {
    Environment::tid()
}

/// Runs `f` on the zeroed private memory of the calling unbound thread.
///
/// Don't call it again from within `f`.
pub fn with_private<R, F: FnOnce(&mut [u8]) -> R>(f: F) -> R {
    let thread = Environment::thread();
    unsafe { (*thread).with_private(f) }
}

/// Suspends the running thread and lets `landing` publish it on `queue`.
///
/// # Safety
/// `queue` has to outlive the suspension.
unsafe fn suspend(landing: arch::Landing, queue: &ThreadQueue) {
    let vp = running_vp();
    let me = vp.current.replace(ptr::null());
    (*me).set_state(ThreadState::Blocked);
    vp.main.set_state(ThreadState::Running);
    trace!("{} suspends on VP {}", (*me).id, vp.vp_id);

    arch::switch_block(
        landing,
        me as *mut u8,
        queue as *const ThreadQueue as *mut u8,
        vp.main.context(),
    );
    // We might be on another VP now.
}

unsafe fn run_queue() -> &'static ThreadQueue {
    (*running_vp().scheduler).run_queue()
}

/// Puts the calling unbound thread at the end of the run queue.
pub fn yield_now() {
    unsafe { suspend(land_ready, run_queue()) }
}

/// Puts the calling unbound thread second in the run queue, so it runs
/// again right after the thread that is next anyways.
pub fn yield_to_first() {
    unsafe { suspend(land_ready_front, run_queue()) }
}

/// Parks the calling unbound thread on a wait queue.
pub(crate) fn wait_on(queue: &ThreadQueue) {
    unsafe { suspend(land_parked, queue) }
}

/// Terminates the calling unbound thread.
///
/// Frees its stack without running destructors of anything that lives on
/// it. Threads normally end by returning from their entry function.
pub fn abort() -> ! {
    let vp = running_vp();
    let me = vp.current.replace(ptr::null());
    unsafe {
        (*me).set_state(ThreadState::Done);
        vp.main.set_state(ThreadState::Running);
        (*vp.scheduler).thread_exited();
        trace!("{} terminates on VP {}", (*me).id, vp.vp_id);

        arch::switch_abort(
            land_release,
            me as *mut u8,
            ptr::null_mut(),
            vp.main.context(),
        )
    }
}

/// Switches from the VP main context into `thread` until it suspends or
/// terminates.
///
/// # Safety
/// Must be called from the VP body that installed `vp`.
pub(crate) unsafe fn run(vp: &VpLocal, thread: Arc<Thread>) {
    debug_assert!(vp.current.get().is_null());
    thread.set_state(ThreadState::Running);
    let target = thread.context();
    trace!("VP {} runs {}", vp.vp_id, thread.id);
    vp.current.set(Arc::into_raw(thread));
    vp.main.set_state(ThreadState::Blocked);

    arch::switch_block(
        land_main,
        &vp.main as *const Thread as *mut u8,
        ptr::null_mut(),
        target,
    );
}

/// Where every unbound thread starts.
pub(crate) extern "C" fn thread_main(arg: *const u8) -> ! {
    {
        let thread = unsafe { &*(arg as *const Thread) };
        if let Some(entry) = thread.take_entry() {
            match panic::catch_unwind(AssertUnwindSafe(entry)) {
                Ok(retval) => thread.set_retval(retval),
                Err(_) => error!("{} panicked", thread.id),
            }
        }
    }
    abort()
}

unsafe extern "C" fn land_main(old: *mut u8, main: *mut u8, _unused: *mut u8) -> *mut u8 {
    (*(main as *const Thread)).set_context(old);
    ptr::null_mut()
}

// Landings can't unwind, a semaphore guarded queue must not honor kills.

unsafe extern "C" fn land_ready(old: *mut u8, thread: *mut u8, queue: *mut u8) -> *mut u8 {
    let thread = Arc::from_raw(thread as *const Thread);
    thread.set_context(old);
    thread.set_state(ThreadState::Ready);
    let queue = &*(queue as *const ThreadQueue);
    kthreads::without_kill(|| queue.enqueue(thread));
    ptr::null_mut()
}

unsafe extern "C" fn land_ready_front(old: *mut u8, thread: *mut u8, queue: *mut u8) -> *mut u8 {
    let thread = Arc::from_raw(thread as *const Thread);
    thread.set_context(old);
    thread.set_state(ThreadState::Ready);
    let queue = &*(queue as *const ThreadQueue);
    kthreads::without_kill(|| queue.enqueue_front(thread));
    ptr::null_mut()
}

unsafe extern "C" fn land_parked(old: *mut u8, thread: *mut u8, queue: *mut u8) -> *mut u8 {
    let thread = Arc::from_raw(thread as *const Thread);
    thread.set_context(old);
    let queue = &*(queue as *const ThreadQueue);
    kthreads::without_kill(|| queue.enqueue(thread));
    ptr::null_mut()
}

unsafe extern "C" fn land_release(_old: *mut u8, thread: *mut u8, _unused: *mut u8) -> *mut u8 {
    let thread = Arc::from_raw(thread as *const Thread);
    thread.release_resources();
    trace!("released stack of {}", thread.id);
    ptr::null_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use crossbeam_queue::ArrayQueue;

    #[test]
    fn environment_outside_vp() {
        assert_eq!(Environment::vp_id(), None);
        assert!(!Environment::is_unbound());
    }

    #[test]
    #[should_panic(expected = "outside of a virtual processor")]
    fn yield_outside_vp() {
        yield_now();
    }

    #[test]
    fn environment_inside_vp() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let sn = seen.clone();
        let h = s
            .create(move || {
                assert!(Environment::is_unbound());
                assert!(Environment::vp_id().unwrap() < 2);
                let state = unsafe { (*Environment::thread()).state() };
                assert_eq!(state, ThreadState::Running);
                sn.store(current_id().0, Ordering::SeqCst);
            })
            .unwrap();

        s.start(2).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), h.id().0);
        assert_eq!(Environment::vp_id(), None);
    }

    #[test]
    fn private_memory() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                s.create(move || {
                    with_private(|p| {
                        assert!(p.iter().all(|b| *b == 0));
                        p[0] = i;
                        p[p.len() - 1] = i;
                    });
                    yield_now();
                    with_private(|p| p[0] == i && p[p.len() - 1] == i)
                })
                .unwrap()
            })
            .collect();

        s.start(2).unwrap();
        for h in handles {
            assert_eq!(h.take_result(), Some(true));
        }
    }

    #[test]
    fn yield_to_first_runs_next() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let trace = Arc::new(ArrayQueue::new(8));

        let t = trace.clone();
        s.create(move || {
            t.push("0a").unwrap();
            yield_to_first();
            t.push("0b").unwrap();
        })
        .unwrap();
        for name in ["1", "2"].iter() {
            let name: &'static str = name;
            let t = trace.clone();
            s.create(move || t.push(name).unwrap()).unwrap();
        }

        s.start(1).unwrap();
        let order: Vec<&str> = std::iter::from_fn(|| trace.pop()).collect();
        assert_eq!(order, vec!["0a", "1", "0b", "2"]);
    }

    #[test]
    fn yield_goes_to_the_back() {
        let _r = env_logger::try_init();

        let s = Scheduler::new();
        let trace = Arc::new(ArrayQueue::new(8));

        let t = trace.clone();
        s.create(move || {
            t.push("0a").unwrap();
            yield_now();
            t.push("0b").unwrap();
        })
        .unwrap();
        for name in ["1", "2"].iter() {
            let name: &'static str = name;
            let t = trace.clone();
            s.create(move || t.push(name).unwrap()).unwrap();
        }

        s.start(1).unwrap();
        let order: Vec<&str> = std::iter::from_fn(|| trace.pop()).collect();
        assert_eq!(order, vec!["0a", "1", "2", "0b"]);
    }
}
