// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel thread creation, joining and termination.

use core::cmp;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread as os;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use hashbrown::HashMap;
use log::*;

use crate::error::KthreadError;
use crate::local;
use crate::reaper;
use crate::semaphore::{SemId, Semaphore};
use crate::signals;
use crate::{MAX_THREADS, MIN_STACK_BYTES};

/// How long a kernel wait sleeps before it re-checks for a kill request.
pub(crate) const WAIT_POLL: Duration = Duration::from_millis(10);

/// How long `join` waits for a termination notice before polling again.
const JOIN_POLL: Duration = Duration::from_millis(50);

/// Identifies a kernel thread; `KthreadId::NONE` is nobody.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct KthreadId(pub u64);

impl KthreadId {
    pub const NONE: KthreadId = KthreadId(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for KthreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KthreadId {{ id={} }}", self.0)
    }
}

/// Invoked by the reaper once the kernel thread terminated.
pub type TerminateFn = Box<dyn FnOnce(KthreadId) + Send + 'static>;

/// Unwind payload that tears down a killed kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Killed(pub KthreadId);

/// Bookkeeping for a kernel thread created through [`create`].
pub(crate) struct ThreadInfo {
    killed: Arc<AtomicBool>,
    thread: spin::Mutex<Option<os::Thread>>,
    on_terminate: spin::Mutex<Option<TerminateFn>>,
}

impl ThreadInfo {
    fn new(on_terminate: Option<TerminateFn>) -> ThreadInfo {
        ThreadInfo {
            killed: Arc::new(AtomicBool::new(false)),
            thread: spin::Mutex::new(None),
            on_terminate: spin::Mutex::new(on_terminate),
        }
    }

    fn request_kill(&self) {
        self.killed.store(true, Ordering::Release);
        if let Some(t) = self.thread.lock().as_ref() {
            t.unpark();
        }
    }

    pub(crate) fn take_terminate(&self) -> Option<TerminateFn> {
        self.on_terminate.lock().take()
    }
}

/// Process wide state of the kernel thread layer.
pub(crate) struct Kernel {
    pub(crate) threads: spin::Mutex<HashMap<KthreadId, Arc<ThreadInfo>>>,
    pub(crate) semaphores: spin::Mutex<HashMap<SemId, Weak<Semaphore>>>,
    /// Serializes thread creation and hands control over to new children.
    pub(crate) sys_sem: Semaphore,
    notices: SegQueue<KthreadId>,
    reaper: spin::Once<os::Thread>,
    /// Bumped by the reaper every time a thread was retired.
    exits: Mutex<u64>,
    exited: Condvar,
    next_thread: AtomicU64,
    next_sem: AtomicU64,
}

static KERNEL: spin::Once<Kernel> = spin::Once::new();
static BOOT: spin::Once<()> = spin::Once::new();

impl Kernel {
    fn new() -> Kernel {
        Kernel {
            threads: spin::Mutex::new(HashMap::with_capacity(MAX_THREADS)),
            semaphores: spin::Mutex::new(HashMap::new()),
            sys_sem: Semaphore::new(SemId::SYSTEM, 1),
            notices: SegQueue::new(),
            reaper: spin::Once::new(),
            exits: Mutex::new(0),
            exited: Condvar::new(),
            next_thread: AtomicU64::new(1),
            next_sem: AtomicU64::new(SemId::SYSTEM.0 + 1),
        }
    }

    /// Starts the reaper and hooks up signal handlers, exactly once.
    ///
    /// Must not call back into `kernel()` on this thread.
    fn boot(&'static self) {
        let reaper_id = self.allocate_id();
        match reaper::spawn(self, reaper_id) {
            Ok(t) => {
                self.reaper.call_once(|| t);
            }
            Err(e) => error!("Unable to start the kernel thread reaper: {}", e),
        }
        signals::install();
        debug!("kernel thread layer initialized (reaper {})", reaper_id);
    }

    pub(crate) fn allocate_id(&self) -> KthreadId {
        KthreadId(self.next_thread.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn allocate_sem_id(&self) -> SemId {
        SemId(self.next_sem.fetch_add(1, Ordering::Relaxed))
    }

    fn is_alive(&self, id: KthreadId) -> bool {
        self.threads.lock().contains_key(&id)
    }

    /// Hands the id of a terminated thread to the reaper.
    pub(crate) fn notify_exit(&self, id: KthreadId) {
        trace!("{} terminated", id);
        self.notices.push(id);
        if let Some(r) = self.reaper.get() {
            r.unpark();
        }
    }

    pub(crate) fn next_notice(&self) -> Option<KthreadId> {
        self.notices.pop()
    }

    /// All semaphores that are still alive.
    pub(crate) fn live_semaphores(&self) -> Vec<Arc<Semaphore>> {
        self.semaphores
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Drops the registry entry of `id` and wakes up anyone joining it.
    pub(crate) fn retire(&self, id: KthreadId) {
        self.threads.lock().remove(&id);
        let mut exits = self.exits.lock().unwrap_or_else(PoisonError::into_inner);
        *exits = exits.wrapping_add(1);
        self.exited.notify_all();
    }

    fn spawn<F>(
        &self,
        entry: F,
        stack_size: usize,
        on_terminate: Option<TerminateFn>,
    ) -> Result<KthreadId, KthreadError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.threads.lock().len() >= MAX_THREADS {
            return Err(KthreadError::OutOfThreadSlots);
        }

        let id = self.allocate_id();
        let info = Arc::new(ThreadInfo::new(on_terminate));
        let killed = info.killed.clone();
        let handle = os::Builder::new()
            .name(format!("kthread-{}", id.0))
            .stack_size(cmp::max(stack_size, MIN_STACK_BYTES))
            .spawn(move || starter(id, killed, entry))?;

        *info.thread.lock() = Some(handle.thread().clone());
        self.threads.lock().insert(id, info);
        debug!("created {}", id);
        Ok(id)
    }
}

pub(crate) fn kernel() -> &'static Kernel {
    let k = KERNEL.call_once(Kernel::new);
    BOOT.call_once(|| k.boot());
    k
}

/// The kernel thread layer, if anything initialized it yet.
pub(crate) fn kernel_if_initialized() -> Option<&'static Kernel> {
    KERNEL.get()
}

/// Runs in every new kernel thread before its entry function.
fn starter<F: FnOnce()>(id: KthreadId, killed: Arc<AtomicBool>, entry: F) {
    local::bind(id, Some(killed), true);

    let r = panic::catch_unwind(AssertUnwindSafe(|| {
        // The parent holds `sys_sem` until our registry entry exists.
        let sys = &kernel().sys_sem;
        sys.get();
        sys.release();
        trace!("{} running", id);
        entry()
    }));

    match r {
        Ok(()) => trace!("{} finished", id),
        Err(payload) if payload.is::<Killed>() => debug!("{} was killed", id),
        Err(_) => error!("{} panicked", id),
    }
}

/// Initializes the kernel thread layer. Calling it again has no effect.
///
/// Every other operation of this crate calls `init` implicitly.
pub fn init() {
    kernel();
}

/// Creates a new kernel thread running `entry`.
///
/// `on_terminate` is invoked from the reaper after the thread terminated
/// and all semaphores it still held were released.
pub fn create<F>(
    entry: F,
    stack_size: usize,
    on_terminate: Option<TerminateFn>,
) -> Result<KthreadId, KthreadError>
where
    F: FnOnce() + Send + 'static,
{
    let k = kernel();
    k.sys_sem.get();
    let r = k.spawn(entry, stack_size, on_terminate);
    k.sys_sem.release();

    if let Err(e) = &r {
        warn!("kernel thread creation failed: {}", e);
        local::set_errno(e.errno());
    }
    r
}

/// Waits until the kernel thread `id` terminated and got reaped.
///
/// Returns immediately if `id` is not a running kernel thread.
pub fn join(id: KthreadId) {
    let k = kernel();
    loop {
        let exits = k.exits.lock().unwrap_or_else(PoisonError::into_inner);
        if !k.is_alive(id) {
            return;
        }
        let _ = k
            .exited
            .wait_timeout(exits, JOIN_POLL)
            .unwrap_or_else(PoisonError::into_inner);
        checkpoint();
    }
}

/// Requests termination of kernel thread `id`.
///
/// The target unwinds at its next kernel wait (semaphores, [`join`],
/// [`sleep`], [`checkpoint`]) and its thread-local storage is freed.
pub fn kill(id: KthreadId) {
    let k = kernel();
    let info = k.threads.lock().get(&id).cloned();
    match info {
        Some(info) => {
            k.sys_sem.get();
            info.request_kill();
            k.sys_sem.release();
            debug!("kill requested for {}", id);
        }
        None => debug!("kill: {} is not running", id),
    }
}

/// Identifier of the calling kernel thread.
///
/// Threads that were not created by [`create`] get an id on first use.
pub fn current() -> KthreadId {
    match local::identity() {
        Some(id) => id,
        None => {
            let id = kernel().allocate_id();
            local::bind(id, None, true);
            id
        }
    }
}

/// Unwinds the calling thread if somebody killed it.
pub fn checkpoint() {
    if local::kill_requested() {
        die();
    }
}

pub(crate) fn die() -> ! {
    panic::resume_unwind(Box::new(Killed(current())))
}

/// Sleeps for `duration`, waking up early only to honor a kill.
pub fn sleep(duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        checkpoint();
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        os::park_timeout(cmp::min(deadline - now, WAIT_POLL));
    }
}

/// Kills every registered kernel thread and forgets all semaphores.
///
/// Registered as process exit cleanup.
pub fn shutdown() {
    let k = match kernel_if_initialized() {
        Some(k) => k,
        None => return,
    };

    for info in k.threads.lock().values() {
        info.request_kill();
    }
    k.semaphores.lock().clear();
}

/// Snapshot of the kernel thread layer tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStats {
    pub threads: usize,
    pub semaphores: usize,
    pub signal_registrations: usize,
}

pub fn stats() -> KernelStats {
    let k = kernel();
    let threads = k.threads.lock().len();
    let semaphores = k.semaphores.lock().len();
    KernelStats {
        threads,
        semaphores,
        signal_registrations: signals::registrations(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Semaphore;

    use core::sync::atomic::AtomicUsize;

    #[test]
    fn create_and_join() {
        let _r = env_logger::try_init();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = create(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            None,
        )
        .expect("can't create kernel thread");

        join(id);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!kernel().is_alive(id));
    }

    #[test]
    fn terminate_callback_runs_before_join_returns() {
        let _r = env_logger::try_init();

        let reaped = Arc::new(AtomicU64::new(0));
        let r = reaped.clone();
        let id = create(
            || {},
            MIN_STACK_BYTES,
            Some(Box::new(move |id: KthreadId| {
                r.store(id.0, Ordering::SeqCst);
            })),
        )
        .expect("can't create kernel thread");

        join(id);
        assert_eq!(reaped.load(Ordering::SeqCst), id.0);
    }

    #[test]
    fn kill_unwinds_sleeper() {
        let _r = env_logger::try_init();

        let reached_end = Arc::new(AtomicBool::new(false));
        let end = reached_end.clone();
        let id = create(
            move || {
                sleep(Duration::from_secs(600));
                end.store(true, Ordering::SeqCst);
            },
            0,
            None,
        )
        .expect("can't create kernel thread");

        kill(id);
        join(id);
        assert!(!reached_end.load(Ordering::SeqCst));
    }

    #[test]
    fn masked_kill_waits_for_the_mask() {
        let _r = env_logger::try_init();

        let gate = Semaphore::create(0).unwrap();
        let got_through = Arc::new(AtomicBool::new(false));
        let reached_end = Arc::new(AtomicBool::new(false));
        let (g, through, end) = (gate.clone(), got_through.clone(), reached_end.clone());
        let id = create(
            move || {
                kill(current());
                crate::without_kill(|| g.get());
                through.store(true, Ordering::SeqCst);
                checkpoint();
                end.store(true, Ordering::SeqCst);
            },
            0,
            None,
        )
        .expect("can't create kernel thread");

        sleep(Duration::from_millis(50));
        gate.release();
        join(id);
        assert!(got_through.load(Ordering::SeqCst));
        assert!(!reached_end.load(Ordering::SeqCst));
    }

    #[test]
    fn current_is_stable() {
        let me = current();
        assert!(!me.is_none());
        assert_eq!(me, current());

        let other = os::spawn(current).join().unwrap();
        assert_ne!(me, other);
    }

    #[test]
    fn join_unknown_thread_returns() {
        join(KthreadId(u64::MAX));
    }

    #[test]
    fn child_sees_created_semaphore() {
        let _r = env_logger::try_init();

        let sem = Semaphore::create(0).unwrap();
        let s = sem.clone();
        let id = create(move || s.release(), 0, None).unwrap();
        sem.get();
        join(id);
        assert_eq!(sem.owner(), current());
    }
}
