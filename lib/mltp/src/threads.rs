// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::any::Any;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use kthreads::{KthreadId, TerminateFn};

use crate::arch;
use crate::error::MltpError;
use crate::scheduler::Scheduler;
use crate::stack::ThreadStack;
use crate::tls;

/// Size of the zeroed scratch memory every unbound thread gets.
pub const PRIVATE_SIZE_BYTES: usize = 1024 * mem::size_of::<usize>();

/// Identifies an unbound thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ThreadId(pub usize);

impl ThreadId {
    /// Carried by queue sentinels, never by a runnable thread.
    pub(crate) const SENTINEL: ThreadId = ThreadId(usize::MAX);

    /// The main context of virtual processor `vp`.
    pub(crate) fn vp_main(vp: usize) -> ThreadId {
        ThreadId(usize::MAX - 1 - vp)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ThreadId {{ id={} }}", self.0)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Waiting on the run queue.
    Ready = 0,
    Running = 1,
    /// Suspended: about to be queued or parked on a condition.
    Blocked = 2,
    /// Finished, its stack is (or is about to be) gone.
    Done = 3,
}

impl From<u8> for ThreadState {
    fn from(v: u8) -> ThreadState {
        match v {
            0 => ThreadState::Ready,
            1 => ThreadState::Running,
            2 => ThreadState::Blocked,
            _ => ThreadState::Done,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadKind {
    /// Scheduled cooperatively on virtual processors.
    Unbound,
    /// A kernel thread of its own.
    Bound,
}

pub(crate) type Entry = Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>;

/// Descriptor of an unbound thread.
///
/// Also used without stack for queue sentinels and the main context of a
/// virtual processor.
pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    state: AtomicU8,
    /// Saved stack pointer; only valid while the thread is not running.
    context: AtomicPtr<u8>,
    /// Intrusive link, protected by the lock of the queue we're on.
    pub(crate) next: AtomicPtr<Thread>,
    stack: spin::Mutex<Option<ThreadStack>>,
    private: spin::Mutex<Option<Box<[u8]>>>,
    entry: spin::Mutex<Option<Entry>>,
    retval: spin::Mutex<Option<Box<dyn Any + Send>>>,
    pub(crate) home: Weak<Scheduler>,
}

impl Thread {
    pub(crate) fn pseudo(id: ThreadId) -> Thread {
        Thread {
            id,
            state: AtomicU8::new(ThreadState::Running as u8),
            context: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            stack: spin::Mutex::new(None),
            private: spin::Mutex::new(None),
            entry: spin::Mutex::new(None),
            retval: spin::Mutex::new(None),
            home: Weak::new(),
        }
    }

    /// A Ready thread that starts out executing `entry` on `stack`.
    pub(crate) fn unbound(
        id: ThreadId,
        stack: ThreadStack,
        entry: Entry,
        home: Weak<Scheduler>,
    ) -> Arc<Thread> {
        let stack_top = stack.base();
        let thread = Arc::new(Thread {
            id,
            state: AtomicU8::new(ThreadState::Ready as u8),
            context: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            stack: spin::Mutex::new(Some(stack)),
            private: spin::Mutex::new(Some(vec![0u8; PRIVATE_SIZE_BYTES].into_boxed_slice())),
            entry: spin::Mutex::new(Some(entry)),
            retval: spin::Mutex::new(None),
            home,
        });

        // The stack memory doesn't move with the `ThreadStack`.
        let context = unsafe {
            arch::init_context(
                stack_top,
                tls::thread_main,
                Arc::as_ptr(&thread) as *const u8,
            )
        };
        thread.set_context(context);
        thread
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn context(&self) -> *mut u8 {
        self.context.load(Ordering::Acquire)
    }

    pub(crate) fn set_context(&self, context: *mut u8) {
        self.context.store(context, Ordering::Release);
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.lock().take()
    }

    pub(crate) fn set_retval(&self, retval: Box<dyn Any + Send>) {
        *self.retval.lock() = Some(retval);
    }

    fn take_retval(&self) -> Option<Box<dyn Any + Send>> {
        self.retval.lock().take()
    }

    pub(crate) fn with_private<R, F: FnOnce(&mut [u8]) -> R>(&self, f: F) -> R {
        let mut private = self.private.lock();
        match private.as_deref_mut() {
            Some(p) => f(p),
            None => panic!("{} has no private memory", self.id),
        }
    }

    /// Frees stack and private memory.
    ///
    /// Nothing may execute on the stack anymore.
    pub(crate) fn release_resources(&self) {
        let stack = self.stack.lock().take();
        let private = self.private.lock().take();
        drop(stack);
        drop(private);
    }

    pub(crate) fn has_resources(&self) -> bool {
        self.stack.lock().is_some() || self.private.lock().is_some()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to an unbound thread whose entry function returns a `T`.
pub struct UnboundHandle<T> {
    pub(crate) thread: Arc<Thread>,
    _result: PhantomData<fn() -> T>,
}

impl<T: 'static> UnboundHandle<T> {
    pub(crate) fn new(thread: Arc<Thread>) -> UnboundHandle<T> {
        UnboundHandle {
            thread,
            _result: PhantomData,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.thread.id
    }

    pub fn kind(&self) -> ThreadKind {
        ThreadKind::Unbound
    }

    pub fn state(&self) -> ThreadState {
        self.thread.state()
    }

    pub fn is_done(&self) -> bool {
        self.state() == ThreadState::Done
    }

    /// Takes the value the entry function returned.
    ///
    /// `None` while the thread is not done, if it called [`crate::abort`]
    /// or panicked, and after the value was taken once.
    pub fn take_result(&self) -> Option<T> {
        if !self.is_done() {
            return None;
        }
        self.thread
            .take_retval()
            .and_then(|r| r.downcast::<T>().ok())
            .map(|r| *r)
    }
}

impl<T> fmt::Debug for UnboundHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("UnboundHandle").field(&self.thread).finish()
    }
}

/// A thread that is a kernel thread of its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BoundThread {
    id: KthreadId,
}

impl BoundThread {
    pub fn id(&self) -> KthreadId {
        self.id
    }

    pub fn kind(&self) -> ThreadKind {
        ThreadKind::Bound
    }
}

/// Runs `f` in a new bound thread.
pub fn create_bound<F>(
    f: F,
    stack_size: usize,
    on_terminate: Option<TerminateFn>,
) -> Result<BoundThread, MltpError>
where
    F: FnOnce() + Send + 'static,
{
    let id = kthreads::create(f, stack_size, on_terminate)?;
    Ok(BoundThread { id })
}

/// Waits for a bound thread to terminate.
pub fn join_bound(thread: &BoundThread) {
    kthreads::join(thread.id);
}

/// Gives up the processor of a bound thread.
pub fn yield_bound() {
    std::thread::yield_now();
}
