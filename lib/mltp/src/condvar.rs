// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Condition variables for unbound threads.
//!
//! A waiter leaves the run queue and parks on the condition's own queue, a
//! signal moves it back. There is no associated mutex: a signal without any
//! waiter is lost.

use std::sync::{Arc, Weak};

use log::*;

use crate::error::MltpError;
use crate::lock::LockClass;
use crate::queue::{Chain, ThreadQueue};
use crate::scheduler::Scheduler;
use crate::threads::{Thread, ThreadState};
use crate::tls;

pub struct Condition {
    waiters: ThreadQueue,
}

impl Default for Condition {
    fn default() -> Self {
        Condition {
            waiters: ThreadQueue::new(),
        }
    }
}

impl Condition {
    pub fn new() -> Condition {
        Condition::default()
    }

    /// A condition whose wait queue is guarded by a lock of `class`.
    ///
    /// With [`LockClass::Semaphore`], kills of a VP's kernel thread are held
    /// back while it parks a waiter.
    ///
    /// # Panics
    /// If `class` is a blocking class.
    pub fn with_lock_class(class: LockClass) -> Result<Condition, MltpError> {
        Ok(Condition {
            waiters: ThreadQueue::with_class(class)?,
        })
    }

    /// Suspends the calling unbound thread until it gets signaled.
    ///
    /// # Panics
    /// When not called from an unbound thread.
    pub fn wait(&self) {
        tls::wait_on(&self.waiters);
    }

    /// Makes the longest waiting thread runnable again.
    ///
    /// Returns false if nobody was waiting.
    pub fn signal(&self) -> bool {
        match self.waiters.dequeue() {
            Some(thread) => {
                wake(thread);
                true
            }
            None => false,
        }
    }

    /// Makes all waiting threads runnable again, returns how many there
    /// were.
    pub fn broadcast(&self) -> usize {
        let chain = match self.waiters.take_all() {
            Some(chain) => chain,
            None => return 0,
        };
        let woken = chain.len();
        chain.for_each(|t| t.set_state(ThreadState::Ready));

        match common_home(&chain) {
            Some(scheduler) => scheduler.run_queue().append(chain),
            None => {
                for thread in chain.into_threads() {
                    wake(thread);
                }
            }
        }
        trace!("broadcast woke {} threads", woken);
        woken
    }

    /// Number of threads waiting.
    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

/// The scheduler all threads of `chain` belong to, if it is the same one.
fn common_home(chain: &Chain) -> Option<Arc<Scheduler>> {
    let mut home: Option<Weak<Scheduler>> = None;
    let mut mixed = false;
    chain.for_each(|t| {
        if let Some(h) = &home {
            mixed |= !h.ptr_eq(&t.home);
        } else {
            home = Some(t.home.clone());
        }
    });

    if mixed {
        None
    } else {
        home.as_ref().and_then(Weak::upgrade)
    }
}

fn wake(thread: Arc<Thread>) {
    match thread.home.upgrade() {
        Some(scheduler) => {
            thread.set_state(ThreadState::Ready);
            scheduler.run_queue().enqueue(thread);
        }
        None => warn!("{} can't be woken, its scheduler is gone", thread.id),
    }
}
