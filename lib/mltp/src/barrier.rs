// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

use crate::error::MltpError;
use crate::lock::{Lock, LockClass};
use crate::tls::{yield_now, Environment};

/// A reusable barrier for unbound and bound threads.
///
/// Waiters don't sleep: they poll the episode and yield until the last
/// arrival flipped it.
#[derive(Debug)]
pub struct Barrier {
    lock: Lock,
    // Only modified while holding `lock`.
    waiters: AtomicUsize,
    episode: AtomicUsize,
}

impl Default for Barrier {
    fn default() -> Self {
        Barrier::with_lock(Lock::new_spin())
    }
}

impl Barrier {
    pub fn new() -> Barrier {
        Barrier::default()
    }

    /// A barrier whose state is guarded by a lock of `class`.
    pub fn with_lock_class(class: LockClass) -> Result<Barrier, MltpError> {
        Ok(Barrier::with_lock(Lock::new(class)?))
    }

    fn with_lock(lock: Lock) -> Barrier {
        Barrier {
            lock,
            waiters: AtomicUsize::new(0),
            episode: AtomicUsize::new(0),
        }
    }

    /// Waits until `count` threads entered the barrier.
    pub fn enter(&self, count: usize) {
        self.lock.acquire();
        let episode = self.episode.load(Ordering::Relaxed);
        let waiters = self.waiters.load(Ordering::Relaxed) + 1;

        if waiters >= count {
            self.waiters.store(0, Ordering::Relaxed);
            self.episode.store(episode ^ 1, Ordering::Release);
            self.lock.release();
            trace!("Barrier {:p} episode {} complete", self, episode);
        } else {
            self.waiters.store(waiters, Ordering::Relaxed);
            self.lock.release();
            while self.episode.load(Ordering::Acquire) == episode {
                relax();
            }
        }
    }
}

fn relax() {
    if Environment::is_unbound() {
        yield_now();
    } else {
        std::thread::yield_now();
    }
}
