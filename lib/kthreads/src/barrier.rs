// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;

use crate::error::KthreadError;
use crate::semaphore::Semaphore;

/// A reusable barrier for kernel threads.
///
/// Built from a guard semaphore and two semaphores that take turns: waiters
/// of an episode sleep until theirs drops to zero, the last arrival re-arms
/// the other one for the next episode.
#[derive(Debug)]
pub struct KBarrier {
    lock: Arc<Semaphore>,
    barrier: [Arc<Semaphore>; 2],
    // Only modified while holding `lock`.
    waiters: AtomicUsize,
    episode: AtomicUsize,
}

impl KBarrier {
    pub fn new() -> Result<KBarrier, KthreadError> {
        Ok(KBarrier {
            lock: Semaphore::create(1)?,
            barrier: [Semaphore::create(1)?, Semaphore::create(0)?],
            waiters: AtomicUsize::new(0),
            episode: AtomicUsize::new(0),
        })
    }

    /// Waits until `count` kernel threads entered the barrier.
    pub fn enter(&self, count: usize) {
        self.lock.get();
        let episode = self.episode.load(Ordering::Relaxed);
        let waiters = self.waiters.load(Ordering::Relaxed) + 1;

        if waiters >= count {
            let next = (episode + 1) % 2;
            self.waiters.store(0, Ordering::Relaxed);
            self.episode.store(next, Ordering::Relaxed);
            self.barrier[next].disown();
            self.barrier[next].release();
            self.lock.release();

            // The reaper must not bump it back up when we exit.
            self.barrier[episode].get();
            self.barrier[episode].disown();
            trace!("KBarrier {:p} episode {} complete", self, episode);
        } else {
            self.waiters.store(waiters, Ordering::Relaxed);
            self.lock.release();
            self.barrier[episode].block_until_zero();
        }
    }

    pub fn destroy(&self) {
        self.lock.destroy();
        for sem in self.barrier.iter() {
            sem.destroy();
        }
    }
}
