// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cleans up after terminated kernel threads.
//!
//! Every kernel thread known to the layer posts its id when its thread-local
//! storage is torn down. The reaper then releases the semaphores the dead
//! thread still owned, runs its termination callback and finally retires the
//! registry entry, which wakes up joiners.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread as os;
use std::time::Duration;

use log::*;

use crate::local;
use crate::thread::{Kernel, KthreadId};

/// Upper bound on how long a termination notice can sit in the queue.
const REAP_POLL: Duration = Duration::from_millis(100);

pub(crate) fn spawn(k: &'static Kernel, id: KthreadId) -> io::Result<os::Thread> {
    let handle = os::Builder::new()
        .name(String::from("kthread-reaper"))
        .spawn(move || {
            local::bind(id, None, false);
            run(k, id)
        })?;
    Ok(handle.thread().clone())
}

fn run(k: &'static Kernel, me: KthreadId) {
    loop {
        while let Some(dead) = k.next_notice() {
            reap(k, dead, me);
        }
        os::park_timeout(REAP_POLL);
    }
}

fn reap(k: &Kernel, dead: KthreadId, me: KthreadId) {
    for sem in k.live_semaphores() {
        if sem.reclaim(dead, me) {
            debug!("released {:?} held by dead {}", sem.id(), dead);
        }
    }
    if k.sys_sem.reclaim(dead, me) {
        warn!("system semaphore held by dead thread {}", dead);
    }

    let info = k.threads.lock().get(&dead).cloned();
    if let Some(on_terminate) = info.and_then(|i| i.take_terminate()) {
        if panic::catch_unwind(AssertUnwindSafe(|| on_terminate(dead))).is_err() {
            error!("termination callback of {} panicked", dead);
        }
    }

    k.retire(dead);
    trace!("reaped {}", dead);
}
