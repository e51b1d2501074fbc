// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interactive/termination signal handlers and process exit cleanup.

use core::sync::atomic::{AtomicUsize, Ordering};

static REGISTRATIONS: AtomicUsize = AtomicUsize::new(0);

/// How many times the handlers got installed (at most once).
pub(crate) fn registrations() -> usize {
    REGISTRATIONS.load(Ordering::Relaxed)
}

#[cfg(feature = "signals")]
pub(crate) fn install() {
    let handler = on_termination_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        if libc::atexit(on_process_exit) != 0 {
            log::warn!("unable to register kernel thread exit cleanup");
        }
    }
    REGISTRATIONS.fetch_add(1, Ordering::Relaxed);
}

#[cfg(not(feature = "signals"))]
pub(crate) fn install() {}

#[cfg(feature = "signals")]
extern "C" fn on_termination_signal(_signo: libc::c_int) {
    // Only async-signal-safe calls in here.
    unsafe { libc::_exit(0) }
}

#[cfg(feature = "signals")]
extern "C" fn on_process_exit() {
    crate::thread::shutdown();
}
