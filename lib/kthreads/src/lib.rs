// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The kernel thread layer.
//!
//! Kernel threads created here share the address space with their parent and
//! are tracked in a registry. Semaphores remember which kernel thread holds
//! them; when a kernel thread dies while still holding one, a reaper thread
//! takes over ownership and releases it so nobody deadlocks on a corpse.

mod barrier;
mod error;
mod local;
mod reaper;
mod semaphore;
mod signals;
mod thread;

pub use barrier::KBarrier;
pub use error::KthreadError;
pub use local::{alloc_local, errno, set_errno, with_local, without_kill};
pub use semaphore::{SemId, Semaphore};
pub use thread::{
    checkpoint, create, current, init, join, kill, shutdown, sleep, stats, KernelStats, KthreadId,
    Killed, TerminateFn,
};

/// Maximum number of kernel threads that can be alive at the same time.
pub const MAX_THREADS: usize = 128;

/// Maximum number of semaphores that can exist at the same time.
pub const MAX_SEMS: usize = 256;

/// Smallest stack handed to a new kernel thread.
pub const MIN_STACK_BYTES: usize = 16 * 4096;
