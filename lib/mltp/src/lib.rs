// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! M:N user-level threads.
//!
//! Unbound threads are cheap, heap-stacked threads that get multiplexed
//! cooperatively on a handful of virtual processors (VPs), each of which is a
//! kernel thread from the `kthreads` crate. They only switch at explicit
//! points: yielding, waiting on a block lock, a barrier or a condition, and
//! termination.
//!
//! ```no_run
//! let s = mltp::Scheduler::new();
//! let h = s.create(|| 6 * 7).unwrap();
//! s.start(2).unwrap();
//! assert_eq!(h.take_result(), Some(42));
//! ```

pub mod atomic;
mod arch;
pub mod barrier;
pub mod condvar;
mod error;
pub mod lock;
mod queue;
pub mod scheduler;
pub mod stack;
pub mod threads;
pub mod tls;

pub use barrier::Barrier;
pub use condvar::Condition;
pub use error::MltpError;
pub use lock::{Lock, LockClass, LockGuard, LOCK_STD};
pub use scheduler::Scheduler;
pub use stack::DEFAULT_STACK_SIZE_BYTES;
pub use threads::{
    create_bound, join_bound, yield_bound, BoundThread, ThreadId, ThreadKind, ThreadState,
    UnboundHandle, PRIVATE_SIZE_BYTES,
};
pub use tls::{abort, current_id, with_private, yield_now, yield_to_first, Environment};
