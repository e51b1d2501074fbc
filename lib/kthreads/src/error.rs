// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use custom_error::custom_error;

custom_error! {
    #[derive(PartialEq, Clone)]
    pub KthreadError
    OutOfThreadSlots = "All kernel thread descriptor slots are in use.",
    OutOfSemaphores = "All semaphore slots are in use.",
    SpawnFailed{reason: String} = "Unable to spawn kernel thread: {reason}",
    LocalAlreadyAllocated = "Thread-local memory was already allocated for this thread.",
}

impl From<std::io::Error> for KthreadError {
    fn from(e: std::io::Error) -> Self {
        KthreadError::SpawnFailed {
            reason: e.to_string(),
        }
    }
}

impl KthreadError {
    /// The `errno` value a C caller of this layer would have seen.
    pub fn errno(&self) -> i32 {
        match self {
            KthreadError::OutOfThreadSlots => libc::ENOMEM,
            KthreadError::OutOfSemaphores => libc::ENOSPC,
            KthreadError::SpawnFailed { .. } => libc::EAGAIN,
            KthreadError::LocalAlreadyAllocated => libc::EEXIST,
        }
    }
}
