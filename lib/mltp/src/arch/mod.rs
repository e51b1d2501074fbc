// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Saving and restoring execution contexts.
//!
//! A context is the stack pointer of a suspended stack whose top holds the
//! callee-saved registers and a return address. Switching is two-phase: the
//! old context is saved completely, then a landing function runs on the new
//! stack with the old stack pointer in hand, and only then the new context
//! is restored. The landing function is where a suspended thread gets
//! published (enqueued) or torn down.

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
use aarch64 as imp;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
use x86_64 as imp;

#[cfg(not(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
compile_error!("mltp context switching is only implemented for x86_64 and aarch64 ELF targets");

/// Runs on the target stack after the previous context was saved.
///
/// Gets the saved stack pointer of the previous context (null when it was
/// discarded) and the two arguments passed to the switch. Whatever it
/// returns is what the resumed `switch_block` call returns.
pub(crate) type Landing = unsafe extern "C" fn(old: *mut u8, a0: *mut u8, a1: *mut u8) -> *mut u8;

/// Where a fresh context starts executing, with the argument given to
/// [`init_context`]. Must never return.
pub(crate) type Entry = extern "C" fn(arg: *const u8) -> !;

extern "C" {
    fn mltp_switch_block(landing: Landing, a0: *mut u8, a1: *mut u8, target: *mut u8) -> *mut u8;
    fn mltp_switch_abort(landing: Landing, a0: *mut u8, a1: *mut u8, target: *mut u8) -> !;
    fn mltp_context_start();
}

/// Saves the current context and resumes `target`, running `landing` in
/// between.
///
/// # Safety
/// `target` must be a context that is suspended and not resumed by anyone
/// else. `landing` must not unwind.
#[inline(never)]
pub(crate) unsafe fn switch_block(
    landing: Landing,
    a0: *mut u8,
    a1: *mut u8,
    target: *mut u8,
) -> *mut u8 {
    mltp_switch_block(landing, a0, a1, target)
}

/// Resumes `target` and forgets the current context.
///
/// # Safety
/// See [`switch_block`]. Nothing on the current stack is dropped.
pub(crate) unsafe fn switch_abort(
    landing: Landing,
    a0: *mut u8,
    a1: *mut u8,
    target: *mut u8,
) -> ! {
    mltp_switch_abort(landing, a0, a1, target)
}

/// Prepares a fresh context at the top of the stack ending at `stack_top`.
///
/// # Safety
/// `stack_top` must be the exclusive upper end of writable memory with at
/// least a few hundred bytes below it.
pub(crate) unsafe fn init_context(stack_top: *mut u8, entry: Entry, arg: *const u8) -> *mut u8 {
    imp::init_context(stack_top, entry, arg, mltp_context_start as usize)
}
