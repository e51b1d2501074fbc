// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::arch::global_asm;
use core::ptr;

use super::Entry;

// Saved frame, from the stack pointer upwards:
// x19 .. x28, x29 (fp), x30 (lr), d8 .. d15.
global_asm!(
    ".text",
    ".global mltp_switch_block",
    ".type mltp_switch_block,%function",
    ".p2align 4",
    "mltp_switch_block:",
    "sub sp, sp, #160",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8, d9, [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x4, x0",
    "mov x0, sp",
    "mov sp, x3",
    "blr x4",
    "b mltp_restore",
    ".size mltp_switch_block, .-mltp_switch_block",
    "",
    ".global mltp_switch_abort",
    ".type mltp_switch_abort,%function",
    ".p2align 4",
    "mltp_switch_abort:",
    "mov x4, x0",
    "mov x0, xzr",
    "mov sp, x3",
    "blr x4",
    "mltp_restore:",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp d8, d9, [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #160",
    "ret",
    ".size mltp_switch_abort, .-mltp_switch_abort",
    "",
    // First resumption of a fresh context: x19 holds the argument, x20 the
    // entry function.
    ".global mltp_context_start",
    ".type mltp_context_start,%function",
    ".p2align 4",
    "mltp_context_start:",
    ".cfi_startproc",
    ".cfi_undefined x30",
    "mov x0, x19",
    "blr x20",
    "brk #0",
    ".cfi_endproc",
    ".size mltp_context_start, .-mltp_context_start",
);

const FRAME_WORDS: usize = 20;

pub(super) unsafe fn init_context(
    stack_top: *mut u8,
    entry: Entry,
    arg: *const u8,
    start: usize,
) -> *mut u8 {
    let top = (stack_top as usize) & !0xf;
    let sp = (top - FRAME_WORDS * 8) as *mut usize;
    let mut frame = [0usize; FRAME_WORDS];
    frame[0] = arg as usize; // x19
    frame[1] = entry as usize; // x20
    frame[11] = start; // x30
    ptr::copy_nonoverlapping(frame.as_ptr(), sp, FRAME_WORDS);
    sp as *mut u8
}
