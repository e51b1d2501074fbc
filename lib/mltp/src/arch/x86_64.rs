// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::arch::global_asm;
use core::ptr;

use super::Entry;

// Saved frame, from the stack pointer upwards:
// r15, r14, r13, r12, rbx, rbp, return address.
//
// The `sub rsp, 8` keeps the landing call 16 byte aligned: a saved context
// is 8 mod 16 because six pushes follow the caller's return address.
global_asm!(
    ".text",
    ".global mltp_switch_block",
    ".type mltp_switch_block,@function",
    ".p2align 4",
    "mltp_switch_block:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rax, rdi",
    "mov rdi, rsp",
    "mov rsp, rcx",
    "sub rsp, 8",
    "call rax",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size mltp_switch_block, .-mltp_switch_block",
    "",
    ".global mltp_switch_abort",
    ".type mltp_switch_abort,@function",
    ".p2align 4",
    "mltp_switch_abort:",
    "mov rax, rdi",
    "xor edi, edi",
    "mov rsp, rcx",
    "sub rsp, 8",
    "call rax",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size mltp_switch_abort, .-mltp_switch_abort",
    "",
    // First resumption of a fresh context: rbx holds the argument, r12 the
    // entry function.
    ".global mltp_context_start",
    ".type mltp_context_start,@function",
    ".p2align 4",
    "mltp_context_start:",
    ".cfi_startproc",
    ".cfi_undefined rip",
    "mov rdi, rbx",
    "call r12",
    "ud2",
    ".cfi_endproc",
    ".size mltp_context_start, .-mltp_context_start",
);

const FRAME_WORDS: usize = 7;

pub(super) unsafe fn init_context(
    stack_top: *mut u8,
    entry: Entry,
    arg: *const u8,
    start: usize,
) -> *mut u8 {
    let top = (stack_top as usize) & !0xf;
    let sp = (top - FRAME_WORDS * 8) as *mut usize;
    let frame: [usize; FRAME_WORDS] = [
        0,                 // r15
        0,                 // r14
        0,                 // r13
        entry as usize,    // r12
        arg as usize,      // rbx
        0,                 // rbp
        start,             // return address
    ];
    ptr::copy_nonoverlapping(frame.as_ptr(), sp, FRAME_WORDS);
    sp as *mut u8
}
