// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Register snapshots taken from a signal `ucontext`.
//!
//! Only the values are kept, so a `CpuState` stays valid after the handler
//! that captured it has returned.

use libc::ucontext_t;

#[cfg(target_arch = "x86_64")]
mod arch {
    pub const REGISTER_NAMES: [&str; 21] = [
        "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip", "rflags", "cs", "fs", "gs",
    ];
    pub const EXCEPTION_REGISTER_NAMES: [&str; 3] = ["trapno", "err", "faultvaddr"];

    pub const FRAME_POINTER: usize = 6;
    pub const STACK_POINTER: usize = 7;
    pub const INSTRUCTION_POINTER: usize = 16;
    pub const LINK_REGISTER: Option<usize> = None;
    pub const FAULT_ADDRESS: usize = 2;

    /// # Safety
    /// `uc` must point to a valid `ucontext_t`.
    pub unsafe fn fill(uc: *const libc::ucontext_t, basic: &mut [u64], exception: &mut [u64]) {
        let gregs = &(*uc).uc_mcontext.gregs;
        let reg = |index: libc::c_int| gregs[index as usize] as u64;
        let order = [
            libc::REG_RAX,
            libc::REG_RBX,
            libc::REG_RCX,
            libc::REG_RDX,
            libc::REG_RDI,
            libc::REG_RSI,
            libc::REG_RBP,
            libc::REG_RSP,
            libc::REG_R8,
            libc::REG_R9,
            libc::REG_R10,
            libc::REG_R11,
            libc::REG_R12,
            libc::REG_R13,
            libc::REG_R14,
            libc::REG_R15,
            libc::REG_RIP,
            libc::REG_EFL,
        ];
        for (slot, index) in basic.iter_mut().zip(order) {
            *slot = reg(index);
        }
        // cs, gs and fs are packed into one 64-bit slot, 16 bits each.
        let segments = reg(libc::REG_CSGSFS);
        basic[18] = segments & 0xffff;
        basic[19] = (segments >> 32) & 0xffff;
        basic[20] = (segments >> 16) & 0xffff;

        exception[0] = reg(libc::REG_TRAPNO);
        exception[1] = reg(libc::REG_ERR);
        exception[2] = reg(libc::REG_CR2);
    }

    pub fn normalise_instruction_pointer(ip: usize) -> usize {
        ip
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    pub const REGISTER_NAMES: [&str; 34] = [
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "fp", "lr", "sp", "pc", "cpsr",
    ];
    pub const EXCEPTION_REGISTER_NAMES: [&str; 1] = ["far"];

    pub const FRAME_POINTER: usize = 29;
    pub const STACK_POINTER: usize = 31;
    pub const INSTRUCTION_POINTER: usize = 32;
    pub const LINK_REGISTER: Option<usize> = Some(30);
    pub const FAULT_ADDRESS: usize = 0;

    // Pointer authentication keeps a signature in the upper bits.
    const PAC_STRIPPING_MASK: usize = 0x0000_000f_ffff_ffff;

    /// # Safety
    /// `uc` must point to a valid `ucontext_t`.
    pub unsafe fn fill(uc: *const libc::ucontext_t, basic: &mut [u64], exception: &mut [u64]) {
        let mcontext = &(*uc).uc_mcontext;
        for (slot, value) in basic.iter_mut().zip(mcontext.regs.iter()) {
            *slot = *value as u64;
        }
        basic[31] = mcontext.sp as u64;
        basic[32] = mcontext.pc as u64;
        basic[33] = mcontext.pstate as u64;
        exception[0] = mcontext.fault_address as u64;
    }

    pub fn normalise_instruction_pointer(ip: usize) -> usize {
        ip & PAC_STRIPPING_MASK
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod arch {
    pub const REGISTER_NAMES: [&str; 0] = [];
    pub const EXCEPTION_REGISTER_NAMES: [&str; 0] = [];

    pub const FRAME_POINTER: usize = usize::MAX;
    pub const STACK_POINTER: usize = usize::MAX;
    pub const INSTRUCTION_POINTER: usize = usize::MAX;
    pub const LINK_REGISTER: Option<usize> = None;
    pub const FAULT_ADDRESS: usize = usize::MAX;

    pub unsafe fn fill(_uc: *const libc::ucontext_t, _basic: &mut [u64], _exception: &mut [u64]) {}

    pub fn normalise_instruction_pointer(ip: usize) -> usize {
        ip
    }
}

pub use arch::normalise_instruction_pointer;

pub const NUM_REGISTERS: usize = arch::REGISTER_NAMES.len();
pub const NUM_EXCEPTION_REGISTERS: usize = arch::EXCEPTION_REGISTER_NAMES.len();

/// Stacks grow towards lower addresses on every supported architecture.
pub const STACK_GROW_DIRECTION: isize = -1;

pub fn current_arch() -> &'static str {
    std::env::consts::ARCH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuState {
    basic: [u64; NUM_REGISTERS],
    exception: [u64; NUM_EXCEPTION_REGISTERS],
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            basic: [0; NUM_REGISTERS],
            exception: [0; NUM_EXCEPTION_REGISTERS],
        }
    }
}

impl CpuState {
    /// Copies the registers out of a signal context.
    ///
    /// # Safety
    /// `uc` must be null or point to a valid `ucontext_t`.
    pub unsafe fn from_ucontext(uc: *const ucontext_t) -> Option<Self> {
        if uc.is_null() {
            return None;
        }
        let mut state = Self::default();
        arch::fill(uc, &mut state.basic, &mut state.exception);
        Some(state)
    }

    /// Builds a state from raw values, in `register_name` order.
    pub fn from_registers(basic: [u64; NUM_REGISTERS], exception: [u64; NUM_EXCEPTION_REGISTERS]) -> Self {
        Self { basic, exception }
    }

    fn basic_or_zero(&self, index: usize) -> usize {
        self.basic.get(index).map_or(0, |v| *v as usize)
    }

    pub fn frame_pointer(&self) -> usize {
        self.basic_or_zero(arch::FRAME_POINTER)
    }

    pub fn stack_pointer(&self) -> usize {
        self.basic_or_zero(arch::STACK_POINTER)
    }

    pub fn instruction_address(&self) -> usize {
        self.basic_or_zero(arch::INSTRUCTION_POINTER)
    }

    /// Zero on architectures without a link register.
    pub fn link_register(&self) -> usize {
        arch::LINK_REGISTER.map_or(0, |index| self.basic_or_zero(index))
    }

    pub fn fault_address(&self) -> usize {
        self.exception
            .get(arch::FAULT_ADDRESS)
            .map_or(0, |v| *v as usize)
    }

    pub fn register_name(index: usize) -> Option<&'static str> {
        arch::REGISTER_NAMES.get(index).copied()
    }

    pub fn register_value(&self, index: usize) -> Option<u64> {
        self.basic.get(index).copied()
    }

    pub fn exception_register_name(index: usize) -> Option<&'static str> {
        arch::EXCEPTION_REGISTER_NAMES.get(index).copied()
    }

    pub fn exception_register_value(&self, index: usize) -> Option<u64> {
        self.exception.get(index).copied()
    }

    /// `(name, value)` pairs of the general purpose registers.
    pub fn registers(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        arch::REGISTER_NAMES.iter().copied().zip(self.basic.iter().copied())
    }

    pub fn exception_registers(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        arch::EXCEPTION_REGISTER_NAMES
            .iter()
            .copied()
            .zip(self.exception.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_values() {
        let state = CpuState::default();
        assert_eq!(state.registers().count(), NUM_REGISTERS);
        assert_eq!(state.exception_registers().count(), NUM_EXCEPTION_REGISTERS);
        assert_eq!(CpuState::register_name(NUM_REGISTERS), None);
        assert_eq!(state.register_value(NUM_REGISTERS), None);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_special_registers_x86_64() {
        let mut basic = [0u64; NUM_REGISTERS];
        basic[6] = 0x7000;
        basic[7] = 0x6000;
        basic[16] = 0x401000;
        let state = CpuState::from_registers(basic, [14, 4, 0xdead]);
        assert_eq!(state.frame_pointer(), 0x7000);
        assert_eq!(state.stack_pointer(), 0x6000);
        assert_eq!(state.instruction_address(), 0x401000);
        assert_eq!(state.link_register(), 0);
        assert_eq!(state.fault_address(), 0xdead);
        assert_eq!(CpuState::register_name(16), Some("rip"));
    }

    #[test]
    fn test_null_ucontext() {
        // SAFETY: null is explicitly allowed.
        assert!(unsafe { CpuState::from_ucontext(std::ptr::null()) }.is_none());
    }
}
