// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::cpu::CpuState;
use super::stack_cursor::{StackCursor, MAX_STACK_DEPTH};
use super::thread_suspend::current_thread_id;
use libc::{pid_t, ucontext_t};

/// Register state and identity of one thread at capture time.
#[derive(Debug, Clone, Copy)]
pub struct MachineContext {
    thread: pid_t,
    cpu_state: Option<CpuState>,
    is_crashed_context: bool,
    is_current_thread: bool,
    is_signal_context: bool,
    is_stack_overflow: bool,
}

impl MachineContext {
    /// Context of the faulting thread, from the `ucontext` a signal handler
    /// received.
    ///
    /// # Safety
    /// `ucontext` must be null or point to a valid `ucontext_t`.
    pub unsafe fn from_signal(ucontext: *const ucontext_t) -> Self {
        let mut context = Self {
            thread: current_thread_id(),
            cpu_state: CpuState::from_ucontext(ucontext),
            is_crashed_context: true,
            is_current_thread: true,
            is_signal_context: true,
            is_stack_overflow: false,
        };
        context.is_stack_overflow = context.stack_cursor().is_stack_overflow();
        context
    }

    /// Context of another thread whose registers were captured while it was
    /// parked.
    pub fn for_thread(thread: pid_t, cpu_state: Option<CpuState>, is_crashed_context: bool) -> Self {
        let mut context = Self {
            thread,
            cpu_state,
            is_crashed_context,
            is_current_thread: thread == current_thread_id(),
            is_signal_context: false,
            is_stack_overflow: false,
        };
        if is_crashed_context {
            context.is_stack_overflow = context.stack_cursor().is_stack_overflow();
        }
        context
    }

    /// Context of the calling thread outside a signal handler. A running
    /// thread cannot read its own registers, so there is no CPU state.
    pub fn for_current_thread(is_crashed_context: bool) -> Self {
        Self::for_thread(current_thread_id(), None, is_crashed_context)
    }

    pub fn thread(&self) -> pid_t {
        self.thread
    }

    pub fn cpu_state(&self) -> Option<&CpuState> {
        self.cpu_state.as_ref()
    }

    pub fn is_crashed_context(&self) -> bool {
        self.is_crashed_context
    }

    pub fn is_current_thread(&self) -> bool {
        self.is_current_thread
    }

    pub fn is_signal_context(&self) -> bool {
        self.is_signal_context
    }

    pub fn is_stack_overflow(&self) -> bool {
        self.is_stack_overflow
    }

    pub fn can_have_cpu_state(&self) -> bool {
        self.cpu_state.is_some() && (!self.is_current_thread || self.is_signal_context)
    }

    pub fn has_valid_exception_registers(&self) -> bool {
        self.can_have_cpu_state() && self.is_crashed_context
    }

    /// A frame-pointer walk over this context, empty without CPU state.
    pub fn stack_cursor(&self) -> StackCursor<'static> {
        match self.cpu_state {
            Some(cpu) if self.can_have_cpu_state() => {
                StackCursor::with_machine_context(cpu, MAX_STACK_DEPTH)
            }
            _ => StackCursor::empty(),
        }
    }
}
