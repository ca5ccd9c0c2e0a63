// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::system::SystemInfo;
use super::MonitorType;
use crate::app_state::AppStateSnapshot;
use crate::collector::{MachineContext, StackCursor};
use std::path::Path;
use uuid::Uuid;

/// Low level exception detail. On Linux this mirrors the kernel's view of a
/// synchronous fault: the signal number, `si_code` and faulting address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HardwareExceptionDetail {
    pub exception_type: i32,
    pub code: i64,
    pub subcode: i64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalDetail {
    pub signum: i32,
    pub sigcode: i32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LanguageExceptionDetail<'a> {
    pub name: Option<&'a str>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UserReportDetail<'a> {
    pub name: Option<&'a str>,
    pub language: Option<&'a str>,
    pub line_of_code: Option<&'a str>,
    /// Pre-encoded JSON array describing the caller's own stack trace.
    pub custom_stack_trace: Option<&'a [u8]>,
}

/// The last deallocated exception object, when a zombie tracker saw one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ZombieDetail<'a> {
    pub address: usize,
    pub name: Option<&'a str>,
    pub reason: Option<&'a str>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSnapshot<'a> {
    pub info: Option<&'a SystemInfo>,
    pub usable_memory: u64,
    pub free_memory: u64,
}

/// Everything known about the fault being handled.
///
/// Built by the monitor that detected the fault, completed by every enabled
/// monitor through [`super::Monitor::add_contextual_info`] and consumed once
/// by the report writer. It only borrows, so it can be built on the stack of
/// a crashed thread.
#[derive(Debug, Clone)]
pub struct MonitorContext<'a> {
    pub crash_type: MonitorType,
    pub event_id: Uuid,
    pub fault_address: usize,
    pub offending_machine_context: Option<MachineContext>,
    pub stack_cursor: StackCursor<'a>,
    pub crash_reason: Option<&'a str>,

    pub crashed_during_crash_handling: bool,
    pub current_snapshot_user_reported: bool,
    pub requires_async_safety: bool,
    pub registers_are_valid: bool,
    pub is_stack_overflow: bool,

    pub hardware_exception: HardwareExceptionDetail,
    pub signal: SignalDetail,
    pub language_exception: LanguageExceptionDetail<'a>,
    pub user_report: UserReportDetail<'a>,
    pub zombie: ZombieDetail<'a>,
    pub app_state: Option<AppStateSnapshot>,
    pub system: SystemSnapshot<'a>,
    pub console_log_path: Option<&'a Path>,
}

impl<'a> MonitorContext<'a> {
    pub fn new(crash_type: MonitorType) -> Self {
        Self {
            crash_type,
            event_id: Uuid::new_v4(),
            fault_address: 0,
            offending_machine_context: None,
            stack_cursor: StackCursor::empty(),
            crash_reason: None,
            crashed_during_crash_handling: false,
            current_snapshot_user_reported: false,
            requires_async_safety: false,
            registers_are_valid: false,
            is_stack_overflow: false,
            hardware_exception: HardwareExceptionDetail::default(),
            signal: SignalDetail::default(),
            language_exception: LanguageExceptionDetail::default(),
            user_report: UserReportDetail::default(),
            zombie: ZombieDetail::default(),
            app_state: None,
            system: SystemSnapshot::default(),
            console_log_path: None,
        }
    }

    /// Attaches the faulting thread's context and the cursor that walks it.
    pub fn with_machine_context(mut self, context: MachineContext) -> Self {
        self.stack_cursor = context.stack_cursor();
        self.registers_are_valid = context.can_have_cpu_state();
        self.is_stack_overflow = context.is_stack_overflow();
        self.offending_machine_context = Some(context);
        self
    }

    pub fn thread(&self) -> Option<libc::pid_t> {
        self.offending_machine_context.map(|c| c.thread())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::cpu::CpuState;

    #[test]
    fn test_new_context_is_blank() {
        let a = MonitorContext::new(MonitorType::SIGNAL);
        let b = MonitorContext::new(MonitorType::SIGNAL);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.event_id.get_version_num(), 4);
        assert!(a.thread().is_none());
        assert!(!a.crashed_during_crash_handling);
        assert!(a.app_state.is_none());
    }

    #[test]
    fn test_with_machine_context() {
        let machine = MachineContext::for_thread(7, Some(CpuState::default()), true);
        let mut context = MonitorContext::new(MonitorType::MAIN_THREAD_DEADLOCK)
            .with_machine_context(machine);
        assert_eq!(context.thread(), Some(7));
        assert!(context.registers_are_valid);
        assert!(context.stack_cursor.advance());
    }
}
