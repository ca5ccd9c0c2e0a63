// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reports requested by the application itself.

use super::{Monitor, MonitorContext, MonitorRegistry, MonitorType};
use crate::collector::{MachineContext, StackCursor};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Weak;
use tracing::{debug, warn};

/// An exception raised by the application, possibly from another language
/// runtime.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserException {
    pub name: String,
    pub reason: Option<String>,
    /// The language the exception comes from, for example "python".
    pub language: Option<String>,
    pub line_of_code: Option<String>,
    /// Frames of the exception's own stack trace, outermost last.
    pub stack_trace: Vec<String>,
}

impl UserException {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

pub struct UserReportedMonitor {
    registry: Weak<MonitorRegistry>,
    enabled: AtomicBool,
}

impl UserReportedMonitor {
    pub fn new(registry: &Weak<MonitorRegistry>) -> Self {
        Self {
            registry: registry.clone(),
            enabled: AtomicBool::new(false),
        }
    }

    /// Writes a report for `exception`, captured on the calling thread.
    ///
    /// With `log_all_threads` every other thread is suspended and included.
    /// With `terminate_program` the process aborts once the report is
    /// written. Returns false when the monitor is not enabled.
    pub fn report(
        &self,
        exception: &UserException,
        log_all_threads: bool,
        terminate_program: bool,
    ) -> bool {
        if !self.is_enabled() {
            warn!("User-reported exception monitor is not enabled, exception not recorded");
            return false;
        }
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        // Encoded up front: nothing may allocate once threads are suspended.
        let custom_stack_trace = if exception.stack_trace.is_empty() {
            None
        } else {
            serde_json::to_vec(&exception.stack_trace).ok()
        };

        debug!(name = %exception.name, "Reporting user exception");
        registry.capture(false, log_all_threads, || {
            let mut context = MonitorContext::new(MonitorType::USER_REPORTED)
                .with_machine_context(MachineContext::for_current_thread(true));
            context.stack_cursor = StackCursor::with_self_thread(1);
            context.current_snapshot_user_reported = true;
            context.crash_reason = exception.reason.as_deref();
            context.user_report.name = Some(exception.name.as_str());
            context.user_report.language = exception.language.as_deref();
            context.user_report.line_of_code = exception.line_of_code.as_deref();
            context.user_report.custom_stack_trace = custom_stack_trace.as_deref();
            context
        });

        if terminate_program {
            std::process::abort();
        }
        true
    }
}

impl Monitor for UserReportedMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::USER_REPORTED
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::thread_suspend::tests::SUSPEND_LOCK;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default, PartialEq)]
    struct Seen {
        name: Option<String>,
        reason: Option<String>,
        trace: Option<String>,
        user_reported: bool,
        frames: usize,
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_report_user_exception() {
        let _guard = SUSPEND_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let seen = Arc::new(Mutex::new(Vec::<Seen>::new()));
        let sink = seen.clone();
        let mut monitor = None;
        let registry = MonitorRegistry::new(
            None,
            Box::new(move |context: &mut MonitorContext<'_>| {
                let mut frames = 0;
                while context.stack_cursor.advance() {
                    frames += 1;
                }
                sink.lock().unwrap().push(Seen {
                    name: context.user_report.name.map(str::to_string),
                    reason: context.crash_reason.map(str::to_string),
                    trace: context
                        .user_report
                        .custom_stack_trace
                        .map(|t| String::from_utf8_lossy(t).into_owned()),
                    user_reported: context.current_snapshot_user_reported,
                    frames,
                });
            }),
            |registry| {
                let user = Arc::new(UserReportedMonitor::new(registry));
                monitor = Some(user.clone());
                vec![user as Arc<dyn Monitor>]
            },
        );
        let monitor = monitor.unwrap();

        let exception = UserException {
            stack_trace: vec!["main.py:3".to_string(), "lib.py:10".to_string()],
            language: Some("python".to_string()),
            ..UserException::new("ValueError").with_reason("bad value")
        };
        assert!(!monitor.report(&exception, false, false));

        registry.set_active_monitors(MonitorType::USER_REPORTED);
        assert!(monitor.report(&exception, false, false));
        assert!(monitor.report(&UserException::new("Second"), false, false));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].name.as_deref(), Some("ValueError"));
        assert_eq!(seen[0].reason.as_deref(), Some("bad value"));
        assert_eq!(seen[0].trace.as_deref(), Some(r#"["main.py:3","lib.py:10"]"#));
        assert!(seen[0].user_reported);
        assert!(seen[0].frames > 0);
        assert_eq!(seen[1].trace, None);
        // A user report leaves the monitors in place.
        assert_eq!(registry.active_monitors(), MonitorType::USER_REPORTED);
    }
}
