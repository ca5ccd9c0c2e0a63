// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Monitor, MonitorContext, MonitorType};
use crate::collector::thread_suspend::{resume_environment, suspend_environment};
use crate::collector::CachedData;
use crate::shared::sync::MutexExt;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

/// Receives every captured event once all monitors added their details.
pub type EventCallback = Box<dyn Fn(&mut MonitorContext<'_>) + Send + Sync>;

/// Owns the monitors and arbitrates the single crash being handled.
pub struct MonitorRegistry {
    monitors: Vec<Arc<dyn Monitor>>,
    event_callback: EventCallback,
    cached_data: Option<Arc<CachedData>>,
    active_monitors: AtomicU32,
    requires_async_safety: AtomicBool,
    handling_fatal_exception: AtomicBool,
    crashed_during_exception_handling: AtomicBool,
    debugger_warned: AtomicBool,
    update_lock: Mutex<()>,
}

impl MonitorRegistry {
    /// `make_monitors` receives a handle back to the registry so fault
    /// detecting monitors can start the hand-off themselves.
    pub fn new(
        cached_data: Option<Arc<CachedData>>,
        event_callback: EventCallback,
        make_monitors: impl FnOnce(&Weak<MonitorRegistry>) -> Vec<Arc<dyn Monitor>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|registry| Self {
            monitors: make_monitors(registry),
            event_callback,
            cached_data,
            active_monitors: AtomicU32::new(MonitorType::NONE.bits()),
            requires_async_safety: AtomicBool::new(false),
            handling_fatal_exception: AtomicBool::new(false),
            crashed_during_exception_handling: AtomicBool::new(false),
            debugger_warned: AtomicBool::new(false),
            update_lock: Mutex::new(()),
        })
    }

    /// Enables the monitors in `requested` and disables the others.
    ///
    /// Debugger unsafe monitors are masked out while a debugger is attached,
    /// and only async safe monitors remain once async safety was required.
    /// Returns the monitors that actually ended up enabled.
    pub fn set_active_monitors(&self, requested: MonitorType) -> MonitorType {
        let _guard = self.update_lock.lock_or_recover();
        let mut monitors = requested;
        if monitors.intersects(MonitorType::DEBUGGER_UNSAFE) && is_debugger_attached() {
            if !self.debugger_warned.swap(true, SeqCst) {
                warn!(
                    "Process is being traced, masking out debugger unsafe monitors. \
                     Most crashes will not be recorded while debugging."
                );
            }
            monitors = monitors & MonitorType::DEBUGGER_SAFE;
        }
        if self.requires_async_safety.load(SeqCst) && monitors.intersects(MonitorType::ASYNC_UNSAFE)
        {
            debug!("Async-safe environment detected, masking out unsafe monitors");
            monitors = monitors & MonitorType::ASYNC_SAFE;
        }

        debug!(
            from = %self.active_monitors(),
            to = %monitors,
            "Changing active monitors"
        );
        let active = self.apply(monitors);
        debug!(active = %active, "Active monitors updated");
        active
    }

    fn apply(&self, monitors: MonitorType) -> MonitorType {
        let mut active = MonitorType::NONE;
        for monitor in &self.monitors {
            let monitor_type = monitor.monitor_type();
            monitor.set_enabled(monitors.intersects(monitor_type));
            if monitor.is_enabled() {
                active |= monitor_type;
            }
        }
        self.active_monitors.store(active.bits(), SeqCst);
        active
    }

    pub fn active_monitors(&self) -> MonitorType {
        MonitorType::from_bits(self.active_monitors.load(SeqCst))
    }

    /// Records that a fatal fault was captured. Returns true when the fault
    /// happened while a previous one was still being handled, in which case
    /// every monitor is disabled for good.
    pub fn notify_fatal_exception_captured(&self, is_async_safe_environment: bool) -> bool {
        // Never unset once required.
        self.requires_async_safety
            .fetch_or(is_async_safe_environment, SeqCst);
        if self.handling_fatal_exception.swap(true, SeqCst) {
            self.crashed_during_exception_handling.store(true, SeqCst);
        }
        let recrashed = self.crashed_during_exception_handling.load(SeqCst);
        if recrashed {
            if !self.requires_async_safety.load(SeqCst) {
                info!("Detected crash in the crash reporter, uninstalling");
            }
            // No lock: the crash may have happened while holding it.
            self.apply(MonitorType::NONE);
        }
        recrashed
    }

    pub fn is_handling_fatal_exception(&self) -> bool {
        self.handling_fatal_exception.load(SeqCst)
    }

    pub fn requires_async_safety(&self) -> bool {
        self.requires_async_safety.load(SeqCst)
    }

    /// Lets every enabled monitor add its details to `context`, then passes it
    /// to the event callback.
    pub fn handle_exception<'a>(&'a self, context: &mut MonitorContext<'a>) {
        context.requires_async_safety = self.requires_async_safety.load(SeqCst);
        if self.crashed_during_exception_handling.load(SeqCst) {
            context.crashed_during_crash_handling = true;
        }
        for monitor in &self.monitors {
            if monitor.is_enabled() {
                monitor.add_contextual_info(context);
            }
        }

        (self.event_callback)(context);

        if context.current_snapshot_user_reported {
            self.handling_fatal_exception.store(false, SeqCst);
        } else if self.handling_fatal_exception.load(SeqCst)
            && !self.crashed_during_exception_handling.load(SeqCst)
        {
            if !context.requires_async_safety {
                debug!("Exception is fatal, restoring original handlers");
            }
            self.apply(MonitorType::NONE);
        }
    }

    /// The complete sequence a fault detecting monitor runs: freeze the
    /// cached data, park the other threads, build the context with `build`,
    /// hand it over, then undo the first two steps.
    ///
    /// Threads are only resumed when this call parked them, so a capture
    /// nested in another one leaves the outer suspension in place.
    ///
    /// Returns true for a crash inside the crash handler.
    pub fn capture<'a>(
        &'a self,
        is_async_safe_environment: bool,
        suspend_threads: bool,
        build: impl FnOnce() -> MonitorContext<'a>,
    ) -> bool {
        if let Some(cached_data) = &self.cached_data {
            cached_data.freeze();
        }
        let suspended = suspend_threads && suspend_environment().is_some();
        let recrashed = self.notify_fatal_exception_captured(is_async_safe_environment);
        let mut context = build();
        self.handle_exception(&mut context);
        if suspended {
            resume_environment();
        }
        if let Some(cached_data) = &self.cached_data {
            cached_data.unfreeze();
        }
        recrashed
    }

    pub fn cached_data(&self) -> Option<&Arc<CachedData>> {
        self.cached_data.as_ref()
    }
}

impl Drop for MonitorRegistry {
    fn drop(&mut self) {
        // Clears the global pointers the fault handlers use to reach us.
        self.apply(MonitorType::NONE);
    }
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("monitors", &self.monitors.len())
            .field("active_monitors", &self.active_monitors())
            .field("handling_fatal_exception", &self.is_handling_fatal_exception())
            .finish()
    }
}

/// True when another process is ptrace-attached to this one.
pub fn is_debugger_attached() -> bool {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return false;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|pid| pid.trim().parse::<i32>().ok())
        .is_some_and(|pid| pid != 0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// A monitor that records what the registry asked of it.
    pub(crate) struct FakeMonitor {
        pub monitor_type: MonitorType,
        pub enabled: AtomicBool,
        pub refuse: bool,
        pub contributions: AtomicUsize,
    }

    impl FakeMonitor {
        pub fn new(monitor_type: MonitorType) -> Arc<Self> {
            Arc::new(Self {
                monitor_type,
                enabled: AtomicBool::new(false),
                refuse: false,
                contributions: AtomicUsize::new(0),
            })
        }
    }

    impl Monitor for FakeMonitor {
        fn monitor_type(&self) -> MonitorType {
            self.monitor_type
        }

        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled && !self.refuse, SeqCst);
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(SeqCst)
        }

        fn add_contextual_info<'a>(&'a self, context: &mut MonitorContext<'a>) {
            self.contributions.fetch_add(1, SeqCst);
            if self.monitor_type == MonitorType::SYSTEM {
                context.system.free_memory = 42;
            }
        }
    }

    fn registry_with(
        monitors: Vec<Arc<FakeMonitor>>,
        events: Arc<Mutex<Vec<(bool, u64)>>>,
    ) -> Arc<MonitorRegistry> {
        MonitorRegistry::new(
            None,
            Box::new(move |context: &mut MonitorContext<'_>| {
                events.lock().unwrap().push((
                    context.crashed_during_crash_handling,
                    context.system.free_memory,
                ));
            }),
            |_| monitors.into_iter().map(|m| m as Arc<dyn Monitor>).collect(),
        )
    }

    #[test]
    fn test_set_active_monitors() {
        let signal = FakeMonitor::new(MonitorType::SIGNAL);
        let system = FakeMonitor::new(MonitorType::SYSTEM);
        let mut stubborn = FakeMonitor::new(MonitorType::MAIN_THREAD_DEADLOCK);
        Arc::get_mut(&mut stubborn).unwrap().refuse = true;
        let registry = registry_with(
            vec![signal.clone(), system.clone(), stubborn],
            Arc::new(Mutex::new(vec![])),
        );

        if is_debugger_attached() {
            return;
        }
        let active = registry.set_active_monitors(MonitorType::ALL);
        // Never widened, and a monitor that failed to enable is not reported.
        assert_eq!(active, MonitorType::SIGNAL | MonitorType::SYSTEM);
        assert_eq!(registry.active_monitors(), active);
        assert!(signal.is_enabled());

        let active = registry.set_active_monitors(MonitorType::SYSTEM);
        assert_eq!(active, MonitorType::SYSTEM);
        assert!(!signal.is_enabled());
        assert!(system.is_enabled());
    }

    #[test]
    fn test_fatal_exception_disables_monitors() {
        let signal = FakeMonitor::new(MonitorType::SIGNAL);
        let system = FakeMonitor::new(MonitorType::SYSTEM);
        let events = Arc::new(Mutex::new(vec![]));
        let registry = registry_with(vec![signal.clone(), system.clone()], events.clone());
        registry.set_active_monitors(MonitorType::SIGNAL | MonitorType::SYSTEM);

        assert!(!registry.notify_fatal_exception_captured(true));
        let mut context = MonitorContext::new(MonitorType::SIGNAL);
        registry.handle_exception(&mut context);

        assert!(context.requires_async_safety);
        assert_eq!(*events.lock().unwrap(), vec![(false, 42)]);
        assert_eq!(system.contributions.load(SeqCst), 1);
        assert_eq!(registry.active_monitors(), MonitorType::NONE);
        assert!(!signal.is_enabled());

        // Async safety is sticky.
        let active = registry.set_active_monitors(MonitorType::SIGNAL | MonitorType::SYSTEM);
        assert_eq!(active, MonitorType::SIGNAL);
    }

    #[test]
    fn test_recrash_is_detected() {
        let signal = FakeMonitor::new(MonitorType::SIGNAL);
        let events = Arc::new(Mutex::new(vec![]));
        let registry = registry_with(vec![signal.clone()], events.clone());
        registry.set_active_monitors(MonitorType::SIGNAL);

        assert!(!registry.notify_fatal_exception_captured(false));
        // A second fault before the first one was handed over.
        assert!(registry.notify_fatal_exception_captured(false));
        assert!(!signal.is_enabled());

        let mut context = MonitorContext::new(MonitorType::SIGNAL);
        registry.handle_exception(&mut context);
        assert!(context.crashed_during_crash_handling);
        assert_eq!(*events.lock().unwrap(), vec![(true, 0)]);
    }

    #[test]
    fn test_user_report_keeps_monitors() {
        let user = FakeMonitor::new(MonitorType::USER_REPORTED);
        let events = Arc::new(Mutex::new(vec![]));
        let registry = registry_with(vec![user.clone()], events.clone());
        registry.set_active_monitors(MonitorType::USER_REPORTED);

        let recrashed = registry.capture(false, false, || {
            let mut context = MonitorContext::new(MonitorType::USER_REPORTED);
            context.current_snapshot_user_reported = true;
            context
        });
        assert!(!recrashed);
        assert!(!registry.is_handling_fatal_exception());
        assert!(user.is_enabled());
        assert_eq!(events.lock().unwrap().len(), 1);

        // A later report is not mistaken for a recursive crash.
        assert!(!registry.notify_fatal_exception_captured(false));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_nested_capture_keeps_outer_suspension() {
        use crate::collector::thread_suspend::is_suspended;
        use crate::collector::thread_suspend::tests::SUSPEND_LOCK;

        let _guard = SUSPEND_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let cached_data = Arc::new(CachedData::new(std::time::Duration::from_secs(60)));
        // Nothing may allocate while other threads are parked.
        let events = Arc::new(AtomicUsize::new(0));
        let sink = events.clone();
        let registry = MonitorRegistry::new(
            Some(cached_data.clone()),
            Box::new(move |_: &mut MonitorContext<'_>| {
                sink.fetch_add(1, SeqCst);
            }),
            |_| Vec::new(),
        );

        cached_data.freeze();
        assert!(suspend_environment().is_some());
        registry.capture(false, true, || MonitorContext::new(MonitorType::SIGNAL));
        let still_suspended = is_suspended();
        let still_frozen = cached_data.is_frozen();
        resume_environment();
        cached_data.unfreeze();

        assert!(still_suspended);
        assert!(still_frozen);
        assert_eq!(events.load(SeqCst), 1);
        assert!(!cached_data.is_frozen());

        // A capture that suspended on its own resumes on its own.
        registry.capture(false, true, || MonitorContext::new(MonitorType::SIGNAL));
        assert!(!is_suspended());
        assert!(!cached_data.is_frozen());
        assert_eq!(events.load(SeqCst), 2);
    }
}
