// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Main thread deadlock monitor.
//!
//! A watchdog thread expects the watched thread to call
//! [`DeadlockMonitor::heartbeat`] at least once per interval. When a whole
//! interval passes without one, the watched thread is reported as
//! deadlocked with the registers captured while it was parked.

use super::{Monitor, MonitorContext, MonitorRegistry, MonitorType};
use crate::collector::thread_suspend::{add_reserved_thread, current_thread_id, suspended_thread};
use crate::collector::MachineContext;
use crate::shared::sync::MutexExt;
use libc::pid_t;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub const DEADLOCK_REASON: &str = "Main thread deadlocked";

struct Watchdog {
    stop: Arc<AtomicBool>,
    thread: Thread,
}

struct Shared {
    registry: Weak<MonitorRegistry>,
    watched_thread: AtomicI32,
    awaiting_heartbeat: AtomicBool,
    interval: Duration,
    terminate: bool,
}

pub struct DeadlockMonitor {
    shared: Arc<Shared>,
    enabled: AtomicBool,
    watchdog: Mutex<Option<Watchdog>>,
}

impl DeadlockMonitor {
    /// Watches the calling thread until [`DeadlockMonitor::watch_thread`]
    /// says otherwise.
    pub fn new(registry: &Weak<MonitorRegistry>, interval: Duration, terminate: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: registry.clone(),
                watched_thread: AtomicI32::new(current_thread_id()),
                awaiting_heartbeat: AtomicBool::new(false),
                interval,
                terminate,
            }),
            enabled: AtomicBool::new(false),
            watchdog: Mutex::new(None),
        }
    }

    pub fn watch_thread(&self, tid: pid_t) {
        self.shared.watched_thread.store(tid, SeqCst);
    }

    pub fn watched_thread(&self) -> pid_t {
        self.shared.watched_thread.load(SeqCst)
    }

    /// Tells the watchdog the watched thread is still responsive.
    pub fn heartbeat(&self) {
        self.shared.awaiting_heartbeat.store(false, SeqCst);
    }

    fn start(&self) -> std::io::Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let shared = self.shared.clone();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("crash-deadlock-watchdog".to_string())
            .spawn(move || shared.run(&thread_stop))?;
        *self.watchdog.lock_or_recover() = Some(Watchdog {
            stop,
            thread: handle.thread().clone(),
        });
        Ok(())
    }

    fn stop(&self) {
        // The watchdog may be the caller, when its own report disables every
        // monitor, so it is never joined.
        if let Some(watchdog) = self.watchdog.lock_or_recover().take() {
            watchdog.stop.store(true, SeqCst);
            watchdog.thread.unpark();
        }
    }
}

impl Shared {
    fn run(&self, stop: &AtomicBool) {
        add_reserved_thread(current_thread_id());
        debug!(interval = ?self.interval, "Deadlock watchdog started");
        loop {
            self.awaiting_heartbeat.store(true, SeqCst);
            let deadline = Instant::now() + self.interval;
            loop {
                if stop.load(SeqCst) {
                    debug!("Deadlock watchdog stopped");
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::park_timeout(deadline - now);
            }
            if self.awaiting_heartbeat.load(SeqCst) {
                self.report_deadlock();
                return;
            }
        }
    }

    fn report_deadlock(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let watched = self.watched_thread.load(SeqCst);
        error!(thread = watched, "Watched thread did not respond, reporting a deadlock");
        registry.capture(false, true, || {
            let cpu_state = suspended_thread(watched).and_then(|t| t.cpu_state);
            let machine_context = MachineContext::for_thread(watched, cpu_state, true);
            let mut context = MonitorContext::new(MonitorType::MAIN_THREAD_DEADLOCK)
                .with_machine_context(machine_context);
            context.crash_reason = Some(DEADLOCK_REASON);
            context
        });
        if self.terminate {
            std::process::abort();
        }
    }
}

impl Monitor for DeadlockMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::MAIN_THREAD_DEADLOCK
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled == self.enabled.load(SeqCst) {
            return;
        }
        if enabled {
            match self.start() {
                Ok(()) => self.enabled.store(true, SeqCst),
                Err(e) => error!("Could not start deadlock watchdog: {e}"),
            }
        } else {
            self.enabled.store(false, SeqCst);
            self.stop();
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

impl Drop for DeadlockMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::thread_suspend::tests::SUSPEND_LOCK;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn registry_with_monitor(
        interval: Duration,
        events: Arc<AtomicUsize>,
        thread: Arc<AtomicI32>,
        had_registers: Arc<AtomicBool>,
    ) -> (Arc<MonitorRegistry>, Arc<DeadlockMonitor>) {
        let mut monitor = None;
        let registry = MonitorRegistry::new(
            None,
            Box::new(move |context: &mut MonitorContext<'_>| {
                if context.crash_reason == Some(DEADLOCK_REASON) {
                    events.fetch_add(1, SeqCst);
                }
                thread.store(context.thread().unwrap_or_default(), SeqCst);
                had_registers.store(context.registers_are_valid, SeqCst);
            }),
            |registry| {
                let deadlock = Arc::new(DeadlockMonitor::new(registry, interval, false));
                monitor = Some(deadlock.clone());
                vec![deadlock as Arc<dyn Monitor>]
            },
        );
        (registry, monitor.unwrap())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_missing_heartbeat_is_reported() {
        let _guard = SUSPEND_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let events = Arc::new(AtomicUsize::new(0));
        let thread = Arc::new(AtomicI32::new(0));
        let had_registers = Arc::new(AtomicBool::new(false));
        let (registry, monitor) = registry_with_monitor(
            Duration::from_millis(50),
            events.clone(),
            thread.clone(),
            had_registers.clone(),
        );

        // A thread that blocks forever without a heartbeat.
        let (tid_tx, tid_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let stuck = thread::spawn(move || {
            tid_tx.send(current_thread_id()).unwrap();
            let _ = release_rx.recv();
        });
        let stuck_tid = tid_rx.recv().unwrap();
        monitor.watch_thread(stuck_tid);
        registry.set_active_monitors(MonitorType::MAIN_THREAD_DEADLOCK);

        let deadline = Instant::now() + Duration::from_secs(5);
        while events.load(SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(events.load(SeqCst), 1);
        assert_eq!(thread.load(SeqCst), stuck_tid);
        assert!(had_registers.load(SeqCst));
        assert_eq!(registry.active_monitors(), MonitorType::NONE);

        release_tx.send(()).unwrap();
        stuck.join().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_heartbeat_keeps_watchdog_quiet() {
        let _guard = SUSPEND_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let events = Arc::new(AtomicUsize::new(0));
        let (registry, monitor) = registry_with_monitor(
            Duration::from_millis(200),
            events.clone(),
            Arc::new(AtomicI32::new(0)),
            Arc::new(AtomicBool::new(false)),
        );
        registry.set_active_monitors(MonitorType::MAIN_THREAD_DEADLOCK);
        assert!(monitor.is_enabled());

        let until = Instant::now() + Duration::from_millis(700);
        while Instant::now() < until {
            monitor.heartbeat();
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(events.load(SeqCst), 0);
        registry.set_active_monitors(MonitorType::NONE);
        assert!(!monitor.is_enabled());
    }
}
