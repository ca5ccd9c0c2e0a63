// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Monitor, MonitorContext, MonitorType};
use crate::app_state::AppState;
use crate::shared::sync::MutexExt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};
use tracing::error;

/// Attaches the application lifecycle counters to every event.
pub struct AppStateMonitor {
    app_state: Arc<Mutex<AppState>>,
    enabled: AtomicBool,
}

impl AppStateMonitor {
    pub fn new(app_state: Arc<Mutex<AppState>>) -> Self {
        Self {
            app_state,
            enabled: AtomicBool::new(false),
        }
    }
}

impl Monitor for AppStateMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::APPLICATION_STATE
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled == self.enabled.swap(enabled, SeqCst) {
            return;
        }
        if enabled {
            if let Err(e) = self.app_state.lock_or_recover().reset() {
                error!("Could not save app state: {e}");
            }
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info<'a>(&'a self, context: &mut MonitorContext<'a>) {
        // The faulting thread may hold the lock.
        if let Some(mut app_state) = self.app_state.try_lock_or_recover() {
            app_state.update();
            context.app_state = Some(app_state.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_starts_a_launch_and_snapshots() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let app_state = Arc::new(Mutex::new(AppState::initialize(
            &dir.path().join("CrashState.json"),
        )?));
        let monitor = AppStateMonitor::new(app_state.clone());
        monitor.set_enabled(true);
        assert!(monitor.is_enabled());

        let mut context = MonitorContext::new(MonitorType::SIGNAL);
        monitor.add_contextual_info(&mut context);
        let snapshot = context.app_state.expect("snapshot");
        assert_eq!(snapshot.launches_since_last_crash, 1);
        assert_eq!(snapshot.sessions_since_launch, 1);
        assert!(snapshot.application_is_in_foreground);

        // Never blocks on a held lock.
        let _held = app_state.lock().unwrap();
        let mut context = MonitorContext::new(MonitorType::SIGNAL);
        monitor.add_contextual_info(&mut context);
        assert!(context.app_state.is_none());
        Ok(())
    }
}
