// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide entry point: installs the monitors, turns every captured
//! event into a report and gives access to the stored reports.

use crate::app_state::{AppState, AppStateError};
use crate::codec::DecodeFailure;
use crate::collector::CachedData;
use crate::monitors::app_state::AppStateMonitor;
use crate::monitors::deadlock::DeadlockMonitor;
use crate::monitors::panic::PanicMonitor;
use crate::monitors::signal::SignalMonitor;
use crate::monitors::system::SystemMonitor;
use crate::monitors::user_reported::{UserException, UserReportedMonitor};
use crate::monitors::{EventCallback, Monitor, MonitorContext, MonitorRegistry, MonitorType};
use crate::report::fixup::fixup_crash_report;
use crate::report::store::ReportPathBuf;
use crate::report::{
    write_recrash_report, write_standard_report, ReportSettings, ReportStore, StoreError,
    UserSectionCallback,
};
use crate::shared::configuration::CrashCaptureConfiguration;
use crate::shared::console_log::ConsoleLog;
use crate::shared::constants::{
    APP_STATE_FILE, CONSOLE_LOG_FILE, DATA_DIRECTORY, REPORTS_DIRECTORY,
};
use crate::shared::file_utils::make_path;
use crate::shared::sync::MutexExt;
use std::path::Path;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, error, info, warn};

/// Called with the id of every report written for a crash, including a
/// report rewritten after a crash in the crash handler.
pub type ReportWrittenCallback = dyn Fn(i64) + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum CrashEngineError {
    #[error("Crash capture is not installed")]
    NotInstalled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    AppState(#[from] AppStateError),
    #[error("Could not fix up report: {0}")]
    Fixup(#[from] DecodeFailure),
    #[error("Could not set up crash capture: {0}")]
    Setup(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Application lifecycle transitions. Those received before installation are
/// queued and applied in order once the app state is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppNotification {
    Active(bool),
    InForeground(bool),
    Terminate,
    Crash,
}

/// Report options that can change at any time, shared with the crash path.
#[derive(Default)]
struct ReportOptions {
    introspect_memory: AtomicBool,
    add_console_log_to_report: AtomicBool,
    user_info_json: Mutex<Option<Vec<u8>>>,
    user_section: Mutex<Option<Box<UserSectionCallback>>>,
    report_written: Mutex<Option<Box<ReportWrittenCallback>>>,
}

struct Installation {
    registry: Arc<MonitorRegistry>,
    store: Arc<ReportStore>,
    app_state: Arc<Mutex<AppState>>,
    console_log: Arc<ConsoleLog>,
    cached_data: Arc<CachedData>,
    deadlock: Option<Arc<DeadlockMonitor>>,
    user_reported: Arc<UserReportedMonitor>,
}

pub struct CrashEngine {
    config: Mutex<CrashCaptureConfiguration>,
    options: Arc<ReportOptions>,
    installation: OnceLock<Installation>,
    pending_notifications: Mutex<Vec<AppNotification>>,
}

impl CrashEngine {
    pub fn new(config: CrashCaptureConfiguration) -> Self {
        let options = ReportOptions::default();
        options
            .introspect_memory
            .store(config.introspect_memory(), SeqCst);
        options
            .add_console_log_to_report
            .store(config.add_console_log_to_report(), SeqCst);
        Self {
            config: Mutex::new(config),
            options: Arc::new(options),
            installation: OnceLock::new(),
            pending_notifications: Mutex::new(Vec::new()),
        }
    }

    /// Creates `Reports/` and `Data/` under `install_path`, loads the app
    /// state and enables the configured monitors. Returns the monitors that
    /// ended up active.
    ///
    /// The calling thread is the one watched for deadlocks, so this should be
    /// called from the main thread. Installing twice has no effect.
    pub fn install(&self, app_name: &str, install_path: &Path) -> Result<MonitorType, CrashEngineError> {
        if self.installation.get().is_some() {
            warn!("Crash capture is already installed");
            return Ok(self.active_monitors());
        }
        let config = self.config.lock_or_recover().clone();

        let reports_path = install_path.join(REPORTS_DIRECTORY);
        let data_path = install_path.join(DATA_DIRECTORY);
        make_path(&reports_path)?;
        make_path(&data_path)?;

        let store = Arc::new(ReportStore::initialize(
            app_name,
            &reports_path,
            config.max_report_count(),
        )?);

        let app_state_path = data_path.join(APP_STATE_FILE);
        let app_state = match AppState::initialize(&app_state_path) {
            Ok(app_state) => app_state,
            Err(e) => {
                error!("Could not load app state, starting over: {e}");
                AppState::new(app_state_path)
            }
        };
        let app_state = Arc::new(Mutex::new(app_state));
        let console_log = Arc::new(ConsoleLog::open(
            &data_path.join(CONSOLE_LOG_FILE),
            config.print_previous_log(),
        )?);
        let cached_data = CachedData::start(config.cached_data_interval())?;

        let event_callback = on_crash(
            self.options.clone(),
            store.clone(),
            app_state.clone(),
            console_log.clone(),
            cached_data.clone(),
        );
        let mut deadlock = None;
        let mut user_reported = None;
        let registry = MonitorRegistry::new(Some(cached_data.clone()), event_callback, |registry| {
            let user = Arc::new(UserReportedMonitor::new(registry));
            user_reported = Some(user.clone());
            let mut monitors: Vec<Arc<dyn Monitor>> = vec![
                Arc::new(SignalMonitor::new(
                    registry,
                    config.signals().clone(),
                    config.create_alt_stack(),
                    config.use_alt_stack(),
                )),
                Arc::new(PanicMonitor::new(registry)),
                user,
                Arc::new(SystemMonitor::new()),
                Arc::new(AppStateMonitor::new(app_state.clone())),
            ];
            let interval = config.deadlock_watchdog_interval();
            if !interval.is_zero() {
                let monitor = Arc::new(DeadlockMonitor::new(
                    registry,
                    interval,
                    config.terminate_on_deadlock(),
                ));
                deadlock = Some(monitor.clone());
                monitors.push(monitor);
            }
            monitors
        });
        let Some(user_reported) = user_reported else {
            return Err(anyhow::anyhow!("User reported monitor was not created").into());
        };

        let installation = Installation {
            registry,
            store,
            app_state,
            console_log,
            cached_data,
            deadlock,
            user_reported,
        };
        if let Err(installation) = self.installation.set(installation) {
            warn!("Crash capture was installed concurrently");
            installation.cached_data.stop();
            return Ok(self.active_monitors());
        }

        let active = self.set_monitoring(config.monitors());
        let pending = std::mem::take(&mut *self.pending_notifications.lock_or_recover());
        for notification in pending {
            debug!(?notification, "Replaying app notification received before install");
            self.notify(notification);
        }
        info!(
            app_name,
            path = %install_path.display(),
            monitors = %active,
            "Crash capture installed"
        );
        Ok(active)
    }

    /// Enables `requested` (minus what the environment forbids) and returns
    /// what is active. Before installation the request is only recorded.
    pub fn set_monitoring(&self, requested: MonitorType) -> MonitorType {
        self.config.lock_or_recover().set_monitors(requested);
        match self.installation.get() {
            Some(installation) => installation.registry.set_active_monitors(requested),
            None => requested,
        }
    }

    pub fn active_monitors(&self) -> MonitorType {
        self.installation
            .get()
            .map(|installation| installation.registry.active_monitors())
            .unwrap_or(MonitorType::NONE)
    }

    /// The registry driving the monitors, for fault sources living outside
    /// this crate. `None` before installation.
    pub fn monitor_registry(&self) -> Option<&Arc<MonitorRegistry>> {
        self.installation.get().map(|installation| &installation.registry)
    }

    fn notify(&self, notification: AppNotification) {
        let Some(installation) = self.installation.get() else {
            self.pending_notifications.lock_or_recover().push(notification);
            return;
        };
        if !installation
            .registry
            .active_monitors()
            .contains(MonitorType::APPLICATION_STATE)
        {
            debug!(?notification, "App state monitor is off, ignoring notification");
            return;
        }
        let mut app_state = installation.app_state.lock_or_recover();
        let result = match notification {
            AppNotification::Active(is_active) => {
                app_state.notify_app_active(is_active);
                Ok(())
            }
            AppNotification::InForeground(is_in_foreground) => {
                app_state.notify_app_in_foreground(is_in_foreground)
            }
            AppNotification::Terminate => app_state.notify_app_terminate(),
            AppNotification::Crash => app_state.notify_app_crash(),
        };
        if let Err(e) = result {
            error!(?notification, "Could not save app state: {e}");
        }
    }

    pub fn notify_app_active(&self, is_active: bool) {
        self.notify(AppNotification::Active(is_active));
    }

    pub fn notify_app_in_foreground(&self, is_in_foreground: bool) {
        self.notify(AppNotification::InForeground(is_in_foreground));
    }

    pub fn notify_app_terminate(&self) {
        self.notify(AppNotification::Terminate);
    }

    pub fn notify_app_crash(&self) {
        self.notify(AppNotification::Crash);
    }

    /// Writes a report for an exception the application caught itself.
    /// Returns false when nothing was recorded.
    pub fn report_user_exception(
        &self,
        exception: &UserException,
        log_all_threads: bool,
        terminate_program: bool,
    ) -> bool {
        let Some(installation) = self.installation.get() else {
            warn!("Crash capture is not installed, user exception not recorded");
            return false;
        };
        let reported = installation
            .user_reported
            .report(exception, log_all_threads, terminate_program);
        if reported && self.options.add_console_log_to_report.load(SeqCst) {
            if let Err(e) = installation.console_log.clear() {
                error!("Could not clear console log: {e}");
            }
        }
        reported
    }

    fn store(&self) -> Result<&ReportStore, CrashEngineError> {
        self.installation
            .get()
            .map(|installation| installation.store.as_ref())
            .ok_or(CrashEngineError::NotInstalled)
    }

    pub fn report_count(&self) -> usize {
        self.store().map(ReportStore::report_count).unwrap_or(0)
    }

    pub fn report_ids(&self) -> Vec<i64> {
        self.store().map(ReportStore::report_ids).unwrap_or_default()
    }

    /// The report with `id`, with readable dates and demangled symbols.
    pub fn read_report(&self, id: i64) -> Result<Vec<u8>, CrashEngineError> {
        if id <= 0 {
            return Err(StoreError::InvalidId(id).into());
        }
        let raw = self.store()?.read_report(id)?;
        Ok(fixup_crash_report(&raw)?)
    }

    pub fn add_user_report(&self, report: &[u8]) -> Result<i64, CrashEngineError> {
        Ok(self.store()?.add_user_report(report)?)
    }

    pub fn delete_all_reports(&self) -> Result<(), CrashEngineError> {
        Ok(self.store()?.delete_all()?)
    }

    pub fn delete_report_with_id(&self, id: i64) -> bool {
        self.store()
            .map(|store| store.delete_report_with_id(id))
            .unwrap_or(false)
    }

    /// Zero or negative counts are ignored.
    pub fn set_max_report_count(&self, count: i64) {
        if count <= 0 {
            warn!(count, "Ignoring invalid max report count");
            return;
        }
        if let Err(e) = self
            .config
            .lock_or_recover()
            .set_max_report_count(count as usize)
        {
            warn!("Ignoring max report count: {e}");
        }
        if let Some(installation) = self.installation.get() {
            installation.store.set_max_report_count(count);
        }
    }

    /// A JSON object copied into the `user` section of every crash report.
    pub fn set_user_info_json(&self, json: Option<Vec<u8>>) {
        *self.options.user_info_json.lock_or_recover() = json;
    }

    pub fn set_user_section_callback(&self, callback: Option<Box<UserSectionCallback>>) {
        *self.options.user_section.lock_or_recover() = callback;
    }

    pub fn set_report_written_callback(&self, callback: Option<Box<ReportWrittenCallback>>) {
        *self.options.report_written.lock_or_recover() = callback;
    }

    pub fn set_introspect_memory(&self, introspect_memory: bool) {
        self.config
            .lock_or_recover()
            .set_introspect_memory(introspect_memory);
        self.options
            .introspect_memory
            .store(introspect_memory, SeqCst);
    }

    pub fn set_add_console_log_to_report(&self, add_console_log_to_report: bool) {
        self.config
            .lock_or_recover()
            .set_add_console_log_to_report(add_console_log_to_report);
        self.options
            .add_console_log_to_report
            .store(add_console_log_to_report, SeqCst);
    }

    /// Tells the deadlock watchdog the main thread is responsive.
    pub fn deadlock_heartbeat(&self) {
        if let Some(deadlock) = self
            .installation
            .get()
            .and_then(|installation| installation.deadlock.as_ref())
        {
            deadlock.heartbeat();
        }
    }

    /// The log file attached to reports. Point a `tracing_subscriber` at it
    /// to capture the application's output.
    pub fn console_log(&self) -> Option<Arc<ConsoleLog>> {
        self.installation
            .get()
            .map(|installation| installation.console_log.clone())
    }

    pub fn config(&self) -> CrashCaptureConfiguration {
        self.config.lock_or_recover().clone()
    }
}

impl Drop for CrashEngine {
    fn drop(&mut self) {
        if let Some(installation) = self.installation.get() {
            installation.registry.set_active_monitors(MonitorType::NONE);
            installation.cached_data.stop();
        }
    }
}

/// Builds the callback that writes a report for every captured event.
///
/// It runs on the crash path: locks are only tried, and a re-crash goes to
/// the report that was being written when it happened.
fn on_crash(
    options: Arc<ReportOptions>,
    store: Arc<ReportStore>,
    app_state: Arc<Mutex<AppState>>,
    console_log: Arc<ConsoleLog>,
    cached_data: Arc<CachedData>,
) -> EventCallback {
    let last_report_id = AtomicI64::new(0);
    Box::new(move |context: &mut MonitorContext<'_>| {
        let mut app_state_result = Ok(());
        // The snapshot is only taken while the app state monitor is enabled.
        if !context.current_snapshot_user_reported && context.app_state.is_some() {
            if let Some(mut app_state) = app_state.try_lock_or_recover() {
                app_state_result = app_state.notify_app_crash();
            }
        }

        let mut context = context.clone();
        if options.add_console_log_to_report.load(SeqCst) {
            context.console_log_path = Some(console_log.path());
        }
        let user_info_json = options.user_info_json.try_lock_or_recover();
        let user_section = options.user_section.try_lock_or_recover();
        let settings = ReportSettings {
            user_info_json: user_info_json.as_deref().and_then(Option::as_deref),
            user_section: user_section.as_deref().and_then(Option::as_deref),
            introspect_memory: options.introspect_memory.load(SeqCst),
            cached_data: Some(&*cached_data),
        };

        let mut path_buffer = ReportPathBuf::new();
        let previous_id = last_report_id.load(SeqCst);
        if context.crashed_during_crash_handling && previous_id > 0 {
            let Some(path) = store.write_report_path(previous_id, &mut path_buffer) else {
                return;
            };
            let result = write_recrash_report(&context, path, &settings);
            drop(user_section);
            drop(user_info_json);
            if !context.requires_async_safety {
                match &result {
                    Ok(()) => info!(id = previous_id, "Crash during crash handling recorded"),
                    Err(e) => error!(id = previous_id, "Recrash report failed: {e}"),
                }
            }
            if result.is_ok() {
                if let Some(Some(callback)) = options.report_written.try_lock_or_recover().as_deref() {
                    callback(previous_id);
                }
            }
            return;
        }

        let Some((id, path)) = store.next_crash_report(&mut path_buffer) else {
            return;
        };
        last_report_id.store(id, SeqCst);
        let result = write_standard_report(&context, path, &settings);
        drop(user_section);
        drop(user_info_json);

        if !context.requires_async_safety {
            match &result {
                Ok(()) => info!(id, path = %path.display(), "Crash report written"),
                Err(e) => error!(id, "Crash report incomplete: {e}"),
            }
            if let Err(e) = &app_state_result {
                error!("Could not save app state: {e}");
            }
        }
        if let Some(Some(callback)) = options.report_written.try_lock_or_recover().as_deref() {
            callback(id);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::thread_suspend::tests::SUSPEND_LOCK;

    fn config(monitors: MonitorType) -> anyhow::Result<CrashCaptureConfiguration> {
        let mut config = CrashCaptureConfiguration::default();
        config.set_monitors(monitors);
        config.set_deadlock_watchdog_interval(std::time::Duration::ZERO);
        config.set_use_alt_stack(true)?;
        config.set_create_alt_stack(false)?;
        Ok(config)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_pending_notification_is_replayed() -> anyhow::Result<()> {
        let _guard = SUSPEND_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir()?;
        let engine = CrashEngine::new(config(MonitorType::APPLICATION_STATE)?);
        engine.notify_app_active(true);
        engine.notify_app_crash();
        assert_eq!(engine.report_count(), 0);
        assert!(matches!(engine.read_report(1), Err(CrashEngineError::NotInstalled)));

        let active = engine.install("App", dir.path())?;
        assert_eq!(active, MonitorType::APPLICATION_STATE);
        let installation = engine.installation.get().unwrap();
        assert!(installation.app_state.lock().unwrap().snapshot().crashed_this_launch);
        assert!(dir.path().join(DATA_DIRECTORY).join(APP_STATE_FILE).exists());
        assert!(dir.path().join(REPORTS_DIRECTORY).is_dir());

        // A second install keeps the first one.
        assert_eq!(engine.install("Other", dir.path())?, active);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_user_exception_report_and_callbacks() -> anyhow::Result<()> {
        let _guard = SUSPEND_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir()?;
        let engine = CrashEngine::new(config(MonitorType::MANUAL)?);
        let written = Arc::new(AtomicI64::new(0));
        let sink = written.clone();
        engine.set_report_written_callback(Some(Box::new(move |id| sink.store(id, SeqCst))));
        engine.set_user_info_json(Some(br#"{"build":"42"}"#.to_vec()));
        engine.set_add_console_log_to_report(true);
        engine.install("App", dir.path())?;

        let log = engine.console_log().expect("console log");
        std::io::Write::write_all(&mut &*log, b"line before the exception\n")?;

        let exception = UserException::new("ValueError").with_reason("bad value");
        assert!(engine.report_user_exception(&exception, false, false));

        let ids = engine.report_ids();
        assert_eq!(ids.len(), 1);
        assert_eq!(written.load(SeqCst), ids[0]);
        let report: serde_json::Value = serde_json::from_slice(&engine.read_report(ids[0])?)?;
        assert_eq!(report["crash"]["error"]["type"], "user");
        assert_eq!(report["crash"]["error"]["reason"], "bad value");
        assert_eq!(report["user"]["build"], "42");
        assert_eq!(report["debug"]["console_log"][0], "line before the exception");
        // Dates are made readable on the way out.
        assert!(report["report"]["timestamp"].as_str().unwrap().ends_with('Z'));
        // The log is cleared once attached to a user report.
        assert_eq!(std::fs::metadata(log.path())?.len(), 0);

        assert!(engine.delete_report_with_id(ids[0]));
        assert_eq!(engine.report_count(), 0);
        assert!(matches!(
            engine.read_report(0),
            Err(CrashEngineError::Store(StoreError::InvalidId(0)))
        ));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_notifications_ignored_without_app_state_monitor() -> anyhow::Result<()> {
        let _guard = SUSPEND_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir()?;
        let engine = CrashEngine::new(config(MonitorType::USER_REPORTED | MonitorType::SYSTEM)?);
        engine.notify_app_active(false);
        engine.install("App", dir.path())?;
        engine.notify_app_in_foreground(false);
        engine.notify_app_in_foreground(true);
        engine.notify_app_terminate();
        engine.notify_app_crash();

        let state_path = dir.path().join(DATA_DIRECTORY).join(APP_STATE_FILE);
        let installation = engine.installation.get().unwrap();
        let snapshot = installation.app_state.lock().unwrap().snapshot();
        assert!(snapshot.application_is_active);
        assert_eq!(snapshot.sessions_since_launch, 0);
        assert_eq!(snapshot.sessions_since_last_crash, 0);
        assert_eq!(snapshot.launches_since_last_crash, 0);
        assert!(!snapshot.crashed_this_launch);
        assert!(!state_path.exists());

        // A fatal event leaves the counters alone too.
        assert!(!installation
            .registry
            .capture(false, false, || MonitorContext::new(MonitorType::SIGNAL)));
        assert_eq!(engine.report_count(), 1);
        assert!(!installation.app_state.lock().unwrap().snapshot().crashed_this_launch);
        assert!(!state_path.exists());

        engine.set_monitoring(MonitorType::USER_REPORTED | MonitorType::APPLICATION_STATE);
        engine.notify_app_crash();
        let snapshot = installation.app_state.lock().unwrap().snapshot();
        assert_eq!(snapshot.launches_since_last_crash, 1);
        assert!(snapshot.crashed_this_launch);
        assert!(state_path.exists());
        Ok(())
    }
}
