// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::collector::signal_names::{default_signals, signal_from_signum};
use crate::monitors::MonitorType;
use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashCaptureConfiguration {
    // Append the console log file to every report
    add_console_log_to_report: bool,
    cached_data_interval: Duration,
    create_alt_stack: bool,
    // Zero disables the watchdog even if the deadlock monitor is requested
    deadlock_watchdog_interval: Duration,
    // Look for strings referenced from registers and the stack of the crashed thread
    introspect_memory: bool,
    max_report_count: usize,
    monitors: MonitorType,
    print_previous_log: bool,
    signals: Vec<i32>,
    // Abort after reporting a deadlock
    terminate_on_deadlock: bool,
    use_alt_stack: bool,
}

impl Default for CrashCaptureConfiguration {
    fn default() -> Self {
        Self {
            add_console_log_to_report: false,
            cached_data_interval: constants::DEFAULT_CACHED_DATA_INTERVAL,
            create_alt_stack: true,
            deadlock_watchdog_interval: constants::DEFAULT_DEADLOCK_WATCHDOG_INTERVAL,
            introspect_memory: true,
            max_report_count: constants::DEFAULT_MAX_REPORT_COUNT,
            monitors: MonitorType::PRODUCTION_SAFE_MINIMAL,
            print_previous_log: false,
            signals: default_signals(),
            terminate_on_deadlock: true,
            use_alt_stack: true,
        }
    }
}

impl CrashCaptureConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        monitors: MonitorType,
        max_report_count: usize,
        create_alt_stack: bool,
        use_alt_stack: bool,
        mut signals: Vec<i32>,
        deadlock_watchdog_interval: Option<Duration>,
        cached_data_interval: Option<Duration>,
        introspect_memory: bool,
        add_console_log_to_report: bool,
        print_previous_log: bool,
        terminate_on_deadlock: bool,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        anyhow::ensure!(max_report_count > 0, "The report count must be positive");
        let cached_data_interval =
            cached_data_interval.unwrap_or(constants::DEFAULT_CACHED_DATA_INTERVAL);
        anyhow::ensure!(
            !cached_data_interval.is_zero(),
            "The cached data interval must not be zero"
        );
        if signals.is_empty() {
            signals = default_signals();
        } else {
            // Ensure we don't have double elements in the signals list.
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            signals
                .iter()
                .try_for_each(|x| signal_from_signum(*x).map(|_| ()))?;
        }

        Ok(Self {
            add_console_log_to_report,
            cached_data_interval,
            create_alt_stack,
            deadlock_watchdog_interval: deadlock_watchdog_interval
                .unwrap_or(constants::DEFAULT_DEADLOCK_WATCHDOG_INTERVAL),
            introspect_memory,
            max_report_count,
            monitors,
            print_previous_log,
            signals,
            terminate_on_deadlock,
            use_alt_stack,
        })
    }

    pub fn add_console_log_to_report(&self) -> bool {
        self.add_console_log_to_report
    }

    pub fn cached_data_interval(&self) -> Duration {
        self.cached_data_interval
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn deadlock_watchdog_interval(&self) -> Duration {
        self.deadlock_watchdog_interval
    }

    pub fn introspect_memory(&self) -> bool {
        self.introspect_memory
    }

    pub fn max_report_count(&self) -> usize {
        self.max_report_count
    }

    pub fn monitors(&self) -> MonitorType {
        self.monitors
    }

    pub fn print_previous_log(&self) -> bool {
        self.print_previous_log
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn terminate_on_deadlock(&self) -> bool {
        self.terminate_on_deadlock
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    pub fn set_monitors(&mut self, monitors: MonitorType) {
        self.monitors = monitors;
    }

    pub fn set_max_report_count(&mut self, max_report_count: usize) -> anyhow::Result<()> {
        anyhow::ensure!(max_report_count > 0, "The report count must be positive");
        self.max_report_count = max_report_count;
        Ok(())
    }

    pub fn set_deadlock_watchdog_interval(&mut self, interval: Duration) {
        self.deadlock_watchdog_interval = interval;
    }

    pub fn set_introspect_memory(&mut self, introspect_memory: bool) {
        self.introspect_memory = introspect_memory;
    }

    pub fn set_add_console_log_to_report(&mut self, add_console_log_to_report: bool) {
        self.add_console_log_to_report = add_console_log_to_report;
    }

    pub fn set_print_previous_log(&mut self, print_previous_log: bool) {
        self.print_previous_log = print_previous_log;
    }

    pub fn set_terminate_on_deadlock(&mut self, terminate_on_deadlock: bool) {
        self.terminate_on_deadlock = terminate_on_deadlock;
    }
}
