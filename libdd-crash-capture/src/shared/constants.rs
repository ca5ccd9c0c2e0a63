// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Format version written into every report.
pub const REPORT_VERSION: &str = "3.3.0";
/// Reports at or above this version store their timestamp in microseconds.
pub const MICROSECOND_TIMESTAMP_VERSION: (u32, u32, u32) = (3, 3, 0);

pub const DEFAULT_MAX_REPORT_COUNT: usize = 5;
pub const DEFAULT_CACHED_DATA_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_DEADLOCK_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

pub const MAX_REPORT_READ_SIZE: usize = 2_000_000;
pub const MAX_APP_STATE_FILE_SIZE: usize = 50_000;

pub const REPORTS_DIRECTORY: &str = "Reports";
pub const DATA_DIRECTORY: &str = "Data";
pub const APP_STATE_FILE: &str = "CrashState.json";
pub const CONSOLE_LOG_FILE: &str = "ConsoleLog.txt";

/// Size of the buffer the report writer accumulates output in before it is
/// written to the report file.
pub const REPORT_WRITE_BUFFER_SIZE: usize = 1024;
