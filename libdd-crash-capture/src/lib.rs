// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process crash capture.
//!
//! A [`CrashEngine`] installs a set of monitors, each watching for one kind
//! of fault: fatal signals, panics, a stalled main thread or exceptions the
//! application reports itself. When one fires, the registry suspends the
//! other threads and hands a [`monitors::MonitorContext`] to the engine,
//! which writes a JSON report into `Reports/` under the install path.
//! Reports are read back on the next launch, with dates and symbol names
//! made readable.
//!
//! The fatal path runs inside a signal handler: it does not allocate and
//! does not block. Everything it needs (paths, thread names, binary images)
//! is prepared ahead of time.
#![cfg(unix)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod app_state;
pub mod codec;
pub mod collector;
mod engine;
pub mod monitors;
pub mod report;
pub mod shared;

pub use app_state::{AppState, AppStateError, AppStateSnapshot};
pub use engine::{CrashEngine, CrashEngineError, ReportWrittenCallback};
pub use monitors::user_reported::UserException;
pub use monitors::{MonitorContext, MonitorRegistry, MonitorType};
pub use report::{ReportStore, ReportWriter, StoreError, UserSectionCallback};
pub use shared::configuration::CrashCaptureConfiguration;
pub use shared::console_log::ConsoleLog;
