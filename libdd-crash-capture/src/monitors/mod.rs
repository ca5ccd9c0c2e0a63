// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault sources and the registry that coordinates them.

pub mod app_state;
pub mod context;
pub mod deadlock;
mod monitor_type;
pub mod panic;
pub mod registry;
pub mod signal;
pub mod system;
pub mod user_reported;

pub use context::MonitorContext;
pub use monitor_type::MonitorType;
pub use registry::{EventCallback, MonitorRegistry};

/// One source of crash events, or of details attached to them.
pub trait Monitor: Send + Sync {
    /// The single bit identifying this monitor.
    fn monitor_type(&self) -> MonitorType;

    /// Installs or removes whatever hooks the monitor needs. A monitor that
    /// cannot be enabled reports so through [`Monitor::is_enabled`].
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Adds this monitor's details to an event. Called from the crash path:
    /// implementations must not block or allocate.
    fn add_contextual_info<'a>(&'a self, _context: &mut MonitorContext<'a>) {}
}
