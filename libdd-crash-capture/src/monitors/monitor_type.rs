// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Set of fault sources, one bit per monitor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorType(u32);

impl MonitorType {
    pub const NONE: Self = Self(0);
    /// Hardware exceptions such as bad memory accesses and illegal instructions.
    pub const HARDWARE_EXCEPTION: Self = Self(0x01);
    /// Fatal signals.
    pub const SIGNAL: Self = Self(0x02);
    /// Uncaught language level exceptions (Rust panics).
    pub const LANGUAGE_EXCEPTION: Self = Self(0x04);
    /// The watched thread stopped making progress.
    pub const MAIN_THREAD_DEADLOCK: Self = Self(0x08);
    /// Reports requested explicitly by the application.
    pub const USER_REPORTED: Self = Self(0x10);
    /// System and process information.
    pub const SYSTEM: Self = Self(0x20);
    /// Application lifecycle counters.
    pub const APPLICATION_STATE: Self = Self(0x40);
    /// Use-after-free tracking.
    pub const ZOMBIE: Self = Self(0x80);

    pub const ALL: Self = Self(0xff);

    pub const EXPERIMENTAL: Self = Self::MAIN_THREAD_DEADLOCK;
    pub const DEBUGGER_UNSAFE: Self = Self(
        Self::HARDWARE_EXCEPTION.0 | Self::SIGNAL.0 | Self::LANGUAGE_EXCEPTION.0,
    );
    pub const ASYNC_SAFE: Self = Self(Self::HARDWARE_EXCEPTION.0 | Self::SIGNAL.0);
    pub const OPTIONAL: Self = Self::ZOMBIE;
    pub const REQUIRED: Self =
        Self(Self::SYSTEM.0 | Self::APPLICATION_STATE.0 | Self::USER_REPORTED.0);

    pub const DEBUGGER_SAFE: Self = Self(Self::ALL.0 & !Self::DEBUGGER_UNSAFE.0);
    pub const ASYNC_UNSAFE: Self = Self(Self::ALL.0 & !Self::ASYNC_SAFE.0);
    pub const PRODUCTION_SAFE: Self = Self(Self::ALL.0 & !Self::EXPERIMENTAL.0);
    pub const PRODUCTION_SAFE_MINIMAL: Self = Self(Self::PRODUCTION_SAFE.0 & !Self::OPTIONAL.0);
    pub const MANUAL: Self = Self(Self::REQUIRED.0 | Self::USER_REPORTED.0);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::HARDWARE_EXCEPTION, "HardwareException"),
        (Self::SIGNAL, "Signal"),
        (Self::LANGUAGE_EXCEPTION, "LanguageException"),
        (Self::MAIN_THREAD_DEADLOCK, "MainThreadDeadlock"),
        (Self::USER_REPORTED, "UserReported"),
        (Self::SYSTEM, "System"),
        (Self::APPLICATION_STATE, "ApplicationState"),
        (Self::ZOMBIE, "Zombie"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Name of a single monitor type, `None` for combinations.
    pub fn name(self) -> Option<&'static str> {
        Self::NAMES
            .iter()
            .find(|(monitor, _)| *monitor == self)
            .map(|(_, name)| *name)
    }

    /// The single-bit types contained in this set.
    pub fn iter(self) -> impl Iterator<Item = MonitorType> {
        Self::NAMES
            .iter()
            .map(|(monitor, _)| *monitor)
            .filter(move |monitor| self.contains(*monitor))
    }
}

impl BitOr for MonitorType {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MonitorType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for MonitorType {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for MonitorType {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

impl fmt::Display for MonitorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        for (i, monitor) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(monitor.name().unwrap_or("Unknown"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MonitorType;

    #[test]
    fn test_masks() {
        assert!(!MonitorType::DEBUGGER_SAFE.intersects(MonitorType::SIGNAL));
        assert!(MonitorType::DEBUGGER_SAFE.contains(MonitorType::USER_REPORTED));
        assert_eq!(
            MonitorType::ASYNC_SAFE | MonitorType::ASYNC_UNSAFE,
            MonitorType::ALL
        );
        assert!(!MonitorType::PRODUCTION_SAFE.contains(MonitorType::MAIN_THREAD_DEADLOCK));
        assert!(!MonitorType::PRODUCTION_SAFE_MINIMAL.contains(MonitorType::ZOMBIE));
        assert!(MonitorType::PRODUCTION_SAFE_MINIMAL.contains(MonitorType::SIGNAL));
        assert_eq!(!MonitorType::ALL, MonitorType::NONE);
    }

    #[test]
    fn test_names() {
        assert_eq!(MonitorType::SIGNAL.name(), Some("Signal"));
        assert_eq!(MonitorType::ALL.name(), None);
        assert_eq!(
            (MonitorType::SIGNAL | MonitorType::SYSTEM).to_string(),
            "Signal | System"
        );
        assert_eq!(MonitorType::NONE.to_string(), "None");
    }

    #[test]
    fn test_serde_as_bits() -> anyhow::Result<()> {
        let json = serde_json::to_string(&MonitorType::REQUIRED)?;
        assert_eq!(json, "112");
        let back: MonitorType = serde_json::from_str(&json)?;
        assert_eq!(back, MonitorType::REQUIRED);
        Ok(())
    }
}
