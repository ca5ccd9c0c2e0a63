// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! System and process information.
//!
//! Everything that does not change while the process runs is collected once,
//! when the monitor is enabled. Only the memory figures are read again for
//! each event, through a single `sysinfo` call.

use super::{Monitor, MonitorContext, MonitorType};
use crate::collector::binary_images::{CPU_SUBTYPE, CPU_TYPE};
use crate::collector::cpu::current_arch;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use std::ffi::CStr;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing::debug;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub system_name: String,
    pub system_version: String,
    pub machine: String,
    pub kernel_version: String,
    pub os_version: String,
    pub executable_path: String,
    pub executable: String,
    pub process_name: String,
    pub process_id: i32,
    pub parent_process_id: i32,
    pub cpu_arch: &'static str,
    pub cpu_type: i32,
    pub cpu_subtype: i32,
    pub boot_time: Option<String>,
    pub app_start_time: Option<String>,
    pub time_zone: String,
    pub memory_size: u64,
    pub storage_size: u64,
    pub build_type: &'static str,
}

impl SystemInfo {
    pub fn collect() -> Self {
        let os = os_info::get();
        let uname = Uname::read();
        let executable = std::env::current_exe().ok();
        let executable_path = executable
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        let executable_name = executable
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let process_name = std::fs::read_to_string("/proc/self/comm")
            .map(|name| name.trim_end().to_string())
            .unwrap_or_else(|_| executable_name.clone());
        let boot_time = boot_time();

        Self {
            system_name: os.os_type().to_string(),
            system_version: os.version().to_string(),
            machine: uname.machine,
            kernel_version: uname.release,
            os_version: uname.version,
            executable_path,
            executable: executable_name,
            process_name,
            process_id: std::process::id() as i32,
            // SAFETY: getppid has no preconditions.
            parent_process_id: unsafe { libc::getppid() },
            cpu_arch: current_arch(),
            cpu_type: CPU_TYPE,
            cpu_subtype: CPU_SUBTYPE,
            boot_time: boot_time.map(format_date),
            app_start_time: boot_time.and_then(app_start_time).map(format_date),
            time_zone: Local::now().format("%:z").to_string(),
            memory_size: read_memory().map(|m| m.total).unwrap_or_default(),
            storage_size: storage_size(),
            build_type: if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            },
        }
    }
}

#[derive(Default)]
struct Uname {
    machine: String,
    release: String,
    version: String,
}

impl Uname {
    fn read() -> Self {
        // SAFETY: utsname is plain old data and uname fills it completely.
        let mut raw: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut raw) } != 0 {
            debug!("uname failed: {}", errno::errno());
            return Self::default();
        }
        let field = |chars: &[libc::c_char]| {
            // SAFETY: uname NUL-terminates every field.
            unsafe { CStr::from_ptr(chars.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        };
        Self {
            machine: field(&raw.machine),
            release: field(&raw.release),
            version: field(&raw.version),
        }
    }
}

fn format_date(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Copy)]
struct Memory {
    total: u64,
    usable: u64,
    free: u64,
}

/// Async signal safe: a single syscall into a stack buffer.
fn read_memory() -> Option<Memory> {
    // SAFETY: sysinfo is plain old data and the syscall fills it.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return None;
    }
    let unit = u64::from(info.mem_unit.max(1));
    let free = info.freeram as u64 * unit;
    Some(Memory {
        total: info.totalram as u64 * unit,
        usable: free + info.bufferram as u64 * unit,
        free,
    })
}

fn boot_time() -> Option<DateTime<Utc>> {
    // SAFETY: as in read_memory.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return None;
    }
    let uptime = Duration::from_secs(u64::try_from(info.uptime).ok()?);
    SystemTime::now().checked_sub(uptime).map(DateTime::<Utc>::from)
}

/// The process start time is stored in `/proc/self/stat` as clock ticks since
/// boot, in the 22nd field.
fn app_start_time(boot_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // The command name may contain spaces, so count from its closing paren.
    let after_name = &stat[stat.rfind(')')? + 1..];
    let ticks: u64 = after_name.split_whitespace().nth(19)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let ticks_per_second = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    let ticks_per_second = u64::try_from(ticks_per_second).ok().filter(|t| *t > 0)?;
    let since_boot = chrono::Duration::from_std(Duration::from_millis(
        ticks.saturating_mul(1000) / ticks_per_second,
    ))
    .ok()?;
    boot_time.checked_add_signed(since_boot)
}

fn storage_size() -> u64 {
    match nix::sys::statvfs::statvfs("/") {
        Ok(stat) => stat.blocks() as u64 * stat.fragment_size() as u64,
        Err(e) => {
            debug!("statvfs failed: {e}");
            0
        }
    }
}

pub struct SystemMonitor {
    info: OnceLock<SystemInfo>,
    enabled: AtomicBool,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            info: OnceLock::new(),
            enabled: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> Option<&SystemInfo> {
        self.info.get()
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for SystemMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::SYSTEM
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.info.get_or_init(SystemInfo::collect);
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info<'a>(&'a self, context: &mut MonitorContext<'a>) {
        context.system.info = self.info.get();
        if let Some(memory) = read_memory() {
            context.system.usable_memory = memory.usable;
            context.system.free_memory = memory.free;
        }
    }
}
