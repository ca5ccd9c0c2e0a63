// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Layout of the reports written for a captured event.
//!
//! Both entry points run on the crash path, usually with every other thread
//! suspended. They write through fixed size buffers and never allocate.

use super::introspection::{write_notable_addresses, write_stack_contents};
use super::writer::{JsonReportWriter, ReportWriter};
use super::ReportError;
use crate::app_state::AppStateSnapshot;
use crate::collector::binary_images::{for_each_image, BinaryImage};
use crate::collector::cpu::CpuState;
use crate::collector::signal_names::{code_name, signal_name};
use crate::collector::thread_suspend::{self, current_thread_id, is_suspended, suspended_threads};
use crate::collector::{CachedData, MachineContext, StackCursor};
use crate::monitors::{MonitorContext, MonitorType};
use crate::shared::buffered_io::BufferedWriter;
use crate::shared::constants::{REPORT_VERSION, REPORT_WRITE_BUFFER_SIZE};
use crate::shared::file_utils::{last_path_entry, remove_file};
use libc::pid_t;
use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const THREAD_NAME_BUFFER_SIZE: usize = 64;
const PATH_BUFFER_SIZE: usize = libc::PATH_MAX as usize;

/// Called while a standard report is written, to add application data to its
/// `user` section. Runs on the crash path with other threads suspended.
pub type UserSectionCallback = dyn Fn(&mut dyn ReportWriter) + Send + Sync;

/// What goes into a report beyond the captured event.
#[derive(Clone, Copy, Default)]
pub struct ReportSettings<'a> {
    /// JSON object copied into the `user` section.
    pub user_info_json: Option<&'a [u8]>,
    pub user_section: Option<&'a UserSectionCallback>,
    /// Look for strings around the crashed thread's registers and stack.
    pub introspect_memory: bool,
    pub cached_data: Option<&'a CachedData>,
}

type ReportFileWriter = JsonReportWriter<BufferedWriter<REPORT_WRITE_BUFFER_SIZE>>;

/// Writes the full report for `context` to a new file at `path`.
pub fn write_standard_report(
    context: &MonitorContext<'_>,
    path: &Path,
    settings: &ReportSettings<'_>,
) -> Result<(), ReportError> {
    let sink = BufferedWriter::create(path)?;
    let mut writer = JsonReportWriter::new(sink, true);
    if let Some(cached_data) = settings.cached_data {
        cached_data.freeze();
    }

    writer.begin_object(None);
    write_report_info(&mut writer, "report", "standard", context);
    writer.flush();

    let executable_path = context.system.info.map(|info| info.executable_path.as_str());
    write_binary_images(&mut writer, "binary_images", executable_path);
    writer.flush();

    write_process_state(&mut writer, "process", context);
    writer.flush();

    write_system_info(&mut writer, "system", context);
    writer.flush();

    writer.begin_object(Some("crash"));
    write_error(&mut writer, "error", context);
    writer.flush();
    write_all_threads(&mut writer, "threads", context, settings);
    writer.end_container();
    writer.flush();

    match settings.user_info_json {
        Some(json) => writer.add_json_element(Some("user"), json, false),
        None => writer.begin_object(Some("user")),
    }
    if !context.current_snapshot_user_reported {
        if let Some(callback) = settings.user_section {
            callback(&mut writer);
        }
    }
    writer.end_container();
    writer.flush();

    writer.begin_object(Some("debug"));
    if let Some(console_log) = context.console_log_path {
        writer.add_text_file_lines_element(Some("console_log"), console_log);
    }
    writer.end_container();

    if let Some(cached_data) = settings.cached_data {
        cached_data.unfreeze();
    }
    finish(writer)
}

/// Writes a minimal report for a fault raised while the report at `path`
/// was being written. The unfinished report is embedded in the new one.
pub fn write_recrash_report(
    context: &MonitorContext<'_>,
    path: &Path,
    settings: &ReportSettings<'_>,
) -> Result<(), ReportError> {
    let mut backup_buffer = [0u8; PATH_BUFFER_SIZE];
    let backup_path = backup_path(path, &mut backup_buffer).ok_or(ReportError::PathTooLong)?;
    let has_previous = match std::fs::rename(path, backup_path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };

    let sink = BufferedWriter::create(path)?;
    let mut writer = JsonReportWriter::new(sink, true);
    if let Some(cached_data) = settings.cached_data {
        cached_data.freeze();
    }

    writer.begin_object(None);
    if has_previous {
        writer.add_json_file_verbatim_element(Some("recrash_report"), backup_path);
        writer.flush();
        remove_file(backup_path, false);
    }
    write_report_info(&mut writer, "report", "minimal", context);
    writer.flush();

    writer.begin_object(Some("crash"));
    write_error(&mut writer, "error", context);
    writer.flush();
    let machine_context = context
        .offending_machine_context
        .unwrap_or_else(|| MachineContext::for_current_thread(true));
    let mut cursor = context.stack_cursor;
    write_thread(
        &mut writer,
        Some("crashed_thread"),
        &machine_context,
        &mut cursor,
        0,
        settings,
        false,
    );
    writer.end_container();

    if let Some(cached_data) = settings.cached_data {
        cached_data.unfreeze();
    }
    finish(writer)
}

fn finish(writer: ReportFileWriter) -> Result<(), ReportError> {
    let (mut sink, error) = writer.finish();
    sink.close()?;
    match error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// `path` with its `.json` extension replaced by `.old`, built in `buffer`.
fn backup_path<'b>(path: &Path, buffer: &'b mut [u8]) -> Option<&'b Path> {
    const EXTENSION: &[u8] = b".json";
    const BACKUP_EXTENSION: &[u8] = b".old";
    let bytes = path.as_os_str().as_bytes();
    let stem = bytes.strip_suffix(EXTENSION).unwrap_or(bytes);
    let length = stem.len() + BACKUP_EXTENSION.len();
    if length > buffer.len() {
        return None;
    }
    buffer[..stem.len()].copy_from_slice(stem);
    buffer[stem.len()..length].copy_from_slice(BACKUP_EXTENSION);
    Some(Path::new(OsStr::from_bytes(&buffer[..length])))
}

fn write_report_info(
    writer: &mut dyn ReportWriter,
    key: &str,
    report_type: &str,
    context: &MonitorContext<'_>,
) {
    let mut id_buffer = Uuid::encode_buffer();
    let id = context.event_id.hyphenated().encode_upper(&mut id_buffer);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or_default();

    writer.begin_object(Some(key));
    writer.add_string_element(Some("version"), Some(REPORT_VERSION));
    writer.add_string_element(Some("id"), Some(&*id));
    writer.add_string_element(
        Some("process_name"),
        context.system.info.map(|info| info.process_name.as_str()),
    );
    writer.add_integer_element(Some("timestamp"), timestamp);
    writer.add_string_element(Some("type"), Some(report_type));
    writer.end_container();
}

fn write_binary_images(writer: &mut dyn ReportWriter, key: &str, executable_path: Option<&str>) {
    writer.begin_array(Some(key));
    for_each_image(|image| {
        write_binary_image(writer, image, executable_path);
        true
    });
    writer.end_container();
}

fn write_binary_image(writer: &mut dyn ReportWriter, image: &BinaryImage, executable_path: Option<&str>) {
    let name = match image.name {
        Some(name) => name.to_str().ok(),
        None => executable_path,
    };
    // Report consumers expect a 16 byte image uuid.
    let uuid = image.build_id().map(|build_id| {
        let mut uuid = [0u8; 16];
        let length = build_id.len().min(uuid.len());
        uuid[..length].copy_from_slice(&build_id[..length]);
        uuid
    });

    writer.begin_object(None);
    writer.add_uinteger_element(Some("image_addr"), image.address as u64);
    writer.add_uinteger_element(Some("image_vmaddr"), image.vm_address as u64);
    writer.add_uinteger_element(Some("image_size"), image.size as u64);
    writer.add_string_element(Some("name"), name);
    writer.add_uuid_element(Some("uuid"), uuid.as_ref());
    writer.add_integer_element(Some("cpu_type"), image.cpu_type().into());
    writer.add_integer_element(Some("cpu_subtype"), image.cpu_subtype().into());
    writer.add_uinteger_element(Some("major_version"), image.major_version);
    writer.add_uinteger_element(Some("minor_version"), image.minor_version);
    writer.add_uinteger_element(Some("revision_version"), image.revision_version);
    writer.end_container();
}

fn write_process_state(writer: &mut dyn ReportWriter, key: &str, context: &MonitorContext<'_>) {
    writer.begin_object(Some(key));
    let zombie = &context.zombie;
    if zombie.address != 0 {
        writer.begin_object(Some("last_dealloced_nsexception"));
        writer.add_uinteger_element(Some("address"), zombie.address as u64);
        writer.add_string_element(Some("name"), zombie.name);
        writer.add_string_element(Some("reason"), zombie.reason);
        writer.end_container();
    }
    writer.end_container();
}

fn write_system_info(writer: &mut dyn ReportWriter, key: &str, context: &MonitorContext<'_>) {
    writer.begin_object(Some(key));
    let info = context.system.info;
    if let Some(info) = info {
        writer.add_string_element(Some("system_name"), Some(&info.system_name));
        writer.add_string_element(Some("system_version"), Some(&info.system_version));
        writer.add_string_element(Some("machine"), Some(&info.machine));
        writer.add_string_element(Some("kernel_version"), Some(&info.kernel_version));
        writer.add_string_element(Some("os_version"), Some(&info.os_version));
        writer.add_string_element(Some("boot_time"), info.boot_time.as_deref());
        writer.add_string_element(Some("app_start_time"), info.app_start_time.as_deref());
        writer.add_string_element(Some("CFBundleExecutablePath"), Some(&info.executable_path));
        writer.add_string_element(Some("CFBundleExecutable"), Some(&info.executable));
        writer.add_string_element(Some("cpu_arch"), Some(info.cpu_arch));
        writer.add_integer_element(Some("cpu_type"), info.cpu_type.into());
        writer.add_integer_element(Some("cpu_subtype"), info.cpu_subtype.into());
        writer.add_string_element(Some("time_zone"), Some(&info.time_zone));
        writer.add_string_element(Some("process_name"), Some(&info.process_name));
        writer.add_integer_element(Some("process_id"), info.process_id.into());
        writer.add_integer_element(Some("parent_process_id"), info.parent_process_id.into());
        writer.add_string_element(Some("build_type"), Some(info.build_type));
        writer.add_uinteger_element(Some("storage"), info.storage_size);
    }

    writer.begin_object(Some("memory"));
    writer.add_uinteger_element(Some("size"), info.map(|i| i.memory_size).unwrap_or_default());
    writer.add_uinteger_element(Some("usable"), context.system.usable_memory);
    writer.add_uinteger_element(Some("free"), context.system.free_memory);
    writer.end_container();

    if let Some(app_state) = &context.app_state {
        write_app_stats(writer, "application_stats", app_state);
    }
    writer.end_container();
}

fn write_app_stats(writer: &mut dyn ReportWriter, key: &str, state: &AppStateSnapshot) {
    writer.begin_object(Some(key));
    writer.add_boolean_element(Some("application_active"), state.application_is_active);
    writer.add_boolean_element(Some("application_in_foreground"), state.application_is_in_foreground);
    writer.add_integer_element(Some("launches_since_last_crash"), state.launches_since_last_crash);
    writer.add_integer_element(Some("sessions_since_last_crash"), state.sessions_since_last_crash);
    writer.add_floating_point_element(
        Some("active_time_since_last_crash"),
        state.active_duration_since_last_crash,
    );
    writer.add_floating_point_element(
        Some("background_time_since_last_crash"),
        state.background_duration_since_last_crash,
    );
    writer.add_integer_element(Some("sessions_since_launch"), state.sessions_since_launch);
    writer.add_floating_point_element(
        Some("active_time_since_launch"),
        state.active_duration_since_launch,
    );
    writer.add_floating_point_element(
        Some("background_time_since_launch"),
        state.background_duration_since_launch,
    );
    writer.end_container();
}

fn write_error(writer: &mut dyn ReportWriter, key: &str, context: &MonitorContext<'_>) {
    writer.begin_object(Some(key));

    let hardware = &context.hardware_exception;
    if hardware.exception_type != 0 {
        writer.begin_object(Some("mach"));
        writer.add_integer_element(Some("exception"), hardware.exception_type.into());
        writer.add_string_element(Some("exception_name"), signal_name(hardware.exception_type));
        writer.add_integer_element(Some("code"), hardware.code);
        writer.add_integer_element(Some("subcode"), hardware.subcode);
        writer.end_container();
    }

    let signal = &context.signal;
    if signal.signum != 0 {
        writer.begin_object(Some("signal"));
        writer.add_integer_element(Some("signal"), signal.signum.into());
        writer.add_string_element(Some("name"), signal_name(signal.signum));
        writer.add_integer_element(Some("code"), signal.sigcode.into());
        writer.add_string_element(Some("code_name"), code_name(signal.signum, signal.sigcode));
        writer.end_container();
    }

    writer.add_uinteger_element(Some("address"), context.fault_address as u64);
    if let Some(reason) = context.crash_reason {
        writer.add_string_element(Some("reason"), Some(reason));
    }

    let crash_type = context.crash_type;
    if crash_type == MonitorType::MAIN_THREAD_DEADLOCK {
        writer.add_string_element(Some("type"), Some("deadlock"));
    } else if crash_type == MonitorType::HARDWARE_EXCEPTION {
        writer.add_string_element(Some("type"), Some("mach"));
    } else if crash_type == MonitorType::SIGNAL {
        writer.add_string_element(Some("type"), Some("signal"));
    } else if crash_type == MonitorType::LANGUAGE_EXCEPTION {
        writer.add_string_element(Some("type"), Some("cpp_exception"));
        writer.begin_object(Some("cpp_exception"));
        writer.add_string_element(Some("name"), context.language_exception.name);
        writer.end_container();
    } else if crash_type == MonitorType::USER_REPORTED {
        writer.add_string_element(Some("type"), Some("user"));
        let report = &context.user_report;
        writer.begin_object(Some("user_reported"));
        writer.add_string_element(Some("name"), report.name);
        if let Some(language) = report.language {
            writer.add_string_element(Some("language"), Some(language));
        }
        if let Some(line_of_code) = report.line_of_code {
            writer.add_string_element(Some("line_of_code"), Some(line_of_code));
        }
        if let Some(stack_trace) = report.custom_stack_trace {
            writer.add_json_element(Some("backtrace"), stack_trace, true);
        }
        writer.end_container();
    }
    writer.end_container();
}

/// Every thread: the calling thread, then the suspended ones. The offending
/// thread is added at the end if neither list had it.
fn write_all_threads(
    writer: &mut dyn ReportWriter,
    key: &str,
    context: &MonitorContext<'_>,
    settings: &ReportSettings<'_>,
) {
    let offending = context.offending_machine_context;
    let offending_thread = context.thread();
    let this_thread = current_thread_id();
    let others = is_suspended()
        .then(suspended_threads)
        .into_iter()
        .flatten()
        .filter(|thread| thread.tid != this_thread)
        .map(|thread| (thread.tid, thread.cpu_state));

    writer.begin_array(Some(key));
    let mut index = 0;
    let mut wrote_offending = false;
    for (tid, cpu_state) in std::iter::once((this_thread, None)).chain(others) {
        match offending {
            Some(machine_context) if Some(tid) == offending_thread => {
                let mut cursor = context.stack_cursor;
                write_thread(writer, None, &machine_context, &mut cursor, index, settings, true);
                wrote_offending = true;
            }
            _ => {
                let machine_context = MachineContext::for_thread(tid, cpu_state, false);
                let mut cursor = machine_context.stack_cursor();
                write_thread(writer, None, &machine_context, &mut cursor, index, settings, false);
            }
        }
        index += 1;
    }
    if let (Some(machine_context), false) = (offending, wrote_offending) {
        let mut cursor = context.stack_cursor;
        write_thread(writer, None, &machine_context, &mut cursor, index, settings, true);
    }
    writer.end_container();
}

fn write_thread(
    writer: &mut dyn ReportWriter,
    key: Option<&str>,
    machine_context: &MachineContext,
    cursor: &mut StackCursor<'_>,
    index: i64,
    settings: &ReportSettings<'_>,
    include_notable_addresses: bool,
) {
    let cpu_state = machine_context
        .cpu_state()
        .filter(|_| machine_context.can_have_cpu_state());

    writer.begin_object(key);
    write_backtrace(writer, "backtrace", cursor);
    if let Some(cpu) = cpu_state {
        write_registers(writer, "registers", cpu, machine_context.has_valid_exception_registers());
    }
    writer.add_integer_element(Some("index"), index);
    let mut name_buffer = [0u8; THREAD_NAME_BUFFER_SIZE];
    if let Some(name) = thread_name(settings.cached_data, machine_context.thread(), &mut name_buffer) {
        writer.add_string_element(Some("name"), Some(name));
    }
    writer.add_boolean_element(Some("crashed"), machine_context.is_crashed_context());
    writer.add_boolean_element(Some("current_thread"), machine_context.is_current_thread());
    if machine_context.is_crashed_context() {
        if let Some(cpu) = cpu_state {
            write_stack_contents(writer, "stack", cpu, cursor.state.has_given_up);
            if include_notable_addresses && settings.introspect_memory {
                write_notable_addresses(writer, "notable_addresses", cpu);
            }
        }
    }
    writer.end_container();
}

fn thread_name<'b>(cached_data: Option<&CachedData>, tid: pid_t, buffer: &'b mut [u8]) -> Option<&'b str> {
    let cached_length = cached_data
        .and_then(|cached| cached.thread_name(tid, buffer))
        .map(str::len);
    match cached_length {
        Some(length) => std::str::from_utf8(&buffer[..length]).ok(),
        None => thread_suspend::thread_name(tid, buffer),
    }
}

fn write_backtrace(writer: &mut dyn ReportWriter, key: &str, cursor: &mut StackCursor<'_>) {
    cursor.reset();
    writer.begin_object(Some(key));
    writer.begin_array(Some("contents"));
    while cursor.advance() {
        writer.begin_object(None);
        if cursor.symbolicate() {
            let entry = &cursor.stack_entry;
            if let Some(image) = entry.image_name.and_then(|name| CStr::to_str(name).ok()) {
                writer.add_string_element(Some("object_name"), Some(last_path_entry(Path::new(image))));
            }
            writer.add_uinteger_element(Some("object_addr"), entry.image_address as u64);
            if let Some(symbol) = entry.symbol_name.and_then(|name| CStr::to_str(name).ok()) {
                writer.add_string_element(Some("symbol_name"), Some(symbol));
            }
            writer.add_uinteger_element(Some("symbol_addr"), entry.symbol_address as u64);
        }
        writer.add_uinteger_element(Some("instruction_addr"), cursor.stack_entry.address as u64);
        writer.end_container();
    }
    writer.end_container();
    writer.add_integer_element(Some("skipped"), 0);
    writer.end_container();
}

fn write_registers(writer: &mut dyn ReportWriter, key: &str, cpu: &CpuState, with_exception: bool) {
    writer.begin_object(Some(key));
    writer.begin_object(Some("basic"));
    for (name, value) in cpu.registers() {
        writer.add_uinteger_element(Some(name), value);
    }
    writer.end_container();
    if with_exception {
        writer.begin_object(Some("exception"));
        for (name, value) in cpu.exception_registers() {
            writer.add_uinteger_element(Some(name), value);
        }
        writer.end_container();
    }
    writer.end_container();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitors::system::SystemInfo;
    use std::io::Write;

    const FRAMES: [usize; 3] = [0x1111, 0x2222, 0x3333];

    fn read(path: &Path) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    fn crashed_threads(threads: &serde_json::Value) -> Vec<&serde_json::Value> {
        threads
            .as_array()
            .map(|threads| threads.iter().filter(|t| t["crashed"] == true).collect())
            .unwrap_or_default()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_standard_report_layout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("App-report-0000000000000001.json");
        let console_log = dir.path().join("ConsoleLog.txt");
        std::fs::write(&console_log, "started\nabout to fail\n")?;
        let info = SystemInfo {
            process_name: "crash-test".to_string(),
            executable_path: "/usr/bin/crash-test".to_string(),
            memory_size: 4096,
            ..Default::default()
        };

        let mut context = MonitorContext::new(MonitorType::SIGNAL)
            .with_machine_context(MachineContext::for_current_thread(true));
        context.stack_cursor = StackCursor::with_backtrace(&FRAMES, 0);
        context.signal.signum = libc::SIGSEGV;
        context.signal.sigcode = 1;
        context.fault_address = 0xdead;
        context.system.info = Some(&info);
        context.system.free_memory = 100;
        context.app_state = Some(AppStateSnapshot {
            launches_since_last_crash: 3,
            ..Default::default()
        });
        context.console_log_path = Some(&console_log);

        let callback = |writer: &mut dyn ReportWriter| {
            writer.add_string_element(Some("from_callback"), Some("yes"));
        };
        let settings = ReportSettings {
            user_info_json: Some(br#"{"account":"a1"}"#),
            user_section: Some(&callback),
            ..Default::default()
        };
        write_standard_report(&context, &path, &settings)?;

        let report = read(&path)?;
        assert_eq!(report["report"]["version"], REPORT_VERSION);
        assert_eq!(report["report"]["type"], "standard");
        assert_eq!(report["report"]["process_name"], "crash-test");
        assert_eq!(
            report["report"]["id"],
            context.event_id.hyphenated().to_string().to_uppercase()
        );
        assert!(report["report"]["timestamp"].as_i64().unwrap() > 0);
        assert!(!report["binary_images"].as_array().unwrap().is_empty());
        assert_eq!(report["system"]["memory"]["size"], 4096);
        assert_eq!(report["system"]["memory"]["free"], 100);
        assert_eq!(report["system"]["application_stats"]["launches_since_last_crash"], 3);

        let error = &report["crash"]["error"];
        assert_eq!(error["type"], "signal");
        assert_eq!(error["signal"]["name"], "SIGSEGV");
        assert_eq!(error["signal"]["code_name"], "SEGV_MAPERR");
        assert_eq!(error["address"], 0xdead);

        let crashed = crashed_threads(&report["crash"]["threads"]);
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0]["current_thread"], true);
        let contents = crashed[0]["backtrace"]["contents"].as_array().unwrap();
        let addresses: Vec<u64> = contents
            .iter()
            .map(|frame| frame["instruction_addr"].as_u64().unwrap())
            .collect();
        assert_eq!(addresses, vec![0x1111, 0x2222, 0x3333]);
        assert_eq!(crashed[0]["backtrace"]["skipped"], 0);

        assert_eq!(report["user"]["account"], "a1");
        assert_eq!(report["user"]["from_callback"], "yes");
        assert_eq!(report["debug"]["console_log"][1], "about to fail");
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_user_report_skips_callback() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report.json");
        let mut context = MonitorContext::new(MonitorType::USER_REPORTED)
            .with_machine_context(MachineContext::for_current_thread(true));
        context.current_snapshot_user_reported = true;
        context.crash_reason = Some("bad value");
        context.user_report.name = Some("ValueError");
        context.user_report.language = Some("python");
        context.user_report.custom_stack_trace = Some(br#"["main.py:3"]"#);

        let callback = |writer: &mut dyn ReportWriter| {
            writer.add_boolean_element(Some("called"), true);
        };
        let settings = ReportSettings {
            user_section: Some(&callback),
            ..Default::default()
        };
        write_standard_report(&context, &path, &settings)?;

        let report = read(&path)?;
        let error = &report["crash"]["error"];
        assert_eq!(error["type"], "user");
        assert_eq!(error["reason"], "bad value");
        assert_eq!(error["user_reported"]["name"], "ValueError");
        assert_eq!(error["user_reported"]["language"], "python");
        assert_eq!(error["user_reported"]["backtrace"][0], "main.py:3");
        assert!(error.get("signal").is_none());
        assert_eq!(report["user"], serde_json::json!({}));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_invalid_user_info_keeps_structure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report.json");
        let mut context = MonitorContext::new(MonitorType::LANGUAGE_EXCEPTION)
            .with_machine_context(MachineContext::for_current_thread(true));
        context.language_exception.name = Some("panic");
        let settings = ReportSettings {
            user_info_json: Some(b"{not json"),
            ..Default::default()
        };
        write_standard_report(&context, &path, &settings)?;

        let report = read(&path)?;
        assert_eq!(report["crash"]["error"]["type"], "cpp_exception");
        assert_eq!(report["crash"]["error"]["cpp_exception"]["name"], "panic");
        assert!(report["user"]["error"].as_str().unwrap().starts_with("Invalid JSON data"));
        assert!(report["debug"].is_object());
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_recrash_embeds_previous_report() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("App-report-0000000000000002.json");
        // A report cut short by the second fault.
        let previous = br#"{"report":{"id":"FIRST","type":"standard"},"crash":{"threads":["#;
        std::fs::File::create(&path)?.write_all(previous)?;

        let mut context = MonitorContext::new(MonitorType::SIGNAL)
            .with_machine_context(MachineContext::for_current_thread(true));
        context.stack_cursor = StackCursor::with_backtrace(&FRAMES, 0);
        context.crashed_during_crash_handling = true;
        context.signal.signum = libc::SIGBUS;
        write_recrash_report(&context, &path, &ReportSettings::default())?;

        let report = read(&path)?;
        assert_eq!(report["recrash_report"]["report"]["id"], "FIRST");
        assert_eq!(report["report"]["type"], "minimal");
        assert_eq!(report["crash"]["error"]["signal"]["name"], "SIGBUS");
        let thread = &report["crash"]["crashed_thread"];
        assert_eq!(thread["crashed"], true);
        assert_eq!(thread["backtrace"]["contents"].as_array().unwrap().len(), 3);
        assert!(thread.get("notable_addresses").is_none());
        assert!(!dir.path().join("App-report-0000000000000002.old").exists());

        let raw = std::fs::read_to_string(&path)?;
        assert!(raw.contains(std::str::from_utf8(previous)?));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_recrash_without_previous_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report.json");
        let context = MonitorContext::new(MonitorType::MAIN_THREAD_DEADLOCK);
        write_recrash_report(&context, &path, &ReportSettings::default())?;

        let report = read(&path)?;
        assert!(report.get("recrash_report").is_none());
        assert_eq!(report["crash"]["error"]["type"], "deadlock");
        Ok(())
    }

    #[test]
    fn test_backup_path() {
        let mut buffer = [0u8; 64];
        assert_eq!(
            backup_path(Path::new("/r/App-report-1.json"), &mut buffer),
            Some(Path::new("/r/App-report-1.old"))
        );
        let mut small = [0u8; 4];
        assert_eq!(backup_path(Path::new("/long/path.json"), &mut small), None);
    }
}
