// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_crash_capture::collector::{MachineContext, StackCursor};
use libdd_crash_capture::{
    CrashCaptureConfiguration, CrashEngine, MonitorContext, MonitorType, UserException,
};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static FRAMES: [usize; 3] = [0x1000, 0x2000, 0x3000];

fn engine() -> anyhow::Result<CrashEngine> {
    let mut config = CrashCaptureConfiguration::default();
    config.set_monitors(MonitorType::REQUIRED);
    config.set_deadlock_watchdog_interval(Duration::ZERO);
    Ok(CrashEngine::new(config))
}

/// Hands a segmentation fault on the current thread to the engine, the way
/// the signal monitor would.
fn simulate_segfault(engine: &CrashEngine) -> bool {
    let registry = engine.monitor_registry().expect("installed");
    registry.capture(false, false, || {
        let mut context = MonitorContext::new(MonitorType::SIGNAL)
            .with_machine_context(MachineContext::for_current_thread(true));
        context.stack_cursor = StackCursor::with_backtrace(&FRAMES, 0);
        context.signal.signum = libc::SIGSEGV;
        context.signal.sigcode = 1;
        context.fault_address = 0xbad;
        context
    })
}

fn read(engine: &CrashEngine, id: i64) -> anyhow::Result<Value> {
    Ok(serde_json::from_slice(&engine.read_report(id)?)?)
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_is_reported_and_read_back() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine()?;
    let written = Arc::new(AtomicI64::new(0));
    let sink = written.clone();
    engine.set_report_written_callback(Some(Box::new(move |id| sink.store(id, SeqCst))));
    assert_eq!(engine.install("App", dir.path())?, MonitorType::REQUIRED);
    engine.notify_app_active(true);
    engine.notify_app_in_foreground(true);

    assert!(!simulate_segfault(&engine));

    let ids = engine.report_ids();
    assert_eq!(ids.len(), 1);
    assert_eq!(written.load(SeqCst), ids[0]);
    let file_name = format!("App-report-{:016x}.json", ids[0]);
    assert!(dir.path().join("Reports").join(file_name).exists());

    let report = read(&engine, ids[0])?;
    assert_eq!(report["report"]["type"], "standard");
    assert!(report["report"]["timestamp"].as_str().unwrap().ends_with('Z'));
    assert!(!report["system"]["process_name"].as_str().unwrap().is_empty());
    assert_eq!(report["system"]["application_stats"]["application_active"], true);

    let error = &report["crash"]["error"];
    assert_eq!(error["type"], "signal");
    assert_eq!(error["signal"]["name"], "SIGSEGV");
    assert_eq!(error["address"], 0xbad);

    let threads = report["crash"]["threads"].as_array().unwrap();
    let crashed: Vec<&Value> = threads.iter().filter(|t| t["crashed"] == true).collect();
    assert_eq!(crashed.len(), 1);
    let addresses: Vec<u64> = crashed[0]["backtrace"]["contents"]
        .as_array()
        .unwrap()
        .iter()
        .map(|frame| frame["instruction_addr"].as_u64().unwrap())
        .collect();
    assert_eq!(addresses, vec![0x1000, 0x2000, 0x3000]);

    // A fatal event leaves every monitor disabled.
    assert_eq!(engine.active_monitors(), MonitorType::NONE);
    Ok(())
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_store_keeps_newest_reports() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine()?;
    engine.install("App", dir.path())?;
    engine.set_max_report_count(2);

    let ids: Vec<i64> = (0..5)
        .map(|i| engine.add_user_report(format!("{{\"n\":{i}}}").as_bytes()))
        .collect::<Result<_, _>>()?;
    assert_eq!(engine.report_count(), 2);
    assert_eq!(engine.report_ids(), ids[3..].to_vec());
    assert_eq!(read(&engine, ids[4])?["n"], 4);

    engine.delete_all_reports()?;
    assert_eq!(engine.report_count(), 0);
    Ok(())
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_while_reporting_embeds_first_report() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine()?;
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink = written.clone();
    engine.set_report_written_callback(Some(Box::new(move |id| {
        sink.lock().unwrap().push(id)
    })));
    engine.install("App", dir.path())?;

    assert!(!simulate_segfault(&engine));
    // The first event was never released, so this one counts as a crash in
    // the crash handler.
    assert!(simulate_segfault(&engine));

    let ids = engine.report_ids();
    assert_eq!(ids.len(), 1);
    // Once for the first report, once more when it is rewritten.
    assert_eq!(*written.lock().unwrap(), vec![ids[0], ids[0]]);
    let report = read(&engine, ids[0])?;
    assert_eq!(report["report"]["type"], "minimal");
    assert_eq!(report["recrash_report"]["report"]["type"], "standard");
    assert!(report["recrash_report"]["report"]["timestamp"]
        .as_str()
        .unwrap()
        .ends_with('Z'));
    assert_eq!(report["recrash_report"]["crash"]["error"]["signal"]["name"], "SIGSEGV");
    assert_eq!(report["crash"]["error"]["type"], "signal");
    assert!(!dir.path().join("Reports").read_dir()?.any(|entry| entry
        .map(|entry| entry.path().extension().is_some_and(|ext| ext == "old"))
        .unwrap_or(false)));
    Ok(())
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_user_exception_before_and_after_install() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine()?;
    let exception = UserException::new("ConfigError").with_reason("missing key");
    assert!(!engine.report_user_exception(&exception, false, false));

    engine.install("App", dir.path())?;
    assert!(engine.report_user_exception(&exception, false, false));
    let ids = engine.report_ids();
    assert_eq!(ids.len(), 1);
    let report = read(&engine, ids[0])?;
    assert_eq!(report["crash"]["error"]["type"], "user");
    assert_eq!(report["crash"]["error"]["user_reported"]["name"], "ConfigError");

    // User reports are not fatal.
    assert_eq!(engine.active_monitors(), MonitorType::REQUIRED);
    Ok(())
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_relaunch_keeps_reports_within_configured_maximum() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let launch = || -> anyhow::Result<CrashEngine> {
        let engine = engine()?;
        engine.set_max_report_count(10);
        engine.install("App", dir.path())?;
        Ok(engine)
    };

    let ids: Vec<i64> = {
        let engine = launch()?;
        (0..8)
            .map(|i| engine.add_user_report(format!("{{\"n\":{i}}}").as_bytes()))
            .collect::<Result<_, _>>()?
    };

    let engine = launch()?;
    assert_eq!(engine.report_count(), 8);
    assert_eq!(engine.report_ids(), ids);
    Ok(())
}
