// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reports on disk.
//!
//! Each report lives in `{dir}/{app}-report-{id:016x}.json`. IDs grow
//! monotonically: the high half comes from the wall clock when the store is
//! opened, the low half from a counter that the crash path bumps without
//! taking a lock.

use crate::shared::constants::{DEFAULT_MAX_REPORT_COUNT, MAX_REPORT_READ_SIZE};
use crate::shared::file_utils::{delete_contents_of_path, make_path, read_entire_file, remove_file};
use crate::shared::fixed_buf::FixedBuf;
use crate::shared::sync::MutexExt;
use chrono::{Datelike, Timelike, Utc};
use std::ffi::OsStr;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, ErrorKind, Write as _};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Mutex;
use tracing::{debug, info, warn};

const REPORT_NAME_INFIX: &str = "-report-";
const REPORT_NAME_SUFFIX: &str = ".json";
const REPORT_ID_DIGITS: usize = 16;

/// Room for a full report path, on the stack.
pub type ReportPathBuf = FixedBuf<{ libc::PATH_MAX as usize }>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Report store I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("No report with id {0}")]
    NotFound(i64),
    #[error("Invalid report id {0}")]
    InvalidId(i64),
    #[error("Report path is too long")]
    PathTooLong,
}

struct StoreState {
    max_report_count: usize,
}

pub struct ReportStore {
    app_name: String,
    reports_path: PathBuf,
    id_high: i64,
    id_counter: AtomicU32,
    state: Mutex<StoreState>,
}

impl ReportStore {
    /// Opens the store in `reports_path`, creating the directory if needed,
    /// and prunes it down to `max_report_count` reports. A zero count falls
    /// back to the default.
    pub fn initialize(
        app_name: &str,
        reports_path: &Path,
        max_report_count: usize,
    ) -> Result<Self, StoreError> {
        make_path(reports_path)?;
        let max_report_count = if max_report_count == 0 {
            warn!("Ignoring invalid max report count 0");
            DEFAULT_MAX_REPORT_COUNT
        } else {
            max_report_count
        };
        let base = id_base();
        let store = Self {
            app_name: app_name.to_string(),
            reports_path: reports_path.to_path_buf(),
            id_high: base & !0xFFFF_FFFF,
            id_counter: AtomicU32::new((base & 0xFFFF_FFFF) as u32),
            state: Mutex::new(StoreState { max_report_count }),
        };
        store.prune(max_report_count);
        debug!(path = %reports_path.display(), app_name, "Report store initialized");
        Ok(store)
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn reports_path(&self) -> &Path {
        &self.reports_path
    }

    fn next_id(&self) -> i64 {
        self.id_high + i64::from(self.id_counter.fetch_add(1, SeqCst))
    }

    /// Reserves a new report id and builds its path in `buffer`.
    ///
    /// Async signal safe: no lock, no allocation.
    pub fn next_crash_report<'b>(&self, buffer: &'b mut ReportPathBuf) -> Option<(i64, &'b Path)> {
        let id = self.next_id();
        let path = self.write_report_path(id, buffer)?;
        Some((id, path))
    }

    /// Builds the path of report `id` in `buffer`, without allocating.
    pub(crate) fn write_report_path<'b>(&self, id: i64, buffer: &'b mut ReportPathBuf) -> Option<&'b Path> {
        buffer.clear();
        buffer.push_bytes(self.reports_path.as_os_str().as_bytes()).ok()?;
        write!(
            buffer,
            "/{}{REPORT_NAME_INFIX}{id:0width$x}{REPORT_NAME_SUFFIX}",
            self.app_name,
            width = REPORT_ID_DIGITS
        )
        .ok()?;
        Some(Path::new(OsStr::from_bytes(buffer.as_bytes())))
    }

    pub fn report_path(&self, id: i64) -> PathBuf {
        self.reports_path.join(format!(
            "{}{REPORT_NAME_INFIX}{id:0width$x}{REPORT_NAME_SUFFIX}",
            self.app_name,
            width = REPORT_ID_DIGITS
        ))
    }

    /// The id in a report file name belonging to this store.
    fn report_id_from_name(&self, name: &str) -> Option<i64> {
        let digits = name
            .strip_prefix(self.app_name.as_str())?
            .strip_prefix(REPORT_NAME_INFIX)?
            .strip_suffix(REPORT_NAME_SUFFIX)?;
        if digits.len() != REPORT_ID_DIGITS {
            return None;
        }
        u64::from_str_radix(digits, 16).ok().map(|id| id as i64)
    }

    /// Every report id, oldest first.
    pub fn report_ids(&self) -> Vec<i64> {
        let _state = self.state.lock_or_recover();
        self.report_ids_unlocked()
    }

    fn report_ids_unlocked(&self) -> Vec<i64> {
        let entries = match std::fs::read_dir(&self.reports_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not list {}: {e}", self.reports_path.display());
                return Vec::new();
            }
        };
        let mut ids: Vec<i64> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| self.report_id_from_name(entry.file_name().to_str()?))
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn report_count(&self) -> usize {
        self.report_ids().len()
    }

    /// The raw bytes of a report, capped at the maximum report size.
    pub fn read_report(&self, id: i64) -> Result<Vec<u8>, StoreError> {
        if id <= 0 {
            return Err(StoreError::InvalidId(id));
        }
        let _state = self.state.lock_or_recover();
        read_entire_file(&self.report_path(id), MAX_REPORT_READ_SIZE).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::NotFound(id)
            } else {
                e.into()
            }
        })
    }

    /// Stores an externally produced report under a new id.
    pub fn add_user_report(&self, report: &[u8]) -> Result<i64, StoreError> {
        let state = self.state.lock_or_recover();
        let id = self.next_id();
        let path = self.report_path(id);
        let mut file = File::options()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)?;
        file.write_all(report)?;
        info!(id, path = %path.display(), "Added user report");
        let max_report_count = state.max_report_count;
        drop(state);
        self.prune(max_report_count);
        Ok(id)
    }

    pub fn delete_all(&self) -> Result<(), StoreError> {
        let _state = self.state.lock_or_recover();
        delete_contents_of_path(&self.reports_path)?;
        Ok(())
    }

    pub fn delete_report_with_id(&self, id: i64) -> bool {
        let _state = self.state.lock_or_recover();
        remove_file(&self.report_path(id), true)
    }

    pub fn max_report_count(&self) -> usize {
        self.state.lock_or_recover().max_report_count
    }

    /// Zero or negative counts are ignored.
    pub fn set_max_report_count(&self, count: i64) {
        match usize::try_from(count) {
            Ok(count) if count > 0 => self.state.lock_or_recover().max_report_count = count,
            _ => warn!(count, "Ignoring invalid max report count"),
        }
    }

    /// Deletes the oldest reports until at most `max_report_count` remain.
    pub fn prune(&self, max_report_count: usize) {
        let _state = self.state.lock_or_recover();
        let ids = self.report_ids_unlocked();
        let excess = ids.len().saturating_sub(max_report_count);
        for id in &ids[..excess] {
            debug!(id, "Pruning old report");
            remove_file(&self.report_path(*id), true);
        }
    }
}

/// Seconds-based counter from the current UTC time, with the year counted
/// from 1900, shifted left to leave room for the per-launch counter.
fn id_base() -> i64 {
    let now = Utc::now();
    let seconds = i64::from(now.second())
        + i64::from(now.minute()) * 61
        + i64::from(now.hour()) * 61 * 60
        + i64::from(now.ordinal0()) * 61 * 60 * 24
        + i64::from(now.year() - 1900) * 61 * 60 * 24 * 366;
    seconds << 23
}
