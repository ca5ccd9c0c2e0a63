// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Application lifecycle counters, persisted between launches.
//!
//! The counters that must survive a crash (time spent active and in the
//! background, launches and sessions since the last crash) are saved to a
//! small JSON file after every significant transition. Saving goes through
//! the allocation free encoder straight into a file, so it may run from the
//! crash path.

use crate::codec::{decode, CodecError, DecodeCallbacks, DecodeFailure, JsonEncoder};
use crate::shared::constants::MAX_APP_STATE_FILE_SIZE;
use crate::shared::file_utils::read_entire_file;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

const FORMAT_VERSION: i64 = 1;

const KEY_VERSION: &str = "version";
const KEY_CRASHED_LAST_LAUNCH: &str = "crashedLastLaunch";
const KEY_ACTIVE_DURATION_SINCE_LAST_CRASH: &str = "activeDurationSinceLastCrash";
const KEY_BACKGROUND_DURATION_SINCE_LAST_CRASH: &str = "backgroundDurationSinceLastCrash";
const KEY_LAUNCHES_SINCE_LAST_CRASH: &str = "launchesSinceLastCrash";
const KEY_SESSIONS_SINCE_LAST_CRASH: &str = "sessionsSinceLastCrash";

#[derive(Debug, thiserror::Error)]
pub enum AppStateError {
    #[error("Unable to access app state file: {0}")]
    Io(#[from] io::Error),
    #[error("Unable to decode app state file: {0}")]
    Decode(#[from] DecodeFailure),
    #[error("Unable to encode app state file: {0}")]
    Encode(#[from] CodecError),
    #[error("App state file has version {0}, expected {}", FORMAT_VERSION)]
    InvalidVersion(i64),
}

/// A copy of the counters, as attached to a crash report. Durations are in
/// seconds.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct AppStateSnapshot {
    pub active_duration_since_last_crash: f64,
    pub background_duration_since_last_crash: f64,
    pub launches_since_last_crash: i64,
    pub sessions_since_last_crash: i64,
    pub active_duration_since_launch: f64,
    pub background_duration_since_launch: f64,
    pub sessions_since_launch: i64,
    pub crashed_last_launch: bool,
    pub crashed_this_launch: bool,
    pub application_is_active: bool,
    pub application_is_in_foreground: bool,
}

#[derive(Debug)]
pub struct AppState {
    path: PathBuf,
    state: AppStateSnapshot,
    transition_time: Instant,
}

impl AppState {
    /// Fresh counters that will be saved to `path`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: AppStateSnapshot {
                application_is_active: true,
                ..Default::default()
            },
            transition_time: Instant::now(),
        }
    }

    /// Loads the counters saved at `path` by a previous launch. A missing
    /// file is not an error.
    pub fn initialize(path: &Path) -> Result<Self, AppStateError> {
        let mut app_state = Self::new(path.to_path_buf());
        let data = match read_entire_file(path, MAX_APP_STATE_FILE_SIZE) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No previous app state");
                return Ok(app_state);
            }
            Err(e) => return Err(e.into()),
        };

        let mut loader = Loader::default();
        let mut scratch = [0u8; 1024];
        decode(&data, &mut scratch, &mut loader)?;
        if loader.version != FORMAT_VERSION {
            return Err(AppStateError::InvalidVersion(loader.version));
        }
        let state = &mut app_state.state;
        state.crashed_last_launch = loader.crashed_last_launch;
        state.active_duration_since_last_crash = loader.active_duration_since_last_crash;
        state.background_duration_since_last_crash = loader.background_duration_since_last_crash;
        state.launches_since_last_crash = loader.launches_since_last_crash;
        state.sessions_since_last_crash = loader.sessions_since_last_crash;
        Ok(app_state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> AppStateSnapshot {
        self.state
    }

    /// Starts counting a new launch.
    pub fn reset(&mut self) -> Result<(), AppStateError> {
        let state = &mut self.state;
        state.sessions_since_launch = 1;
        state.active_duration_since_launch = 0.0;
        state.background_duration_since_launch = 0.0;
        if state.crashed_last_launch {
            state.active_duration_since_last_crash = 0.0;
            state.background_duration_since_last_crash = 0.0;
            state.launches_since_last_crash = 0;
            state.sessions_since_last_crash = 0;
        }
        state.crashed_this_launch = false;
        state.launches_since_last_crash += 1;
        state.sessions_since_last_crash += 1;
        state.application_is_in_foreground = true;
        self.save()
    }

    pub fn notify_app_active(&mut self, is_active: bool) {
        self.notify_app_active_at(is_active, Instant::now());
    }

    fn notify_app_active_at(&mut self, is_active: bool, now: Instant) {
        self.state.application_is_active = is_active;
        if is_active {
            self.transition_time = now;
        } else {
            let duration = self.seconds_since_transition(now);
            self.state.active_duration_since_last_crash += duration;
            self.state.active_duration_since_launch += duration;
        }
    }

    pub fn notify_app_in_foreground(&mut self, is_in_foreground: bool) -> Result<(), AppStateError> {
        self.notify_app_in_foreground_at(is_in_foreground, Instant::now())
    }

    fn notify_app_in_foreground_at(
        &mut self,
        is_in_foreground: bool,
        now: Instant,
    ) -> Result<(), AppStateError> {
        self.state.application_is_in_foreground = is_in_foreground;
        if is_in_foreground {
            let duration = self.seconds_since_transition(now);
            self.state.background_duration_since_last_crash += duration;
            self.state.background_duration_since_launch += duration;
            self.state.sessions_since_last_crash += 1;
            self.state.sessions_since_launch += 1;
            Ok(())
        } else {
            self.transition_time = now;
            self.save()
        }
    }

    pub fn notify_app_terminate(&mut self) -> Result<(), AppStateError> {
        self.update();
        self.save()
    }

    /// Records the crash being reported. Safe to call from the crash path.
    pub fn notify_app_crash(&mut self) -> Result<(), AppStateError> {
        self.update();
        self.state.crashed_this_launch = true;
        self.save()
    }

    /// Folds the time since the last transition into the duration matching
    /// the current state.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    fn update_at(&mut self, now: Instant) {
        let duration = self.seconds_since_transition(now);
        if self.state.application_is_active {
            self.state.active_duration_since_last_crash += duration;
            self.state.active_duration_since_launch += duration;
        } else if !self.state.application_is_in_foreground {
            self.state.background_duration_since_last_crash += duration;
            self.state.background_duration_since_launch += duration;
        }
        self.transition_time = now;
    }

    fn seconds_since_transition(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.transition_time).as_secs_f64()
    }

    fn save(&self) -> Result<(), AppStateError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&self.path)?;
        let state = &self.state;
        let mut encoder = JsonEncoder::new(file, true);
        encoder.begin_object(None)?;
        encoder.add_integer_element(Some(KEY_VERSION), FORMAT_VERSION)?;
        // Read back as the previous launch by the next one.
        encoder.add_boolean_element(Some(KEY_CRASHED_LAST_LAUNCH), state.crashed_this_launch)?;
        encoder.add_floating_point_element(
            Some(KEY_ACTIVE_DURATION_SINCE_LAST_CRASH),
            state.active_duration_since_last_crash,
        )?;
        encoder.add_floating_point_element(
            Some(KEY_BACKGROUND_DURATION_SINCE_LAST_CRASH),
            state.background_duration_since_last_crash,
        )?;
        encoder.add_integer_element(
            Some(KEY_LAUNCHES_SINCE_LAST_CRASH),
            state.launches_since_last_crash,
        )?;
        encoder.add_integer_element(
            Some(KEY_SESSIONS_SINCE_LAST_CRASH),
            state.sessions_since_last_crash,
        )?;
        encoder.end_encode()?;
        Ok(())
    }
}

#[derive(Default)]
struct Loader {
    version: i64,
    crashed_last_launch: bool,
    active_duration_since_last_crash: f64,
    background_duration_since_last_crash: f64,
    launches_since_last_crash: i64,
    sessions_since_last_crash: i64,
}

impl DecodeCallbacks for Loader {
    fn on_boolean_element(&mut self, name: Option<&str>, value: bool) -> Result<(), CodecError> {
        if name == Some(KEY_CRASHED_LAST_LAUNCH) {
            self.crashed_last_launch = value;
        }
        Ok(())
    }

    fn on_floating_point_element(&mut self, name: Option<&str>, value: f64) -> Result<(), CodecError> {
        match name {
            Some(KEY_ACTIVE_DURATION_SINCE_LAST_CRASH) => {
                self.active_duration_since_last_crash = value
            }
            Some(KEY_BACKGROUND_DURATION_SINCE_LAST_CRASH) => {
                self.background_duration_since_last_crash = value
            }
            _ => {}
        }
        Ok(())
    }

    fn on_integer_element(&mut self, name: Option<&str>, value: i64) -> Result<(), CodecError> {
        match name {
            Some(KEY_VERSION) => self.version = value,
            Some(KEY_LAUNCHES_SINCE_LAST_CRASH) => self.launches_since_last_crash = value,
            Some(KEY_SESSIONS_SINCE_LAST_CRASH) => self.sessions_since_last_crash = value,
            // Whole durations may have been written without a fraction.
            _ => self.on_floating_point_element(name, value as f64)?,
        }
        Ok(())
    }

    fn on_null_element(&mut self, _name: Option<&str>) -> Result<(), CodecError> {
        Ok(())
    }

    fn on_string_element(&mut self, _name: Option<&str>, _value: &str) -> Result<(), CodecError> {
        Ok(())
    }

    fn on_begin_object(&mut self, _name: Option<&str>) -> Result<(), CodecError> {
        Ok(())
    }

    fn on_begin_array(&mut self, _name: Option<&str>) -> Result<(), CodecError> {
        Ok(())
    }

    fn on_end_container(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}
