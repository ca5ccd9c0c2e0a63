// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log file whose lines can be attached to crash reports.
//!
//! `Arc<ConsoleLog>` implements `tracing_subscriber::fmt::MakeWriter`, so an
//! application can direct its own subscriber at it:
//!
//! ```no_run
//! # fn demo(log: std::sync::Arc<libdd_crash_capture::ConsoleLog>) {
//! tracing_subscriber::fmt().with_writer(log).init();
//! # }
//! ```

use crate::shared::file_utils::read_entire_file;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct ConsoleLog {
    path: PathBuf,
    file: File,
}

impl ConsoleLog {
    /// Opens the log at `path`, discarding what the previous run wrote.
    /// When `print_previous` is set the old contents are logged first.
    pub fn open(path: &Path, print_previous: bool) -> io::Result<Self> {
        if print_previous {
            match read_entire_file(path, 0) {
                Ok(previous) => info!(
                    "===== Previous console log =====\n{}",
                    String::from_utf8_lossy(&previous)
                ),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => info!("Could not read previous console log: {e}"),
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        file.set_len(0)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn clear(&self) -> io::Result<()> {
        self.file.set_len(0)
    }
}

impl Write for &ConsoleLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.file).flush()
    }
}
