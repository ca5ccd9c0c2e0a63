// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Whole-file helpers.
//!
//! The read/write loops in this module retry until the request is satisfied,
//! the descriptor reports end of file, or a real error occurs. None of them
//! allocate, so they may be used from the crash path.

use std::fs::{self, DirBuilder, File};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use tracing::error;

/// Writes all of `bytes`, retrying partial and interrupted writes.
pub fn write_bytes(writer: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes)
}

/// Fills `buf` from `reader`, stopping early only at end of file.
/// Returns the number of bytes read.
pub fn read_bytes(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reads one line (without its terminating newline) into `buf`, one byte at a
/// time so that nothing past the newline is consumed.
pub fn read_line(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut len = 0;
    let mut byte = [0u8; 1];
    while len < buf.len() {
        match reader.read(&mut byte) {
            Ok(0) => break,
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => {
                buf[len] = byte[0];
                len += 1;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(len)
}

/// Reads a whole file. When `max_length` is non-zero and the file is larger,
/// only its last `max_length` bytes are returned.
pub fn read_entire_file(path: &Path, max_length: usize) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let size = usize::try_from(file.metadata()?.len()).unwrap_or(usize::MAX);
    let to_read = if max_length == 0 || max_length >= size {
        size
    } else {
        file.seek(SeekFrom::End(-(max_length as i64)))?;
        max_length
    };
    let mut data = vec![0u8; to_read];
    let read = read_bytes(&mut file, &mut data)?;
    data.truncate(read);
    Ok(data)
}

/// Creates `path` and every missing parent, owner-accessible only.
pub fn make_path(path: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(path)
}

/// Removes a file. A missing file is only reported when `must_exist` is set.
pub fn remove_file(path: &Path, must_exist: bool) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            if must_exist || e.kind() != ErrorKind::NotFound {
                error!("Could not delete {}: {e}", path.display());
            }
            false
        }
    }
}

fn can_delete_path(path: &Path) -> bool {
    !matches!(last_path_entry(path), "." | "..")
}

/// Deletes everything inside `path`, leaving the directory itself in place.
pub fn delete_contents_of_path(path: &Path) -> io::Result<()> {
    if !can_delete_path(path) {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("Refusing to delete contents of {}", path.display()),
        ));
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&entry_path)?;
        } else {
            fs::remove_file(&entry_path)?;
        }
    }
    Ok(())
}

/// Returns the final component of `path`, or the whole path if it has none.
pub fn last_path_entry(path: &Path) -> &str {
    let text = path.to_str().unwrap_or_default();
    match text.rfind('/') {
        Some(index) => &text[index + 1..],
        None => text,
    }
}
