// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity buffered readers and writers over files.
//!
//! The buffers live inline in the reader/writer, so placing one on the stack
//! of a crash handler does not touch the heap.

use crate::codec::{CodecError, JsonSink};
use crate::shared::file_utils::{read_bytes, write_bytes};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::error;

pub struct BufferedWriter<const N: usize> {
    file: Option<File>,
    buffer: [u8; N],
    position: usize,
}

impl<const N: usize> BufferedWriter<N> {
    /// Creates a new file at `path`. Fails if the file already exists.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)?;
        Ok(Self {
            file: Some(file),
            buffer: [0; N],
            position: 0,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() > N - self.position {
            self.flush()?;
        }
        if data.len() > N {
            let file = self.file.as_mut().ok_or(ErrorKind::BrokenPipe)?;
            return write_bytes(file, data);
        }
        self.buffer[self.position..self.position + data.len()].copy_from_slice(data);
        self.position += data.len();
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if self.position == 0 {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or(ErrorKind::BrokenPipe)?;
        write_bytes(file, &self.buffer[..self.position])?;
        self.position = 0;
        Ok(())
    }

    /// Flushes and closes the file. Later writes fail.
    pub fn close(&mut self) -> io::Result<()> {
        let result = self.flush();
        self.file = None;
        result
    }
}

impl<const N: usize> Drop for BufferedWriter<N> {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.close() {
                error!("Could not flush buffered writer: {e}");
            }
        }
    }
}

impl<const N: usize> JsonSink for BufferedWriter<N> {
    fn add_data(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.write(data).map_err(|_| CodecError::CannotAddData)
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        BufferedWriter::flush(self).map_err(|_| CodecError::CannotAddData)
    }
}

/// Unbuffered sink writing straight to a file.
impl JsonSink for File {
    fn add_data(&mut self, data: &[u8]) -> Result<(), CodecError> {
        write_bytes(self, data).map_err(|_| CodecError::CannotAddData)
    }
}

/// Outcome of [`BufferedReader::read_until_char`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadUntil {
    /// Bytes copied into the destination, including the delimiter if found.
    pub length: usize,
    pub found: bool,
}

pub struct BufferedReader<const N: usize> {
    file: File,
    buffer: [u8; N],
    start: usize,
    end: usize,
}

impl<const N: usize> BufferedReader<N> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let mut reader = Self {
            file,
            buffer: [0; N],
            start: 0,
            end: 0,
        };
        reader.fill()?;
        Ok(reader)
    }

    /// Moves unread data to the front of the buffer and reads more behind it.
    fn fill(&mut self) -> io::Result<()> {
        if self.start > 0 {
            self.buffer.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == N {
            return Ok(());
        }
        self.end += read_bytes(&mut self.file, &mut self.buffer[self.end..])?;
        Ok(())
    }

    fn buffered(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    /// Reads up to `dst.len()` bytes, fewer only at end of file.
    pub fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut copied = 0;
        while copied < dst.len() {
            if self.buffered().is_empty() {
                self.fill()?;
                if self.buffered().is_empty() {
                    break;
                }
            }
            let count = self.buffered().len().min(dst.len() - copied);
            dst[copied..copied + count].copy_from_slice(&self.buffer[self.start..self.start + count]);
            self.start += count;
            copied += count;
        }
        Ok(copied)
    }

    /// Copies bytes into `dst` up to and including the first `delimiter`, or
    /// until `dst` is full or the file ends.
    pub fn read_until_char(&mut self, delimiter: u8, dst: &mut [u8]) -> io::Result<ReadUntil> {
        let mut copied = 0;
        while copied < dst.len() {
            if self.buffered().is_empty() {
                self.fill()?;
                if self.buffered().is_empty() {
                    break;
                }
            }
            let available = self.buffered();
            let mut count = available.len().min(dst.len() - copied);
            let found_at = available[..count].iter().position(|&c| c == delimiter);
            if let Some(index) = found_at {
                count = index + 1;
            }
            dst[copied..copied + count].copy_from_slice(&self.buffer[self.start..self.start + count]);
            self.start += count;
            copied += count;
            if found_at.is_some() {
                return Ok(ReadUntil {
                    length: copied,
                    found: true,
                });
            }
        }
        Ok(ReadUntil {
            length: copied,
            found: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_writer_buffers_and_bypasses() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out");
        let mut writer = BufferedWriter::<8>::create(&path)?;
        writer.write(b"abc")?;
        assert_eq!(fs::read(&path)?, b"");
        writer.write(b"defgh")?;
        writer.write(b"0123456789")?;
        writer.write(b"!")?;
        writer.close()?;
        assert_eq!(fs::read(&path)?, b"abcdefgh0123456789!");
        assert!(writer.write(b"late").is_ok());
        assert!(writer.flush().is_err());
        Ok(())
    }

    #[test]
    fn test_writer_refuses_existing_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out");
        fs::write(&path, b"x")?;
        assert!(BufferedWriter::<8>::create(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_reader_lines_across_refills() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lines");
        fs::write(&path, b"alpha\nbravo charlie\ndelta")?;
        let mut reader = BufferedReader::<4>::open(&path)?;
        let mut line = [0u8; 64];

        let result = reader.read_until_char(b'\n', &mut line)?;
        assert_eq!(&line[..result.length], b"alpha\n");
        assert!(result.found);

        let result = reader.read_until_char(b'\n', &mut line)?;
        assert_eq!(&line[..result.length], b"bravo charlie\n");

        let result = reader.read_until_char(b'\n', &mut line)?;
        assert_eq!(&line[..result.length], b"delta");
        assert!(!result.found);
        Ok(())
    }

    #[test]
    fn test_reader_read_exact_count() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bytes");
        fs::write(&path, b"0123456789")?;
        let mut reader = BufferedReader::<3>::open(&path)?;
        let mut dst = [0u8; 7];
        assert_eq!(reader.read(&mut dst)?, 7);
        assert_eq!(&dst, b"0123456");
        assert_eq!(reader.read(&mut dst)?, 3);
        assert_eq!(&dst[..3], b"789");
        Ok(())
    }

    #[test]
    fn test_bounded_read_until() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("long");
        fs::write(&path, b"abcdefgh\n")?;
        let mut reader = BufferedReader::<4>::open(&path)?;
        let mut dst = [0u8; 5];
        let result = reader.read_until_char(b'\n', &mut dst)?;
        assert_eq!(result, ReadUntil { length: 5, found: false });
        let result = reader.read_until_char(b'\n', &mut dst)?;
        assert_eq!(&dst[..result.length], b"fgh\n");
        Ok(())
    }
}
