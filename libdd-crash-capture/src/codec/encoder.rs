// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{CodecError, JsonSink, MAX_CONTAINER_DEPTH};
use crate::shared::fixed_buf::FixedBuf;
use std::fmt::Write;

const INDENT: &[u8] = b"    ";
const WORK_BUFFER_SIZE: usize = 512;
// Worst case every input byte expands to two output bytes.
const ESCAPE_CHUNK_SIZE: usize = WORK_BUFFER_SIZE / 2;
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Incremental JSON writer.
///
/// The encoder tracks which containers are open so that element names are
/// only written inside objects and commas are placed between siblings. It
/// holds no heap memory; every byte is handed to the sink as soon as it is
/// produced.
pub struct JsonEncoder<S: JsonSink> {
    sink: S,
    pretty_print: bool,
    container_level: usize,
    is_object: [bool; MAX_CONTAINER_DEPTH + 1],
    first_entry: bool,
}

impl<S: JsonSink> JsonEncoder<S> {
    pub fn new(sink: S, pretty_print: bool) -> Self {
        Self {
            sink,
            pretty_print,
            container_level: 0,
            is_object: [false; MAX_CONTAINER_DEPTH + 1],
            first_entry: true,
        }
    }

    pub fn container_level(&self) -> usize {
        self.container_level
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn add_data(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.sink.add_data(data)
    }

    fn add_escaped_chunk(&mut self, chunk: &[u8]) -> Result<(), CodecError> {
        let mut work = [0u8; WORK_BUFFER_SIZE];
        let mut len = 0;
        for &ch in chunk {
            let escaped = match ch {
                b'\\' => Some(b'\\'),
                b'"' => Some(b'"'),
                0x08 => Some(b'b'),
                0x0c => Some(b'f'),
                b'\n' => Some(b'n'),
                b'\r' => Some(b'r'),
                b'\t' => Some(b't'),
                c if c < 0x20 => return Err(CodecError::InvalidCharacter),
                _ => None,
            };
            match escaped {
                Some(e) => {
                    work[len] = b'\\';
                    work[len + 1] = e;
                    len += 2;
                }
                None => {
                    work[len] = ch;
                    len += 1;
                }
            }
        }
        self.add_data(&work[..len])
    }

    fn add_escaped_string(&mut self, value: &[u8]) -> Result<(), CodecError> {
        for chunk in value.chunks(ESCAPE_CHUNK_SIZE) {
            self.add_escaped_chunk(chunk)?;
        }
        Ok(())
    }

    /// Writes `value` between quotes. The closing quote is emitted even if the
    /// content could not be escaped so that the document stays balanced.
    fn add_quoted_escaped_string(&mut self, value: &[u8]) -> Result<(), CodecError> {
        self.add_data(b"\"")?;
        let result = self.add_escaped_string(value);
        let close = self.add_data(b"\"");
        result.and(close)
    }

    fn add_indent(&mut self, level: usize) -> Result<(), CodecError> {
        self.add_data(b"\n")?;
        for _ in 0..level {
            self.add_data(INDENT)?;
        }
        Ok(())
    }

    /// Writes the separator, indentation and name that precede an element.
    ///
    /// A name is mandatory inside an object and ignored anywhere else.
    pub fn begin_element(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        if self.first_entry {
            self.first_entry = false;
        } else {
            self.add_data(b",")?;
        }
        if self.pretty_print && self.container_level > 0 {
            self.add_indent(self.container_level)?;
        }
        if self.is_object[self.container_level] {
            let name = name.ok_or(CodecError::InvalidData)?;
            self.add_quoted_escaped_string(name.as_bytes())?;
            if self.pretty_print {
                self.add_data(b": ")?;
            } else {
                self.add_data(b":")?;
            }
        }
        Ok(())
    }

    pub fn add_raw_json_data(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.add_data(data)
    }

    pub fn add_boolean_element(&mut self, name: Option<&str>, value: bool) -> Result<(), CodecError> {
        self.begin_element(name)?;
        if value {
            self.add_data(b"true")
        } else {
            self.add_data(b"false")
        }
    }

    pub fn add_integer_element(&mut self, name: Option<&str>, value: i64) -> Result<(), CodecError> {
        self.begin_element(name)?;
        let mut buf = FixedBuf::<24>::new();
        write!(buf, "{value}").map_err(|_| CodecError::DataTooLong)?;
        self.add_data(buf.as_bytes())
    }

    pub fn add_uinteger_element(&mut self, name: Option<&str>, value: u64) -> Result<(), CodecError> {
        self.begin_element(name)?;
        let mut buf = FixedBuf::<24>::new();
        write!(buf, "{value}").map_err(|_| CodecError::DataTooLong)?;
        self.add_data(buf.as_bytes())
    }

    /// Writes a float so that it reads back as a float: values without a
    /// fractional part get a trailing `.0` and very large or very small
    /// magnitudes use exponent notation. NaN and infinities become `null`.
    pub fn add_floating_point_element(
        &mut self,
        name: Option<&str>,
        value: f64,
    ) -> Result<(), CodecError> {
        if !value.is_finite() {
            return self.add_null_element(name);
        }
        self.begin_element(name)?;
        let mut buf = FixedBuf::<64>::new();
        let magnitude = value.abs();
        let formatted = if magnitude == 0.0 || (1e-5..1e16).contains(&magnitude) {
            write!(buf, "{value}")
        } else {
            write!(buf, "{value:e}")
        };
        formatted.map_err(|_| CodecError::DataTooLong)?;
        if !buf.as_bytes().iter().any(|c| matches!(c, b'.' | b'e' | b'E')) {
            buf.push_bytes(b".0").map_err(|_| CodecError::DataTooLong)?;
        }
        self.add_data(buf.as_bytes())
    }

    pub fn add_null_element(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.begin_element(name)?;
        self.add_data(b"null")
    }

    /// Adds a string element, or `null` when `value` is `None`.
    pub fn add_string_element(
        &mut self,
        name: Option<&str>,
        value: Option<&str>,
    ) -> Result<(), CodecError> {
        let Some(value) = value else {
            return self.add_null_element(name);
        };
        self.begin_element(name)?;
        self.add_quoted_escaped_string(value.as_bytes())
    }

    pub fn begin_string_element(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.begin_element(name)?;
        self.add_data(b"\"")
    }

    pub fn append_string_element(&mut self, value: &str) -> Result<(), CodecError> {
        self.add_escaped_string(value.as_bytes())
    }

    pub fn end_string_element(&mut self) -> Result<(), CodecError> {
        self.add_data(b"\"")
    }

    /// Adds binary data as a string of uppercase hex digits.
    pub fn add_data_element(&mut self, name: Option<&str>, value: &[u8]) -> Result<(), CodecError> {
        self.begin_data_element(name)?;
        self.append_data_element(value)?;
        self.end_data_element()
    }

    pub fn begin_data_element(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.begin_string_element(name)
    }

    pub fn append_data_element(&mut self, value: &[u8]) -> Result<(), CodecError> {
        let mut work = [0u8; WORK_BUFFER_SIZE];
        for chunk in value.chunks(WORK_BUFFER_SIZE / 2) {
            for (i, byte) in chunk.iter().enumerate() {
                work[i * 2] = HEX_DIGITS[(byte >> 4) as usize];
                work[i * 2 + 1] = HEX_DIGITS[(byte & 0x0f) as usize];
            }
            self.add_data(&work[..chunk.len() * 2])?;
        }
        Ok(())
    }

    pub fn end_data_element(&mut self) -> Result<(), CodecError> {
        self.end_string_element()
    }

    fn begin_container(&mut self, name: Option<&str>, is_object: bool) -> Result<(), CodecError> {
        if self.container_level >= MAX_CONTAINER_DEPTH {
            return Err(CodecError::DataTooLong);
        }
        self.begin_element(name)?;
        self.container_level += 1;
        self.is_object[self.container_level] = is_object;
        self.first_entry = true;
        if is_object {
            self.add_data(b"{")
        } else {
            self.add_data(b"[")
        }
    }

    pub fn begin_object(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.begin_container(name, true)
    }

    pub fn begin_array(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.begin_container(name, false)
    }

    /// Closes the innermost open container. Does nothing at the top level.
    pub fn end_container(&mut self) -> Result<(), CodecError> {
        if self.container_level == 0 {
            return Ok(());
        }
        let is_object = self.is_object[self.container_level];
        self.container_level -= 1;
        if self.pretty_print && !self.first_entry {
            self.add_indent(self.container_level)?;
        }
        self.first_entry = false;
        if is_object {
            self.add_data(b"}")
        } else {
            self.add_data(b"]")
        }
    }

    /// Closes every container that is still open.
    pub fn end_encode(&mut self) -> Result<(), CodecError> {
        while self.container_level > 0 {
            self.end_container()?;
        }
        Ok(())
    }
}
