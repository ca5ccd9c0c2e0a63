// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::codec::{
    add_json_element, add_json_file_verbatim, add_json_from_file, CodecError, EmbedError,
    JsonEncoder, JsonSink,
};
use crate::shared::buffered_io::BufferedReader;
use crate::shared::fixed_buf::FixedBuf;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

const TEXT_FILE_CHUNK_SIZE: usize = 512;
const TEXT_LINE_BUFFER_SIZE: usize = 1024;

/// Element level interface used by every section of a report.
///
/// Calls never fail: a report is written once, from a crashed process, so a
/// bad element is skipped and the rest of the report still goes out.
pub trait ReportWriter {
    fn add_boolean_element(&mut self, name: Option<&str>, value: bool);
    fn add_floating_point_element(&mut self, name: Option<&str>, value: f64);
    fn add_integer_element(&mut self, name: Option<&str>, value: i64);
    fn add_uinteger_element(&mut self, name: Option<&str>, value: u64);
    /// `None` is written as `null`.
    fn add_string_element(&mut self, name: Option<&str>, value: Option<&str>);
    /// The whole content of a text file, as one string.
    fn add_text_file_element(&mut self, name: Option<&str>, path: &Path);
    /// The lines of a text file, as an array of strings.
    fn add_text_file_lines_element(&mut self, name: Option<&str>, path: &Path);
    fn add_json_file_element(&mut self, name: Option<&str>, path: &Path, close_last_container: bool);
    /// A JSON file copied byte for byte, closed if it was cut short.
    fn add_json_file_verbatim_element(&mut self, name: Option<&str>, path: &Path);
    fn add_data_element(&mut self, name: Option<&str>, value: &[u8]);
    fn begin_data_element(&mut self, name: Option<&str>);
    fn append_data_element(&mut self, value: &[u8]);
    fn end_data_element(&mut self);
    fn add_uuid_element(&mut self, name: Option<&str>, value: Option<&[u8; 16]>);
    fn add_json_element(&mut self, name: Option<&str>, json: &[u8], close_last_container: bool);
    fn begin_object(&mut self, name: Option<&str>);
    fn begin_array(&mut self, name: Option<&str>);
    fn end_container(&mut self);
    /// Pushes everything written so far to storage.
    fn flush(&mut self) {}
}

/// [`ReportWriter`] on top of the JSON encoder. Keeps the first error it
/// hit, for logging once the report is done.
pub struct JsonReportWriter<S: JsonSink> {
    encoder: JsonEncoder<S>,
    error: Option<CodecError>,
}

impl<S: JsonSink> JsonReportWriter<S> {
    pub fn new(sink: S, pretty_print: bool) -> Self {
        Self {
            encoder: JsonEncoder::new(sink, pretty_print),
            error: None,
        }
    }

    pub fn error(&self) -> Option<CodecError> {
        self.error
    }

    /// Closes every open container and returns the sink.
    pub fn finish(mut self) -> (S, Option<CodecError>) {
        let result = self.encoder.end_encode();
        self.record(result);
        let error = self.error;
        (self.encoder.into_sink(), error)
    }

    fn record(&mut self, result: Result<(), CodecError>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    fn record_embed(&mut self, result: Result<(), EmbedError>) {
        match result {
            Ok(()) => {}
            Err(EmbedError::Encode(e)) => self.record(Err(e)),
            Err(EmbedError::Decode(failure)) => self.record(Err(failure.error)),
            Err(EmbedError::Io(_)) => self.record(Err(CodecError::CannotAddData)),
        }
    }

    /// Appends as much of `bytes` as is valid UTF-8 and returns the length
    /// of an incomplete character left at the end.
    fn append_utf8(&mut self, mut bytes: &[u8]) -> usize {
        loop {
            match std::str::from_utf8(bytes) {
                Ok(text) => {
                    let result = self.encoder.append_string_element(text);
                    self.record(result);
                    return 0;
                }
                Err(e) => {
                    let (valid, rest) = bytes.split_at(e.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        let result = self.encoder.append_string_element(text);
                        self.record(result);
                    }
                    match e.error_len() {
                        Some(invalid) => bytes = &rest[invalid..],
                        None => return rest.len(),
                    }
                }
            }
        }
    }

    fn copy_text_file(&mut self, path: &Path) -> std::io::Result<()> {
        let mut file = File::open(path)?;
        let mut buffer = [0u8; TEXT_FILE_CHUNK_SIZE];
        let mut pending = 0;
        loop {
            let read = match file.read(&mut buffer[pending..]) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            let filled = pending + read;
            pending = self.append_utf8(&buffer[..filled]);
            buffer.copy_within(filled - pending..filled, 0);
        }
        Ok(())
    }

    fn copy_text_lines(&mut self, path: &Path) -> std::io::Result<()> {
        let mut reader = BufferedReader::<TEXT_LINE_BUFFER_SIZE>::open(path)?;
        let mut line = [0u8; TEXT_LINE_BUFFER_SIZE];
        loop {
            let read = reader.read_until_char(b'\n', &mut line)?;
            if read.length == 0 {
                return Ok(());
            }
            let mut end = read.length;
            if read.found {
                end -= 1;
            }
            let text = match std::str::from_utf8(&line[..end]) {
                Ok(text) => text,
                Err(e) => std::str::from_utf8(&line[..e.valid_up_to()]).unwrap_or_default(),
            };
            let result = self.encoder.add_string_element(None, Some(text));
            self.record(result);
        }
    }
}

impl<S: JsonSink> ReportWriter for JsonReportWriter<S> {
    fn add_boolean_element(&mut self, name: Option<&str>, value: bool) {
        let result = self.encoder.add_boolean_element(name, value);
        self.record(result);
    }

    fn add_floating_point_element(&mut self, name: Option<&str>, value: f64) {
        let result = self.encoder.add_floating_point_element(name, value);
        self.record(result);
    }

    fn add_integer_element(&mut self, name: Option<&str>, value: i64) {
        let result = self.encoder.add_integer_element(name, value);
        self.record(result);
    }

    fn add_uinteger_element(&mut self, name: Option<&str>, value: u64) {
        let result = self.encoder.add_uinteger_element(name, value);
        self.record(result);
    }

    fn add_string_element(&mut self, name: Option<&str>, value: Option<&str>) {
        let result = self.encoder.add_string_element(name, value);
        self.record(result);
    }

    fn add_text_file_element(&mut self, name: Option<&str>, path: &Path) {
        let result = self.encoder.begin_string_element(name);
        self.record(result);
        if self.copy_text_file(path).is_err() {
            self.record(Err(CodecError::CannotAddData));
        }
        let result = self.encoder.end_string_element();
        self.record(result);
    }

    fn add_text_file_lines_element(&mut self, name: Option<&str>, path: &Path) {
        let result = self.encoder.begin_array(name);
        self.record(result);
        if self.copy_text_lines(path).is_err() {
            self.record(Err(CodecError::CannotAddData));
        }
        let result = self.encoder.end_container();
        self.record(result);
    }

    fn add_json_file_element(&mut self, name: Option<&str>, path: &Path, close_last_container: bool) {
        let result = add_json_from_file(&mut self.encoder, name, path, close_last_container);
        self.record_embed(result);
    }

    fn add_json_file_verbatim_element(&mut self, name: Option<&str>, path: &Path) {
        let result = add_json_file_verbatim(&mut self.encoder, name, path);
        self.record_embed(result);
    }

    fn add_data_element(&mut self, name: Option<&str>, value: &[u8]) {
        let result = self.encoder.add_data_element(name, value);
        self.record(result);
    }

    fn begin_data_element(&mut self, name: Option<&str>) {
        let result = self.encoder.begin_data_element(name);
        self.record(result);
    }

    fn append_data_element(&mut self, value: &[u8]) {
        let result = self.encoder.append_data_element(value);
        self.record(result);
    }

    fn end_data_element(&mut self) {
        let result = self.encoder.end_data_element();
        self.record(result);
    }

    fn add_uuid_element(&mut self, name: Option<&str>, value: Option<&[u8; 16]>) {
        let Some(value) = value else {
            let result = self.encoder.add_null_element(name);
            self.record(result);
            return;
        };
        let mut buf = FixedBuf::<36>::new();
        for (i, byte) in value.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                let _ = buf.write_char('-');
            }
            let _ = write!(buf, "{byte:02X}");
        }
        let result = self.encoder.add_string_element(name, Some(buf.as_str()));
        self.record(result);
    }

    fn add_json_element(&mut self, name: Option<&str>, json: &[u8], close_last_container: bool) {
        let Err(failure) = add_json_element(&mut self.encoder, name, json, close_last_container)
        else {
            return;
        };
        // Nothing was written for an invalid document; describe it instead.
        let mut message = FixedBuf::<128>::new();
        let _ = write!(message, "Invalid JSON data: {failure}");
        let raw = match std::str::from_utf8(json) {
            Ok(text) => text,
            Err(e) => std::str::from_utf8(&json[..e.valid_up_to()]).unwrap_or_default(),
        };
        self.begin_object(name);
        self.add_string_element(Some("error"), Some(message.as_str()));
        self.add_string_element(Some("json_data"), Some(raw));
        if close_last_container {
            self.end_container();
        }
    }

    fn begin_object(&mut self, name: Option<&str>) {
        let result = self.encoder.begin_object(name);
        self.record(result);
    }

    fn begin_array(&mut self, name: Option<&str>) {
        let result = self.encoder.begin_array(name);
        self.record(result);
    }

    fn end_container(&mut self) {
        let result = self.encoder.end_container();
        self.record(result);
    }

    fn flush(&mut self) {
        let result = self.encoder.sink_mut().flush();
        self.record(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn render(f: impl FnOnce(&mut JsonReportWriter<Vec<u8>>)) -> (serde_json::Value, Option<CodecError>) {
        let mut writer = JsonReportWriter::new(Vec::new(), false);
        writer.begin_object(None);
        f(&mut writer);
        let (data, error) = writer.finish();
        (serde_json::from_slice(&data).expect("valid JSON"), error)
    }

    #[test]
    fn test_uuid_element() {
        let bytes = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ];
        let (value, error) = render(|w| {
            w.add_uuid_element(Some("uuid"), Some(&bytes));
            w.add_uuid_element(Some("missing"), None);
        });
        assert_eq!(error, None);
        assert_eq!(value["uuid"], "12345678-9ABC-DEF0-0123-456789ABCDEF");
        assert!(value["missing"].is_null());
    }

    #[test]
    fn test_invalid_json_is_described() {
        let (value, error) = render(|w| {
            w.add_json_element(Some("good"), br#"{"a":[1,2]}"#, true);
            w.add_json_element(Some("bad"), br#"{"a":"#, true);
            w.add_json_element(Some("open"), b"[1,", false);
            w.add_boolean_element(Some("inside"), true);
            w.end_container();
        });
        assert_eq!(error, None);
        assert_eq!(value["good"]["a"][1], 2);
        let message = value["bad"]["error"].as_str().unwrap();
        assert!(message.starts_with("Invalid JSON data: "), "{message}");
        assert_eq!(value["bad"]["json_data"], r#"{"a":"#);
        assert_eq!(value["open"]["json_data"], "[1,");
        assert_eq!(value["open"]["inside"], true);
    }

    #[test]
    fn test_text_file_elements() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log.txt");
        let mut file = File::create(&path)?;
        // Long enough to split a multi-byte character across reads.
        let long_line = "é".repeat(400);
        writeln!(file, "first \"line\"")?;
        writeln!(file, "{long_line}")?;
        write!(file, "last without newline")?;
        drop(file);

        let (value, error) = render(|w| {
            w.add_text_file_element(Some("text"), &path);
            w.add_text_file_lines_element(Some("lines"), &path);
            w.add_text_file_lines_element(Some("missing"), &dir.path().join("nope"));
        });
        assert_eq!(error, Some(CodecError::CannotAddData));
        assert_eq!(
            value["text"],
            format!("first \"line\"\n{long_line}\nlast without newline")
        );
        let lines = value["lines"].as_array().unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "first \"line\"");
        assert_eq!(lines[1], long_line.as_str());
        assert_eq!(lines[2], "last without newline");
        assert_eq!(value["missing"], serde_json::json!([]));
        Ok(())
    }

    #[test]
    fn test_first_error_is_kept() {
        let (value, error) = render(|w| {
            w.add_string_element(Some("bad"), Some("bell \u{7}"));
            w.add_string_element(Some("good"), Some("fine"));
        });
        assert_eq!(error, Some(CodecError::InvalidCharacter));
        assert_eq!(value["good"], "fine");
    }
}
