// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-processing applied to a stored report before it is handed out.
//!
//! Reports are written from a crashed process, so they hold raw values:
//! integer timestamps and mangled symbol names. This pass decodes the report,
//! turns those into readable text and re-encodes the rest unchanged.

use crate::codec::{decode, CodecError, DecodeCallbacks, DecodeFailure, JsonEncoder};
use crate::shared::constants::MICROSECOND_TIMESTAMP_VERSION;
use chrono::DateTime;
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

const MAX_DEPTH: usize = 100;
const MAX_NAME_LENGTH: usize = 100;
const MIN_SCRATCH_SIZE: usize = 10_000;

/// Container names from the document root, arrays and the root contributing
/// an empty name, followed by the element name.
type ElementPath = &'static [&'static str];

const DATE_PATHS: &[ElementPath] = &[
    &["", "report", "timestamp"],
    &["", "recrash_report", "report", "timestamp"],
];

const VERSION_PATHS: &[ElementPath] = &[
    &["", "report", "version"],
    &["", "recrash_report", "report", "version"],
];

const DEMANGLE_PATHS: &[ElementPath] = &[
    &["", "crash", "threads", "", "backtrace", "contents", "", "symbol_name"],
    &["", "recrash_report", "crash", "threads", "", "backtrace", "contents", "", "symbol_name"],
    &["", "crash", "error", "cpp_exception", "name"],
    &["", "recrash_report", "crash", "error", "cpp_exception", "name"],
];

/// Re-encodes `report` with readable dates and demangled symbols.
///
/// Fails only when `report` is not a well formed document.
pub fn fixup_crash_report(report: &[u8]) -> Result<Vec<u8>, DecodeFailure> {
    let mut scratch = vec![0u8; (report.len() * 2).max(MIN_SCRATCH_SIZE)];
    let mut fixup = Fixup {
        encoder: JsonEncoder::new(Vec::with_capacity(report.len() * 3 / 2), true),
        version: (0, 0, 0),
        path: Vec::with_capacity(MAX_DEPTH),
    };
    decode(report, &mut scratch, &mut fixup)?;
    Ok(fixup.encoder.into_sink())
}

struct Fixup {
    encoder: JsonEncoder<Vec<u8>>,
    version: (u32, u32, u32),
    path: Vec<String>,
}

impl Fixup {
    fn matches_any(&self, paths: &[ElementPath], name: Option<&str>) -> bool {
        let name = name.unwrap_or_default();
        paths.iter().any(|path| {
            path.len() == self.path.len() + 1
                && path.iter().zip(&self.path).all(|(expected, actual)| *expected == actual.as_str())
                && path[self.path.len()] == name
        })
    }

    fn push(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        if self.path.len() >= MAX_DEPTH {
            return Err(CodecError::DataTooLong);
        }
        let name = name.unwrap_or_default();
        let mut end = name.len().min(MAX_NAME_LENGTH);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.path.push(name[..end].to_string());
        Ok(())
    }
}

/// `major.minor.patch`, each part read like `atoi`: leading digits only.
fn parse_version(value: &str) -> (u32, u32, u32) {
    let mut parts = value.split('.').map(|part| {
        let digits = part.bytes().take_while(u8::is_ascii_digit).count();
        part[..digits].parse().unwrap_or(0)
    });
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

fn format_timestamp(value: i64, microseconds: bool) -> Option<String> {
    if microseconds {
        let time = DateTime::from_timestamp_micros(value)?;
        Some(time.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
    } else {
        let time = DateTime::from_timestamp(value, 0)?;
        Some(time.format("%Y-%m-%dT%H:%M:%SZ").to_string())
    }
}

fn demangle(symbol: &str) -> Option<String> {
    Name::from(symbol)
        .demangle(DemangleOptions::name_only())
        .filter(|demangled| demangled != symbol)
}

impl DecodeCallbacks for Fixup {
    fn on_boolean_element(&mut self, name: Option<&str>, value: bool) -> Result<(), CodecError> {
        self.encoder.add_boolean_element(name, value)
    }

    fn on_floating_point_element(
        &mut self,
        name: Option<&str>,
        value: f64,
    ) -> Result<(), CodecError> {
        self.encoder.add_floating_point_element(name, value)
    }

    fn on_integer_element(&mut self, name: Option<&str>, value: i64) -> Result<(), CodecError> {
        if self.matches_any(DATE_PATHS, name) {
            let microseconds = self.version >= MICROSECOND_TIMESTAMP_VERSION;
            if let Some(date) = format_timestamp(value, microseconds) {
                return self.encoder.add_string_element(name, Some(&date));
            }
        }
        self.encoder.add_integer_element(name, value)
    }

    fn on_null_element(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.encoder.add_null_element(name)
    }

    fn on_string_element(&mut self, name: Option<&str>, value: &str) -> Result<(), CodecError> {
        if self.matches_any(VERSION_PATHS, name) {
            self.version = parse_version(value);
        }
        let demangled = if self.matches_any(DEMANGLE_PATHS, name) {
            demangle(value)
        } else {
            None
        };
        self.encoder
            .add_string_element(name, Some(demangled.as_deref().unwrap_or(value)))
    }

    fn on_begin_object(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.encoder.begin_object(name)?;
        self.push(name)
    }

    fn on_begin_array(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.encoder.begin_array(name)?;
        self.push(name)
    }

    fn on_end_container(&mut self) -> Result<(), CodecError> {
        self.path.pop();
        self.encoder.end_container()
    }

    fn on_end_data(&mut self) -> Result<(), CodecError> {
        self.encoder.end_encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn fixup(report: &str) -> Value {
        let fixed = fixup_crash_report(report.as_bytes()).expect("fixup");
        serde_json::from_slice(&fixed).expect("valid JSON")
    }

    #[test]
    fn test_timestamp_units_follow_version() {
        let current = fixup(r#"{"report": {"version": "3.3.0", "timestamp": 1700000000123456}}"#);
        assert_eq!(current["report"]["timestamp"], "2023-11-14T22:13:20.123456Z");

        let older = fixup(r#"{"report": {"version": "3.2.9", "timestamp": 1700000000}}"#);
        assert_eq!(older["report"]["timestamp"], "2023-11-14T22:13:20Z");

        // Only the report timestamp is a date.
        let other = fixup(r#"{"report": {"version": "3.3.0"}, "system": {"timestamp": 12}}"#);
        assert_eq!(other["system"]["timestamp"], 12);
    }

    #[test]
    fn test_recrash_report_dates_use_their_own_version() {
        let fixed = fixup(
            r#"{
                "recrash_report": {"report": {"version": "3.0.0", "timestamp": 1700000000}},
                "report": {"version": "3.3.0", "timestamp": 1700000000000000}
            }"#,
        );
        assert_eq!(fixed["recrash_report"]["report"]["timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(fixed["report"]["timestamp"], "2023-11-14T22:13:20.000000Z");
    }

    #[test]
    fn test_symbols_are_demangled() {
        let frame = |symbol: &str| json!({"backtrace": {"contents": [{"symbol_name": symbol}]}});
        let report = json!({
            "crash": {
                "error": {"cpp_exception": {"name": "_ZN3Foo3barEv"}},
                "threads": [frame("_ZN3std2rt10lang_start17h7a87e81ecc4a9d6cE"), frame("main")],
            },
            "recrash_report": {"crash": {"threads": [frame("_ZN3Foo3barEv")]}},
            "other": {"symbol_name": "_ZN3Foo3barEv"},
        });
        let fixed = fixup(&report.to_string());
        let symbol = |thread: &Value| thread["backtrace"]["contents"][0]["symbol_name"].clone();
        assert_eq!(symbol(&fixed["crash"]["threads"][0]), "std::rt::lang_start");
        assert_eq!(symbol(&fixed["crash"]["threads"][1]), "main");
        assert_eq!(symbol(&fixed["recrash_report"]["crash"]["threads"][0]), "Foo::bar");
        assert_eq!(fixed["crash"]["error"]["cpp_exception"]["name"], "Foo::bar");
        assert_eq!(fixed["other"]["symbol_name"], "_ZN3Foo3barEv");
    }

    #[test]
    fn test_fixup_is_idempotent() {
        let report = r#"{
            "report": {"version": "3.3.0", "timestamp": 1700000000000001, "id": "A"},
            "crash": {"threads": [{"backtrace": {"contents": [
                {"symbol_name": "_ZN3Foo3barEv", "instruction_addr": 4096}
            ]}}]},
            "system": {"memory": {"free": 1.5}}
        }"#;
        let once = fixup_crash_report(report.as_bytes()).expect("first pass");
        let twice = fixup_crash_report(&once).expect("second pass");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_malformed_report_fails() {
        assert!(fixup_crash_report(br#"{"report": {"version": "#).is_err());
        assert!(fixup_crash_report(b"not json").is_err());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("3.3.0"), (3, 3, 0));
        assert_eq!(parse_version("3.10"), (3, 10, 0));
        assert_eq!(parse_version("4.1.2-beta"), (4, 1, 2));
        assert_eq!(parse_version("x"), (0, 0, 0));
    }
}
