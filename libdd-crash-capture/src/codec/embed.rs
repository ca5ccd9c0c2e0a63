// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Embedding of existing JSON documents into a document being encoded.

use super::decoder::{Decoder, ElementName, Source};
use super::{CodecError, DecodeCallbacks, DecodeFailure, JsonEncoder, JsonSink, MAX_CONTAINER_DEPTH};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("Unable to read embedded JSON file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to decode embedded JSON: {0}")]
    Decode(#[from] DecodeFailure),
    #[error("Unable to encode embedded JSON: {0}")]
    Encode(#[from] CodecError),
}

/// Re-encodes decoded elements into another encoder.
struct Replay<'e, S: JsonSink> {
    encoder: &'e mut JsonEncoder<S>,
    close_last_container: bool,
    base_level: usize,
}

impl<S: JsonSink> DecodeCallbacks for Replay<'_, S> {
    fn on_boolean_element(&mut self, name: Option<&str>, value: bool) -> Result<(), CodecError> {
        self.encoder.add_boolean_element(name, value)
    }

    fn on_floating_point_element(&mut self, name: Option<&str>, value: f64) -> Result<(), CodecError> {
        self.encoder.add_floating_point_element(name, value)
    }

    fn on_integer_element(&mut self, name: Option<&str>, value: i64) -> Result<(), CodecError> {
        self.encoder.add_integer_element(name, value)
    }

    fn on_null_element(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.encoder.add_null_element(name)
    }

    fn on_string_element(&mut self, name: Option<&str>, value: &str) -> Result<(), CodecError> {
        self.encoder.add_string_element(name, Some(value))
    }

    fn on_begin_object(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.encoder.begin_object(name)
    }

    fn on_begin_array(&mut self, name: Option<&str>) -> Result<(), CodecError> {
        self.encoder.begin_array(name)
    }

    fn on_end_container(&mut self) -> Result<(), CodecError> {
        // The embedded document's own outermost container stays open unless
        // the caller asked for it to be closed.
        if self.close_last_container || self.encoder.container_level() > self.base_level + 1 {
            self.encoder.end_container()
        } else {
            Ok(())
        }
    }
}

/// Accepts everything; used to check a document before replaying it.
struct Validate;

impl DecodeCallbacks for Validate {
    fn on_boolean_element(&mut self, _: Option<&str>, _: bool) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_floating_point_element(&mut self, _: Option<&str>, _: f64) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_integer_element(&mut self, _: Option<&str>, _: i64) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_null_element(&mut self, _: Option<&str>) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_string_element(&mut self, _: Option<&str>, _: &str) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_begin_object(&mut self, _: Option<&str>) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_begin_array(&mut self, _: Option<&str>) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_end_container(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

fn element_name(name: Option<&str>) -> ElementName<'_> {
    match name {
        Some(name) => ElementName::Given(name),
        None => ElementName::Absent,
    }
}

/// Decodes `json` and adds it to `encoder` as the element `name`.
///
/// The document is checked first, so nothing is written when it is invalid.
/// Unless `close_last_container` is set, the outermost container of the
/// embedded document is left open for the caller to extend and close.
pub fn add_json_element<S: JsonSink>(
    encoder: &mut JsonEncoder<S>,
    name: Option<&str>,
    json: &[u8],
    close_last_container: bool,
) -> Result<(), DecodeFailure> {
    let mut name_buffer = [0u8; 100];
    let mut string_buffer = [0u8; 5000];

    Decoder::new(
        Source::Slice(json),
        &mut name_buffer,
        &mut string_buffer,
        &mut Validate,
    )
    .run_element(element_name(name))?;

    let base_level = encoder.container_level();
    let mut replay = Replay {
        encoder: &mut *encoder,
        close_last_container,
        base_level,
    };
    let result = Decoder::new(
        Source::Slice(json),
        &mut name_buffer,
        &mut string_buffer,
        &mut replay,
    )
    .run_element(element_name(name));
    close_to_level(encoder, close_last_container, base_level);
    result
}

/// Streams the JSON document stored at `path` into `encoder` as the element
/// `name`, refilling a small window as it goes.
pub fn add_json_from_file<S: JsonSink>(
    encoder: &mut JsonEncoder<S>,
    name: Option<&str>,
    path: &Path,
    close_last_container: bool,
) -> Result<(), EmbedError> {
    let mut name_buffer = [0u8; 100];
    let mut string_buffer = [0u8; 500];
    let mut window = [0u8; 1000];
    let mut file = File::open(path)?;

    let base_level = encoder.container_level();
    let mut replay = Replay {
        encoder: &mut *encoder,
        close_last_container,
        base_level,
    };
    let result = Decoder::new(
        Source::stream(&mut file, &mut window),
        &mut name_buffer,
        &mut string_buffer,
        &mut replay,
    )
    .run_element(element_name(name));
    close_to_level(encoder, close_last_container, base_level);
    Ok(result?)
}

fn close_to_level<S: JsonSink>(encoder: &mut JsonEncoder<S>, close: bool, base_level: usize) {
    while close && encoder.container_level() > base_level {
        if encoder.end_container().is_err() {
            break;
        }
    }
}

/// Tracks the last offset at which the document could be cut and still be
/// completed by closing the containers open at that point.
struct PrefixTracker {
    closers: [u8; MAX_CONTAINER_DEPTH + 1],
    depth: usize,
    safe_offset: usize,
    safe_depth: usize,
}

impl PrefixTracker {
    fn push(&mut self, closer: u8) -> Result<(), CodecError> {
        if self.depth >= MAX_CONTAINER_DEPTH {
            return Err(CodecError::DataTooLong);
        }
        self.closers[self.depth] = closer;
        self.depth += 1;
        Ok(())
    }
}

impl DecodeCallbacks for PrefixTracker {
    fn on_boolean_element(&mut self, _: Option<&str>, _: bool) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_floating_point_element(&mut self, _: Option<&str>, _: f64) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_integer_element(&mut self, _: Option<&str>, _: i64) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_null_element(&mut self, _: Option<&str>) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_string_element(&mut self, _: Option<&str>, _: &str) -> Result<(), CodecError> {
        Ok(())
    }
    fn on_begin_object(&mut self, _: Option<&str>) -> Result<(), CodecError> {
        self.push(b'}')
    }
    fn on_begin_array(&mut self, _: Option<&str>) -> Result<(), CodecError> {
        self.push(b']')
    }
    fn on_end_container(&mut self) -> Result<(), CodecError> {
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }
    fn on_checkpoint(&mut self, offset: usize) {
        self.safe_offset = offset;
        self.safe_depth = self.depth;
    }
}

/// Copies the JSON file at `path` byte for byte into `encoder` as the element
/// `name`.
///
/// The file may have been cut short by a crash while it was being written.
/// Only its longest structurally complete prefix is copied and the containers
/// still open at that point are closed afterwards, so the result is always
/// valid JSON and a complete file is reproduced exactly.
pub fn add_json_file_verbatim<S: JsonSink>(
    encoder: &mut JsonEncoder<S>,
    name: Option<&str>,
    path: &Path,
) -> Result<(), EmbedError> {
    let mut file = File::open(path)?;
    let mut tracker = PrefixTracker {
        closers: [0; MAX_CONTAINER_DEPTH + 1],
        depth: 0,
        safe_offset: 0,
        safe_depth: 0,
    };
    {
        let mut name_buffer = [0u8; 128];
        let mut string_buffer = [0u8; 2048];
        let mut window = [0u8; 4096];
        let mut decoder = Decoder::new(
            Source::stream(&mut file, &mut window),
            &mut name_buffer,
            &mut string_buffer,
            &mut tracker,
        );
        if let Err(e) = decoder.run_element(ElementName::Absent) {
            tracing::debug!("Embedding truncated JSON document: {e}");
        }
    }

    encoder.begin_element(name)?;
    if tracker.safe_offset == 0 {
        encoder.add_raw_json_data(b"null")?;
        return Ok(());
    }

    file.seek(SeekFrom::Start(0))?;
    let mut remaining = tracker.safe_offset;
    let mut chunk = [0u8; 1024];
    while remaining > 0 {
        let wanted = remaining.min(chunk.len());
        let read = match file.read(&mut chunk[..wanted]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        encoder.add_raw_json_data(&chunk[..read])?;
        remaining -= read;
    }
    for closer in tracker.closers[..tracker.safe_depth].iter().rev() {
        encoder.add_raw_json_data(std::slice::from_ref(closer))?;
    }
    Ok(())
}
