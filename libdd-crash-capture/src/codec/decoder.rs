// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{CodecError, MAX_CONTAINER_DEPTH};
use std::io::Read;

/// Receives the elements found by the decoder, in document order.
///
/// `name` is the member name inside an object and `None` for array entries
/// and for the top level element. Returning an error stops the decode.
pub trait DecodeCallbacks {
    fn on_boolean_element(&mut self, name: Option<&str>, value: bool) -> Result<(), CodecError>;
    fn on_floating_point_element(
        &mut self,
        name: Option<&str>,
        value: f64,
    ) -> Result<(), CodecError>;
    fn on_integer_element(&mut self, name: Option<&str>, value: i64) -> Result<(), CodecError>;
    fn on_null_element(&mut self, name: Option<&str>) -> Result<(), CodecError>;
    fn on_string_element(&mut self, name: Option<&str>, value: &str) -> Result<(), CodecError>;
    fn on_begin_object(&mut self, name: Option<&str>) -> Result<(), CodecError>;
    fn on_begin_array(&mut self, name: Option<&str>) -> Result<(), CodecError>;
    fn on_end_container(&mut self) -> Result<(), CodecError>;
    fn on_end_data(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    /// Called after every completed element and every opened container with
    /// the absolute input offset just past it.
    fn on_checkpoint(&mut self, _offset: usize) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{error} at offset {offset}")]
pub struct DecodeFailure {
    pub error: CodecError,
    pub offset: usize,
}

/// Decodes one JSON document held in `data`.
///
/// `scratch` is split between names (first quarter) and string or number
/// text (the rest). An element that does not fit fails with
/// [`CodecError::DataTooLong`].
pub fn decode<C: DecodeCallbacks + ?Sized>(
    data: &[u8],
    scratch: &mut [u8],
    callbacks: &mut C,
) -> Result<(), DecodeFailure> {
    let (name_buffer, string_buffer) = scratch.split_at_mut(scratch.len() / 4);
    let mut decoder = Decoder::new(Source::Slice(data), name_buffer, string_buffer, callbacks);
    decoder.run_document()
}

/// Decodes one JSON document read from `reader` through `window`.
///
/// The window is refilled between elements, so the largest single string or
/// number must fit in it.
pub fn decode_file<C: DecodeCallbacks + ?Sized>(
    reader: &mut dyn Read,
    window: &mut [u8],
    name_buffer: &mut [u8],
    string_buffer: &mut [u8],
    callbacks: &mut C,
) -> Result<(), DecodeFailure> {
    let mut decoder = Decoder::new(
        Source::stream(reader, window),
        name_buffer,
        string_buffer,
        callbacks,
    );
    decoder.run_document()
}

pub(super) enum Source<'a> {
    Slice(&'a [u8]),
    Stream {
        reader: &'a mut dyn Read,
        window: &'a mut [u8],
        len: usize,
        consumed: usize,
        eof: bool,
    },
}

impl<'a> Source<'a> {
    pub(super) fn stream(reader: &'a mut dyn Read, window: &'a mut [u8]) -> Self {
        Source::Stream {
            reader,
            window,
            len: 0,
            consumed: 0,
            eof: false,
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            Source::Slice(data) => data,
            Source::Stream { window, len, .. } => &window[..*len],
        }
    }

    fn base(&self) -> usize {
        match self {
            Source::Slice(_) => 0,
            Source::Stream { consumed, .. } => *consumed,
        }
    }

    /// Slides the unread tail of a stream to the front of its window and tops
    /// the window up once less than half of it remains.
    fn refill(&mut self, pos: &mut usize) {
        let Source::Stream {
            reader,
            window,
            len,
            consumed,
            eof,
        } = self
        else {
            return;
        };
        if *eof {
            return;
        }
        let remaining = *len - *pos;
        if remaining >= window.len() / 2 {
            return;
        }
        window.copy_within(*pos..*len, 0);
        *consumed += *pos;
        *pos = 0;
        *len = remaining;
        while *len < window.len() {
            match reader.read(&mut window[*len..]) {
                Ok(0) => {
                    *eof = true;
                    break;
                }
                Ok(n) => *len += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("Error reading JSON input: {e}");
                    *eof = true;
                    break;
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
pub(super) enum ElementName<'n> {
    Absent,
    Given(&'n str),
    Buffered(usize),
}

fn resolve_name<'s>(
    name: ElementName<'s>,
    name_buffer: &'s [u8],
) -> Result<Option<&'s str>, CodecError> {
    match name {
        ElementName::Absent => Ok(None),
        ElementName::Given(name) => Ok(Some(name)),
        ElementName::Buffered(len) => std::str::from_utf8(&name_buffer[..len])
            .map(Some)
            .map_err(|_| CodecError::InvalidCharacter),
    }
}

fn is_fp_char(ch: u8) -> bool {
    matches!(ch, b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-')
}

fn hex_value(ch: u8) -> Option<u32> {
    (ch as char).to_digit(16)
}

/// Reads four hex digits ending before `end`, the closing quote of the
/// string, so running short is malformed input rather than truncation.
fn read_hex4(input: &[u8], at: usize, end: usize) -> Result<u32, CodecError> {
    if at + 4 > end {
        return Err(CodecError::InvalidCharacter);
    }
    input[at..at + 4].iter().try_fold(0u32, |acc, &ch| {
        hex_value(ch)
            .map(|v| (acc << 4) | v)
            .ok_or(CodecError::InvalidCharacter)
    })
}

fn put(dst: &mut [u8], at: &mut usize, bytes: &[u8]) -> Result<(), CodecError> {
    let end = *at + bytes.len();
    if end > dst.len() {
        return Err(CodecError::DataTooLong);
    }
    dst[*at..end].copy_from_slice(bytes);
    *at = end;
    Ok(())
}

/// Decodes the string starting at `input[*pos]` (which must be a quote) into
/// `dst`, returning the decoded length.
fn decode_string(input: &[u8], pos: &mut usize, dst: &mut [u8]) -> Result<usize, CodecError> {
    if input.get(*pos) != Some(&b'"') {
        return Err(CodecError::InvalidCharacter);
    }
    let start = *pos + 1;
    let mut end = start;
    let mut has_escape = false;
    loop {
        match input.get(end) {
            None => return Err(CodecError::Incomplete),
            Some(b'"') => break,
            Some(b'\\') => {
                has_escape = true;
                end += 2;
            }
            Some(_) => end += 1,
        }
    }
    if end - start > dst.len() {
        return Err(CodecError::DataTooLong);
    }

    if !has_escape {
        let len = end - start;
        dst[..len].copy_from_slice(&input[start..end]);
        std::str::from_utf8(&dst[..len]).map_err(|_| CodecError::InvalidCharacter)?;
        *pos = end + 1;
        return Ok(len);
    }

    let mut src = start;
    let mut len = 0;
    while src < end {
        let ch = input[src];
        if ch != b'\\' {
            put(dst, &mut len, &[ch])?;
            src += 1;
            continue;
        }
        src += 1;
        let escaped = input[src];
        src += 1;
        let plain = match escaped {
            b'"' => b'"',
            b'\\' => b'\\',
            b'/' => b'/',
            b'b' => 0x08,
            b'f' => 0x0c,
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'u' => {
                let mut code = read_hex4(input, src, end)?;
                src += 4;
                if (0xdc00..=0xdfff).contains(&code) {
                    return Err(CodecError::InvalidCharacter);
                }
                if (0xd800..=0xdbff).contains(&code) {
                    if src + 2 > end || input[src] != b'\\' || input[src + 1] != b'u' {
                        return Err(CodecError::InvalidCharacter);
                    }
                    let trail = read_hex4(input, src + 2, end)?;
                    if !(0xdc00..=0xdfff).contains(&trail) {
                        return Err(CodecError::InvalidCharacter);
                    }
                    src += 6;
                    code = 0x10000 + (((code - 0xd800) << 10) | (trail - 0xdc00));
                }
                let ch = char::from_u32(code).ok_or(CodecError::InvalidCharacter)?;
                let mut utf8 = [0u8; 4];
                put(dst, &mut len, ch.encode_utf8(&mut utf8).as_bytes())?;
                continue;
            }
            _ => return Err(CodecError::InvalidCharacter),
        };
        put(dst, &mut len, &[plain])?;
    }
    std::str::from_utf8(&dst[..len]).map_err(|_| CodecError::InvalidCharacter)?;
    *pos = end + 1;
    Ok(len)
}

pub(super) struct Decoder<'a, 'b, C: DecodeCallbacks + ?Sized> {
    source: Source<'a>,
    pos: usize,
    name_buffer: &'b mut [u8],
    string_buffer: &'b mut [u8],
    callbacks: &'b mut C,
    depth: usize,
}

impl<'a, 'b, C: DecodeCallbacks + ?Sized> Decoder<'a, 'b, C> {
    pub(super) fn new(
        source: Source<'a>,
        name_buffer: &'b mut [u8],
        string_buffer: &'b mut [u8],
        callbacks: &'b mut C,
    ) -> Self {
        Self {
            source,
            pos: 0,
            name_buffer,
            string_buffer,
            callbacks,
            depth: 0,
        }
    }

    pub(super) fn offset(&self) -> usize {
        self.source.base() + self.pos
    }

    pub(super) fn callbacks(&mut self) -> &mut C {
        &mut *self.callbacks
    }

    fn failure(&self, error: CodecError) -> DecodeFailure {
        DecodeFailure {
            error,
            offset: self.offset(),
        }
    }

    fn run_document(&mut self) -> Result<(), DecodeFailure> {
        self.run_element(ElementName::Absent)?;
        self.callbacks
            .on_end_data()
            .map_err(|error| self.failure(error))
    }

    /// Decodes a single element, giving it `name` if one is supplied.
    pub(super) fn run_element(&mut self, name: ElementName<'_>) -> Result<(), DecodeFailure> {
        self.source.refill(&mut self.pos);
        self.decode_element(name).map_err(|error| self.failure(error))
    }

    fn peek(&self) -> Option<u8> {
        self.source.data().get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if !ch.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
    }

    /// Runs after every callback: lets streams refill and reports progress.
    fn after_callback(&mut self) {
        self.source.refill(&mut self.pos);
        let offset = self.offset();
        self.callbacks.on_checkpoint(offset);
    }

    fn decode_element(&mut self, name: ElementName<'_>) -> Result<(), CodecError> {
        self.skip_whitespace();
        let Some(ch) = self.peek() else {
            return Err(CodecError::Incomplete);
        };
        match ch {
            b'[' => self.decode_array(name),
            b'{' => self.decode_object(name),
            b'"' => {
                let len = decode_string(self.source.data(), &mut self.pos, self.string_buffer)?;
                let value = std::str::from_utf8(&self.string_buffer[..len])
                    .map_err(|_| CodecError::InvalidCharacter)?;
                let name = resolve_name(name, self.name_buffer)?;
                self.callbacks.on_string_element(name, value)?;
                self.after_callback();
                Ok(())
            }
            b'f' => self.decode_literal(name, b"false", Literal::Boolean(false)),
            b't' => self.decode_literal(name, b"true", Literal::Boolean(true)),
            b'n' => self.decode_literal(name, b"null", Literal::Null),
            b'-' | b'0'..=b'9' => self.decode_number(name),
            _ => Err(CodecError::InvalidCharacter),
        }
    }

    fn enter_container(&mut self) -> Result<(), CodecError> {
        if self.depth >= MAX_CONTAINER_DEPTH {
            return Err(CodecError::DataTooLong);
        }
        self.depth += 1;
        Ok(())
    }

    fn end_container(&mut self) -> Result<(), CodecError> {
        self.pos += 1;
        self.depth -= 1;
        self.callbacks.on_end_container()?;
        self.after_callback();
        Ok(())
    }

    fn decode_array(&mut self, name: ElementName<'_>) -> Result<(), CodecError> {
        self.enter_container()?;
        self.pos += 1;
        let resolved = resolve_name(name, self.name_buffer)?;
        self.callbacks.on_begin_array(resolved)?;
        self.after_callback();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(CodecError::Incomplete),
                Some(b']') => return self.end_container(),
                Some(_) => {}
            }
            self.decode_element(ElementName::Absent)?;
            self.skip_whitespace();
            match self.peek() {
                None => return Err(CodecError::Incomplete),
                Some(b',') => self.pos += 1,
                Some(_) => {}
            }
        }
    }

    fn decode_object(&mut self, name: ElementName<'_>) -> Result<(), CodecError> {
        self.enter_container()?;
        self.pos += 1;
        let resolved = resolve_name(name, self.name_buffer)?;
        self.callbacks.on_begin_object(resolved)?;
        self.after_callback();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(CodecError::Incomplete),
                Some(b'}') => return self.end_container(),
                Some(_) => {}
            }
            let name_len = decode_string(self.source.data(), &mut self.pos, self.name_buffer)?;
            self.skip_whitespace();
            match self.peek() {
                None => return Err(CodecError::Incomplete),
                Some(b':') => self.pos += 1,
                Some(_) => return Err(CodecError::InvalidCharacter),
            }
            self.skip_whitespace();
            self.decode_element(ElementName::Buffered(name_len))?;
            self.skip_whitespace();
            match self.peek() {
                None => return Err(CodecError::Incomplete),
                Some(b',') => self.pos += 1,
                Some(_) => {}
            }
        }
    }

    fn decode_literal(
        &mut self,
        name: ElementName<'_>,
        text: &[u8],
        literal: Literal,
    ) -> Result<(), CodecError> {
        let data = self.source.data();
        let available = &data[self.pos..];
        if available.len() < text.len() {
            return Err(CodecError::Incomplete);
        }
        if &available[..text.len()] != text {
            return Err(CodecError::InvalidCharacter);
        }
        self.pos += text.len();
        let name = resolve_name(name, self.name_buffer)?;
        match literal {
            Literal::Boolean(value) => self.callbacks.on_boolean_element(name, value)?,
            Literal::Null => self.callbacks.on_null_element(name)?,
        }
        self.after_callback();
        Ok(())
    }

    fn decode_number(&mut self, name: ElementName<'_>) -> Result<(), CodecError> {
        let data = self.source.data();
        let start = self.pos;
        let mut pos = self.pos;
        let negative = data[pos] == b'-';
        if negative {
            pos += 1;
            match data.get(pos) {
                None => return Err(CodecError::Incomplete),
                Some(ch) if !ch.is_ascii_digit() => return Err(CodecError::InvalidCharacter),
                Some(_) => {}
            }
        }

        let mut accum: u64 = 0;
        let mut overflowed = false;
        while let Some(ch) = data.get(pos).filter(|c| c.is_ascii_digit()) {
            let digit = u64::from(ch - b'0');
            match accum.checked_mul(10).and_then(|v| v.checked_add(digit)) {
                Some(v) => accum = v,
                None => overflowed = true,
            }
            pos += 1;
        }
        let Some(&next) = data.get(pos) else {
            return Err(CodecError::Incomplete);
        };

        let as_integer = if overflowed || is_fp_char(next) {
            None
        } else if negative {
            (accum <= 1u64 << 63).then(|| 0u64.wrapping_sub(accum) as i64)
        } else {
            i64::try_from(accum).ok()
        };

        if let Some(value) = as_integer {
            self.pos = pos;
            let name = resolve_name(name, self.name_buffer)?;
            self.callbacks.on_integer_element(name, value)?;
            self.after_callback();
            return Ok(());
        }

        let mut end = start;
        while data.get(end).is_some_and(|c| is_fp_char(*c)) {
            end += 1;
        }
        if end >= data.len() {
            return Err(CodecError::Incomplete);
        }
        let len = end - start;
        if len >= self.string_buffer.len() {
            return Err(CodecError::DataTooLong);
        }
        self.string_buffer[..len].copy_from_slice(&data[start..end]);
        let value = std::str::from_utf8(&self.string_buffer[..len])
            .ok()
            .and_then(|text| text.parse::<f64>().ok())
            .ok_or(CodecError::InvalidCharacter)?;
        self.pos = end;
        let name = resolve_name(name, self.name_buffer)?;
        self.callbacks.on_floating_point_element(name, value)?;
        self.after_callback();
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Literal {
    Boolean(bool),
    Null,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonEncoder;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Bool(Option<String>, bool),
        Float(Option<String>, f64),
        Int(Option<String>, i64),
        Null(Option<String>),
        Str(Option<String>, String),
        Object(Option<String>),
        Array(Option<String>),
        End,
        EndData,
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
    }

    fn owned(name: Option<&str>) -> Option<String> {
        name.map(str::to_string)
    }

    impl DecodeCallbacks for Recorder {
        fn on_boolean_element(&mut self, name: Option<&str>, value: bool) -> Result<(), CodecError> {
            self.events.push(Event::Bool(owned(name), value));
            Ok(())
        }
        fn on_floating_point_element(
            &mut self,
            name: Option<&str>,
            value: f64,
        ) -> Result<(), CodecError> {
            self.events.push(Event::Float(owned(name), value));
            Ok(())
        }
        fn on_integer_element(&mut self, name: Option<&str>, value: i64) -> Result<(), CodecError> {
            self.events.push(Event::Int(owned(name), value));
            Ok(())
        }
        fn on_null_element(&mut self, name: Option<&str>) -> Result<(), CodecError> {
            self.events.push(Event::Null(owned(name)));
            Ok(())
        }
        fn on_string_element(&mut self, name: Option<&str>, value: &str) -> Result<(), CodecError> {
            self.events.push(Event::Str(owned(name), value.to_string()));
            Ok(())
        }
        fn on_begin_object(&mut self, name: Option<&str>) -> Result<(), CodecError> {
            self.events.push(Event::Object(owned(name)));
            Ok(())
        }
        fn on_begin_array(&mut self, name: Option<&str>) -> Result<(), CodecError> {
            self.events.push(Event::Array(owned(name)));
            Ok(())
        }
        fn on_end_container(&mut self) -> Result<(), CodecError> {
            self.events.push(Event::End);
            Ok(())
        }
        fn on_end_data(&mut self) -> Result<(), CodecError> {
            self.events.push(Event::EndData);
            Ok(())
        }
    }

    fn decode_events(data: &[u8]) -> Result<Vec<Event>, DecodeFailure> {
        let mut scratch = [0u8; 1024];
        let mut recorder = Recorder::default();
        decode(data, &mut scratch, &mut recorder)?;
        Ok(recorder.events)
    }

    fn n(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn test_decode_mixed_document() {
        let events =
            decode_events(br#" {"a": [1, -2, 3.5, true, null], "s": "x\ty", "o": {}} "#).unwrap();
        assert_eq!(
            events,
            vec![
                Event::Object(None),
                Event::Array(n("a")),
                Event::Int(None, 1),
                Event::Int(None, -2),
                Event::Float(None, 3.5),
                Event::Bool(None, true),
                Event::Null(None),
                Event::End,
                Event::Str(n("s"), "x\ty".to_string()),
                Event::Object(n("o")),
                Event::End,
                Event::End,
                Event::EndData,
            ]
        );
    }

    #[test]
    fn test_integer_boundaries() {
        let events = decode_events(b"[9223372036854775807, -9223372036854775808, 9223372036854775808]")
            .unwrap();
        assert_eq!(events[1], Event::Int(None, i64::MAX));
        assert_eq!(events[2], Event::Int(None, i64::MIN));
        assert_eq!(events[3], Event::Float(None, 9223372036854775808.0));
    }

    #[test]
    fn test_unicode_escapes() {
        let events = decode_events(br#"["\u00e9\ud83d\ude00\/"]"#).unwrap();
        assert_eq!(events[1], Event::Str(None, "\u{e9}\u{1f600}/".to_string()));
    }

    #[test]
    fn test_invalid_surrogates() {
        let lone_trail = decode_events(br#"["\udc00"]"#).unwrap_err();
        assert_eq!(lone_trail.error, CodecError::InvalidCharacter);
        let unpaired = decode_events(br#"["\ud83dxx"]"#).unwrap_err();
        assert_eq!(unpaired.error, CodecError::InvalidCharacter);
        let bad_hex = decode_events(br#"["\u00g0"]"#).unwrap_err();
        assert_eq!(bad_hex.error, CodecError::InvalidCharacter);
        for input in [&br#"["\ud83d"]"#[..], br#"["\ud83d\ude"]"#, br#"["\u12"]"#] {
            let failure = decode_events(input).unwrap_err();
            assert_eq!(failure.error, CodecError::InvalidCharacter, "{input:?}");
        }
    }

    #[test]
    fn test_truncated_input() {
        for input in [
            &b"{\"a\": [1, 2"[..],
            b"{\"a\"",
            b"[\"abc",
            b"[tru",
            b"[12",
            br#"["\ud83d"#,
            br#"["\ud83d\ude0"#,
        ] {
            let failure = decode_events(input).unwrap_err();
            assert_eq!(failure.error, CodecError::Incomplete, "{input:?}");
        }
    }

    #[test]
    fn test_invalid_tokens() {
        for input in [&b"{\"a\" 1}"[..], b"[-x]", b"[fals3]", b"@"] {
            let failure = decode_events(input).unwrap_err();
            assert_eq!(failure.error, CodecError::InvalidCharacter, "{input:?}");
        }
    }

    #[test]
    fn test_string_too_long_for_scratch() {
        let mut scratch = [0u8; 16];
        let mut recorder = Recorder::default();
        let failure = decode(br#"["0123456789abcdef"]"#, &mut scratch, &mut recorder).unwrap_err();
        assert_eq!(failure.error, CodecError::DataTooLong);
    }

    #[test]
    fn test_nesting_depth_limit() {
        let mut deep = vec![b'['; MAX_CONTAINER_DEPTH + 1];
        deep.extend(vec![b']'; MAX_CONTAINER_DEPTH + 1]);
        let failure = decode_events(&deep).unwrap_err();
        assert_eq!(failure.error, CodecError::DataTooLong);

        let mut ok = vec![b'['; MAX_CONTAINER_DEPTH];
        ok.extend(vec![b']'; MAX_CONTAINER_DEPTH]);
        assert!(decode_events(&ok).is_ok());
    }

    #[test]
    fn test_decode_from_small_stream_window() {
        let mut encoder = JsonEncoder::new(Vec::new(), false);
        encoder.begin_object(None).unwrap();
        encoder.begin_array(Some("values")).unwrap();
        for i in 0..200 {
            encoder.add_integer_element(None, i).unwrap();
        }
        encoder.end_encode().unwrap();
        let bytes = encoder.into_sink();

        let mut reader = std::io::Cursor::new(bytes.clone());
        let mut window = [0u8; 64];
        let mut names = [0u8; 32];
        let mut strings = [0u8; 32];
        let mut recorder = Recorder::default();
        decode_file(&mut reader, &mut window, &mut names, &mut strings, &mut recorder).unwrap();
        assert_eq!(recorder.events, decode_events(&bytes).unwrap());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn fuzz_encode_then_decode() {
        let clean = |s: &str| s.chars().filter(|c| *c >= ' ').collect::<String>();
        bolero::check!()
            .with_type::<Vec<(String, u8, i64, String, Vec<i32>)>>()
            .for_each(|members| {
                let mut encoder = JsonEncoder::new(Vec::new(), false);
                encoder.begin_object(None).unwrap();
                let mut expected = vec![Event::Object(None)];
                for (name, kind, int, text, items) in members {
                    let name = clean(name);
                    let name = Some(name.as_str());
                    match kind % 5 {
                        0 => {
                            encoder.add_boolean_element(name, *int > 0).unwrap();
                            expected.push(Event::Bool(owned(name), *int > 0));
                        }
                        1 => {
                            encoder.add_integer_element(name, *int).unwrap();
                            expected.push(Event::Int(owned(name), *int));
                        }
                        2 => {
                            let text = clean(text);
                            encoder.add_string_element(name, Some(&text)).unwrap();
                            expected.push(Event::Str(owned(name), text));
                        }
                        3 => {
                            encoder.add_null_element(name).unwrap();
                            expected.push(Event::Null(owned(name)));
                        }
                        _ => {
                            encoder.begin_array(name).unwrap();
                            expected.push(Event::Array(owned(name)));
                            for item in items {
                                encoder.add_integer_element(None, i64::from(*item)).unwrap();
                                expected.push(Event::Int(None, i64::from(*item)));
                            }
                            encoder.end_container().unwrap();
                            expected.push(Event::End);
                        }
                    }
                }
                encoder.end_encode().unwrap();
                expected.push(Event::End);
                expected.push(Event::EndData);

                let bytes = encoder.into_sink();
                let mut scratch = vec![0u8; bytes.len() * 4 + 64];
                let mut recorder = Recorder::default();
                decode(&bytes, &mut scratch, &mut recorder).unwrap();
                assert_eq!(recorder.events, expected);
            });
    }
}
