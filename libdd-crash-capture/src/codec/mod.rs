// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming JSON codec used to write reports from a crashed process and to
//! transform them afterwards.
//!
//! The encoder never allocates: output goes straight to a [`JsonSink`] and
//! numbers are formatted into stack buffers. The decoder is a single pass
//! recursive descent parser that reports every element through
//! [`DecodeCallbacks`] using caller supplied scratch space.

mod decoder;
mod embed;
mod encoder;

pub use decoder::{decode, decode_file, DecodeCallbacks, DecodeFailure};
pub use embed::{add_json_element, add_json_file_verbatim, add_json_from_file, EmbedError};
pub use encoder::JsonEncoder;

/// Deepest container nesting the encoder and decoder accept.
pub const MAX_CONTAINER_DEPTH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid character")]
    InvalidCharacter,
    #[error("Data too long")]
    DataTooLong,
    #[error("Cannot add data")]
    CannotAddData,
    #[error("Incomplete data")]
    Incomplete,
    #[error("Invalid data")]
    InvalidData,
}

/// Destination for encoded bytes.
///
/// Implementations used from a crash handler must not allocate.
pub trait JsonSink {
    fn add_data(&mut self, data: &[u8]) -> Result<(), CodecError>;

    /// Pushes buffered bytes to their destination.
    fn flush(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

impl<S: JsonSink + ?Sized> JsonSink for &mut S {
    fn add_data(&mut self, data: &[u8]) -> Result<(), CodecError> {
        (**self).add_data(data)
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        (**self).flush()
    }
}

/// Growable sink, only for use outside of the crash path.
impl JsonSink for Vec<u8> {
    fn add_data(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.extend_from_slice(data);
        Ok(())
    }
}
