// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Everything that turns a captured event into a file on disk and back.

pub mod fixup;
pub mod introspection;
pub mod standard;
pub mod store;
pub mod writer;

pub use standard::{write_recrash_report, write_standard_report, ReportSettings, UserSectionCallback};
pub use store::{ReportStore, StoreError};
pub use writer::{JsonReportWriter, ReportWriter};

use crate::codec::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Could not write report file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Report was written with errors: {0}")]
    Encode(#[from] CodecError),
    #[error("Report path is too long")]
    PathTooLong,
}
