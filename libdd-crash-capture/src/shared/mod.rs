// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Building blocks shared by the collector, the monitors and the report writer.

pub mod buffered_io;
pub mod configuration;
pub mod console_log;
pub mod file_utils;
pub mod fixed_buf;
pub(crate) mod sync;

#[cfg(not(feature = "benchmarking"))]
pub(crate) mod constants;

#[cfg(feature = "benchmarking")]
pub mod constants;
