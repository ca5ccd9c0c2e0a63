// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Low level capture of process state: registers, threads, stacks and
//! loaded images. Everything reachable from a signal handler here avoids
//! locks and heap allocation.

pub mod binary_images;
pub mod cached_data;
pub mod cpu;
pub mod machine_context;
pub mod memory;
pub mod signal_handler_manager;
pub mod signal_names;
pub mod stack_cursor;
pub mod symbolicator;
pub mod thread_suspend;

pub use cached_data::CachedData;
pub use machine_context::MachineContext;
pub use stack_cursor::{StackCursor, StackEntry};
pub use symbolicator::{DladdrSymbolicator, Symbolicator};
