// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory around the crashed thread: a raw dump of the stack near its stack
//! pointer, and the values in registers and stack slots that point at
//! something readable.

use super::writer::ReportWriter;
use crate::collector::cpu::{CpuState, STACK_GROW_DIRECTION};
use crate::collector::memory::{copy_max_possible, copy_safely, read_word};
use crate::shared::fixed_buf::FixedBuf;
use std::fmt::Write as _;

const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Slots dumped on the side the stack grows to, and on the other side.
const STACK_CONTENTS_PUSHED_DISTANCE: usize = 20;
const STACK_CONTENTS_POPPED_DISTANCE: usize = 10;
const STACK_CONTENTS_TOTAL_DISTANCE: usize =
    STACK_CONTENTS_PUSHED_DISTANCE + STACK_CONTENTS_POPPED_DISTANCE;

/// Slots examined for notable values on each side of the stack pointer.
const NOTABLE_STACK_BACK_DISTANCE: usize = 20;
const NOTABLE_STACK_FORWARD_DISTANCE: usize = 10;

const MIN_STRING_LENGTH: usize = 4;
const MAX_STRING_LENGTH: usize = 500;

/// The address range `distance_pushed` slots into the stack's growth and
/// `distance_popped` slots back from `stack_pointer`, lowest first.
fn stack_range(stack_pointer: usize, distance_pushed: usize, distance_popped: usize) -> (usize, usize) {
    let pushed = (distance_pushed * WORD_SIZE) as isize * STACK_GROW_DIRECTION;
    let popped = (distance_popped * WORD_SIZE) as isize * -STACK_GROW_DIRECTION;
    let a = stack_pointer.wrapping_add_signed(pushed);
    let b = stack_pointer.wrapping_add_signed(popped);
    (a.min(b), a.max(b))
}

/// Writes the raw bytes around the stack pointer.
pub fn write_stack_contents(
    writer: &mut dyn ReportWriter,
    name: &str,
    cpu: &CpuState,
    is_stack_overflow: bool,
) {
    let stack_pointer = cpu.stack_pointer();
    if stack_pointer == 0 {
        return;
    }
    let (low, high) = stack_range(
        stack_pointer,
        STACK_CONTENTS_PUSHED_DISTANCE,
        STACK_CONTENTS_POPPED_DISTANCE,
    );

    writer.begin_object(Some(name));
    writer.add_string_element(
        Some("grow_direction"),
        Some(if STACK_GROW_DIRECTION > 0 { "+" } else { "-" }),
    );
    writer.add_uinteger_element(Some("dump_start"), low as u64);
    writer.add_uinteger_element(Some("dump_end"), high as u64);
    writer.add_uinteger_element(Some("stack_pointer"), stack_pointer as u64);
    writer.add_boolean_element(Some("overflow"), is_stack_overflow);
    let mut contents = [0u8; STACK_CONTENTS_TOTAL_DISTANCE * WORD_SIZE];
    let length = (high - low).min(contents.len());
    if copy_safely(low, &mut contents[..length]) {
        writer.add_data_element(Some("contents"), &contents[..length]);
    } else {
        writer.add_string_element(Some("error"), Some("Stack contents not accessible"));
    }
    writer.end_container();
}

/// Copies the NUL-terminated string at `address` into `buffer` if it is
/// valid printable UTF-8 of a plausible length.
fn string_at(address: usize, buffer: &mut [u8; MAX_STRING_LENGTH]) -> Option<&str> {
    if address == 0 {
        return None;
    }
    let copied = copy_max_possible(address, buffer);
    let length = buffer[..copied].iter().position(|&c| c == 0)?;
    if length < MIN_STRING_LENGTH {
        return None;
    }
    let text = std::str::from_utf8(&buffer[..length]).ok()?;
    text.chars()
        .all(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .then_some(text)
}

fn write_memory_contents_if_notable(writer: &mut dyn ReportWriter, name: &str, address: usize) {
    let mut buffer = [0u8; MAX_STRING_LENGTH];
    let Some(text) = string_at(address, &mut buffer) else {
        return;
    };
    writer.begin_object(Some(name));
    writer.add_uinteger_element(Some("address"), address as u64);
    writer.add_string_element(Some("type"), Some("string"));
    writer.add_string_element(Some("value"), Some(text));
    writer.end_container();
}

/// Writes every register or nearby stack slot that points at a string.
pub fn write_notable_addresses(writer: &mut dyn ReportWriter, name: &str, cpu: &CpuState) {
    writer.begin_object(Some(name));
    for (register, value) in cpu.registers() {
        write_memory_contents_if_notable(writer, register, value as usize);
    }

    let stack_pointer = cpu.stack_pointer();
    if stack_pointer != 0 {
        let (low, high) = stack_range(
            stack_pointer,
            NOTABLE_STACK_BACK_DISTANCE,
            NOTABLE_STACK_FORWARD_DISTANCE,
        );
        let mut slot_name = FixedBuf::<32>::new();
        for address in (low..high).step_by(WORD_SIZE) {
            let Some(value) = read_word(address) else {
                continue;
            };
            slot_name.clear();
            let _ = write!(slot_name, "stack@{address:#x}");
            write_memory_contents_if_notable(writer, slot_name.as_str(), value);
        }
    }
    writer.end_container();
}
