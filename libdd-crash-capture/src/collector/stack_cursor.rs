// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Iterators producing one backtrace frame per step.
//!
//! A cursor walks one of three frame sources: the frame-pointer chain of a
//! captured machine context, an already captured address array, or the
//! current thread's own stack. Addresses are raw; symbolication is a
//! separate optional step.

use super::cpu::{normalise_instruction_pointer, CpuState};
use super::memory::copy_safely;
use super::symbolicator::{DladdrSymbolicator, Symbolicator};
use std::ffi::CStr;

/// The max depth to search before giving up.
pub const MAX_STACK_DEPTH: usize = 500;

/// Point at which to give up walking a stack and consider it a stack overflow.
pub const STACK_OVERFLOW_THRESHOLD: usize = 150;

/// Maximum number of frames captured for the current thread.
pub const MAX_BACKTRACE_FRAMES: usize = 128;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StackEntry {
    /// Current address in the stack trace.
    pub address: usize,
    /// The binary image the address falls inside, if known.
    pub image_name: Option<&'static CStr>,
    pub image_address: usize,
    /// The closest symbol preceding the address, if known.
    pub symbol_name: Option<&'static CStr>,
    pub symbol_address: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    /// Number of frames produced so far.
    pub current_depth: usize,
    /// Set once the depth limit was hit.
    pub has_given_up: bool,
}

/// Something that yields raw frame addresses.
pub trait FrameSource {
    /// Produces the address at `depth`, or `None` once exhausted.
    fn next_frame(&mut self, depth: usize) -> Option<usize>;
    fn reset(&mut self);
}

/// Two words pushed by a standard function prologue.
#[derive(Debug, Default, Clone, Copy)]
struct FrameEntry {
    previous: usize,
    return_address: usize,
}

/// Walks the frame-pointer chain of a register snapshot.
#[derive(Debug, Clone, Copy)]
pub struct MachineContextWalk {
    cpu: CpuState,
    current_frame: FrameEntry,
    instruction_address: usize,
    link_register: usize,
    is_past_frame_pointer: bool,
}

impl MachineContextWalk {
    pub fn new(cpu: CpuState) -> Self {
        Self {
            cpu,
            current_frame: FrameEntry::default(),
            instruction_address: 0,
            link_register: 0,
            is_past_frame_pointer: false,
        }
    }

    fn read_frame(address: usize) -> Option<FrameEntry> {
        const WORD: usize = std::mem::size_of::<usize>();
        let mut bytes = [0u8; 2 * WORD];
        if !copy_safely(address, &mut bytes) {
            return None;
        }
        let mut previous = [0u8; WORD];
        let mut return_address = [0u8; WORD];
        previous.copy_from_slice(&bytes[..WORD]);
        return_address.copy_from_slice(&bytes[WORD..]);
        Some(FrameEntry {
            previous: usize::from_ne_bytes(previous),
            return_address: usize::from_ne_bytes(return_address),
        })
    }
}

impl FrameSource for MachineContextWalk {
    fn next_frame(&mut self, depth: usize) -> Option<usize> {
        if self.instruction_address == 0 && depth == 0 {
            self.instruction_address = self.cpu.instruction_address();
            return Some(normalise_instruction_pointer(self.instruction_address));
        }

        // The link register, if the architecture has one, is the second address.
        if self.link_register == 0 && !self.is_past_frame_pointer {
            self.link_register = self.cpu.link_register();
            if self.link_register != 0 {
                return Some(normalise_instruction_pointer(self.link_register));
            }
        }

        if self.current_frame.previous == 0 {
            if self.is_past_frame_pointer {
                return None;
            }
            self.current_frame.previous = self.cpu.frame_pointer();
            self.is_past_frame_pointer = true;
        }

        let frame = Self::read_frame(self.current_frame.previous)?;
        self.current_frame = frame;
        if frame.previous == 0 || frame.return_address == 0 {
            return None;
        }
        Some(normalise_instruction_pointer(frame.return_address))
    }

    fn reset(&mut self) {
        self.current_frame = FrameEntry::default();
        self.instruction_address = 0;
        self.link_register = 0;
        self.is_past_frame_pointer = false;
    }
}

/// Indexes into an already captured address array.
#[derive(Debug, Clone, Copy)]
pub struct BacktraceWalk<'a> {
    addresses: &'a [usize],
    skip_entries: usize,
}

impl<'a> BacktraceWalk<'a> {
    pub fn new(addresses: &'a [usize], skip_entries: usize) -> Self {
        Self {
            addresses,
            skip_entries,
        }
    }
}

impl FrameSource for BacktraceWalk<'_> {
    fn next_frame(&mut self, depth: usize) -> Option<usize> {
        self.addresses.get(self.skip_entries + depth).copied()
    }

    fn reset(&mut self) {}
}

/// The current thread's stack, captured once into a fixed array.
#[derive(Debug, Clone, Copy)]
pub struct SelfThreadWalk {
    addresses: [usize; MAX_BACKTRACE_FRAMES],
    length: usize,
    skip_entries: usize,
}

impl SelfThreadWalk {
    /// Captures the caller's stack. `skip_entries` hides that many frames
    /// above the caller.
    #[inline(never)]
    pub fn capture(skip_entries: usize) -> Self {
        let mut addresses = [0usize; MAX_BACKTRACE_FRAMES];
        let mut length = 0;
        // SAFETY: we do not resolve symbols, only read instruction pointers.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                addresses[length] = frame.ip() as usize;
                length += 1;
                length < MAX_BACKTRACE_FRAMES
            });
        }
        Self {
            addresses,
            length,
            skip_entries,
        }
    }

    pub fn addresses(&self) -> &[usize] {
        let start = self.skip_entries.min(self.length);
        &self.addresses[start..self.length]
    }
}

impl FrameSource for SelfThreadWalk {
    fn next_frame(&mut self, depth: usize) -> Option<usize> {
        self.addresses().get(depth).copied()
    }

    fn reset(&mut self) {}
}

/// Frame sources a cursor can walk.
#[derive(Debug, Clone, Copy)]
pub enum CursorKind<'a> {
    Empty,
    MachineContext(MachineContextWalk),
    Backtrace(BacktraceWalk<'a>),
    SelfThread(SelfThreadWalk),
}

impl FrameSource for CursorKind<'_> {
    fn next_frame(&mut self, depth: usize) -> Option<usize> {
        match self {
            CursorKind::Empty => None,
            CursorKind::MachineContext(walk) => walk.next_frame(depth),
            CursorKind::Backtrace(walk) => walk.next_frame(depth),
            CursorKind::SelfThread(walk) => walk.next_frame(depth),
        }
    }

    fn reset(&mut self) {
        match self {
            CursorKind::Empty => {}
            CursorKind::MachineContext(walk) => walk.reset(),
            CursorKind::Backtrace(walk) => walk.reset(),
            CursorKind::SelfThread(walk) => walk.reset(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct StackCursor<'a> {
    pub stack_entry: StackEntry,
    pub state: CursorState,
    kind: CursorKind<'a>,
    max_depth: usize,
    is_exhausted: bool,
    symbolicator: &'a dyn Symbolicator,
}

impl std::fmt::Debug for StackCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackCursor")
            .field("stack_entry", &self.stack_entry)
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl<'a> StackCursor<'a> {
    pub fn new(kind: CursorKind<'a>, max_depth: usize) -> Self {
        Self {
            stack_entry: StackEntry::default(),
            state: CursorState::default(),
            kind,
            max_depth,
            is_exhausted: false,
            symbolicator: &DladdrSymbolicator,
        }
    }

    /// A cursor that never produces a frame.
    pub fn empty() -> Self {
        Self::new(CursorKind::Empty, 0)
    }

    pub fn with_machine_context(cpu: CpuState, max_depth: usize) -> Self {
        Self::new(CursorKind::MachineContext(MachineContextWalk::new(cpu)), max_depth)
    }

    pub fn with_backtrace(addresses: &'a [usize], skip_entries: usize) -> Self {
        Self::new(
            CursorKind::Backtrace(BacktraceWalk::new(addresses, skip_entries)),
            MAX_STACK_DEPTH,
        )
    }

    /// Captures the calling thread. `skip_entries` hides that many frames
    /// above the caller.
    #[inline(never)]
    pub fn with_self_thread(skip_entries: usize) -> Self {
        Self::new(
            CursorKind::SelfThread(SelfThreadWalk::capture(skip_entries + 1)),
            MAX_STACK_DEPTH,
        )
    }

    pub fn with_symbolicator(mut self, symbolicator: &'a dyn Symbolicator) -> Self {
        self.symbolicator = symbolicator;
        self
    }

    /// Moves to the next frame. Once this returned false it keeps returning
    /// false until [`StackCursor::reset`].
    pub fn advance(&mut self) -> bool {
        if self.is_exhausted || self.state.has_given_up {
            return false;
        }
        if self.state.current_depth >= self.max_depth {
            self.state.has_given_up = true;
            return false;
        }
        match self.kind.next_frame(self.state.current_depth) {
            Some(address) => {
                self.stack_entry = StackEntry {
                    address,
                    ..Default::default()
                };
                self.state.current_depth += 1;
                true
            }
            None => {
                self.is_exhausted = true;
                false
            }
        }
    }

    pub fn reset(&mut self) {
        self.stack_entry = StackEntry::default();
        self.state = CursorState::default();
        self.is_exhausted = false;
        self.kind.reset();
    }

    /// Fills in the image and symbol of the current entry.
    pub fn symbolicate(&mut self) -> bool {
        self.symbolicator.symbolicate(&mut self.stack_entry)
    }

    /// Walks the whole stack (up to the overflow threshold) and reports
    /// whether the walk had to give up.
    pub fn is_stack_overflow(&self) -> bool {
        let mut scout = *self;
        scout.max_depth = STACK_OVERFLOW_THRESHOLD;
        scout.reset();
        while scout.advance() {}
        scout.state.has_given_up
    }
}
