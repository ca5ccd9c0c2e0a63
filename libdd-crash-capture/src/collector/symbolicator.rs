// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::stack_cursor::StackEntry;
use std::ffi::CStr;

/// Fills in the image and symbol fields of a stack entry.
///
/// Failing to symbolicate is not an error; the fields simply stay absent.
pub trait Symbolicator: Send + Sync {
    fn symbolicate(&self, entry: &mut StackEntry) -> bool;
}

/// Looks addresses up in the dynamic loader's tables with `dladdr`.
///
/// Names point into the loader's own memory and stay valid as long as the
/// owning object is loaded, which for a crash report is the rest of the
/// process lifetime.
#[derive(Debug, Default, Clone, Copy)]
pub struct DladdrSymbolicator;

/// Return addresses point after the call; step back into the call
/// instruction so the lookup lands in the caller.
pub fn call_instruction_from_return_address(address: usize) -> usize {
    address.saturating_sub(1)
}

impl Symbolicator for DladdrSymbolicator {
    fn symbolicate(&self, entry: &mut StackEntry) -> bool {
        if entry.address == 0 {
            return false;
        }
        let lookup = call_instruction_from_return_address(entry.address);
        // SAFETY: zeroed Dl_info is a valid out parameter.
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        // SAFETY: dladdr only inspects the loader's tables.
        if unsafe { libc::dladdr(lookup as *const libc::c_void, &mut info) } == 0 {
            return false;
        }
        entry.image_address = info.dli_fbase as usize;
        entry.image_name = to_static_cstr(info.dli_fname);
        entry.symbol_address = info.dli_saddr as usize;
        entry.symbol_name = to_static_cstr(info.dli_sname);
        true
    }
}

fn to_static_cstr(name: *const libc::c_char) -> Option<&'static CStr> {
    if name.is_null() {
        return None;
    }
    // SAFETY: the loader keeps the string alive while the object is loaded.
    Some(unsafe { CStr::from_ptr(name) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn some_function() {}

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_dladdr_finds_image() {
        let mut entry = StackEntry {
            address: some_function as usize + 1,
            ..Default::default()
        };
        assert!(DladdrSymbolicator.symbolicate(&mut entry));
        assert!(entry.image_address != 0);
        assert!(entry.image_name.is_some());
    }

    #[test]
    fn test_null_address() {
        let mut entry = StackEntry::default();
        assert!(!DladdrSymbolicator.symbolicate(&mut entry));
        assert!(entry.image_name.is_none());
    }
}
