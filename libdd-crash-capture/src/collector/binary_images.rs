// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loaded ELF objects, enumerated through `dl_iterate_phdr`.

use super::memory::copy_safely;
use libc::{c_int, c_void, dl_phdr_info};
use std::ffi::CStr;

const NT_GNU_BUILD_ID: u32 = 3;
pub const MAX_BUILD_ID_LENGTH: usize = 32;

#[cfg(target_arch = "x86_64")]
pub const CPU_TYPE: i32 = 62; // EM_X86_64
#[cfg(target_arch = "aarch64")]
pub const CPU_TYPE: i32 = 183; // EM_AARCH64
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const CPU_TYPE: i32 = 0;

pub const CPU_SUBTYPE: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryImage {
    /// Address the first segment is loaded at.
    pub address: usize,
    /// Link-time address of the first segment.
    pub vm_address: usize,
    /// Span of all loadable segments.
    pub size: usize,
    /// Path of the object; `None` for the main executable.
    pub name: Option<&'static CStr>,
    build_id: [u8; MAX_BUILD_ID_LENGTH],
    build_id_length: usize,
    pub major_version: u64,
    pub minor_version: u64,
    pub revision_version: u64,
}

impl BinaryImage {
    /// The GNU build id, if the object carries one.
    pub fn build_id(&self) -> Option<&[u8]> {
        (self.build_id_length > 0).then(|| &self.build_id[..self.build_id_length])
    }

    pub fn cpu_type(&self) -> i32 {
        CPU_TYPE
    }

    pub fn cpu_subtype(&self) -> i32 {
        CPU_SUBTYPE
    }
}

/// Extracts `X.Y.Z` from a name ending in `.so.X.Y.Z`. Missing parts are 0.
pub fn versions_from_name(name: &[u8]) -> (u64, u64, u64) {
    let marker = b".so.";
    let start = match name.windows(marker.len()).rposition(|w| w == marker) {
        Some(index) => index + marker.len(),
        None => return (0, 0, 0),
    };
    let mut parts = [0u64; 3];
    for (slot, part) in parts.iter_mut().zip(name[start..].split(|&c| c == b'.')) {
        let mut value = 0u64;
        for &c in part {
            if !c.is_ascii_digit() {
                break;
            }
            value = value.saturating_mul(10).saturating_add((c - b'0') as u64);
        }
        *slot = value;
    }
    (parts[0], parts[1], parts[2])
}

/// Walks the notes in `[start, start + length)` looking for the GNU build id.
fn read_build_id(start: usize, length: usize, dst: &mut [u8; MAX_BUILD_ID_LENGTH]) -> usize {
    let align4 = |n: usize| (n + 3) & !3;
    let mut offset = 0;
    while offset + 12 <= length {
        let mut header = [0u8; 12];
        if !copy_safely(start + offset, &mut header) {
            return 0;
        }
        let word = |i: usize| {
            u32::from_ne_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]) as usize
        };
        let (name_size, desc_size, note_type) = (word(0), word(4), word(8) as u32);
        let name_start = start + offset + 12;
        let desc_start = name_start + align4(name_size);
        if note_type == NT_GNU_BUILD_ID && name_size == 4 {
            let mut name = [0u8; 4];
            if copy_safely(name_start, &mut name) && &name == b"GNU\0" {
                let count = desc_size.min(MAX_BUILD_ID_LENGTH);
                return if copy_safely(desc_start, &mut dst[..count]) {
                    count
                } else {
                    0
                };
            }
        }
        offset += 12 + align4(name_size) + align4(desc_size);
    }
    0
}

/// # Safety
/// `info` must come from `dl_iterate_phdr`.
unsafe fn image_from_phdr_info(info: &dl_phdr_info) -> BinaryImage {
    let base = info.dlpi_addr as usize;
    let headers = if info.dlpi_phdr.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
    };

    let mut low = usize::MAX;
    let mut high = 0usize;
    let mut build_id = [0u8; MAX_BUILD_ID_LENGTH];
    let mut build_id_length = 0;
    for header in headers {
        if header.p_type == libc::PT_LOAD {
            let start = header.p_vaddr as usize;
            low = low.min(start);
            high = high.max(start + header.p_memsz as usize);
        } else if header.p_type == libc::PT_NOTE && build_id_length == 0 {
            build_id_length = read_build_id(
                base + header.p_vaddr as usize,
                header.p_memsz as usize,
                &mut build_id,
            );
        }
    }
    if low == usize::MAX {
        low = 0;
    }

    let name = if info.dlpi_name.is_null() {
        None
    } else {
        Some(CStr::from_ptr(info.dlpi_name)).filter(|n| !n.is_empty())
    };
    let (major_version, minor_version, revision_version) =
        name.map_or((0, 0, 0), |n| versions_from_name(n.to_bytes()));

    BinaryImage {
        address: base + low,
        vm_address: low,
        size: high.saturating_sub(low),
        name,
        build_id,
        build_id_length,
        major_version,
        minor_version,
        revision_version,
    }
}

unsafe extern "C" fn visit(info: *mut dl_phdr_info, _size: usize, data: *mut c_void) -> c_int {
    let visitor = &mut *(data as *mut &mut dyn FnMut(&BinaryImage) -> bool);
    if info.is_null() {
        return 0;
    }
    let image = image_from_phdr_info(&*info);
    if visitor(&image) {
        0
    } else {
        1
    }
}

/// Calls `visitor` for every loaded object until it returns false.
pub fn for_each_image(mut visitor: impl FnMut(&BinaryImage) -> bool) {
    let mut visitor: &mut dyn FnMut(&BinaryImage) -> bool = &mut visitor;
    // SAFETY: `visit` only casts `data` back to the trait object passed here.
    unsafe {
        libc::dl_iterate_phdr(
            Some(visit),
            &mut visitor as *mut &mut dyn FnMut(&BinaryImage) -> bool as *mut c_void,
        );
    }
}

pub fn image_count() -> usize {
    let mut count = 0;
    for_each_image(|_| {
        count += 1;
        true
    });
    count
}

/// The image containing `address`, if any.
pub fn image_containing(address: usize) -> Option<BinaryImage> {
    let mut found = None;
    for_each_image(|image| {
        if address >= image.address && address < image.address + image.size {
            found = Some(*image);
            return false;
        }
        true
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_from_name() {
        assert_eq!(versions_from_name(b"/lib/libssl.so.3"), (3, 0, 0));
        assert_eq!(versions_from_name(b"/lib/libz.so.1.2.13"), (1, 2, 13));
        assert_eq!(versions_from_name(b"/lib/libc.so"), (0, 0, 0));
        assert_eq!(versions_from_name(b"app"), (0, 0, 0));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_images_enumerated() {
        assert!(image_count() > 0);
        let mut saw_main = false;
        for_each_image(|image| {
            saw_main |= image.name.is_none();
            assert!(image.build_id().map_or(true, |id| !id.is_empty()));
            true
        });
        assert!(saw_main);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_image_containing_code() {
        let here = test_image_containing_code as usize;
        let image = image_containing(here).unwrap();
        assert!(image.address <= here && here < image.address + image.size);
        assert_eq!(image.cpu_type(), CPU_TYPE);
    }

    #[test]
    fn test_stop_early() {
        let mut visited = 0;
        for_each_image(|_| {
            visited += 1;
            false
        });
        assert!(visited <= 1);
    }
}
