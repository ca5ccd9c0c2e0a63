// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads of arbitrary addresses that fail instead of faulting.
//!
//! `process_vm_readv` on our own pid is used when available. Kernels or
//! sandboxes that refuse it fall back to pushing the bytes through a pipe,
//! which also reports `EFAULT` rather than raising `SIGSEGV`.

use std::sync::atomic::{AtomicBool, Ordering};

static VM_READV_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

const PIPE_CHUNK: usize = 4096;

fn copy_with_vm_readv(src: usize, dst: &mut [u8]) -> Option<bool> {
    let local = libc::iovec {
        iov_base: dst.as_mut_ptr() as *mut libc::c_void,
        iov_len: dst.len(),
    };
    let remote = libc::iovec {
        iov_base: src as *mut libc::c_void,
        iov_len: dst.len(),
    };
    // SAFETY: `local` covers memory we own; the kernel validates `remote`.
    let copied = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if copied < 0 {
        let err = errno::errno().0;
        if err == libc::ENOSYS || err == libc::EPERM {
            VM_READV_UNAVAILABLE.store(true, Ordering::Relaxed);
            return None;
        }
        return Some(false);
    }
    Some(copied as usize == dst.len())
}

fn copy_with_pipe(src: usize, dst: &mut [u8]) -> bool {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return false;
    }
    let mut ok = true;
    let mut offset = 0;
    while ok && offset < dst.len() {
        let count = (dst.len() - offset).min(PIPE_CHUNK);
        // SAFETY: the kernel checks the source range and fails with EFAULT.
        let written =
            unsafe { libc::write(fds[1], (src + offset) as *const libc::c_void, count) };
        if written != count as isize {
            ok = false;
            break;
        }
        // SAFETY: `dst[offset..offset + count]` is writable.
        let read = unsafe {
            libc::read(
                fds[0],
                dst[offset..].as_mut_ptr() as *mut libc::c_void,
                count,
            )
        };
        if read != count as isize {
            ok = false;
        }
        offset += count;
    }
    // SAFETY: both descriptors were opened above.
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
    ok
}

/// Copies `dst.len()` bytes starting at `src`. Returns false when any part of
/// the range is unreadable.
///
/// Async-signal-safe.
pub fn copy_safely(src: usize, dst: &mut [u8]) -> bool {
    if dst.is_empty() {
        return true;
    }
    if src == 0 || src.checked_add(dst.len()).is_none() {
        return false;
    }
    if !VM_READV_UNAVAILABLE.load(Ordering::Relaxed) {
        if let Some(result) = copy_with_vm_readv(src, dst) {
            return result;
        }
    }
    copy_with_pipe(src, dst)
}

/// Copies as many leading bytes of the range as are readable, narrowing the
/// attempted length by halves after each failure.
pub fn copy_max_possible(src: usize, dst: &mut [u8]) -> usize {
    if dst.is_empty() || !copy_safely(src, &mut dst[..1]) {
        return 0;
    }
    let total = dst.len();
    let mut copied = 0;
    let mut limit = total;
    let mut attempt = total;
    while copied < total {
        let length = attempt - copied;
        if length == 0 {
            break;
        }
        if copy_safely(src + copied, &mut dst[copied..attempt]) {
            copied = attempt;
            attempt = copied + (limit - copied) / 2;
            if attempt == copied && copied < limit {
                attempt = copied + 1;
            }
        } else {
            if length <= 1 {
                break;
            }
            limit = attempt;
            attempt = copied + length / 2;
        }
    }
    copied
}

pub fn is_memory_readable(address: usize, length: usize) -> bool {
    let mut buffer = [0u8; 256];
    let mut offset = 0;
    while offset < length {
        let count = (length - offset).min(buffer.len());
        if !copy_safely(address + offset, &mut buffer[..count]) {
            return false;
        }
        offset += count;
    }
    true
}

/// Reads one pointer-sized word.
pub fn read_word(address: usize) -> Option<usize> {
    let mut bytes = [0u8; std::mem::size_of::<usize>()];
    copy_safely(address, &mut bytes).then(|| usize::from_ne_bytes(bytes))
}
