// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread enumeration, suspension and resumption on Linux.
//!
//! Linux has no `thread_suspend`, so every other thread is sent a real-time
//! "park" signal. Its handler stores the thread's registers into a slot and
//! sleeps until the resume generation changes. Everything here is built from
//! atomics, raw syscalls and fixed arrays so it can run inside a crash
//! handler.

use super::cpu::CpuState;
use crate::shared::fixed_buf::FixedBuf;
use libc::{c_int, c_void, pid_t, siginfo_t};
use std::cell::UnsafeCell;
use std::fmt::Write;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize};
use tracing::error;

pub const MAX_THREADS: usize = 512;
pub const MAX_RESERVED_THREADS: usize = 10;

// Upper bound on the wait for parked threads to acknowledge, in polls.
const ACK_POLLS: u32 = 2000;
const ACK_POLL_INTERVAL_NS: i64 = 100_000;

struct Slot {
    tid: AtomicI32,
    parked: AtomicBool,
    acked: AtomicBool,
    has_state: AtomicBool,
    state: UnsafeCell<MaybeUninit<CpuState>>,
}

// SAFETY: `state` is written only by the thread owning the slot, before it
// publishes `acked`, and read only after `acked` was observed.
unsafe impl Sync for Slot {}

impl Slot {
    const fn new() -> Self {
        Self {
            tid: AtomicI32::new(0),
            parked: AtomicBool::new(false),
            acked: AtomicBool::new(false),
            has_state: AtomicBool::new(false),
            state: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

static SLOTS: [Slot; MAX_THREADS] = [const { Slot::new() }; MAX_THREADS];
static SLOT_COUNT: AtomicUsize = AtomicUsize::new(0);
static SUSPENDED: AtomicBool = AtomicBool::new(false);
static RESUME_GENERATION: AtomicU64 = AtomicU64::new(0);
static PARK_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

static RESERVED: [AtomicI32; MAX_RESERVED_THREADS] =
    [const { AtomicI32::new(0) }; MAX_RESERVED_THREADS];
static RESERVED_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Kernel thread id of the caller.
pub fn current_thread_id() -> pid_t {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as pid_t }
}

/// The signal used to park threads.
pub fn park_signal() -> c_int {
    libc::SIGRTMIN() + 2
}

/// Excludes `tid` from suspension. Returns false when the list is full.
pub fn add_reserved_thread(tid: pid_t) -> bool {
    let index = RESERVED_COUNT.fetch_add(1, SeqCst);
    if index >= MAX_RESERVED_THREADS {
        RESERVED_COUNT.fetch_sub(1, SeqCst);
        error!(
            "Too many reserved threads ({}). Max is {MAX_RESERVED_THREADS}",
            index + 1
        );
        return false;
    }
    RESERVED[index].store(tid, SeqCst);
    true
}

pub fn is_reserved_thread(tid: pid_t) -> bool {
    let count = RESERVED_COUNT.load(SeqCst).min(MAX_RESERVED_THREADS);
    RESERVED[..count].iter().any(|t| t.load(SeqCst) == tid)
}

/// Fills `dst` with the ids of the threads of this process, in directory
/// order. Returns how many were written; the list is cut at `dst.len()`.
pub fn list_threads(dst: &mut [pid_t]) -> usize {
    const PATH: &[u8] = b"/proc/self/task\0";
    // SAFETY: PATH is NUL terminated.
    let fd = unsafe {
        libc::open(
            PATH.as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return 0;
    }
    let mut buffer = [0u8; 4096];
    let mut count = 0;
    'outer: loop {
        // SAFETY: the buffer is writable for its full length.
        let read = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len(),
            )
        };
        if read <= 0 {
            break;
        }
        let mut offset = 0;
        let read = read as usize;
        // struct linux_dirent64 { u64 d_ino; i64 d_off; u16 d_reclen; u8 d_type; char d_name[]; }
        while offset + 19 < read {
            let record_length =
                u16::from_ne_bytes([buffer[offset + 16], buffer[offset + 17]]) as usize;
            if record_length == 0 {
                break;
            }
            let name_end = (offset + record_length).min(read);
            let name = &buffer[offset + 19..name_end];
            if let Some(tid) = parse_tid(name) {
                if count == dst.len() {
                    break 'outer;
                }
                dst[count] = tid;
                count += 1;
            }
            offset += record_length;
        }
    }
    // SAFETY: fd was opened above.
    unsafe { libc::close(fd) };
    count
}

fn parse_tid(name: &[u8]) -> Option<pid_t> {
    let mut value: pid_t = 0;
    let mut digits = 0;
    for &c in name {
        if c == 0 {
            break;
        }
        if !c.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((c - b'0') as pid_t)?;
        digits += 1;
    }
    (digits > 0).then_some(value)
}

/// Reads `/proc/self/task/<tid>/comm` into `buffer`, without allocating.
pub fn thread_name(tid: pid_t, buffer: &mut [u8]) -> Option<&str> {
    let mut path = FixedBuf::<64>::new();
    write!(path, "/proc/self/task/{tid}/comm\0").ok()?;
    // SAFETY: path is NUL terminated.
    let fd = unsafe {
        libc::open(
            path.as_bytes().as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return None;
    }
    let mut length = 0;
    while length < buffer.len() {
        // SAFETY: the destination range is inside `buffer`.
        let read = unsafe {
            libc::read(
                fd,
                buffer[length..].as_mut_ptr() as *mut c_void,
                buffer.len() - length,
            )
        };
        if read <= 0 {
            break;
        }
        length += read as usize;
    }
    // SAFETY: fd was opened above.
    unsafe { libc::close(fd) };
    while length > 0 && (buffer[length - 1] == b'\n' || buffer[length - 1] == 0) {
        length -= 1;
    }
    if length == 0 {
        return None;
    }
    std::str::from_utf8(&buffer[..length]).ok()
}

fn sleep_nanos(nanos: i64) {
    let duration = libc::timespec {
        tv_sec: 0,
        tv_nsec: nanos as _,
    };
    // SAFETY: nanosleep is async-signal-safe.
    unsafe { libc::nanosleep(&duration, std::ptr::null_mut()) };
}

extern "C" fn park_handler(_signum: c_int, _info: *mut siginfo_t, ucontext: *mut c_void) {
    let saved_errno = errno::errno();
    if SUSPENDED.load(SeqCst) {
        let generation = RESUME_GENERATION.load(SeqCst);
        let tid = current_thread_id();
        let count = SLOT_COUNT.load(SeqCst).min(MAX_THREADS);
        if let Some(slot) = SLOTS[..count].iter().find(|s| s.tid.load(SeqCst) == tid) {
            // SAFETY: the kernel hands us a valid ucontext.
            if let Some(state) = unsafe { CpuState::from_ucontext(ucontext as *const _) } {
                // SAFETY: only this thread writes its slot, before `acked`.
                unsafe { (*slot.state.get()).write(state) };
                slot.has_state.store(true, SeqCst);
            }
            slot.acked.store(true, SeqCst);
            while RESUME_GENERATION.load(SeqCst) == generation {
                sleep_nanos(ACK_POLL_INTERVAL_NS);
            }
        }
    }
    errno::set_errno(saved_errno);
}

fn install_park_handler() -> bool {
    if PARK_HANDLER_INSTALLED.load(SeqCst) {
        return true;
    }
    // SAFETY: zeroed sigaction is a valid starting point.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = park_handler as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_ONSTACK;
    // SAFETY: sa_mask is owned by `action`.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    // SAFETY: sigaction is async-signal-safe; the handler lives forever.
    let result = unsafe { libc::sigaction(park_signal(), &action, std::ptr::null_mut()) };
    if result != 0 {
        return false;
    }
    PARK_HANDLER_INSTALLED.store(true, SeqCst);
    true
}

/// Parks every thread except the caller and the reserved threads.
///
/// Returns the number of threads parked, or `None` when this call did not
/// suspend anything: the environment was already suspended or the park
/// handler could not be installed. Only a call that returned `Some` should be
/// paired with [`resume_environment`]. The handler for the park signal stays
/// installed afterwards.
pub fn suspend_environment() -> Option<usize> {
    if SUSPENDED.swap(true, SeqCst) {
        return None;
    }
    if !install_park_handler() {
        SUSPENDED.store(false, SeqCst);
        return None;
    }

    let mut tids = [0 as pid_t; MAX_THREADS];
    let count = list_threads(&mut tids);
    let this_thread = current_thread_id();
    // SAFETY: getpid has no preconditions.
    let pid = unsafe { libc::getpid() };

    for (slot, tid) in SLOTS.iter().zip(&tids[..count]) {
        slot.tid.store(*tid, SeqCst);
        slot.parked.store(false, SeqCst);
        slot.acked.store(false, SeqCst);
        slot.has_state.store(false, SeqCst);
    }
    SLOT_COUNT.store(count, SeqCst);

    let mut parked = 0;
    for slot in &SLOTS[..count] {
        let tid = slot.tid.load(SeqCst);
        if tid == this_thread || is_reserved_thread(tid) {
            continue;
        }
        // SAFETY: tgkill only delivers a signal.
        let sent = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, park_signal()) };
        if sent == 0 {
            slot.parked.store(true, SeqCst);
            parked += 1;
        }
    }

    for _ in 0..ACK_POLLS {
        let pending = SLOTS[..count]
            .iter()
            .any(|s| s.parked.load(SeqCst) && !s.acked.load(SeqCst));
        if !pending {
            break;
        }
        sleep_nanos(ACK_POLL_INTERVAL_NS);
    }
    Some(parked)
}

/// Releases the threads parked by [`suspend_environment`]. Without a prior
/// suspension this does nothing.
pub fn resume_environment() {
    if !SUSPENDED.swap(false, SeqCst) {
        return;
    }
    RESUME_GENERATION.fetch_add(1, SeqCst);
}

pub fn is_suspended() -> bool {
    SUSPENDED.load(SeqCst)
}

/// One thread captured by the last suspension.
#[derive(Debug, Clone, Copy)]
pub struct SuspendedThread {
    pub tid: pid_t,
    /// True for threads that were sent the park signal.
    pub parked: bool,
    pub cpu_state: Option<CpuState>,
}

/// Threads recorded by the last suspension, in enumeration order.
pub fn suspended_threads() -> impl Iterator<Item = SuspendedThread> {
    let count = SLOT_COUNT.load(SeqCst).min(MAX_THREADS);
    SLOTS[..count].iter().map(|slot| {
        let acked = slot.acked.load(SeqCst);
        let cpu_state = if acked && slot.has_state.load(SeqCst) {
            // SAFETY: initialised before `has_state` and `acked` were published.
            Some(unsafe { (*slot.state.get()).assume_init() })
        } else {
            None
        };
        SuspendedThread {
            tid: slot.tid.load(SeqCst),
            parked: slot.parked.load(SeqCst),
            cpu_state,
        }
    })
}

pub fn suspended_thread(tid: pid_t) -> Option<SuspendedThread> {
    suspended_threads().find(|t| t.tid == tid)
}
