// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::signal_names::signal_from_signum;
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ,
    PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};
use std::ptr;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::SeqCst;

pub type SignalHandler = extern "C" fn(i32, *mut siginfo_t, *mut c_void);

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;
static mut HANDLERS: [Option<(signal::Signal, SigAction)>; MAX_SIGNALS] = [None; MAX_SIGNALS];

const UNINSTALLED: u8 = 0;
const INSTALLING: u8 = 1;
const INSTALLED: u8 = 2;
const UNINSTALLING: u8 = 3;
static STATE: AtomicU8 = AtomicU8::new(UNINSTALLED);

/// Registers `handler` for every signal in `signals`, remembering the
/// previous handlers so they can be chained to and restored.
///
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     If a crash occurs while handlers are being registered, the previous
///     handler may not be stored yet. The process is then terminated.
pub fn register_crash_handlers(
    signals: &[i32],
    create_alt_stack: bool,
    use_alt_stack: bool,
    handler: SignalHandler,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        STATE
            .compare_exchange(UNINSTALLED, INSTALLING, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register crash handlers"
    );

    // Validate signal numbers will fit in the array.
    for signum in signals {
        if !(*signum >= 0 && *signum < MAX_SIGNALS as i32) {
            STATE.store(UNINSTALLED, SeqCst);
            anyhow::bail!("Signal {signum} is out of range");
        }
    }

    if create_alt_stack {
        // Safety: This function has no documented preconditions.
        if let Err(e) = unsafe { create_alt_stack_for_current_thread() } {
            STATE.store(UNINSTALLED, SeqCst);
            return Err(e);
        }
    }

    // A new install only chains to what it saves itself.
    // SAFETY: see below.
    unsafe { HANDLERS = [None; MAX_SIGNALS] };

    let mut errors = vec![];
    for signum in signals {
        let index = *signum as usize;
        // Safety: This function has no documented preconditions.
        match unsafe { register_signal_handler(*signum, use_alt_stack, handler) } {
            // SAFETY: `HANDLERS` is only written while STATE is INSTALLING or
            // UNINSTALLING, which this thread owns. Chaining refuses to read it
            // in those states.
            Ok(previous) => unsafe { HANDLERS[index] = Some(previous) },
            Err(e) => errors.push(format!("Unable to register signal for {signum}: {e:?}")),
        };
    }
    STATE.store(INSTALLED, SeqCst);
    anyhow::ensure!(
        errors.is_empty(),
        "Errors registering signal handlers {errors:?}"
    );
    Ok(())
}

/// Puts back the handlers that were active before [`register_crash_handlers`].
pub fn restore_previous_handlers() -> anyhow::Result<()> {
    anyhow::ensure!(
        STATE
            .compare_exchange(INSTALLED, UNINSTALLING, SeqCst, SeqCst)
            .is_ok(),
        "Crash handlers are not installed"
    );
    let mut errors = vec![];
    for index in 0..MAX_SIGNALS {
        // SAFETY: see register_crash_handlers.
        if let Some((signal, previous)) = unsafe { HANDLERS[index] } {
            // SAFETY: restoring a handler that was installed before ours.
            if let Err(e) = unsafe { signal::sigaction(signal, &previous) } {
                errors.push(format!("Unable to restore {signal}: {e}"));
            }
        }
    }
    // The saved handlers stay readable so a signal already inside our
    // handler can still chain. The next install clears them.
    STATE.store(UNINSTALLED, SeqCst);
    anyhow::ensure!(errors.is_empty(), "Errors restoring signal handlers {errors:?}");
    Ok(())
}

pub fn handlers_installed() -> bool {
    STATE.load(SeqCst) == INSTALLED
}

/// Once we've handled the signal, chain to any previous handlers.
/// If we run into an unexpected condition we just `_exit` to quit the program
/// without re-raising `SIGABRT`.
///
/// # Safety
/// Must only be called from the handler passed to [`register_crash_handlers`].
pub unsafe fn chain_signal_handler(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    let state = STATE.load(SeqCst);
    if state == INSTALLING || state == UNINSTALLING {
        terminate()
    }
    if signum < 0 || signum >= MAX_SIGNALS as i32 {
        terminate()
    }
    // SAFETY: STATE is neither INSTALLING nor UNINSTALLING, so nothing writes
    // `HANDLERS` concurrently.
    if let Some((signal, sigaction)) = &mut unsafe { HANDLERS[signum as usize] } {
        // How we chain depends on what kind of handler we're chaining to.
        // https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
        // https://man7.org/linux/man-pages/man2/sigaction.2.html
        match sigaction.handler() {
            SigHandler::SigDfl => {
                // Restore the default action and re-raise so the process dies the
                // way it would have without us, core dump included. Returning
                // from a synchronous fault re-executes the faulting instruction;
                // a `raise`d signal must be raised again explicitly.
                unsafe { signal::sigaction(*signal, sigaction) }.unwrap_or_else(|_| terminate());
                unsafe { libc::raise(signum) };
            }
            SigHandler::SigIgn => (), // Return and ignore the signal.
            SigHandler::Handler(f) => f(signum),
            SigHandler::SigAction(f) => f(signum, sig_info, ucontext),
        }
    } else {
        terminate()
    }
}

fn terminate() -> ! {
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(-1) }
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack_for_current_thread() -> anyhow::Result<()> {
    // The altstack is the greater of 16 pages or SIGSTKSZ; the default SIGSTKSZ
    // of 8KB is too small to write a report.
    let page_size = page_size::get();
    let sigalstack_base_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        sigalstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigalstack_base_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

unsafe fn register_signal_handler(
    signum: i32,
    use_alt_stack: bool,
    handler: SignalHandler,
) -> anyhow::Result<(signal::Signal, SigAction)> {
    let signal_type = signal_from_signum(signum)?;

    // Some runtimes install an altstack of their own and check the stack
    // pointer in their chained handler, so the stack can be used without
    // being created. Creating it without using it is rejected by the
    // configuration.
    let extra_saflags = if use_alt_stack {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };

    let sig_action = SigAction::new(
        SigHandler::SigAction(handler),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );

    let old_handler = signal::sigaction(signal_type, &sig_action)?;
    Ok((signal_type, old_handler))
}
