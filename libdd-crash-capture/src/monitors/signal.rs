// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fatal signal monitor. On Linux it also covers hardware exceptions: the
//! kernel reports those as synchronous signals with a positive `si_code`.

use super::context::{HardwareExceptionDetail, SignalDetail};
use super::{Monitor, MonitorContext, MonitorRegistry, MonitorType};
use crate::collector::signal_handler_manager::{
    chain_signal_handler, register_crash_handlers, restore_previous_handlers,
};
use crate::collector::MachineContext;
use libc::{c_void, siginfo_t, ucontext_t};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};
use std::sync::Weak;
use tracing::{debug, error};

// Either null or the registry of the enabled signal monitor. Cleared before
// that registry can be dropped.
static REGISTRY: AtomicPtr<MonitorRegistry> = AtomicPtr::new(ptr::null_mut());

pub struct SignalMonitor {
    registry: Weak<MonitorRegistry>,
    enabled: AtomicBool,
    signals: Vec<i32>,
    create_alt_stack: bool,
    use_alt_stack: bool,
}

impl SignalMonitor {
    pub fn new(
        registry: &Weak<MonitorRegistry>,
        signals: Vec<i32>,
        create_alt_stack: bool,
        use_alt_stack: bool,
    ) -> Self {
        Self {
            registry: registry.clone(),
            enabled: AtomicBool::new(false),
            signals,
            create_alt_stack,
            use_alt_stack,
        }
    }

    fn install(&self) -> anyhow::Result<()> {
        let registry = self.registry.as_ptr() as *mut MonitorRegistry;
        anyhow::ensure!(
            REGISTRY
                .compare_exchange(ptr::null_mut(), registry, SeqCst, SeqCst)
                .is_ok(),
            "Another signal monitor is already enabled"
        );
        if let Err(e) = register_crash_handlers(
            &self.signals,
            self.create_alt_stack,
            self.use_alt_stack,
            handle_signal,
        ) {
            REGISTRY.store(ptr::null_mut(), SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn uninstall(&self) {
        if let Err(e) = restore_previous_handlers() {
            error!("Could not restore signal handlers: {e}");
        }
        let registry = self.registry.as_ptr() as *mut MonitorRegistry;
        let _ = REGISTRY.compare_exchange(registry, ptr::null_mut(), SeqCst, SeqCst);
    }
}

impl Monitor for SignalMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::SIGNAL
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled == self.enabled.load(SeqCst) {
            return;
        }
        if enabled {
            match self.install() {
                Ok(()) => {
                    debug!(signals = ?self.signals, "Installed signal handlers");
                    self.enabled.store(true, SeqCst);
                }
                Err(e) => error!("Could not enable signal monitor: {e}"),
            }
        } else {
            self.enabled.store(false, SeqCst);
            self.uninstall();
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

extern "C" fn handle_signal(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    let registry = REGISTRY.load(SeqCst);
    if !registry.is_null() {
        // SAFETY: the pointer is only set while the registry is alive.
        let registry = unsafe { &*registry };
        // SAFETY: the kernel passes valid `siginfo_t` and `ucontext_t` pointers.
        unsafe { capture_signal(registry, signum, sig_info, ucontext as *const ucontext_t) };
    }
    // SAFETY: called from the handler registered above.
    unsafe { chain_signal_handler(signum, sig_info, ucontext) };
}

/// # Safety
/// `sig_info` and `ucontext` must be null or valid.
unsafe fn capture_signal(
    registry: &MonitorRegistry,
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
) {
    registry.capture(true, true, || {
        let machine_context = MachineContext::from_signal(ucontext);
        let mut context =
            MonitorContext::new(MonitorType::SIGNAL).with_machine_context(machine_context);
        context.signal.signum = signum;
        if let Some(info) = sig_info.as_ref() {
            let code = info.si_code;
            let address = info.si_addr() as usize;
            context.fault_address = address;
            context.signal = SignalDetail {
                signum,
                sigcode: code,
            };
            // Raised by the kernel for the faulting instruction.
            if code > 0 {
                context.hardware_exception = HardwareExceptionDetail {
                    exception_type: signum,
                    code: code as i64,
                    subcode: address as i64,
                };
            }
        }
        context
    });
}
