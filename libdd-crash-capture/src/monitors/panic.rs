// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Language exception monitor: reports Rust panics through a chained panic
//! hook.

use super::{Monitor, MonitorContext, MonitorRegistry, MonitorType};
use crate::collector::{MachineContext, StackCursor};
use std::panic::{self, PanicHookInfo};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};
use std::sync::Weak;
use tracing::error;

pub const PANIC_EXCEPTION_NAME: &str = "panic";

// Frames belonging to the hook itself.
const HOOK_FRAMES: usize = 2;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>;
static PREVIOUS_PANIC_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(ptr::null_mut());
static REGISTRY: AtomicPtr<MonitorRegistry> = AtomicPtr::new(ptr::null_mut());

/// Register the panic hook.
///
/// The hook is installed once and stays for the life of the process;
/// disabling the monitor only stops it from reporting.
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
fn register_panic_hook() {
    if !PREVIOUS_PANIC_HOOK.load(SeqCst).is_null() {
        return;
    }
    let old_hook = panic::take_hook();
    let old_hook_ptr = Box::into_raw(Box::new(old_hook));
    PREVIOUS_PANIC_HOOK.swap(old_hook_ptr, SeqCst);
    panic::set_hook(Box::new(|panic_info| {
        let registry = REGISTRY.load(SeqCst);
        if !registry.is_null() {
            // SAFETY: the pointer is only set while the registry is alive.
            capture_panic(unsafe { &*registry }, panic_info);
        }
        call_previous_panic_hook(panic_info);
    }));
}

fn call_previous_panic_hook(panic_info: &PanicHookInfo<'_>) {
    let old_hook_ptr = PREVIOUS_PANIC_HOOK.load(SeqCst);
    if !old_hook_ptr.is_null() {
        // Safety: This pointer can only come from Box::into_raw above in register_panic_hook.
        // We borrow it here without taking ownership so it remains valid for future calls.
        unsafe {
            let old_hook = &*old_hook_ptr;
            old_hook(panic_info);
        }
    }
}

fn panic_message<'a>(panic_info: &'a PanicHookInfo<'_>) -> &'a str {
    let payload = panic_info.payload();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    }
}

fn capture_panic(registry: &MonitorRegistry, panic_info: &PanicHookInfo<'_>) {
    let message = panic_message(panic_info);
    registry.capture(false, true, || {
        let mut context = MonitorContext::new(MonitorType::LANGUAGE_EXCEPTION)
            .with_machine_context(MachineContext::for_current_thread(true));
        context.stack_cursor = StackCursor::with_self_thread(HOOK_FRAMES);
        context.crash_reason = Some(message);
        context.language_exception.name = Some(PANIC_EXCEPTION_NAME);
        context
    });
}

pub struct PanicMonitor {
    registry: Weak<MonitorRegistry>,
    enabled: AtomicBool,
}

impl PanicMonitor {
    pub fn new(registry: &Weak<MonitorRegistry>) -> Self {
        Self {
            registry: registry.clone(),
            enabled: AtomicBool::new(false),
        }
    }
}

impl Monitor for PanicMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::LANGUAGE_EXCEPTION
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled == self.enabled.load(SeqCst) {
            return;
        }
        let registry = self.registry.as_ptr() as *mut MonitorRegistry;
        if enabled {
            register_panic_hook();
            if REGISTRY
                .compare_exchange(ptr::null_mut(), registry, SeqCst, SeqCst)
                .is_err()
            {
                error!("Could not enable panic monitor: another one is enabled");
                return;
            }
            self.enabled.store(true, SeqCst);
        } else {
            self.enabled.store(false, SeqCst);
            let _ = REGISTRY.compare_exchange(registry, ptr::null_mut(), SeqCst, SeqCst);
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}
