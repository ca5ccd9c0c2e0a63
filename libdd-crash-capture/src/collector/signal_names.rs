// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Human readable names for signals and `si_code` values.

use anyhow::Context;
use nix::sys::signal::Signal;

/// Signals treated as fatal when no explicit list is configured.
pub fn default_signals() -> Vec<i32> {
    vec![
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
        libc::SIGPIPE,
        libc::SIGSEGV,
        libc::SIGSYS,
        libc::SIGTRAP,
    ]
}

/// Converts a signum into a Signal.
pub fn signal_from_signum(value: libc::c_int) -> anyhow::Result<Signal> {
    Signal::try_from(value).with_context(|| format!("Invalid signal number {value}"))
}

pub fn signal_name(signum: libc::c_int) -> Option<&'static str> {
    Signal::try_from(signum).ok().map(Signal::as_str)
}

// These are defined in siginfo.h. Only the most common, actionable values are
// listed.
mod siginfo_code {
    pub const SI_USER: i32 = 0;
    pub const SI_KERNEL: i32 = 0x80;
    pub const SI_QUEUE: i32 = -1;
    pub const SI_TIMER: i32 = -2;
    pub const SI_MESGQ: i32 = -3;
    pub const SI_ASYNCIO: i32 = -4;
    pub const SI_TKILL: i32 = -6;

    pub mod ill {
        pub const ILLOPC: i32 = 1;
        pub const ILLOPN: i32 = 2;
        pub const ILLADR: i32 = 3;
        pub const ILLTRP: i32 = 4;
        pub const PRVOPC: i32 = 5;
        pub const PRVREG: i32 = 6;
        pub const COPROC: i32 = 7;
        pub const BADSTK: i32 = 8;
    }

    pub mod fpe {
        pub const INTDIV: i32 = 1;
        pub const INTOVF: i32 = 2;
        pub const FLTDIV: i32 = 3;
        pub const FLTOVF: i32 = 4;
        pub const FLTUND: i32 = 5;
        pub const FLTRES: i32 = 6;
        pub const FLTINV: i32 = 7;
        pub const FLTSUB: i32 = 8;
    }

    pub mod segv {
        pub const MAPERR: i32 = 1;
        pub const ACCERR: i32 = 2;
    }

    pub mod bus {
        pub const ADRALN: i32 = 1;
        pub const ADRERR: i32 = 2;
        pub const OBJERR: i32 = 3;
    }

    pub mod trap {
        pub const BRKPT: i32 = 1;
        pub const TRACE: i32 = 2;
    }

    pub mod sys {
        pub const SECCOMP: i32 = 1;
    }
}

/// Name of `code` as reported alongside `signum`.
pub fn code_name(signum: libc::c_int, code: libc::c_int) -> Option<&'static str> {
    use siginfo_code::*;

    let general = match code {
        SI_USER => Some("SI_USER"),
        SI_KERNEL => Some("SI_KERNEL"),
        SI_QUEUE => Some("SI_QUEUE"),
        SI_TIMER => Some("SI_TIMER"),
        SI_MESGQ => Some("SI_MESGQ"),
        SI_ASYNCIO => Some("SI_ASYNCIO"),
        SI_TKILL => Some("SI_TKILL"),
        _ => None,
    };
    if general.is_some() || code <= 0 {
        return general;
    }

    match signum {
        libc::SIGILL => match code {
            ill::ILLOPC => Some("ILL_ILLOPC"),
            ill::ILLOPN => Some("ILL_ILLOPN"),
            ill::ILLADR => Some("ILL_ILLADR"),
            ill::ILLTRP => Some("ILL_ILLTRP"),
            ill::PRVOPC => Some("ILL_PRVOPC"),
            ill::PRVREG => Some("ILL_PRVREG"),
            ill::COPROC => Some("ILL_COPROC"),
            ill::BADSTK => Some("ILL_BADSTK"),
            _ => None,
        },
        libc::SIGFPE => match code {
            fpe::INTDIV => Some("FPE_INTDIV"),
            fpe::INTOVF => Some("FPE_INTOVF"),
            fpe::FLTDIV => Some("FPE_FLTDIV"),
            fpe::FLTOVF => Some("FPE_FLTOVF"),
            fpe::FLTUND => Some("FPE_FLTUND"),
            fpe::FLTRES => Some("FPE_FLTRES"),
            fpe::FLTINV => Some("FPE_FLTINV"),
            fpe::FLTSUB => Some("FPE_FLTSUB"),
            _ => None,
        },
        libc::SIGSEGV => match code {
            segv::MAPERR => Some("SEGV_MAPERR"),
            segv::ACCERR => Some("SEGV_ACCERR"),
            _ => None,
        },
        libc::SIGBUS => match code {
            bus::ADRALN => Some("BUS_ADRALN"),
            bus::ADRERR => Some("BUS_ADRERR"),
            bus::OBJERR => Some("BUS_OBJERR"),
            _ => None,
        },
        libc::SIGTRAP => match code {
            trap::BRKPT => Some("TRAP_BRKPT"),
            trap::TRACE => Some("TRAP_TRACE"),
            _ => None,
        },
        libc::SIGSYS => match code {
            sys::SECCOMP => Some("SYS_SECCOMP"),
            _ => None,
        },
        _ => None,
    }
}
