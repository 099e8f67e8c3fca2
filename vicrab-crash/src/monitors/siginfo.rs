// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Human readable names for signals and `si_code` values. Everything here is
//! a lookup into static strings, callable from a signal handler.

pub fn signal_from_signum(value: libc::c_int) -> anyhow::Result<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;
    let rval = match value {
        libc::SIGHUP => Signal::SIGHUP,
        libc::SIGINT => Signal::SIGINT,
        libc::SIGQUIT => Signal::SIGQUIT,
        libc::SIGILL => Signal::SIGILL,
        libc::SIGTRAP => Signal::SIGTRAP,
        libc::SIGABRT => Signal::SIGABRT,
        libc::SIGBUS => Signal::SIGBUS,
        libc::SIGFPE => Signal::SIGFPE,
        libc::SIGUSR1 => Signal::SIGUSR1,
        libc::SIGSEGV => Signal::SIGSEGV,
        libc::SIGUSR2 => Signal::SIGUSR2,
        libc::SIGPIPE => Signal::SIGPIPE,
        libc::SIGALRM => Signal::SIGALRM,
        libc::SIGTERM => Signal::SIGTERM,
        libc::SIGXCPU => Signal::SIGXCPU,
        libc::SIGXFSZ => Signal::SIGXFSZ,
        libc::SIGSYS => Signal::SIGSYS,
        // KILL and STOP cannot be caught; the rest are not crashes.
        _ => anyhow::bail!("Unsupported signal number {value}"),
    };
    Ok(rval)
}

pub fn signal_name(signum: libc::c_int) -> &'static str {
    match signum {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGSYS => "SIGSYS",
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        _ => "UNKNOWN",
    }
}

// Defined in siginfo.h. There doesn't appear to be a crate that provides them
// in a comparable way; only the common, actionable values are listed.
pub mod siginfo_code {
    pub const SI_USER: i32 = 0;
    pub const SI_KERNEL: i32 = 0x80;
    pub const SI_QUEUE: i32 = -1;
    pub const SI_TIMER: i32 = -2;
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

pub fn code_name(signo: libc::c_int, si_code: libc::c_int) -> &'static str {
    // Strip out the high byte for PTRACE_EVENT_* flags.
    let code = si_code & 0x7f;
    // Codes at or below zero are sender codes, whatever the signal.
    if si_code <= 0 || si_code == siginfo_code::SI_KERNEL {
        return match si_code {
            siginfo_code::SI_USER => "SI_USER",
            siginfo_code::SI_KERNEL => "SI_KERNEL",
            siginfo_code::SI_QUEUE => "SI_QUEUE",
            siginfo_code::SI_TIMER => "SI_TIMER",
            siginfo_code::SI_TKILL => "SI_TKILL",
            _ => "UNKNOWN_GENERAL",
        };
    }
    match signo {
        libc::SIGILL => match code {
            siginfo_code::ill::ILLOPC => "ILL_ILLOPC",
            siginfo_code::ill::ILLOPN => "ILL_ILLOPN",
            siginfo_code::ill::ILLADR => "ILL_ILLADR",
            siginfo_code::ill::ILLTRP => "ILL_ILLTRP",
            siginfo_code::ill::PRVOPC => "ILL_PRVOPC",
            siginfo_code::ill::PRVREG => "ILL_PRVREG",
            siginfo_code::ill::COPROC => "ILL_COPROC",
            siginfo_code::ill::BADSTK => "ILL_BADSTK",
            _ => "UNKNOWN_SIGILL",
        },
        libc::SIGFPE => match code {
            siginfo_code::fpe::INTDIV => "FPE_INTDIV",
            siginfo_code::fpe::INTOVF => "FPE_INTOVF",
            siginfo_code::fpe::FLTDIV => "FPE_FLTDIV",
            siginfo_code::fpe::FLTOVF => "FPE_FLTOVF",
            siginfo_code::fpe::FLTUND => "FPE_FLTUND",
            siginfo_code::fpe::FLTRES => "FPE_FLTRES",
            siginfo_code::fpe::FLTINV => "FPE_FLTINV",
            siginfo_code::fpe::FLTSUB => "FPE_FLTSUB",
            _ => "UNKNOWN_SIGFPE",
        },
        libc::SIGSEGV => match code {
            siginfo_code::segv::MAPERR => "SEGV_MAPERR",
            siginfo_code::segv::ACCERR => "SEGV_ACCERR",
            _ => "UNKNOWN_SIGSEGV",
        },
        libc::SIGBUS => match code {
            siginfo_code::bus::ADRALN => "BUS_ADRALN",
            siginfo_code::bus::ADRERR => "BUS_ADRERR",
            siginfo_code::bus::OBJERR => "BUS_OBJERR",
            _ => "UNKNOWN_SIGBUS",
        },
        libc::SIGTRAP => match code {
            siginfo_code::trap::BRKPT => "TRAP_BRKPT",
            siginfo_code::trap::TRACE => "TRAP_TRACE",
            _ => "UNKNOWN_SIGTRAP",
        },
        libc::SIGSYS => match code {
            siginfo_code::sys::SECCOMP => "SYS_SECCOMP",
            _ => "UNKNOWN_SIGSYS",
        },
        _ => "UNKNOWN_GENERAL",
    }
}

/// SIGILL, SIGFPE, SIGSEGV, SIGBUS, and SIGTRAP fill in si_addr with the
/// address of the fault.
/// <https://man7.org/linux/man-pages/man2/sigaction.2.html>
pub fn has_fault_address(signum: libc::c_int) -> bool {
    matches!(
        signum,
        libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP
    )
}
