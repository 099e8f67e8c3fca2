// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Register snapshots, decoded from a signal `ucontext_t` or, on macOS, from
//! a suspended thread's Mach thread state.

use libc::ucontext_t;

pub const MAX_REGISTERS: usize = 40;

#[cfg(target_arch = "x86_64")]
const REGISTER_NAMES: &[&str] = &[
    "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip", "rflags",
];

#[cfg(target_arch = "aarch64")]
const REGISTER_NAMES: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr", "sp", "pc", "cpsr",
];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const REGISTER_NAMES: &[&str] = &[];

/// A named register set plus the three registers the unwinder needs.
/// Plain data, `Copy`, fixed size: it lives on the handler's stack.
#[derive(Clone, Copy)]
pub struct MachineContext {
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
    values: [u64; MAX_REGISTERS],
    count: usize,
}

impl MachineContext {
    pub const fn empty() -> Self {
        Self {
            ip: 0,
            sp: 0,
            fp: 0,
            values: [0; MAX_REGISTERS],
            count: 0,
        }
    }

    /// A context with only the unwinding registers known.
    pub fn from_registers(ip: usize, sp: usize, fp: usize) -> Self {
        Self {
            ip,
            sp,
            fp,
            ..Self::empty()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ip == 0 && self.count == 0
    }

    /// `(name, value)` pairs in the architecture's canonical order.
    pub fn registers(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        REGISTER_NAMES
            .iter()
            .copied()
            .zip(self.values[..self.count].iter().copied())
    }

    fn set_all(&mut self, values: &[u64]) {
        let count = values.len().min(REGISTER_NAMES.len()).min(MAX_REGISTERS);
        self.values[..count].copy_from_slice(&values[..count]);
        self.count = count;
    }

    /// Decodes the context handed to an `SA_SIGINFO` handler.
    ///
    /// # Safety
    /// `ucontext` must be null or point to the context the kernel passed to
    /// the current signal handler.
    pub unsafe fn from_ucontext(ucontext: *const ucontext_t) -> Option<Self> {
        if ucontext.is_null() {
            return None;
        }
        let mut context = Self::empty();
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        {
            let gregs = &(*ucontext).uc_mcontext.gregs;
            let reg = |index: libc::c_int| gregs[index as usize] as u64;
            context.set_all(&[
                reg(libc::REG_RAX),
                reg(libc::REG_RBX),
                reg(libc::REG_RCX),
                reg(libc::REG_RDX),
                reg(libc::REG_RDI),
                reg(libc::REG_RSI),
                reg(libc::REG_RBP),
                reg(libc::REG_RSP),
                reg(libc::REG_R8),
                reg(libc::REG_R9),
                reg(libc::REG_R10),
                reg(libc::REG_R11),
                reg(libc::REG_R12),
                reg(libc::REG_R13),
                reg(libc::REG_R14),
                reg(libc::REG_R15),
                reg(libc::REG_RIP),
                reg(libc::REG_EFL),
            ]);
            context.ip = reg(libc::REG_RIP) as usize;
            context.sp = reg(libc::REG_RSP) as usize;
            context.fp = reg(libc::REG_RBP) as usize;
        }
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        {
            let mcontext = &(*ucontext).uc_mcontext;
            let mut values = [0u64; 34];
            values[..29].copy_from_slice(&mcontext.regs[..29]);
            values[29] = mcontext.regs[29];
            values[30] = mcontext.regs[30];
            values[31] = mcontext.sp;
            values[32] = mcontext.pc;
            values[33] = mcontext.pstate;
            context.set_all(&values);
            context.ip = mcontext.pc as usize;
            context.sp = mcontext.sp as usize;
            context.fp = mcontext.regs[29] as usize;
        }
        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        {
            let mcontext = (*ucontext).uc_mcontext;
            if mcontext.is_null() {
                return None;
            }
            let ss = &(*mcontext).__ss;
            context.set_all(&[
                ss.__rax, ss.__rbx, ss.__rcx, ss.__rdx, ss.__rdi, ss.__rsi, ss.__rbp, ss.__rsp,
                ss.__r8, ss.__r9, ss.__r10, ss.__r11, ss.__r12, ss.__r13, ss.__r14, ss.__r15,
                ss.__rip, ss.__rflags,
            ]);
            context.ip = ss.__rip as usize;
            context.sp = ss.__rsp as usize;
            context.fp = ss.__rbp as usize;
        }
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            let mcontext = (*ucontext).uc_mcontext;
            if mcontext.is_null() {
                return None;
            }
            let ss = &(*mcontext).__ss;
            let mut values = [0u64; 34];
            values[..29].copy_from_slice(&ss.__x);
            values[29] = ss.__fp;
            values[30] = ss.__lr;
            values[31] = ss.__sp;
            values[32] = ss.__pc;
            values[33] = ss.__cpsr as u64;
            context.set_all(&values);
            context.ip = ss.__pc as usize;
            context.sp = ss.__sp as usize;
            context.fp = ss.__fp as usize;
        }
        Some(context)
    }

    /// Decodes a Mach `x86_THREAD_STATE64` / `ARM_THREAD_STATE64` buffer, as
    /// returned by `thread_get_state`. Every register is two `natural_t`s,
    /// low word first.
    #[cfg(target_os = "macos")]
    pub fn from_mach_thread_state(state: &[u32]) -> Self {
        let mut context = Self::empty();
        let word = |index: usize| -> u64 {
            match (state.get(index * 2), state.get(index * 2 + 1)) {
                (Some(lo), Some(hi)) => (*lo as u64) | ((*hi as u64) << 32),
                _ => 0,
            }
        };
        #[cfg(target_arch = "x86_64")]
        {
            // rax rbx rcx rdx rdi rsi rbp rsp r8..r15 rip rflags, as named.
            let mut values = [0u64; 18];
            for (index, value) in values.iter_mut().enumerate() {
                *value = word(index);
            }
            context.set_all(&values);
            context.ip = values[16] as usize;
            context.sp = values[7] as usize;
            context.fp = values[6] as usize;
        }
        #[cfg(target_arch = "aarch64")]
        {
            // x0..x28 fp lr sp pc, then a 32-bit cpsr.
            let mut values = [0u64; 34];
            for (index, value) in values.iter_mut().take(33).enumerate() {
                *value = word(index);
            }
            values[33] = state.get(66).copied().unwrap_or_default() as u64;
            context.set_all(&values);
            context.ip = values[32] as usize;
            context.sp = values[31] as usize;
            context.fp = values[29] as usize;
        }
        context
    }
}

impl std::fmt::Debug for MachineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineContext")
            .field("ip", &format_args!("{:#x}", self.ip))
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("fp", &format_args!("{:#x}", self.fp))
            .field("registers", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_registers() {
        let context = MachineContext::from_registers(0x1000, 0x2000, 0x3000);
        assert_eq!(context.ip, 0x1000);
        assert_eq!(context.registers().count(), 0);
        assert!(!context.is_empty());
        assert!(MachineContext::empty().is_empty());
    }

    #[test]
    fn test_null_ucontext() {
        assert!(unsafe { MachineContext::from_ucontext(std::ptr::null()) }.is_none());
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_linux_x86_64_ucontext() {
        let mut ucontext: ucontext_t = unsafe { std::mem::zeroed() };
        ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x4010;
        ucontext.uc_mcontext.gregs[libc::REG_RSP as usize] = 0x7ff0;
        ucontext.uc_mcontext.gregs[libc::REG_RBP as usize] = 0x7ff8;
        ucontext.uc_mcontext.gregs[libc::REG_RAX as usize] = 42;
        let context = unsafe { MachineContext::from_ucontext(&ucontext) }.unwrap();
        assert_eq!((context.ip, context.sp, context.fp), (0x4010, 0x7ff0, 0x7ff8));
        let registers: Vec<_> = context.registers().collect();
        assert_eq!(registers.len(), REGISTER_NAMES.len());
        assert_eq!(registers[0], ("rax", 42));
        assert_eq!(registers[16], ("rip", 0x4010));
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    #[test]
    fn test_linux_aarch64_ucontext() {
        let mut ucontext: ucontext_t = unsafe { std::mem::zeroed() };
        ucontext.uc_mcontext.pc = 0x4010;
        ucontext.uc_mcontext.sp = 0x7ff0;
        ucontext.uc_mcontext.regs[29] = 0x7ff8;
        ucontext.uc_mcontext.regs[0] = 42;
        let context = unsafe { MachineContext::from_ucontext(&ucontext) }.unwrap();
        assert_eq!((context.ip, context.sp, context.fp), (0x4010, 0x7ff0, 0x7ff8));
        let registers: Vec<_> = context.registers().collect();
        assert_eq!(registers[0], ("x0", 42));
        assert_eq!(registers[32], ("pc", 0x4010));
    }
}
