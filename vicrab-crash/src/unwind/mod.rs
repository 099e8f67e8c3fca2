// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack and context unwinding.
//!
//! Everything here runs inside the capture window. Frames are produced
//! lazily by iterators and consumed immediately by the report writer; no
//! frame list is ever buffered in a growable structure.

mod current_thread;
mod frame_pointer;
mod machine_context;
mod threads;

pub use current_thread::walk_current_thread;
pub use frame_pointer::FramePointerCursor;
pub use machine_context::{MachineContext, MAX_REGISTERS};
pub use threads::{
    current_tid, default_suspender, thread_name, NoopSuspender, ThreadSnapshot, ThreadSuspender,
    ThreadTable, MAX_THREADS,
};

/// Maximum number of frames to collect in a backtrace.
///
/// This limit prevents runaway frame walking in case of stack corruption.
pub const MAX_BACKTRACE_FRAMES: usize = 128;

/// A raw stack frame containing register values.
///
/// - `ip`: Instruction pointer (RIP on x86_64, PC on aarch64)
/// - `sp`: Stack pointer (RSP on x86_64, SP on aarch64)
/// - `bp`: Base/frame pointer (RBP on x86_64, FP/X29 on aarch64)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFrame {
    /// Instruction pointer (return address for every frame but the first)
    pub ip: usize,
    /// Stack pointer at this frame
    pub sp: usize,
    /// Base/frame pointer at this frame
    pub bp: usize,
}

/// Word-sized reads from the address space being unwound.
///
/// The live implementation goes through [`read_word`], which never faults.
/// Tests substitute a synthetic stack.
///
/// [`read_word`]: crate::recording_tools::read_word
pub trait MemoryReader {
    fn read_word(&self, address: usize) -> Option<usize>;
}

/// Reads the memory of the current process through the fault-contained
/// reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveMemory;

impl MemoryReader for LiveMemory {
    fn read_word(&self, address: usize) -> Option<usize> {
        crate::recording_tools::read_word(address)
    }
}

impl<M: MemoryReader + ?Sized> MemoryReader for &M {
    fn read_word(&self, address: usize) -> Option<usize> {
        (**self).read_word(address)
    }
}
