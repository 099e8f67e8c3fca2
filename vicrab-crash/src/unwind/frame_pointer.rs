// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{MemoryReader, RawFrame};

const WORD: usize = std::mem::size_of::<usize>();

/// Walks a frame-pointer chain starting from a register snapshot.
///
/// On both x86_64 and aarch64 a frame record is two words: the caller's frame
/// pointer at `[fp]` and the return address at `[fp + WORD]`. The first item
/// is the snapshot itself, then one item per valid frame record, callee to
/// caller.
///
/// The walk stops when a record fails validation: the frame pointer must be
/// aligned, readable, and strictly above the previous one (stacks grow
/// down). It also stops after `max_depth` items; [`is_truncated`] tells the
/// two apart.
///
/// [`is_truncated`]: FramePointerCursor::is_truncated
pub struct FramePointerCursor<M> {
    memory: M,
    next: Option<RawFrame>,
    produced: usize,
    max_depth: usize,
    truncated: bool,
}

impl<M: MemoryReader> FramePointerCursor<M> {
    pub fn new(memory: M, ip: usize, sp: usize, fp: usize, max_depth: usize) -> Self {
        let next = (ip != 0).then_some(RawFrame { ip, sp, bp: fp });
        Self {
            memory,
            next,
            produced: 0,
            max_depth,
            truncated: false,
        }
    }

    /// Whether the walk was cut by the depth bound while more frames
    /// remained.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn caller_of(&self, frame: &RawFrame) -> Option<RawFrame> {
        let fp = frame.bp;
        if fp == 0 || fp % WORD != 0 {
            return None;
        }
        // The record must sit at or above the current stack pointer.
        if frame.sp != 0 && fp < frame.sp {
            return None;
        }
        let caller_fp = self.memory.read_word(fp)?;
        let return_address = self.memory.read_word(fp.checked_add(WORD)?)?;
        if return_address == 0 {
            return None;
        }
        // A bad caller link still leaves a good return address; keep it and
        // end the walk there.
        let bp = if caller_fp <= fp { 0 } else { caller_fp };
        Some(RawFrame {
            ip: return_address,
            sp: fp + 2 * WORD,
            bp,
        })
    }
}

impl<M: MemoryReader> Iterator for FramePointerCursor<M> {
    type Item = RawFrame;

    fn next(&mut self) -> Option<RawFrame> {
        let current = self.next.take()?;
        if self.produced == self.max_depth {
            self.truncated = true;
            return None;
        }
        self.produced += 1;
        self.next = self.caller_of(&current);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A sparse fake address space.
    #[derive(Default)]
    struct SyntheticStack {
        words: HashMap<usize, usize>,
    }

    impl MemoryReader for SyntheticStack {
        fn read_word(&self, address: usize) -> Option<usize> {
            self.words.get(&address).copied()
        }
    }

    const STACK_TOP: usize = 0x7fff_0000;
    const FRAME_SIZE: usize = 0x40;

    /// Builds `depth` chained frame records below `STACK_TOP`. Returns the
    /// stack and the frame pointer of the innermost frame. The outermost
    /// record has a null caller frame pointer.
    fn build_stack(depth: usize) -> (SyntheticStack, usize) {
        let mut stack = SyntheticStack::default();
        let mut caller_fp = 0;
        let mut fp = 0;
        for level in 0..depth {
            fp = STACK_TOP - (level + 1) * FRAME_SIZE;
            stack.words.insert(fp, caller_fp);
            stack.words.insert(fp + WORD, 0x1000 + level);
            caller_fp = fp;
        }
        (stack, fp)
    }

    #[test]
    fn test_walks_exact_depth() {
        for depth in [1, 2, 7, 40] {
            let (stack, fp) = build_stack(depth);
            let cursor = FramePointerCursor::new(&stack, 0xdead, fp - 0x10, fp, 128);
            let frames: Vec<RawFrame> = cursor.collect();
            // The register snapshot plus one frame per record.
            assert_eq!(frames.len(), depth + 1);
            assert_eq!(frames[0].ip, 0xdead);
            // Callee to caller: the innermost record was pushed last.
            let return_addresses: Vec<usize> = frames[1..].iter().map(|f| f.ip).collect();
            let expected: Vec<usize> = (0..depth).rev().map(|level| 0x1000 + level).collect();
            assert_eq!(return_addresses, expected);
        }
    }

    #[test]
    fn test_truncates_at_bound() {
        let (stack, fp) = build_stack(200);
        let mut cursor = FramePointerCursor::new(&stack, 0xdead, fp, fp, 128);
        let count = cursor.by_ref().count();
        assert_eq!(count, 128);
        assert!(cursor.is_truncated());
    }

    #[test]
    fn test_not_truncated_when_exactly_at_bound() {
        let (stack, fp) = build_stack(9);
        let mut cursor = FramePointerCursor::new(&stack, 0xdead, fp, fp, 10);
        assert_eq!(cursor.by_ref().count(), 10);
        assert!(!cursor.is_truncated());
    }

    #[test]
    fn test_stops_on_corrupt_chain() {
        let (mut stack, fp) = build_stack(5);
        // Point the second record back down the stack.
        let second = fp + FRAME_SIZE;
        stack.words.insert(second, fp - FRAME_SIZE);
        let frames: Vec<_> = FramePointerCursor::new(&stack, 0xdead, fp, fp, 128).collect();
        assert_eq!(frames.len(), 3);

        // Unreadable and misaligned frame pointers end the walk immediately.
        let frames: Vec<_> = FramePointerCursor::new(&stack, 0xdead, 0, 0x10, 128).collect();
        assert_eq!(frames.len(), 1);
        let frames: Vec<_> = FramePointerCursor::new(&stack, 0xdead, 0, fp + 1, 128).collect();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_empty_without_ip() {
        let stack = SyntheticStack::default();
        assert_eq!(FramePointerCursor::new(&stack, 0, 0, 0, 128).count(), 0);
    }
}
