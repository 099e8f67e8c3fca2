// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::RawFrame;

/// Walks the stack of the calling thread with the platform unwinder and
/// hands each frame to `emit` as soon as it is found.
///
/// Frames before `start_ip` belong to the crash machinery itself and are
/// skipped. If `start_ip` is never seen (it is 0, or the unwinder could not
/// step through the signal frame), the walk is repeated and every frame is
/// emitted. Returns the number of frames emitted and whether the walk was
/// cut by `max_depth`.
///
/// SIGNAL SAFETY:
///     Getting a backtrace on rust is not guaranteed to be signal safe.
///     https://github.com/rust-lang/backtrace-rs/issues/414
///     Only instruction and stack pointers are collected; symbols are never
///     resolved here, which is the part known to allocate.
pub fn walk_current_thread(
    start_ip: usize,
    max_depth: usize,
    mut emit: impl FnMut(RawFrame),
) -> (usize, bool) {
    let mut emitted = 0;
    let mut truncated = false;
    let mut ip_found = start_ip == 0;
    for _ in 0..2 {
        // SAFETY: the capture window is single threaded with respect to
        // this function, which is what `trace_unsynchronized` requires.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let ip = frame.ip() as usize;
                if !ip_found {
                    if ip != start_ip {
                        return true;
                    }
                    ip_found = true;
                }
                if emitted == max_depth {
                    truncated = true;
                    return false;
                }
                emit(RawFrame {
                    ip,
                    sp: frame.sp() as usize,
                    bp: 0,
                });
                emitted += 1;
                true
            })
        };
        if ip_found {
            break;
        }
        // Emit anything at all if the starting frame was not found.
        ip_found = true;
    }
    (emitted, truncated)
}
