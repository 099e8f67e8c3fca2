// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault-contained memory reads.
//!
//! Dereferencing a corrupt pointer from a crash handler would fault again and
//! lose the report. Instead, memory is copied by the kernel on our behalf,
//! which reports `EFAULT` for unmapped ranges rather than raising a signal.
//! Linux uses `process_vm_readv` on our own pid. Elsewhere, or where that
//! syscall is filtered, bytes are pushed through a pre-opened pipe: `write`
//! from an unreadable address fails with `EFAULT`.

use std::os::fd::IntoRawFd;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::{AtomicU64, AtomicUsize};

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);
/// Both ends of the probe pipe, `read << 32 | write`, published together.
static PROBE_FDS: AtomicU64 = AtomicU64::new(NO_PROBE);
const NO_PROBE: u64 = u64::MAX;

fn probe_fds() -> Option<(i32, i32)> {
    let packed = PROBE_FDS.load(Relaxed);
    if packed == NO_PROBE {
        None
    } else {
        Some(((packed >> 32) as i32, packed as u32 as i32))
    }
}

/// Prepares the fallback pipe and caches the page size. Called at install,
/// from normal context. Safe to call more than once.
pub fn init_memory_probe() -> anyhow::Result<()> {
    PAGE_SIZE.store(page_size::get(), SeqCst);
    if probe_fds().is_some() {
        return Ok(());
    }
    let (read_end, write_end) = nix::unistd::pipe()?;
    let read_fd = read_end.into_raw_fd();
    let write_fd = write_end.into_raw_fd();
    for fd in [read_fd, write_fd] {
        // Never block the crash handler on a full or empty pipe.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        anyhow::ensure!(flags >= 0, "fcntl(F_GETFL) failed on probe pipe");
        let rval = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        anyhow::ensure!(rval == 0, "fcntl(F_SETFL) failed on probe pipe");
    }
    let packed = ((read_fd as u32 as u64) << 32) | write_fd as u32 as u64;
    if PROBE_FDS
        .compare_exchange(NO_PROBE, packed, SeqCst, SeqCst)
        .is_err()
    {
        // Someone else won the race; theirs is as good as ours.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
    Ok(())
}

/// The page size recorded by [`init_memory_probe`], 4096 before that.
pub fn cached_page_size() -> usize {
    PAGE_SIZE.load(Relaxed)
}

/// Copies up to `out.len()` bytes starting at `address` into `out`.
///
/// Returns how many leading bytes were copied. Reading stops at the first
/// unreadable page, so a buffer straddling the end of a mapping yields the
/// readable prefix. Never faults.
pub fn read_memory_safely(address: usize, out: &mut [u8]) -> usize {
    if address == 0 || out.is_empty() {
        return 0;
    }
    let page = PAGE_SIZE.load(Relaxed).max(1);
    let mut copied = 0;
    while copied < out.len() {
        let Some(at) = address.checked_add(copied) else {
            break;
        };
        // Stay within one page per attempt so partial success is exact.
        let until_page_end = page - (at % page);
        let want = until_page_end.min(out.len() - copied);
        let got = read_chunk(at, &mut out[copied..copied + want]);
        copied += got;
        if got < want {
            break;
        }
    }
    copied
}

/// Reads one native word, or `None` if the address is unreadable.
pub fn read_word(address: usize) -> Option<usize> {
    let mut bytes = [0u8; std::mem::size_of::<usize>()];
    if read_memory_safely(address, &mut bytes) == bytes.len() {
        Some(usize::from_ne_bytes(bytes))
    } else {
        None
    }
}

fn read_chunk(address: usize, out: &mut [u8]) -> usize {
    #[cfg(target_os = "linux")]
    {
        match read_chunk_vm(address, out) {
            Some(n) => return n,
            None => {
                // Syscall unavailable; fall through to the pipe.
            }
        }
    }
    read_chunk_pipe(address, out)
}

/// `None` means the syscall itself is not usable here.
#[cfg(target_os = "linux")]
fn read_chunk_vm(address: usize, out: &mut [u8]) -> Option<usize> {
    let local = libc::iovec {
        iov_base: out.as_mut_ptr() as *mut libc::c_void,
        iov_len: out.len(),
    };
    let remote = libc::iovec {
        iov_base: address as *mut libc::c_void,
        iov_len: out.len(),
    };
    let rval = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if rval >= 0 {
        return Some(rval as usize);
    }
    match errno::errno().0 {
        libc::EFAULT | libc::ESRCH => Some(0),
        _ => None,
    }
}

fn read_chunk_pipe(address: usize, out: &mut [u8]) -> usize {
    let Some((read_fd, write_fd)) = probe_fds() else {
        return 0;
    };
    let written = loop {
        let rval = unsafe { libc::write(write_fd, address as *const libc::c_void, out.len()) };
        if rval < 0 && errno::errno().0 == libc::EINTR {
            continue;
        }
        break rval;
    };
    if written <= 0 {
        return 0;
    }
    let mut got = 0usize;
    while got < written as usize {
        let rval = unsafe {
            libc::read(
                read_fd,
                out[got..].as_mut_ptr() as *mut libc::c_void,
                written as usize - got,
            )
        };
        if rval < 0 && errno::errno().0 == libc::EINTR {
            continue;
        }
        if rval <= 0 {
            break;
        }
        got += rval as usize;
    }
    got
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_reads_valid_memory() {
        init_memory_probe().unwrap();
        let source: Vec<u8> = (0..=255u8).collect();
        let mut out = [0u8; 256];
        let n = read_memory_safely(source.as_ptr() as usize, &mut out);
        assert_eq!(n, 256);
        assert_eq!(&out[..], &source[..]);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_null_and_unmapped_do_not_fault() {
        init_memory_probe().unwrap();
        let mut out = [0u8; 16];
        assert_eq!(read_memory_safely(0, &mut out), 0);
        assert_eq!(read_memory_safely(8, &mut out), 0);
        assert_eq!(read_word(16), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_partial_read_at_guard_page() {
        init_memory_probe().unwrap();
        let page = page_size::get();
        unsafe {
            let base = libc::mmap(
                std::ptr::null_mut(),
                2 * page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            assert_ne!(base, libc::MAP_FAILED);
            std::ptr::write_bytes(base as *mut u8, 0xAB, page);
            assert_eq!(
                libc::mprotect((base as usize + page) as *mut libc::c_void, page, libc::PROT_NONE),
                0
            );
            let start = base as usize + page - 8;
            let mut out = [0u8; 32];
            let n = read_memory_safely(start, &mut out);
            assert_eq!(n, 8);
            assert!(out[..8].iter().all(|b| *b == 0xAB));
            libc::munmap(base, 2 * page);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_pipe_fallback() {
        init_memory_probe().unwrap();
        let value: u64 = 0x1122_3344_5566_7788;
        let mut out = [0u8; 8];
        let n = read_chunk_pipe(&value as *const u64 as usize, &mut out);
        assert_eq!(n, 8);
        assert_eq!(u64::from_ne_bytes(out), value);
        assert_eq!(read_chunk_pipe(8, &mut out), 0);
    }
}
