// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Primitives that are safe to call while the process is in an undefined
//! state: the heap, every lock and most of libc may be broken.
//!
//! Nothing in this module allocates. The only system calls used are on the
//! async-signal-safe list: `open`, `read`, `write`, `close`, `getpid`,
//! `process_vm_readv` and `pipe`.
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>

mod file;
mod format;
mod memory;

pub use file::{read_file_into, CPath, LineReader, MAX_PATH_LEN};
pub use format::{format_into, parse_addr, write_decimal, Addr, FixedBuf, HexBytes, JsonStr};
pub use memory::{cached_page_size, init_memory_probe, read_memory_safely, read_word};

use std::io;
use std::os::fd::RawFd;

/// Writes all of `buf` to `fd` with plain `write(2)` calls.
///
/// Retries on `EINTR` and on short writes only. Returns `false` on any other
/// error; the caller must not retry.
pub fn write_bytes(fd: RawFd, mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let rval = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rval < 0 {
            if errno::errno().0 == libc::EINTR {
                continue;
            }
            return false;
        }
        if rval == 0 {
            return false;
        }
        buf = &buf[rval as usize..];
    }
    true
}

/// Writes a single diagnostic line to stderr, formatted into a stack buffer.
pub fn write_stderr(args: std::fmt::Arguments<'_>) {
    let mut buf = [0u8; 256];
    let mut len = format_into(&mut buf[..255], args);
    buf[len] = b'\n';
    len += 1;
    let _ = write_bytes(libc::STDERR_FILENO, &buf[..len]);
}

/// A `std::io::Write` over a raw file descriptor with an inline buffer.
///
/// The formatting machinery of `write!` does not allocate, so the emitters
/// can be written against `impl Write` and driven either by this type in a
/// crash handler or by a `Vec<u8>` in tests and in the re-encoder.
/// Nothing is written through the descriptor until the buffer fills or
/// `flush` is called; the emitters flush at every block boundary so a crash
/// mid-report loses at most the block in progress.
pub struct FdWriter {
    fd: RawFd,
    buf: [u8; FdWriter::CAPACITY],
    len: usize,
    failed: bool,
}

impl FdWriter {
    const CAPACITY: usize = 4096;

    pub const fn new(fd: RawFd) -> Self {
        Self {
            fd,
            buf: [0; Self::CAPACITY],
            len: 0,
            failed: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Whether any write to the descriptor failed. Once failed, further
    /// output is discarded.
    pub fn failed(&self) -> bool {
        self.failed
    }

    fn drain(&mut self) -> io::Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        let ok = !self.failed && write_bytes(self.fd, &self.buf[..self.len]);
        self.len = 0;
        if ok {
            Ok(())
        } else {
            self.failed = true;
            Err(io::Error::from(io::ErrorKind::WriteZero))
        }
    }
}

impl io::Write for FdWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.failed {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        if data.len() >= Self::CAPACITY {
            self.drain()?;
            return if write_bytes(self.fd, data) {
                Ok(data.len())
            } else {
                self.failed = true;
                Err(io::Error::from(io::ErrorKind::WriteZero))
            };
        }
        if self.len + data.len() > Self::CAPACITY {
            self.drain()?;
        }
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()
    }
}

impl Drop for FdWriter {
    fn drop(&mut self) {
        let _ = self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_bytes_to_file() {
        let mut file = tempfile::tempfile().unwrap();
        assert!(write_bytes(file.as_raw_fd(), b"hello crash"));
        let mut out = String::new();
        use std::io::Seek;
        file.rewind().unwrap();
        file.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello crash");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_bytes_bad_fd() {
        assert!(!write_bytes(-1, b"nope"));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_fd_writer_buffers_until_flush() {
        let mut file = tempfile::tempfile().unwrap();
        {
            let mut w = FdWriter::new(file.as_raw_fd());
            write!(w, "{}:{}", "tid", 42).unwrap();
            assert_eq!(file.metadata().unwrap().len(), 0);
            w.flush().unwrap();
            assert_eq!(file.metadata().unwrap().len(), 6);
            // Larger than the inline buffer goes straight through.
            let big = vec![b'x'; FdWriter::CAPACITY + 1];
            w.write_all(&big).unwrap();
        }
        assert_eq!(
            file.metadata().unwrap().len(),
            6 + FdWriter::CAPACITY as u64 + 1
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_fd_writer_reports_failure() {
        let mut w = FdWriter::new(-1);
        write!(w, "lost").unwrap();
        assert!(w.flush().is_err());
        assert!(w.failed());
        assert!(write!(w, "more").is_err());
    }
}
