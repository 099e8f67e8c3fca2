// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::os::fd::RawFd;

pub const MAX_PATH_LEN: usize = 1024;

/// A nul-terminated path in an inline buffer, built ahead of time so the
/// crash handler can `open` it without touching the heap.
#[derive(Clone)]
pub struct CPath {
    buf: [u8; MAX_PATH_LEN],
    len: usize,
}

impl CPath {
    pub const fn empty() -> Self {
        Self {
            buf: [0; MAX_PATH_LEN],
            len: 0,
        }
    }

    /// Builds a path from formatting arguments. `None` if it does not fit or
    /// contains an interior nul.
    pub fn from_fmt(args: fmt::Arguments<'_>) -> Option<Self> {
        let mut path = Self::empty();
        let len = super::format_into(&mut path.buf[..MAX_PATH_LEN - 1], args);
        if len == MAX_PATH_LEN - 1 || path.buf[..len].contains(&0) {
            return None;
        }
        path.buf[len] = 0;
        path.len = len;
        Some(path)
    }

    /// Appends `suffix`, still nul-terminated. `false` if it does not fit.
    pub fn push_str(&mut self, suffix: &str) -> bool {
        let end = self.len + suffix.len();
        if end >= MAX_PATH_LEN || suffix.as_bytes().contains(&0) {
            return false;
        }
        self.buf[self.len..end].copy_from_slice(suffix.as_bytes());
        self.buf[end] = 0;
        self.len = end;
        true
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    pub fn as_ptr(&self) -> *const libc::c_char {
        self.buf.as_ptr() as *const libc::c_char
    }

    /// `open(2)` with the given flags, mode 0644. Returns the raw result.
    pub fn open(&self, flags: libc::c_int) -> RawFd {
        if self.is_empty() {
            return -1;
        }
        loop {
            let fd = unsafe { libc::open(self.as_ptr(), flags | libc::O_CLOEXEC, 0o644) };
            if fd < 0 && errno::errno().0 == libc::EINTR {
                continue;
            }
            return fd;
        }
    }
}

impl fmt::Debug for CPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// Reads a whole (small) file into `out`; returns the byte count, 0 on error.
pub fn read_file_into(path: &CPath, out: &mut [u8]) -> usize {
    let fd = path.open(libc::O_RDONLY);
    if fd < 0 {
        return 0;
    }
    let mut total = 0;
    while total < out.len() {
        let rval = unsafe {
            libc::read(
                fd,
                out[total..].as_mut_ptr() as *mut libc::c_void,
                out.len() - total,
            )
        };
        if rval < 0 && errno::errno().0 == libc::EINTR {
            continue;
        }
        if rval <= 0 {
            break;
        }
        total += rval as usize;
    }
    unsafe { libc::close(fd) };
    total
}

/// Splits the content of a descriptor into lines using a fixed buffer.
/// Lines longer than the buffer are cut; the remainder is skipped.
pub struct LineReader<const N: usize> {
    fd: RawFd,
    buf: [u8; N],
    start: usize,
    end: usize,
    eof: bool,
}

impl<const N: usize> LineReader<N> {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            buf: [0; N],
            start: 0,
            end: 0,
            eof: false,
        }
    }

    fn fill(&mut self) -> bool {
        if self.eof {
            return false;
        }
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == N {
            return false;
        }
        loop {
            let rval = unsafe {
                libc::read(
                    self.fd,
                    self.buf[self.end..].as_mut_ptr() as *mut libc::c_void,
                    N - self.end,
                )
            };
            if rval < 0 && errno::errno().0 == libc::EINTR {
                continue;
            }
            if rval <= 0 {
                self.eof = true;
                return false;
            }
            self.end += rval as usize;
            return true;
        }
    }

    /// Calls `f` with each line, without the trailing newline.
    pub fn for_each_line(&mut self, mut f: impl FnMut(&[u8])) {
        loop {
            if let Some(pos) = self.buf[self.start..self.end].iter().position(|b| *b == b'\n') {
                let line_end = self.start + pos;
                f(&self.buf[self.start..line_end]);
                self.start = line_end + 1;
                continue;
            }
            if self.fill() {
                continue;
            }
            if self.end - self.start == N {
                // Overlong line: emit what we have, then discard to newline.
                f(&self.buf[..N]);
                self.start = 0;
                self.end = 0;
                self.skip_to_newline();
                continue;
            }
            if self.start < self.end {
                f(&self.buf[self.start..self.end]);
            }
            return;
        }
    }

    fn skip_to_newline(&mut self) {
        loop {
            if !self.fill() {
                return;
            }
            if let Some(pos) = self.buf[..self.end].iter().position(|b| *b == b'\n') {
                self.start = pos + 1;
                return;
            }
            self.end = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_cpath() {
        let mut path = CPath::from_fmt(format_args!("/tmp/{}-{:016x}", "app", 42)).unwrap();
        assert_eq!(path.as_str(), "/tmp/app-000000000000002a");
        assert!(path.push_str(".vcr"));
        assert_eq!(path.as_str(), "/tmp/app-000000000000002a.vcr");
        let long = "x".repeat(MAX_PATH_LEN);
        assert!(CPath::from_fmt(format_args!("{long}")).is_none());
        assert!(!path.push_str(&long));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_line_reader() {
        let mut file = tempfile::tempfile().unwrap();
        write!(file, "first\nsecond line\n{}\nlast", "y".repeat(40)).unwrap();
        use std::io::Seek;
        file.rewind().unwrap();

        let mut reader = LineReader::<16>::new(file.as_raw_fd());
        let mut lines = vec![];
        reader.for_each_line(|line| lines.push(String::from_utf8_lossy(line).to_string()));
        assert_eq!(
            lines,
            vec![
                "first".to_string(),
                "second line".to_string(),
                "y".repeat(16),
                "last".to_string()
            ]
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_read_file_into() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("comm");
        std::fs::write(&file_path, "worker\n").unwrap();
        let path = CPath::from_fmt(format_args!("{}", file_path.display())).unwrap();
        let mut out = [0u8; 64];
        assert_eq!(read_file_into(&path, &mut out), 7);
        assert_eq!(&out[..7], b"worker\n");
        assert_eq!(read_file_into(&CPath::empty(), &mut out), 0);
    }
}
