// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Deadline bookkeeping for the bounded waits of the capture path.
///
/// `Instant::now` is a plain `clock_gettime(CLOCK_MONOTONIC)` and is safe to
/// call from a signal handler.
pub struct TimeoutManager {
    start_time: Instant,
    timeout: Duration,
}

impl TimeoutManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start_time.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.start_time.elapsed() >= self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("start_time", &self.start_time)
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Sleeps for `duration` with `nanosleep`, which unlike `std::thread::sleep`
/// is on the async-signal-safe list.
pub fn signal_safe_sleep(duration: Duration) {
    let ts = libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };
    // Interruptions just shorten the sleep, which every caller tolerates.
    unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_manager_new() {
        let timeout = Duration::from_secs(5);
        let manager = TimeoutManager::new(timeout);

        assert_eq!(manager.timeout(), timeout);
        assert!(manager.elapsed() < Duration::from_millis(100));
        assert!(!manager.expired());
    }

    #[test]
    fn test_timeout_manager_expires() {
        let manager = TimeoutManager::new(Duration::from_millis(10));
        signal_safe_sleep(Duration::from_millis(30));
        assert!(manager.expired());
        assert_eq!(manager.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_timeout_manager_debug() {
        let manager = TimeoutManager::new(Duration::from_secs(1));
        let debug_str = format!("{:?}", manager);
        assert!(debug_str.contains("TimeoutManager"));
        assert!(debug_str.contains("remaining"));
    }
}
