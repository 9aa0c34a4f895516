//! Monotonic millisecond clock with per-tick caching
//!
//! Deadlines across the runtime are absolute values of this clock.
//! `now()` reads a cached value so hot paths pay one syscall per
//! scheduler tick at most; the run loop refreshes the cache before every
//! poll and after every context switch.

/// Read CLOCK_MONOTONIC in milliseconds
pub fn raw_now_ms() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

/// Cached clock owned by the runtime
pub struct Clock {
    cached_ms: i64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            cached_ms: raw_now_ms(),
        }
    }

    /// Re-read the kernel clock and update the cache
    #[inline]
    pub fn refresh(&mut self) -> i64 {
        self.cached_ms = raw_now_ms();
        self.cached_ms
    }

    /// Cached reading; O(1) within one scheduler tick
    #[inline]
    pub fn now(&self) -> i64 {
        self.cached_ms
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = raw_now_ms();
        let b = raw_now_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_cache_advances_on_refresh() {
        let mut clock = Clock::new();
        let first = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(clock.now(), first);
        let refreshed = clock.refresh();
        assert!(refreshed >= first + 4);
        assert_eq!(clock.now(), refreshed);
    }
}
