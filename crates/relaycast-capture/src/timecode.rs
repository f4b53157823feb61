//! Per-instance timecode clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of wall-clock and monotonic readings.
pub trait ClockSource: Send + Sync {
    /// Wall-clock time since the Unix epoch, in nanoseconds.
    fn wall_ns(&self) -> u64;

    /// Monotonic time since an arbitrary origin, in nanoseconds.
    fn monotonic_ns(&self) -> u64;
}

/// Operating-system clocks.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn wall_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn monotonic_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Nanosecond timecodes anchored to the wall clock once, then advanced from
/// the monotonic clock only.
///
/// Successive calls to [`TimecodeClock::next`] return strictly increasing
/// values, whatever happens to the system clock during a run.
pub struct TimecodeClock {
    source: Arc<dyn ClockSource>,
    anchor: u64,
    last: AtomicU64,
}

impl TimecodeClock {
    /// Anchors a new clock on the given source.
    pub fn new(source: Arc<dyn ClockSource>) -> Self {
        let anchor = source.wall_ns().saturating_sub(source.monotonic_ns());
        Self {
            source,
            anchor,
            last: AtomicU64::new(0),
        }
    }

    /// Anchors a new clock on the operating-system clocks.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock::new()))
    }

    /// Returns the next timecode.
    pub fn next(&self) -> u64 {
        let candidate = self.anchor.saturating_add(self.source.monotonic_ns());
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(candidate.max(last.saturating_add(1)))
            })
            .unwrap_or(candidate);
        candidate.max(previous.saturating_add(1))
    }
}

impl std::fmt::Debug for TimecodeClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimecodeClock")
            .field("anchor", &self.anchor)
            .field("last", &self.last.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedClock {
        wall: Mutex<u64>,
        mono: Mutex<u64>,
    }

    impl ClockSource for ScriptedClock {
        fn wall_ns(&self) -> u64 {
            *self.wall.lock()
        }

        fn monotonic_ns(&self) -> u64 {
            *self.mono.lock()
        }
    }

    #[test]
    fn test_anchored_to_wall_clock() {
        let source = Arc::new(ScriptedClock {
            wall: Mutex::new(1_000_000),
            mono: Mutex::new(400),
        });
        let clock = TimecodeClock::new(source.clone());
        assert_eq!(clock.next(), 1_000_000);

        *source.mono.lock() = 900;
        assert_eq!(clock.next(), 1_000_500);
    }

    #[test]
    fn test_strictly_increasing_under_wall_clock_rollback() {
        let source = Arc::new(ScriptedClock {
            wall: Mutex::new(5_000_000_000),
            mono: Mutex::new(0),
        });
        let clock = TimecodeClock::new(source.clone());

        let mut previous = clock.next();
        for step in 1..100u64 {
            // Wall clock jumps back an hour; it must not matter.
            *source.wall.lock() = 1_000;
            if step % 3 != 0 {
                *source.mono.lock() += 10;
            }
            let current = clock.next();
            assert!(current > previous, "{current} <= {previous}");
            previous = current;
        }
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = TimecodeClock::system();
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
    }
}
