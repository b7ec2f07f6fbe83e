//! Rate limiting for repetitive diagnostics.

use std::time::{Duration, Instant};

/// Lets one message through per period and counts the rest.
///
/// ```ignore
/// if let Some(suppressed) = throttle.check() {
///     debug!("odom lookup failed ({suppressed} suppressed)");
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LogThrottle {
    period: Duration,
    last_emit: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_emit: None,
            suppressed: 0,
        }
    }

    /// `Some(n)` if a message may be emitted now, with `n` occurrences
    /// suppressed since the last one.
    pub fn check(&mut self) -> Option<u64> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> Option<u64> {
        let due = self
            .last_emit
            .map_or(true, |last| now.saturating_duration_since(last) >= self.period);
        if due {
            self.last_emit = Some(now);
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}
