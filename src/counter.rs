//! Counters measuring the throughput of a transfer or connection.

use std::time::Instant;

/// The weight of the latest full second when folding it into the rolling
/// average. With 0.4, roughly the last one to two seconds dominate.
const ROUND_WEIGHT: f64 = 0.4;

/// After this many idle seconds the average is treated as zero rather than
/// decayed further.
const IDLE_RESET_SECS: u64 = 5;

/// Counts payload bytes over time and maintains a rolling per-second
/// average. Driven purely by [`record`](Self::record) and
/// [`avg`](Self::avg) calls; time is folded in lazily.
#[derive(Debug)]
pub(crate) struct ThruputCounter {
    /// All payload bytes ever recorded.
    total: u64,
    /// Bytes recorded in the current one second round.
    round: u64,
    /// The highest single-round byte count seen.
    peak: u64,
    /// Rolling weighted average of bytes per second.
    avg: f64,
    last_roll: Instant,
}

impl ThruputCounter {
    pub fn new() -> Self {
        Self {
            total: 0,
            round: 0,
            peak: 0,
            avg: 0.0,
            last_roll: Instant::now(),
        }
    }

    /// Records `bytes` of payload traffic.
    pub fn record(&mut self, bytes: u64) {
        self.roll();
        self.round += bytes;
        self.total += bytes;
    }

    /// The rolling average throughput, in bytes per second.
    pub fn avg(&mut self) -> u64 {
        self.roll();
        self.avg.round() as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    #[allow(dead_code)]
    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// Folds finished one second rounds into the average.
    fn roll(&mut self) {
        let elapsed = self.last_roll.elapsed().as_secs();
        if elapsed == 0 {
            return;
        }
        self.peak = self.peak.max(self.round);
        self.avg = self.avg * (1.0 - ROUND_WEIGHT) + self.round as f64 * ROUND_WEIGHT;
        self.round = 0;
        if elapsed >= IDLE_RESET_SECS {
            self.avg = 0.0;
        } else {
            // decay through the fully idle seconds
            for _ in 1..elapsed {
                self.avg *= 1.0 - ROUND_WEIGHT;
            }
        }
        self.last_roll = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn records_accumulate_into_total() {
        let mut c = ThruputCounter::new();
        c.record(100);
        c.record(200);
        assert_eq!(c.total(), 300);
    }

    #[test]
    fn average_follows_rounds() {
        let mut c = ThruputCounter::new();
        c.record(1000);
        // same round: the average hasn't folded yet
        assert_eq!(c.avg(), 0);

        c.last_roll = Instant::now() - Duration::from_secs(1);
        let avg = c.avg();
        assert_eq!(avg, 400); // 1000 * ROUND_WEIGHT

        // an idle stretch zeroes it out
        c.last_roll = Instant::now() - Duration::from_secs(10);
        assert_eq!(c.avg(), 0);
    }
}
