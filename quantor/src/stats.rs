//! Counters and scoped timers with an exponential histogram, used to
//! profile the solve loop per scope and the preprocessing phases.

#[cfg(feature = "timing")]
use std::time::Instant;

use itertools::Itertools;
use log::info;

/// Accumulates samples (typically seconds) with min/max/total tracking and
/// an exponential histogram. Without the `timing` feature the timer entry
/// points compile to no-ops; explicit [`Stats::record`] calls still work.
#[derive(Clone, Debug)]
pub struct Stats {
    count: usize,
    total: f64,
    min: f64,
    max: f64,
    histogram: Vec<u32>,
    /// Scales samples before bucketing; `10_000.0` gives 0.1ms resolution.
    factor: f64,
    #[cfg(feature = "timing")]
    started: Option<Instant>,
}

impl Stats {
    pub fn new(factor: f64) -> Self {
        Self {
            count: 0,
            total: 0.0,
            min: 0.0,
            max: 0.0,
            histogram: Vec::new(),
            factor,
            #[cfg(feature = "timing")]
            started: None,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    #[cfg(feature = "timing")]
    pub fn start_timer(&mut self) {
        self.started = Some(Instant::now());
    }

    #[cfg(not(feature = "timing"))]
    pub fn start_timer(&mut self) {}

    #[cfg(feature = "timing")]
    pub fn stop_and_record(&mut self) {
        if let Some(started) = self.started.take() {
            self.record(started.elapsed().as_secs_f64());
        }
    }

    #[cfg(not(feature = "timing"))]
    pub fn stop_and_record(&mut self) {}

    pub fn record(&mut self, value: f64) {
        debug_assert!((0.0..1e9).contains(&value));
        if self.count == 0 {
            self.min = value;
            self.max = value;
        }
        self.count += 1;
        self.total += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let bucket = (self.factor * value).log2().ceil().max(0.0) as usize;
        if bucket >= self.histogram.len() {
            self.histogram.resize(bucket + 1, 0);
        }
        self.histogram[bucket] += 1;
    }

    pub fn print_time(&self, label: &str) {
        info!("{} took {:.6}s", label, self.total);
    }

    pub fn print(&self) {
        if self.count == 0 {
            info!("    no samples");
            return;
        }
        info!(
            "    average: {:.6}  total: {:.6}  min/max: {:.6}/{:.6}  count: {}",
            self.total / self.count as f64,
            self.total,
            self.min,
            self.max,
            self.count
        );
        let buckets = self
            .histogram
            .iter()
            .enumerate()
            .map(|(i, n)| format!("{i}:{n}"))
            .join(" ");
        info!("    histogram: {}", buckets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_tracks_extremes() {
        let mut stats = Stats::new(10_000.0);
        stats.record(0.5);
        stats.record(0.1);
        stats.record(0.9);
        assert_eq!(stats.count(), 3);
        assert!((stats.total() - 1.5).abs() < 1e-9);
        assert!((stats.min - 0.1).abs() < 1e-9);
        assert!((stats.max - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_buckets_grow() {
        let mut stats = Stats::new(1.0);
        stats.record(1.0);
        stats.record(16.0);
        assert_eq!(stats.histogram.iter().sum::<u32>(), 2);
        assert!(stats.histogram.len() >= 5);
    }

    #[cfg(feature = "timing")]
    #[test]
    fn test_timer_records_a_sample() {
        let mut stats = Stats::new(10_000.0);
        stats.start_timer();
        stats.stop_and_record();
        assert_eq!(stats.count(), 1);
    }
}
