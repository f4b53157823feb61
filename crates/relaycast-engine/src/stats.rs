//! Latency and throughput aggregation.

use std::collections::VecDeque;
use std::time::Duration;

use relaycast_ipc::LatencyStatistics;

/// Weighted moving average over the last `len` samples.
///
/// The newest sample weighs `len`, the one before `len - 1` and so on.
/// Statistics are reported once every `every` recorded samples.
#[derive(Debug, Clone)]
pub struct WeightedAverage {
    len: usize,
    every: usize,
    samples: VecDeque<f64>,
    pending: usize,
    session_min: f64,
    session_max: f64,
}

impl WeightedAverage {
    pub fn new(len: usize, every: usize) -> Self {
        let len = len.max(1);
        Self {
            len,
            every: every.max(1),
            samples: VecDeque::with_capacity(len),
            pending: 0,
            session_min: f64::INFINITY,
            session_max: f64::NEG_INFINITY,
        }
    }

    /// Window sized for a stream at `fps`: two seconds of samples, reported
    /// once per second.
    pub fn for_rate(fps: u32) -> Self {
        let fps = fps.max(1) as usize;
        Self::new(fps * 2, fps)
    }

    /// Records a sample. Returns statistics when a report is due.
    pub fn record(&mut self, value: f64) -> Option<LatencyStatistics> {
        if !value.is_finite() {
            return None;
        }

        if self.samples.len() == self.len {
            self.samples.pop_back();
        }
        self.samples.push_front(value);
        self.session_min = self.session_min.min(value);
        self.session_max = self.session_max.max(value);

        self.pending += 1;
        if self.pending < self.every {
            return None;
        }
        self.pending = 0;
        self.snapshot()
    }

    /// Current statistics, `None` before the first sample.
    pub fn snapshot(&self) -> Option<LatencyStatistics> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sum = 0.0;
        let mut weights = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for (i, &value) in self.samples.iter().enumerate() {
            let weight = (self.len - i) as f64;
            sum += value * weight;
            weights += weight;
            min = min.min(value);
            max = max.max(value);
        }

        Some(LatencyStatistics {
            avg: (sum / weights).clamp(min, max),
            min,
            max,
            session_min: self.session_min,
            session_max: self.session_max,
        })
    }
}

/// Counts events per fixed time bucket.
#[derive(Debug, Clone)]
pub struct RateCounter {
    bucket_ms: u64,
    bucket: Option<u64>,
    count: u64,
}

impl RateCounter {
    pub fn new(bucket: Duration) -> Self {
        Self {
            bucket_ms: (bucket.as_millis() as u64).max(1),
            bucket: None,
            count: 0,
        }
    }

    /// Counts one event at `now_ms`.
    pub fn record(&mut self, now_ms: u64) -> Option<u64> {
        self.record_n(1, now_ms)
    }

    /// Counts `n` events at `now_ms`. Returns the bucket total when a bucket
    /// boundary was crossed; the counter then starts over.
    pub fn record_n(&mut self, n: u64, now_ms: u64) -> Option<u64> {
        self.count += n;
        let bucket = now_ms / self.bucket_ms;
        match self.bucket {
            None => {
                self.bucket = Some(bucket);
                None
            }
            Some(last) if bucket > last => {
                self.bucket = Some(bucket);
                Some(std::mem::take(&mut self.count))
            }
            Some(_) => None,
        }
    }
}
