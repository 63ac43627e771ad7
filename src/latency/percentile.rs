//! Bounded rolling estimator for latency quantiles.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::time::Instant;

/// Distribution summary in milliseconds. All zeros when empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PercentileSummary {
    /// Samples currently retained.
    pub count: usize,
    /// Samples ever recorded, including evicted ones.
    pub total_count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Value at quantile `p` (0.0..=1.0) of an ascending slice, by rounded rank.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 - 1.0) * p.clamp(0.0, 1.0)).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Keeps the newest `capacity` samples with their arrival instant.
#[derive(Debug, Clone)]
pub struct RollingEstimator {
    capacity: usize,
    samples: VecDeque<(Instant, f64)>,
    total_count: u64,
}

impl RollingEstimator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity.min(4096)),
            total_count: 0,
        }
    }

    pub fn record(&mut self, ms: f64) {
        self.record_at(Instant::now(), ms);
    }

    pub fn record_at(&mut self, at: Instant, ms: f64) {
        if !ms.is_finite() {
            return;
        }
        self.samples.push_back((at, ms.max(0.0)));
        self.total_count += 1;
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Drop samples recorded before `cutoff`. Returns how many were removed.
    pub fn evict_before(&mut self, cutoff: Instant) -> usize {
        let before = self.samples.len();
        while self.samples.front().is_some_and(|(at, _)| *at < cutoff) {
            self.samples.pop_front();
        }
        before - self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summary(&self) -> PercentileSummary {
        if self.samples.is_empty() {
            return PercentileSummary {
                total_count: self.total_count,
                ..PercentileSummary::default()
            };
        }
        let mut sorted: Vec<f64> = self.samples.iter().map(|(_, ms)| *ms).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        PercentileSummary {
            count: sorted.len(),
            total_count: self.total_count,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            stddev: variance.sqrt(),
            p50: percentile(&sorted, 0.50),
            p90: percentile(&sorted, 0.90),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        }
    }
}
