//! Cost-aware priority scoring
//!
//! Keeps a rolling window of observed fetch durations and nudges cheap
//! fetches up by at most 30%: `effective = base * (1 + clamp(1 - est/p95, 0, 0.3))`.

use std::collections::VecDeque;

/// Maximum boost applied to a cheap fetch
const MAX_BOOST: f64 = 0.3;

/// Rolling window of observed fetch durations
#[derive(Debug)]
pub struct PriorityScorer {
    window: VecDeque<u64>,
    capacity: usize,
}

impl PriorityScorer {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record an observed fetch duration
    pub fn record(&mut self, duration_ms: u64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(duration_ms);
    }

    /// 95th percentile of the recent window
    pub fn p95_ms(&self) -> Option<u64> {
        if self.window.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    /// Boost fraction for an estimated cost, in [0, MAX_BOOST]
    pub fn boost(&self, estimated_cost_ms: Option<u64>) -> f64 {
        let Some(est) = estimated_cost_ms else { return 0.0 };
        let Some(p95) = self.p95_ms() else { return 0.0 };
        if p95 == 0 {
            return 0.0;
        }
        (1.0 - est as f64 / p95 as f64).clamp(0.0, MAX_BOOST)
    }

    /// Effective priority in milli-units (base x 1000, boosted)
    pub fn score_milli(&self, base_priority: i64, estimated_cost_ms: Option<u64>) -> i64 {
        let boost = self.boost(estimated_cost_ms);
        (base_priority as f64 * (1.0 + boost) * 1000.0).round() as i64
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }
}

impl Default for PriorityScorer {
    fn default() -> Self {
        Self::new(256)
    }
}
