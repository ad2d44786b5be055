//! Fetch cost estimation
//!
//! Costs are tracked in rolling windows grouped by (host, path shape). After
//! each completed fetch the actual duration is recorded; a large estimation
//! error is surfaced so the planner can emit a cost-deviation problem and
//! replan.

use std::collections::{HashMap, VecDeque};

use crate::domain::host_of;

/// Samples kept per (host, path shape) group
const WINDOW: usize = 32;

/// Estimation error ratio above which a deviation is reported
const DEVIATION_THRESHOLD: f64 = 0.5;

/// Reduce a URL path to its shape
///
/// The first segment is kept literal (it usually names the section); deeper
/// segments collapse to `{n}` for numbers and `{s}` otherwise.
/// `https://example.com/world/france/2024` becomes `/world/{s}/{n}`.
pub fn path_shape(url: &str) -> String {
    let path = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("/");
    let path = path.split(['?', '#']).next().unwrap_or("/");

    let mut shape = String::new();
    for (i, segment) in path.split('/').filter(|s| !s.is_empty()).enumerate() {
        shape.push('/');
        if i == 0 {
            shape.push_str(segment);
        } else if segment.chars().all(|c| c.is_ascii_digit()) {
            shape.push_str("{n}");
        } else {
            shape.push_str("{s}");
        }
    }
    if shape.is_empty() {
        shape.push('/');
    }
    shape
}

/// A reported estimation miss
#[derive(Debug, Clone)]
pub struct CostDeviation {
    pub url: String,
    pub estimated_ms: u64,
    pub actual_ms: u64,
    /// |actual - estimated| / estimated
    pub error: f64,
}

#[derive(Debug, Default)]
struct Rolling {
    samples: VecDeque<u64>,
}

impl Rolling {
    fn record(&mut self, ms: u64) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    fn mean(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() / self.samples.len() as u64)
    }
}

/// Rolling cost estimates grouped by (host, path shape)
#[derive(Debug, Default)]
pub struct CostModel {
    groups: HashMap<(String, String), Rolling>,
}

impl CostModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(url: &str) -> Option<(String, String)> {
        Some((host_of(url)?, path_shape(url)))
    }

    /// Estimated cost for a URL, if its group has history
    pub fn estimate(&self, url: &str) -> Option<u64> {
        let key = Self::key(url)?;
        self.groups.get(&key)?.mean()
    }

    /// Record an observed cost; reports a deviation when the prior estimate
    /// was off by more than 50%
    pub fn record(&mut self, url: &str, actual_ms: u64) -> Option<CostDeviation> {
        let key = Self::key(url)?;
        let estimated = self.groups.get(&key).and_then(Rolling::mean);
        self.groups.entry(key).or_default().record(actual_ms);

        let estimated_ms = estimated?;
        if estimated_ms == 0 {
            return None;
        }
        let error = (actual_ms.abs_diff(estimated_ms)) as f64 / estimated_ms as f64;
        if error > DEVIATION_THRESHOLD {
            Some(CostDeviation {
                url: url.to_string(),
                estimated_ms,
                actual_ms,
                error,
            })
        } else {
            None
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
