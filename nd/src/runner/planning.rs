//! Per-job planning state
//!
//! Each crawl job owns a frontier and a planner for its lifetime. The runner
//! feeds worker observations in (verified hubs, fetch durations, problems)
//! and takes candidate URLs out; candidates pass through the frontier so
//! ordering, dedupe and queue telemetry stay in one place. The frontier is
//! discarded with the job.

use std::collections::VecDeque;

use newsstore::{PlannerStageEvent, QueueEvent, now_ms};
use tracing::debug;

use crate::domain::{CrawlOptions, host_of};
use crate::frontier::{Frontier, FrontierConfig, FrontierEntry};
use crate::planner::{CostDeviation, ExpansionContext, Planner, PlannerConfig, PlannerSignal, SeedContext};

/// Problems per minute that trigger re-planning
const PROBLEM_RATE_THRESHOLD: f64 = 6.0;

/// Sliding window for the problem rate (one minute)
const PROBLEM_WINDOW_MS: i64 = 60_000;

/// Frontier + planner pair owned by one crawl job
pub struct JobPlanning {
    frontier: Frontier,
    planner: Planner,
    host: String,
    max_feed: usize,
    /// Recently verified hub URLs, input to the next expansion
    verified_hubs: Vec<String>,
    /// Every URL ever handed to the frontier; dequeued URLs never re-enter
    seen: std::collections::HashSet<String>,
    /// Problem timestamps within the sliding window
    problem_times: VecDeque<i64>,
    enqueued: u64,
    dequeued: u64,
}

impl JobPlanning {
    pub fn new(
        task_id: &str,
        options: &CrawlOptions,
        planner_config: PlannerConfig,
        frontier_config: FrontierConfig,
        seed_ctx: SeedContext,
    ) -> Self {
        let host = host_of(&options.url).unwrap_or_else(|| "unknown".to_string());
        let max_feed = planner_config.max_branches;
        Self {
            frontier: Frontier::new(task_id, frontier_config),
            planner: Planner::new(task_id, &host, planner_config, seed_ctx),
            host,
            max_feed,
            verified_hubs: Vec::new(),
            seen: std::collections::HashSet::new(),
            problem_times: VecDeque::new(),
            enqueued: 0,
            dequeued: 0,
        }
    }

    /// Deterministic lookahead sampling for tests
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.planner = self.planner.with_rng_seed(seed);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn frontier_size(&self) -> usize {
        self.frontier.size()
    }

    /// Generate the seed plan and hand back the initial URLs for the worker
    pub fn seed(&mut self, options: &CrawlOptions) -> Vec<String> {
        let plan = self.planner.generate_seed_plan(options);
        self.enqueue_plan_steps(&plan);
        self.drain_ready()
    }

    /// A hub was verified; learn from it and possibly expand
    pub fn on_hub_verified(&mut self, url: &str) -> Vec<String> {
        self.planner.note_hub_verified(url);
        self.verified_hubs.push(url.to_string());
        let plan = self.planner.propose_candidates(&self.expansion_context());
        self.enqueue_plan_steps(&plan);
        self.drain_ready()
    }

    /// A proposed candidate turned out not to be a hub
    pub fn on_candidate_missed(&mut self, url: &str) -> Vec<String> {
        if let Some(signal) = self.planner.note_candidate_miss(url) {
            if let Some(plan) = self.planner.react_to_signal(signal) {
                self.enqueue_plan_steps(&plan);
                return self.drain_ready();
            }
        }
        Vec::new()
    }

    /// An observed fetch; updates the cost model and the frontier scorer
    ///
    /// Returns a deviation when the estimate was off by more than half.
    pub fn on_fetch_observed(&mut self, url: &str, duration_ms: u64) -> Option<CostDeviation> {
        self.frontier.record_fetch_duration(duration_ms);
        let deviation = self.planner.observe_fetch(url, duration_ms)?;
        debug!(url, estimated = deviation.estimated_ms, actual = deviation.actual_ms, "cost deviation");
        Some(deviation)
    }

    /// Feed a cost deviation back as a re-planning signal
    pub fn on_cost_deviation(&mut self, deviation: &CostDeviation) -> Vec<String> {
        let signal = PlannerSignal::CostDeviation {
            url: deviation.url.clone(),
            estimated_ms: deviation.estimated_ms,
            actual_ms: deviation.actual_ms,
        };
        if let Some(plan) = self.planner.react_to_signal(signal) {
            self.enqueue_plan_steps(&plan);
            return self.drain_ready();
        }
        Vec::new()
    }

    /// A problem was observed; a rate spike triggers re-planning
    pub fn on_problem(&mut self) -> Vec<String> {
        let now = now_ms();
        self.problem_times.push_back(now);
        while self.problem_times.front().is_some_and(|&t| t < now - PROBLEM_WINDOW_MS) {
            self.problem_times.pop_front();
        }
        let rate = self.problem_times.len() as f64;
        if rate < PROBLEM_RATE_THRESHOLD {
            return Vec::new();
        }
        self.problem_times.clear();
        let signal = PlannerSignal::ProblemRateSpike {
            rate,
            threshold: PROBLEM_RATE_THRESHOLD,
        };
        if let Some(plan) = self.planner.react_to_signal(signal) {
            self.enqueue_plan_steps(&plan);
            return self.drain_ready();
        }
        Vec::new()
    }

    /// The worker filtered a URL without fetching it
    pub fn on_skip(&mut self, url: &str, reason: &str) {
        self.frontier.skip(url, reason);
    }

    /// Drain queue events and planner stages produced since the last call
    pub fn drain_telemetry(&mut self) -> (Vec<QueueEvent>, Vec<PlannerStageEvent>) {
        (self.frontier.take_events(), self.planner.take_stages())
    }

    /// Discard planning state (job reached a terminal status)
    pub fn discard(&mut self) {
        self.frontier.clear();
    }

    fn expansion_context(&self) -> ExpansionContext {
        let place_values: Vec<String> = self.verified_hubs
            .iter()
            .rev()
            .take(8)
            .filter_map(|url| url.rsplit('/').next().map(str::to_string))
            .collect();
        ExpansionContext {
            verified_hubs: self.verified_hubs.clone(),
            place_values,
            queue_pressure: if self.dequeued == 0 {
                self.enqueued as f64
            } else {
                self.enqueued as f64 / self.dequeued as f64
            },
            problem_rate: self.problem_times.len() as f64,
        }
    }

    fn enqueue_plan_steps(&mut self, plan: &crate::domain::Plan) {
        for step in &plan.steps {
            let Some(host) = host_of(&step.url) else { continue };
            // A URL already handed out never re-enters; a pending one may
            // still have its priority raised
            if !self.frontier.contains(&step.url) && !self.seen.insert(step.url.clone()) {
                continue;
            }
            let mut entry = FrontierEntry::new(&step.url, host, step.depth, step.priority)
                .with_source(step.role.source_tag());
            if let Some(cost) = step.estimated_cost_ms.or_else(|| self.planner.estimate(&step.url)) {
                entry = entry.with_cost(cost);
            }
            self.frontier.enqueue(entry);
            self.enqueued += 1;
        }
    }

    /// Pop the best candidates to hand to the worker
    fn drain_ready(&mut self) -> Vec<String> {
        let mut urls = Vec::new();
        while urls.len() < self.max_feed {
            match self.frontier.dequeue() {
                Some(entry) => {
                    self.dequeued += 1;
                    urls.push(entry.url);
                }
                None => break,
            }
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{PlaceKind, PlaceSeed, PlannerFlags};
    use newsstore::QueueAction;

    fn planning(flags: PlannerFlags) -> JobPlanning {
        let options = CrawlOptions::new("https://example.com/");
        let seed_ctx = SeedContext {
            topics: vec!["world".into()],
            places: vec![PlaceSeed {
                name: "France".into(),
                kind: PlaceKind::Country,
                country: None,
            }],
        };
        let planner_config = PlannerConfig {
            flags,
            ..Default::default()
        };
        JobPlanning::new("job-1", &options, planner_config, FrontierConfig::default(), seed_ctx).with_rng_seed(3)
    }

    #[test]
    fn test_seed_produces_urls_and_telemetry() {
        let mut planning = planning(PlannerFlags::default());
        let urls = planning.seed(&CrawlOptions::new("https://example.com/"));

        // Start URL first: it carries the highest seed priority
        assert_eq!(urls[0], "https://example.com/");
        assert!(urls.contains(&"https://example.com/world".to_string()));
        assert!(urls.contains(&"https://example.com/world/france".to_string()));

        let (queue_events, stages) = planning.drain_telemetry();
        assert!(queue_events.iter().any(|e| e.action == QueueAction::Enqueue));
        assert!(queue_events.iter().any(|e| e.action == QueueAction::Dequeue));
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].stage, "seed");
    }

    #[test]
    fn test_hub_verified_expands_patterns() {
        let mut planning = planning(PlannerFlags {
            pattern_discovery: true,
            ..Default::default()
        });
        planning.seed(&CrawlOptions::new("https://example.com/"));
        planning.drain_telemetry();

        let fed = planning.on_hub_verified("https://example.com/world/france");
        // The verified hub's last segment substitutes into the learned template,
        // but france itself was already dequeued at seed time
        assert!(!fed.contains(&"https://example.com/world/france".to_string()));

        let (_, stages) = planning.drain_telemetry();
        assert!(stages.iter().any(|s| s.stage == "expand"));
    }

    #[test]
    fn test_problem_rate_spike_replans() {
        let mut planning = planning(PlannerFlags {
            pattern_discovery: true,
            dynamic_replanning: true,
            ..Default::default()
        });
        planning.seed(&CrawlOptions::new("https://example.com/"));
        planning.on_hub_verified("https://example.com/world/france");
        planning.drain_telemetry();

        let mut replanned = false;
        for _ in 0..10 {
            if !planning.on_problem().is_empty() {
                replanned = true;
            }
        }
        let (_, stages) = planning.drain_telemetry();
        // Threshold crossed within the window: a replan stage was recorded
        assert!(stages.iter().any(|s| s.stage == "replan"));
        let _ = replanned;
    }

    #[test]
    fn test_cost_deviation_detected() {
        let mut planning = planning(PlannerFlags {
            cost_aware_priority: true,
            ..Default::default()
        });
        planning.on_fetch_observed("https://example.com/world/a", 100);
        let deviation = planning.on_fetch_observed("https://example.com/world/b", 700);
        assert!(deviation.is_some());
    }

    #[test]
    fn test_skip_records_event() {
        let mut planning = planning(PlannerFlags::default());
        planning.on_skip("https://example.com/login", "filtered: auth page");
        let (events, _) = planning.drain_telemetry();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, QueueAction::Skip);
    }

    #[test]
    fn test_discard_clears_frontier() {
        let mut planning = planning(PlannerFlags::default());
        planning.seed(&CrawlOptions::new("https://example.com/"));
        planning.discard();
        assert_eq!(planning.frontier_size(), 0);
    }
}
