//! Planner - candidate generation for the frontier
//!
//! Produces ordered candidate sets: an initial seed plan (start URLs plus
//! topic/place hub guesses), continuation plans from learned URL patterns
//! and hub-gap analysis, and replacement plans when signals say the current
//! one stopped paying off. Plans are advisory; the frontier dedupes.
//!
//! Six independent feature flags gate the adaptive behaviors. With all of
//! them off the planner degrades to static seeds and the worker's own
//! breadth-first link discovery.

mod costs;
mod patterns;

pub use costs::{CostDeviation, CostModel, path_shape};
pub use patterns::{PatternBook, abstract_template};
pub(crate) use patterns::slugify;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use newsstore::PlannerStageEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{CandidateRole, CrawlOptions, Plan, PlanStep};

/// Independent planner feature toggles
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerFlags {
    #[serde(rename = "cost-aware-priority")]
    pub cost_aware_priority: bool,
    #[serde(rename = "pattern-discovery")]
    pub pattern_discovery: bool,
    #[serde(rename = "adaptive-branching")]
    pub adaptive_branching: bool,
    #[serde(rename = "real-time-adjustment")]
    pub real_time_adjustment: bool,
    #[serde(rename = "dynamic-replanning")]
    pub dynamic_replanning: bool,
    #[serde(rename = "cross-domain-sharing")]
    pub cross_domain_sharing: bool,
}

impl PlannerFlags {
    pub fn all_off(&self) -> bool {
        !(self.cost_aware_priority
            || self.pattern_discovery
            || self.adaptive_branching
            || self.real_time_adjustment
            || self.dynamic_replanning
            || self.cross_domain_sharing)
    }
}

/// Planner tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub flags: PlannerFlags,
    /// Candidates per expansion step
    #[serde(rename = "max-branches")]
    pub max_branches: usize,
    /// Upper bound on lookahead depth (1-3)
    #[serde(rename = "max-lookahead")]
    pub max_lookahead: u8,
    /// Pattern book LRU capacity per job
    #[serde(rename = "pattern-capacity")]
    pub pattern_capacity: usize,
    /// Templates below this hit-rate are retired
    #[serde(rename = "pattern-min-hit-rate")]
    pub pattern_min_hit_rate: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            flags: PlannerFlags::default(),
            max_branches: 8,
            max_lookahead: 3,
            pattern_capacity: 256,
            pattern_min_hit_rate: 0.2,
        }
    }
}

/// Geographic place kind, coarsest to finest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceKind {
    Country,
    Region,
    City,
}

impl PlaceKind {
    /// Candidate depth for hub guesses of this kind
    fn depth(&self) -> u32 {
        match self {
            PlaceKind::Country => 1,
            PlaceKind::Region => 2,
            PlaceKind::City => 3,
        }
    }
}

impl std::fmt::Display for PlaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaceKind::Country => write!(f, "country"),
            PlaceKind::Region => write!(f, "region"),
            PlaceKind::City => write!(f, "city"),
        }
    }
}

impl std::str::FromStr for PlaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "country" => Ok(PlaceKind::Country),
            "region" => Ok(PlaceKind::Region),
            "city" => Ok(PlaceKind::City),
            other => Err(format!("Unknown place kind: {other}")),
        }
    }
}

/// A place name available for hub guessing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceSeed {
    pub name: String,
    pub kind: PlaceKind,
    /// Parent country for regions and cities
    pub country: Option<String>,
}

/// Inputs for seed planning beyond the crawl options
#[derive(Debug, Clone, Default)]
pub struct SeedContext {
    /// Topic section slugs ("politics", "world", ...)
    pub topics: Vec<String>,
    /// Place names to guess hubs for
    pub places: Vec<PlaceSeed>,
}

/// Observed job state driving continuation planning
#[derive(Debug, Clone, Default)]
pub struct ExpansionContext {
    /// Recently verified hub URLs (pattern learning input)
    pub verified_hubs: Vec<String>,
    /// Values to substitute into learned templates
    pub place_values: Vec<String>,
    /// enqueue rate / dequeue rate; above 1 the queue is growing
    pub queue_pressure: f64,
    /// Recent problems per minute
    pub problem_rate: f64,
}

/// A condition that triggers dynamic re-planning
#[derive(Debug, Clone)]
pub enum PlannerSignal {
    /// Problem rate exceeded its threshold
    ProblemRateSpike { rate: f64, threshold: f64 },
    /// A template's hit-rate collapsed
    PatternCollapse { template: String },
    /// A cost estimate was off by more than 50%
    CostDeviation { url: String, estimated_ms: u64, actual_ms: u64 },
}

impl PlannerSignal {
    fn describe(&self) -> String {
        match self {
            PlannerSignal::ProblemRateSpike { rate, threshold } => {
                format!("problem rate {rate:.2}/min exceeded {threshold:.2}/min")
            }
            PlannerSignal::PatternCollapse { template } => {
                format!("pattern {template} hit-rate collapsed")
            }
            PlannerSignal::CostDeviation { url, estimated_ms, actual_ms } => {
                format!("cost estimate for {url} was {estimated_ms}ms, actual {actual_ms}ms")
            }
        }
    }
}

const SEED_PRIORITY: i64 = 80;
const TOPIC_HUB_PRIORITY: i64 = 60;
const PLACE_HUB_PRIORITY: i64 = 55;
const PATTERN_PRIORITY: i64 = 50;
const HUB_GAP_PRIORITY: i64 = 45;

/// Per-job planner
pub struct Planner {
    job_id: String,
    host: String,
    config: PlannerConfig,
    seed_ctx: SeedContext,
    patterns: PatternBook,
    /// Cross-domain pattern book, shared between jobs of the same category
    shared_patterns: Option<Arc<Mutex<PatternBook>>>,
    costs: CostModel,
    /// Template each outstanding candidate came from, for hit attribution
    candidate_templates: HashMap<String, String>,
    current_plan: Option<Plan>,
    last_expansion: Option<ExpansionContext>,
    stages: Vec<PlannerStageEvent>,
    rng: StdRng,
}

impl Planner {
    pub fn new(job_id: impl Into<String>, host: impl Into<String>, config: PlannerConfig, seed_ctx: SeedContext) -> Self {
        let patterns = PatternBook::new(config.pattern_capacity, config.pattern_min_hit_rate);
        Self {
            job_id: job_id.into(),
            host: host.into(),
            config,
            seed_ctx,
            patterns,
            shared_patterns: None,
            costs: CostModel::new(),
            candidate_templates: HashMap::new(),
            current_plan: None,
            last_expansion: None,
            stages: Vec::new(),
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic lookahead sampling for tests
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Attach a cross-domain pattern book (used when the flag is on)
    pub fn with_shared_patterns(mut self, shared: Arc<Mutex<PatternBook>>) -> Self {
        self.shared_patterns = Some(shared);
        self
    }

    pub fn flags(&self) -> &PlannerFlags {
        &self.config.flags
    }

    pub fn current_plan(&self) -> Option<&Plan> {
        self.current_plan.as_ref()
    }

    /// Drain planner-stage telemetry produced since the last call
    pub fn take_stages(&mut self) -> Vec<PlannerStageEvent> {
        std::mem::take(&mut self.stages)
    }

    /// Cost estimate for a URL, for frontier enqueue
    pub fn estimate(&self, url: &str) -> Option<u64> {
        self.costs.estimate(url)
    }

    /// Record an observed fetch duration
    ///
    /// Returns a deviation when the prior estimate was off by more than 50%;
    /// the caller emits the problem and, with dynamic re-planning on, feeds
    /// it back via [`Planner::react_to_signal`].
    pub fn observe_fetch(&mut self, url: &str, actual_ms: u64) -> Option<CostDeviation> {
        self.costs.record(url, actual_ms)
    }

    /// A verified hub URL; learns a pattern and credits its template
    pub fn note_hub_verified(&mut self, url: &str) {
        if self.config.flags.pattern_discovery {
            self.patterns.learn(url);
        }
        if let Some(template) = self.candidate_templates.remove(url) {
            self.patterns.record_hit(&template);
        }
    }

    /// A proposed candidate turned out not to be a hub
    ///
    /// Returns a collapse signal when the template was retired.
    pub fn note_candidate_miss(&mut self, url: &str) -> Option<PlannerSignal> {
        let template = self.candidate_templates.remove(url)?;
        if self.patterns.record_miss(&template) {
            Some(PlannerSignal::PatternCollapse { template })
        } else {
            None
        }
    }

    /// Produce the initial seed plan
    pub fn generate_seed_plan(&mut self, opts: &CrawlOptions) -> Plan {
        let lookahead = self.pick_lookahead(0.0);
        let mut plan = Plan::new(&self.job_id, lookahead);

        plan.steps.push(PlanStep {
            url: opts.url.clone(),
            role: CandidateRole::StartUrl,
            depth: 0,
            priority: SEED_PRIORITY,
            estimated_cost_ms: self.costs.estimate(&opts.url),
            rationale: "configured start URL".to_string(),
        });

        let mut topic_count = 0;
        for topic in self.seed_ctx.topics.iter().take(self.config.max_branches) {
            let url = format!("https://{}/{}", self.host, patterns::slugify(topic));
            plan.steps.push(PlanStep {
                url: url.clone(),
                role: CandidateRole::TopicHub,
                depth: 1,
                priority: TOPIC_HUB_PRIORITY,
                estimated_cost_ms: self.costs.estimate(&url),
                rationale: format!("topic hub guess ({topic})"),
            });
            topic_count += 1;
        }

        let mut place_count = 0;
        let places = self.seed_ctx.places.clone();
        for place in places.iter().take(self.config.max_branches) {
            if place.kind.depth() > lookahead as u32 {
                continue;
            }
            let url = self.place_hub_url(place);
            plan.steps.push(PlanStep {
                url: url.clone(),
                role: CandidateRole::PlaceHub,
                depth: place.kind.depth(),
                priority: PLACE_HUB_PRIORITY,
                estimated_cost_ms: self.costs.estimate(&url),
                rationale: format!("{} hub guess ({})", place.kind, place.name),
            });
            place_count += 1;
        }

        self.record_stage(
            "seed",
            format!("1 start URL, {topic_count} topic hubs, {place_count} place hubs, lookahead {lookahead}"),
            format!("emitted {} candidates", plan.len()),
            plan.estimated_cost_ms(),
        );

        debug!(job_id = %self.job_id, steps = plan.len(), "Planner::generate_seed_plan");
        self.current_plan = Some(plan.clone());
        plan
    }

    /// Produce continuation candidates from observed state
    ///
    /// With every flag off this returns an empty plan; breadth-first link
    /// discovery is the worker's job.
    pub fn propose_candidates(&mut self, ctx: &ExpansionContext) -> Plan {
        let lookahead = self.pick_lookahead(ctx.queue_pressure);
        let mut plan = Plan::new(&self.job_id, lookahead);
        let budget = self.config.max_branches * lookahead as usize;

        if self.config.flags.pattern_discovery {
            for hub in &ctx.verified_hubs {
                self.patterns.learn(hub);
            }

            if self.config.flags.cross_domain_sharing
                && let Some(shared) = self.shared_patterns.clone()
            {
                let mut shared = shared.lock().unwrap_or_else(|e| e.into_inner());
                self.patterns.adopt_from(&shared);
                shared.adopt_from(&self.patterns);
            }

            for (url, template) in self.patterns.expand(&self.host, &ctx.place_values, budget) {
                self.candidate_templates.insert(url.clone(), template.clone());
                plan.steps.push(PlanStep {
                    url: url.clone(),
                    role: CandidateRole::Pattern,
                    depth: lookahead as u32,
                    priority: PATTERN_PRIORITY,
                    estimated_cost_ms: self.costs.estimate(&url),
                    rationale: format!("substituted into {template}"),
                });
            }
        }

        if self.config.flags.real_time_adjustment {
            // Hub-gap analysis: expected hubs the crawl has not verified yet
            let verified: Vec<&str> = ctx.verified_hubs.iter().map(String::as_str).collect();
            for place in self.seed_ctx.places.clone() {
                if plan.len() >= budget {
                    break;
                }
                let url = self.place_hub_url(&place);
                if !verified.contains(&url.as_str()) && !plan.steps.iter().any(|s| s.url == url) {
                    plan.steps.push(PlanStep {
                        url: url.clone(),
                        role: CandidateRole::PlaceHub,
                        depth: place.kind.depth(),
                        priority: HUB_GAP_PRIORITY,
                        estimated_cost_ms: self.costs.estimate(&url),
                        rationale: format!("hub gap: {} not yet verified", place.name),
                    });
                }
            }
        }

        plan.steps.truncate(budget);

        self.record_stage(
            "expand",
            format!(
                "{} templates, pressure {:.2}, lookahead {lookahead}",
                self.patterns.len(),
                ctx.queue_pressure
            ),
            format!("emitted {} candidates", plan.len()),
            plan.estimated_cost_ms(),
        );

        self.last_expansion = Some(ctx.clone());
        self.current_plan = Some(plan.clone());
        plan
    }

    /// Dynamic re-planning trigger
    ///
    /// Records the signal; with the flag off the current plan stands and the
    /// planner only notes what happened. With the flag on a replacement plan
    /// is produced that supersedes the current one.
    pub fn react_to_signal(&mut self, signal: PlannerSignal) -> Option<Plan> {
        let description = signal.describe();

        if let PlannerSignal::PatternCollapse { ref template } = signal {
            self.patterns.retire(template);
        }

        if !self.config.flags.dynamic_replanning {
            self.record_stage("signal", description, "replanning disabled, plan kept".to_string(), 0);
            return None;
        }

        let mut ctx = self.last_expansion.clone().unwrap_or_default();
        if matches!(signal, PlannerSignal::ProblemRateSpike { .. }) {
            // Bias the next plan toward shallow, conservative expansion
            ctx.queue_pressure = ctx.queue_pressure.max(2.0);
        }

        self.record_stage("replan", description, "superseding current plan".to_string(), 0);
        Some(self.propose_candidates(&ctx))
    }

    fn place_hub_url(&self, place: &PlaceSeed) -> String {
        let slug = patterns::slugify(&place.name);
        match (place.kind, place.country.as_deref()) {
            (PlaceKind::Country, _) | (_, None) => format!("https://{}/world/{}", self.host, slug),
            (_, Some(country)) => {
                format!("https://{}/world/{}/{}", self.host, patterns::slugify(country), slug)
            }
        }
    }

    /// Sample a lookahead depth
    ///
    /// Default distribution is 40% depth-1, 40% depth-2, 20% depth-3; it
    /// shifts toward shallow when the queue grows faster than it drains.
    fn pick_lookahead(&mut self, queue_pressure: f64) -> u8 {
        if !self.config.flags.adaptive_branching {
            return 1;
        }
        let weights = if queue_pressure > 1.5 {
            [0.70, 0.25, 0.05]
        } else {
            [0.40, 0.40, 0.20]
        };
        let roll: f64 = self.rng.random();
        let depth = if roll < weights[0] {
            1
        } else if roll < weights[0] + weights[1] {
            2
        } else {
            3
        };
        depth.min(self.config.max_lookahead)
    }

    fn record_stage(&mut self, stage: &str, rationale: String, decision: String, estimated_cost_ms: u64) {
        let mut event = PlannerStageEvent::new(&self.job_id, stage);
        event.rationale = Some(rationale);
        event.decision = Some(decision);
        event.estimated_cost_ms = if estimated_cost_ms > 0 { Some(estimated_cost_ms) } else { None };
        self.stages.push(event);
    }
}
