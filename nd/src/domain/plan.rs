//! Plan types produced by the planner
//!
//! A plan is an ordered list of frontier candidates. It is advisory: the
//! frontier may skip steps whose URLs have since been resolved, and a newer
//! plan supersedes the old one. Cross-references between steps are by index,
//! never by shared reference.

use serde::{Deserialize, Serialize};

/// Why a candidate was proposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateRole {
    /// Configured start URL
    StartUrl,
    /// Geographic hub guess (country/region/city)
    PlaceHub,
    /// Topic hub guess (politics, sport, ...)
    TopicHub,
    /// Substituted from a learned URL template
    Pattern,
    /// Found in fetched content
    Discovered,
}

impl CandidateRole {
    /// Frontier source tag recorded in queue events
    pub fn source_tag(&self) -> &'static str {
        match self {
            Self::StartUrl => "adaptive-seed",
            Self::PlaceHub => "place-hub",
            Self::TopicHub => "topic-hub",
            Self::Pattern => "pattern",
            Self::Discovered => "discovered",
        }
    }
}

/// One candidate URL within a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub url: String,
    pub role: CandidateRole,
    /// Crawl depth this candidate would be fetched at
    pub depth: u32,
    /// Base scheduling priority before cost-aware re-scoring
    pub priority: i64,
    pub estimated_cost_ms: Option<u64>,
    /// Short human rationale, recorded in planner-stage telemetry
    pub rationale: String,
}

/// An ordered, time-budgeted sequence of frontier candidates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub job_id: String,
    pub steps: Vec<PlanStep>,
    /// Unix milliseconds
    pub generated_at: i64,
    /// Levels of lookahead this plan was built with (1-3)
    pub lookahead_depth: u8,
}

impl Plan {
    pub fn new(job_id: impl Into<String>, lookahead_depth: u8) -> Self {
        Self {
            job_id: job_id.into(),
            steps: Vec::new(),
            generated_at: newsstore::now_ms(),
            lookahead_depth: lookahead_depth.clamp(1, 3),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Total estimated cost of all steps that carry an estimate
    pub fn estimated_cost_ms(&self) -> u64 {
        self.steps.iter().filter_map(|s| s.estimated_cost_ms).sum()
    }
}
