//! Structured worker output parser
//!
//! The external worker writes line-oriented records on stdout: a prefix tag
//! selecting the record kind, then a JSON payload. The parser turns each
//! line into a typed [`WorkerEvent`]; unparseable lines surface as errors
//! that the runner logs and ignores.

use newsstore::QueueAction;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// A line the parser could not handle
#[derive(Debug, Error)]
pub enum OutputParseError {
    #[error("empty line")]
    Empty,

    #[error("unknown record prefix: {0}")]
    UnknownPrefix(String),

    #[error("missing payload for {0}")]
    MissingPayload(&'static str),

    #[error("malformed {prefix} payload: {message}")]
    Malformed { prefix: &'static str, message: String },
}

/// One structured record from the worker's stdout
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Progress {
        current: u64,
        total: u64,
        stage: Option<String>,
        message: Option<String>,
    },
    Queue {
        action: QueueAction,
        url: String,
        depth: Option<u32>,
        host: Option<String>,
        reason: Option<String>,
        queue_size: Option<u64>,
        role: Option<String>,
        depth_bucket: Option<String>,
    },
    Problem {
        kind: String,
        scope: Option<String>,
        target: Option<String>,
        message: String,
        details: Option<Value>,
    },
    Milestone {
        kind: String,
        scope: Option<String>,
        target: Option<String>,
        message: String,
        details: Option<Value>,
    },
    PlannerStage {
        stage: String,
        rationale: Option<String>,
        estimated_cost_ms: Option<u64>,
        decision: Option<String>,
    },
    Error {
        message: String,
        fatal: bool,
    },
    /// Advisory cache diagnostic, folded into progress metadata
    Cache { details: Value },
}

#[derive(Deserialize)]
struct ProgressPayload {
    #[serde(default)]
    current: u64,
    #[serde(default)]
    total: u64,
    stage: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct QueuePayload {
    action: QueueAction,
    url: String,
    depth: Option<u32>,
    host: Option<String>,
    reason: Option<String>,
    queue_size: Option<u64>,
    role: Option<String>,
    depth_bucket: Option<String>,
}

#[derive(Deserialize)]
struct ObservationPayload {
    kind: String,
    scope: Option<String>,
    target: Option<String>,
    message: String,
    details: Option<Value>,
}

#[derive(Deserialize)]
struct PlannerStagePayload {
    stage: String,
    rationale: Option<String>,
    estimated_cost_ms: Option<u64>,
    decision: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
    #[serde(default)]
    fatal: bool,
}

fn payload<'a, T: Deserialize<'a>>(prefix: &'static str, json: &'a str) -> Result<T, OutputParseError> {
    serde_json::from_str(json).map_err(|e| OutputParseError::Malformed {
        prefix,
        message: e.to_string(),
    })
}

/// Parse one stdout line into a worker event
pub fn parse_line(line: &str) -> Result<WorkerEvent, OutputParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(OutputParseError::Empty);
    }

    let (prefix, rest) = match line.split_once(char::is_whitespace) {
        Some((prefix, rest)) => (prefix, rest.trim_start()),
        None => (line, ""),
    };

    let require = |name: &'static str| -> Result<&str, OutputParseError> {
        if rest.is_empty() {
            Err(OutputParseError::MissingPayload(name))
        } else {
            Ok(rest)
        }
    };

    match prefix {
        "PROGRESS" => {
            let p: ProgressPayload = payload("PROGRESS", require("PROGRESS")?)?;
            Ok(WorkerEvent::Progress {
                current: p.current,
                total: p.total,
                stage: p.stage,
                message: p.message,
            })
        }
        "QUEUE" => {
            let p: QueuePayload = payload("QUEUE", require("QUEUE")?)?;
            Ok(WorkerEvent::Queue {
                action: p.action,
                url: p.url,
                depth: p.depth,
                host: p.host,
                reason: p.reason,
                queue_size: p.queue_size,
                role: p.role,
                depth_bucket: p.depth_bucket,
            })
        }
        "PROBLEM" => {
            let p: ObservationPayload = payload("PROBLEM", require("PROBLEM")?)?;
            Ok(WorkerEvent::Problem {
                kind: p.kind,
                scope: p.scope,
                target: p.target,
                message: p.message,
                details: p.details,
            })
        }
        "MILESTONE" => {
            let p: ObservationPayload = payload("MILESTONE", require("MILESTONE")?)?;
            Ok(WorkerEvent::Milestone {
                kind: p.kind,
                scope: p.scope,
                target: p.target,
                message: p.message,
                details: p.details,
            })
        }
        "PLANNER_STAGE" => {
            let p: PlannerStagePayload = payload("PLANNER_STAGE", require("PLANNER_STAGE")?)?;
            Ok(WorkerEvent::PlannerStage {
                stage: p.stage,
                rationale: p.rationale,
                estimated_cost_ms: p.estimated_cost_ms,
                decision: p.decision,
            })
        }
        "ERROR" => {
            let p: ErrorPayload = payload("ERROR", require("ERROR")?)?;
            Ok(WorkerEvent::Error {
                message: p.message,
                fatal: p.fatal,
            })
        }
        "CACHE" => {
            let details: Value = payload("CACHE", require("CACHE")?)?;
            Ok(WorkerEvent::Cache { details })
        }
        other => Err(OutputParseError::UnknownPrefix(other.to_string())),
    }
}
