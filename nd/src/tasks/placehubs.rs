//! Batch place-hub guessing
//!
//! For each requested domain: probe readiness (does the store hold enough
//! prior signal for guesses to be worth anything), generate hub URL
//! candidates from the gazetteer, and diff them against the hubs already
//! known. A dry run (`apply: false`) performs no durable mutation; the
//! facade calls the same routine the background task does.

use std::collections::HashSet;
use std::time::Duration;

use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use newsstore::{PlaceHubRecord, PlaceRecord, ProgressUpdate, TaskStore};

use crate::orchestrator::{BackgroundTask, TaskContext};
use crate::planner::slugify;

/// Options for a guessing run, shared by facade and task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlaceHubGuessOptions {
    pub domains: Vec<String>,
    /// Place kinds to guess for; empty means country only
    pub kinds: Vec<String>,
    /// Candidates per domain per kind
    pub limit: usize,
    /// Write accepted guesses; false previews only
    pub apply: bool,
}

impl Default for PlaceHubGuessOptions {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            kinds: vec!["country".to_string()],
            limit: 5,
            apply: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    /// "ready" or "insufficient-signals"
    pub status: String,
    pub fetch_count: u64,
    pub verified_hubs: u64,
    pub known_hubs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSummary {
    pub domain: String,
    pub readiness: Readiness,
    pub candidates: u64,
    pub inserted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceHubCandidate {
    pub domain: String,
    pub url: String,
    pub kind: String,
    pub place: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTotals {
    pub processed_domains: u64,
    pub candidates: u64,
    pub inserted: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffPreview {
    /// Rows that were (or with `apply` would be) inserted
    pub inserted: Vec<PlaceHubCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceHubGuessReport {
    pub batch: BatchTotals,
    pub domain_summaries: Vec<DomainSummary>,
    pub diff_preview: DiffPreview,
    pub errors: Vec<String>,
}

/// Guess the hub URL for a place on a domain
fn hub_url(domain: &str, place: &PlaceRecord) -> String {
    let slug = slugify(&place.name);
    match (place.kind.as_str(), place.country.as_deref()) {
        ("country", _) | (_, None) => format!("https://{domain}/world/{slug}"),
        (_, Some(country)) => format!("https://{domain}/world/{}/{slug}", slugify(country)),
    }
}

/// Run a guessing batch against the store
pub async fn guess_place_hubs(
    store: &TaskStore,
    options: &PlaceHubGuessOptions,
    min_fetches: u64,
    probe_timeout: Duration,
) -> Result<PlaceHubGuessReport> {
    let mut report = PlaceHubGuessReport {
        batch: BatchTotals::default(),
        domain_summaries: Vec::new(),
        diff_preview: DiffPreview::default(),
        errors: Vec::new(),
    };

    let kinds = if options.kinds.is_empty() {
        vec!["country".to_string()]
    } else {
        options.kinds.clone()
    };

    for domain in &options.domains {
        let signals = match tokio::time::timeout(probe_timeout, store.domain_signals(domain)).await {
            Ok(Ok(signals)) => signals,
            Ok(Err(e)) => {
                report.errors.push(format!("{domain}: readiness probe failed: {e}"));
                continue;
            }
            Err(_) => {
                report.errors.push(format!(
                    "{domain}: readiness probe timed out after {}s",
                    probe_timeout.as_secs()
                ));
                continue;
            }
        };

        let ready = signals.is_ready(min_fetches);
        let readiness = Readiness {
            status: if ready { "ready" } else { "insufficient-signals" }.to_string(),
            fetch_count: signals.fetch_count,
            verified_hubs: signals.verified_hubs,
            known_hubs: signals.known_hubs,
        };

        let mut candidates = 0u64;
        let mut inserted = 0u64;
        if ready {
            let known: HashSet<String> = store
                .list_place_hubs(domain, 10_000)
                .await?
                .into_iter()
                .map(|hub| hub.url)
                .collect();

            for kind in &kinds {
                for place in store.list_places(Some(kind), options.limit).await? {
                    let url = hub_url(domain, &place);
                    if known.contains(&url) {
                        continue;
                    }
                    candidates += 1;
                    let candidate = PlaceHubCandidate {
                        domain: domain.clone(),
                        url: url.clone(),
                        kind: kind.clone(),
                        place: place.name.clone(),
                    };
                    if options.apply {
                        let mut hub = PlaceHubRecord::guess(domain, &url, kind);
                        hub.place_name = Some(place.name.clone());
                        if store.insert_place_hub(hub).await? {
                            inserted += 1;
                            report.diff_preview.inserted.push(candidate);
                        }
                    } else {
                        report.diff_preview.inserted.push(candidate);
                    }
                }
            }
        } else {
            debug!(%domain, "domain not ready for place-hub guessing");
        }

        report.batch.processed_domains += 1;
        report.batch.candidates += candidates;
        report.batch.inserted += inserted;
        report.domain_summaries.push(DomainSummary {
            domain: domain.clone(),
            readiness,
            candidates,
            inserted,
        });
    }

    info!(
        domains = report.batch.processed_domains,
        candidates = report.batch.candidates,
        inserted = report.batch.inserted,
        apply = options.apply,
        "place-hub guessing finished"
    );
    Ok(report)
}

/// Background task wrapper for large apply runs
pub struct GuessPlaceHubsTask {
    options: PlaceHubGuessOptions,
    min_fetches: u64,
}

impl GuessPlaceHubsTask {
    pub fn from_config(config: &Value, min_fetches: u64) -> Result<Self> {
        let options: PlaceHubGuessOptions = serde_json::from_value(config.clone())?;
        Ok(Self { options, min_fetches })
    }
}

#[async_trait::async_trait]
impl BackgroundTask for GuessPlaceHubsTask {
    async fn run(&mut self, ctx: TaskContext) -> Result<()> {
        let total = self.options.domains.len() as u64;
        let mut combined = PlaceHubGuessReport {
            batch: BatchTotals::default(),
            domain_summaries: Vec::new(),
            diff_preview: DiffPreview::default(),
            errors: Vec::new(),
        };

        // One domain per batch so cancel and progress stay responsive
        for (index, domain) in self.options.domains.clone().iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                info!(task_id = %ctx.task_id, "place-hub guessing cancelled");
                return Ok(());
            }

            let single = PlaceHubGuessOptions {
                domains: vec![domain.clone()],
                ..self.options.clone()
            };
            let report = guess_place_hubs(&ctx.store, &single, self.min_fetches, Duration::from_secs(10)).await?;
            combined.batch.processed_domains += report.batch.processed_domains;
            combined.batch.candidates += report.batch.candidates;
            combined.batch.inserted += report.batch.inserted;
            combined.domain_summaries.extend(report.domain_summaries);
            combined.diff_preview.inserted.extend(report.diff_preview.inserted);
            combined.errors.extend(report.errors);

            let update = ProgressUpdate {
                current: Some(index as u64 + 1),
                total: Some(total),
                message: Some(format!("{domain}: {} candidates", combined.batch.candidates)),
                metadata: Some(json!({ "stage": "guess" })),
            };
            if let Err(e) = ctx.progress.update(update).await {
                warn!(task_id = %ctx.task_id, error = %e, "progress write failed");
            }
        }

        let update = ProgressUpdate {
            metadata: Some(json!({ "stage": "report", "report": serde_json::to_value(&combined)? })),
            ..Default::default()
        };
        if let Err(e) = ctx.progress.update(update).await {
            warn!(task_id = %ctx.task_id, error = %e, "report write failed");
        }
        Ok(())
    }
}
