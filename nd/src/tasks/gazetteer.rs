//! Gazetteer ingestion task
//!
//! Imports place records into the store from a [`GazetteerSource`]. The
//! actual data providers (Wikidata, OSM, REST endpoints) are external
//! collaborators behind the trait; the in-tree source reads records embedded
//! in the task config, which is also how tests and seed fixtures feed it.

use async_trait::async_trait;
use eyre::{Context, Result};
use serde_json::{Value, json};
use tracing::{info, warn};

use newsstore::{Observation, PlaceRecord, ProgressUpdate};

use crate::orchestrator::{BackgroundTask, TaskContext};

/// Provider of place records, one kind at a time
#[async_trait]
pub trait GazetteerSource: Send + Sync {
    fn name(&self) -> &str;

    /// Place kinds this source can produce ("country", "region", "city")
    fn kinds(&self) -> Vec<String>;

    async fn fetch(&self, kind: &str) -> Result<Vec<PlaceRecord>>;
}

/// Source backed by records embedded in the task config
pub struct StaticGazetteerSource {
    places: Vec<PlaceRecord>,
}

impl StaticGazetteerSource {
    pub fn new(places: Vec<PlaceRecord>) -> Self {
        Self { places }
    }

    /// Read `{"places": [{name, kind, country?, population?}]}` from config
    pub fn from_config(config: &Value) -> Result<Self> {
        let places: Vec<PlaceRecord> = match config.get("places") {
            Some(value) => serde_json::from_value(value.clone()).context("invalid places payload")?,
            None => Vec::new(),
        };
        Ok(Self::new(places))
    }
}

#[async_trait]
impl GazetteerSource for StaticGazetteerSource {
    fn name(&self) -> &str {
        "static"
    }

    fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.places.iter().map(|p| p.kind.clone()).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    async fn fetch(&self, kind: &str) -> Result<Vec<PlaceRecord>> {
        Ok(self
            .places
            .iter()
            .filter(|p| p.kind == kind)
            .cloned()
            .map(|p| {
                if p.source.is_none() {
                    PlaceRecord {
                        source: Some("static".to_string()),
                        ..p
                    }
                } else {
                    p
                }
            })
            .collect())
    }
}

/// Import places from a source, one kind per batch
pub struct IngestGazetteerTask {
    source: Box<dyn GazetteerSource>,
}

impl IngestGazetteerTask {
    pub fn new(source: Box<dyn GazetteerSource>) -> Self {
        Self { source }
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        Ok(Self::new(Box::new(StaticGazetteerSource::from_config(config)?)))
    }
}

#[async_trait]
impl BackgroundTask for IngestGazetteerTask {
    async fn run(&mut self, ctx: TaskContext) -> Result<()> {
        let kinds = self.source.kinds();
        let total = kinds.len() as u64;
        info!(task_id = %ctx.task_id, source = %self.source.name(), ?kinds, "gazetteer ingest starting");

        let mut imported = 0usize;
        for (index, kind) in kinds.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                info!(task_id = %ctx.task_id, "gazetteer ingest cancelled");
                return Ok(());
            }

            let places = self
                .source
                .fetch(kind)
                .await
                .with_context(|| format!("gazetteer fetch for kind {kind} failed"))?;
            let fetched = places.len();
            let inserted = ctx.store.upsert_places(places).await?;
            imported += inserted;

            let update = ProgressUpdate {
                current: Some(index as u64 + 1),
                total: Some(total),
                message: Some(format!("imported {inserted} new {kind} places ({fetched} fetched)")),
                metadata: Some(json!({ "stage": "ingest", "kind": kind, "imported": imported })),
            };
            if let Err(e) = ctx.progress.update(update).await {
                warn!(task_id = %ctx.task_id, error = %e, "progress write failed");
            }
        }

        let milestone = Observation::new(
            &ctx.task_id,
            "gazetteer-imported",
            format!("imported {imported} places across {total} kinds"),
        );
        if let Err(e) = ctx.store.append_milestone(milestone.clone()).await {
            warn!(task_id = %ctx.task_id, error = %e, "milestone append dropped");
        }

        info!(task_id = %ctx.task_id, imported, "gazetteer ingest finished");
        Ok(())
    }
}
