//! Stored-page analysis task
//!
//! Two stages: scan every page for size and host statistics, then aggregate
//! into the task metadata where status displays pick it up.

use std::collections::HashMap;
use std::path::PathBuf;

use eyre::{Context, Result};
use serde_json::{Value, json};
use tracing::{info, warn};

use newsstore::ProgressUpdate;

use crate::orchestrator::{BackgroundTask, TaskContext};

/// Aggregate statistics over stored pages
pub struct AnalyzeTask {
    pages_dir: PathBuf,
    /// Progress is reported every this many pages
    batch: u64,
}

impl AnalyzeTask {
    pub fn new(pages_dir: PathBuf) -> Self {
        Self { pages_dir, batch: 50 }
    }

    pub fn from_config(default_dir: PathBuf, config: &Value) -> Result<Self> {
        let pages_dir = config
            .get("pages-dir")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or(default_dir);
        Ok(Self::new(pages_dir))
    }
}

#[async_trait::async_trait]
impl BackgroundTask for AnalyzeTask {
    async fn run(&mut self, mut ctx: TaskContext) -> Result<()> {
        let mut pages: Vec<PathBuf> = if self.pages_dir.exists() {
            std::fs::read_dir(&self.pages_dir)
                .with_context(|| format!("cannot read pages dir {}", self.pages_dir.display()))?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "html"))
                .collect()
        } else {
            Vec::new()
        };
        pages.sort();
        let total = pages.len() as u64;

        let mut total_bytes = 0u64;
        let mut largest: Option<(String, u64)> = None;
        let mut by_prefix: HashMap<String, u64> = HashMap::new();

        for (index, page) in pages.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                info!(task_id = %ctx.task_id, "analysis cancelled");
                return Ok(());
            }
            ctx.pause.wait_if_paused().await;

            let size = std::fs::metadata(page).map(|m| m.len()).unwrap_or(0);
            total_bytes += size;
            let name = page.file_name().unwrap_or_default().to_string_lossy().to_string();
            if largest.as_ref().is_none_or(|(_, s)| size > *s) {
                largest = Some((name.clone(), size));
            }
            // Pages are stored as {host}__{slug}.html; group by host prefix
            let prefix = name.split("__").next().unwrap_or("unknown").to_string();
            *by_prefix.entry(prefix).or_default() += 1;

            let done = index as u64 + 1;
            if done % self.batch == 0 || done == total {
                let update = ProgressUpdate {
                    current: Some(done),
                    total: Some(total),
                    message: Some(format!("scanned {done} of {total} pages")),
                    metadata: Some(json!({ "stage": "scan" })),
                };
                if let Err(e) = ctx.progress.update(update).await {
                    warn!(task_id = %ctx.task_id, error = %e, "progress write failed");
                }
            }
        }

        let mut hosts: Vec<(String, u64)> = by_prefix.into_iter().collect();
        hosts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hosts.truncate(10);

        let stats = json!({
            "pages": total,
            "total-bytes": total_bytes,
            "mean-bytes": if total > 0 { total_bytes / total } else { 0 },
            "largest": largest.map(|(name, size)| json!({ "name": name, "bytes": size })),
            "top-hosts": hosts.iter().map(|(h, n)| json!({ "host": h, "pages": n })).collect::<Vec<_>>(),
        });

        let update = ProgressUpdate {
            current: Some(total),
            total: Some(total),
            message: Some(format!("analyzed {total} pages")),
            metadata: Some(json!({ "stage": "aggregate", "stats": stats })),
        };
        if let Err(e) = ctx.progress.update(update).await {
            warn!(task_id = %ctx.task_id, error = %e, "final progress write failed");
        }

        info!(task_id = %ctx.task_id, pages = total, total_bytes, "analysis finished");
        Ok(())
    }
}
