//! Page compression task
//!
//! Walks stored HTML pages and pushes each through a compressor. The
//! compression routine itself is a black box behind the [`Compressor`]
//! trait: bytes in, (hopefully shorter) bytes out. Already-compressed pages
//! are skipped, so restarts rescan cheaply.

use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use newsstore::ProgressUpdate;

use crate::orchestrator::{BackgroundTask, TaskContext};

/// Byte-buffer-in, byte-buffer-out compression routine
pub trait Compressor: Send + Sync {
    /// Short name recorded in task metadata
    fn name(&self) -> &'static str;

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Extension appended to compressed files
    fn extension(&self) -> &'static str;
}

/// Brotli at a quality suited to cold HTML storage
pub struct BrotliCompressor {
    quality: u32,
}

impl BrotliCompressor {
    pub fn new(quality: u32) -> Self {
        Self {
            quality: quality.clamp(1, 11),
        }
    }
}

impl Default for BrotliCompressor {
    fn default() -> Self {
        Self::new(9)
    }
}

impl Compressor for BrotliCompressor {
    fn name(&self) -> &'static str {
        "brotli"
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut writer = brotli::CompressorWriter::new(Vec::new(), 4096, self.quality, 22);
        writer.write_all(input).context("brotli compression failed")?;
        writer.flush().context("brotli flush failed")?;
        Ok(writer.into_inner())
    }

    fn extension(&self) -> &'static str {
        "br"
    }
}

/// Recompress all pages under a directory
pub struct CompressTask {
    pages_dir: PathBuf,
    compressor: Box<dyn Compressor>,
}

impl CompressTask {
    pub fn new(pages_dir: PathBuf, compressor: Box<dyn Compressor>) -> Self {
        Self { pages_dir, compressor }
    }

    /// Build from a task config payload
    ///
    /// `pages-dir` overrides the daemon default; `quality` tunes brotli.
    pub fn from_config(default_dir: PathBuf, config: &Value) -> Result<Self> {
        let pages_dir = config
            .get("pages-dir")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or(default_dir);
        let quality = config.get("quality").and_then(|v| v.as_u64()).unwrap_or(9) as u32;
        Ok(Self::new(pages_dir, Box::new(BrotliCompressor::new(quality))))
    }

    fn output_path(&self, input: &Path) -> PathBuf {
        let mut name = input.file_name().unwrap_or_default().to_os_string();
        name.push(".");
        name.push(self.compressor.extension());
        input.with_file_name(name)
    }
}

/// Stored pages eligible for compression, sorted for determinism
fn list_pages(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut pages: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read pages dir {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "html"))
        .collect();
    pages.sort();
    Ok(pages)
}

#[async_trait::async_trait]
impl BackgroundTask for CompressTask {
    async fn run(&mut self, mut ctx: TaskContext) -> Result<()> {
        let pages = list_pages(&self.pages_dir)?;
        let total = pages.len() as u64;
        info!(task_id = %ctx.task_id, total, dir = %self.pages_dir.display(), "compression scan complete");

        let mut compressed = 0u64;
        let mut skipped = 0u64;
        let mut bytes_in = 0u64;
        let mut bytes_out = 0u64;

        for (index, page) in pages.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                info!(task_id = %ctx.task_id, "compression cancelled");
                return Ok(());
            }
            ctx.pause.wait_if_paused().await;

            let output = self.output_path(page);
            if output.exists() {
                skipped += 1;
            } else {
                let input = std::fs::read(page).with_context(|| format!("cannot read {}", page.display()))?;
                let result = self.compressor.compress(&input)?;
                if result.len() >= input.len() {
                    debug!(page = %page.display(), "compression did not shrink page, keeping original only");
                    skipped += 1;
                } else {
                    std::fs::write(&output, &result)
                        .with_context(|| format!("cannot write {}", output.display()))?;
                    bytes_in += input.len() as u64;
                    bytes_out += result.len() as u64;
                    compressed += 1;
                }
            }

            let update = ProgressUpdate {
                current: Some(index as u64 + 1),
                total: Some(total),
                message: Some(format!("{} compressed, {} skipped", compressed, skipped)),
                metadata: Some(json!({
                    "stage": "compress",
                    "codec": self.compressor.name(),
                    "bytes-in": bytes_in,
                    "bytes-out": bytes_out,
                })),
            };
            if let Err(e) = ctx.progress.update(update).await {
                warn!(task_id = %ctx.task_id, error = %e, "progress write failed");
            }
        }

        info!(task_id = %ctx.task_id, compressed, skipped, bytes_in, bytes_out, "compression finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{cancel_pair, pause_pair};
    use crate::events::EventBus;
    use crate::progress::ProgressSink;
    use newsstore::{StatusChange, TaskStatus, TaskStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn context(store: &TaskStore, bus: &Arc<EventBus>) -> TaskContext {
        let row = store.create_task("compress", json!({})).await.unwrap();
        store
            .update_status(&row.id, TaskStatus::Running, StatusChange::default())
            .await
            .unwrap();
        let (cancel_handle, cancel) = cancel_pair();
        std::mem::forget(cancel_handle);
        let (pause_handle, pause) = pause_pair();
        std::mem::forget(pause_handle);
        TaskContext {
            store: store.clone(),
            task_id: row.id.clone(),
            config: json!({}),
            cancel,
            pause,
            progress: ProgressSink::with_interval(store.clone(), bus.clone(), &row.id, Duration::from_millis(0)),
        }
    }

    #[test]
    fn test_brotli_shrinks_html() {
        let compressor = BrotliCompressor::default();
        let input = "<html><body>".to_string() + &"<p>repetitive paragraph</p>".repeat(200) + "</body></html>";
        let output = compressor.compress(input.as_bytes()).unwrap();
        assert!(output.len() < input.len());
    }

    #[tokio::test]
    async fn test_compress_task_processes_pages() {
        let dir = tempdir().unwrap();
        let big = "<p>body text here</p>".repeat(500);
        for name in ["a.html", "b.html", "c.html"] {
            std::fs::write(dir.path().join(name), &big).unwrap();
        }
        // Non-HTML files are ignored
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let store = TaskStore::in_memory().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let ctx = context(&store, &bus).await;
        let task_id = ctx.task_id.clone();

        let mut task = CompressTask::new(dir.path().to_path_buf(), Box::new(BrotliCompressor::default()));
        task.run(ctx).await.unwrap();

        assert!(dir.path().join("a.html.br").exists());
        assert!(dir.path().join("c.html.br").exists());
        assert!(!dir.path().join("notes.txt.br").exists());

        let row = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(row.progress_current, 3);
        assert_eq!(row.progress_total, 3);
        assert_eq!(row.metadata["codec"], "brotli");
    }

    #[tokio::test]
    async fn test_compress_task_skips_already_done() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.html"), "<p>x</p>".repeat(300)).unwrap();
        std::fs::write(dir.path().join("a.html.br"), b"already done").unwrap();

        let store = TaskStore::in_memory().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let ctx = context(&store, &bus).await;

        let mut task = CompressTask::new(dir.path().to_path_buf(), Box::new(BrotliCompressor::default()));
        task.run(ctx).await.unwrap();

        // Existing output untouched
        assert_eq!(std::fs::read(dir.path().join("a.html.br")).unwrap(), b"already done");
    }

    #[tokio::test]
    async fn test_compress_empty_dir_completes() {
        let dir = tempdir().unwrap();
        let store = TaskStore::in_memory().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let ctx = context(&store, &bus).await;

        let mut task = CompressTask::new(dir.path().to_path_buf(), Box::new(BrotliCompressor::default()));
        task.run(ctx).await.unwrap();
    }

    #[test]
    fn test_from_config_honors_overrides() {
        let task = CompressTask::from_config(
            PathBuf::from("/default"),
            &json!({"pages-dir": "/custom", "quality": 4}),
        )
        .unwrap();
        assert_eq!(task.pages_dir, PathBuf::from("/custom"));
    }
}
