//! Built-in background task types
//!
//! Each type is a cooperative in-process routine behind the
//! [`BackgroundTask`](crate::orchestrator::BackgroundTask) trait: it checks
//! the cancel signal at batch boundaries, honors the pause gate where
//! supported, and reports through the progress sink.
//!
//! - [`compress`] - recompress stored pages through a black-box compressor
//! - [`analyze`] - aggregate statistics over stored pages
//! - [`gazetteer`] - import place records from a gazetteer source
//! - [`placehubs`] - batch place-hub guessing with readiness probes

pub mod analyze;
pub mod compress;
pub mod gazetteer;
pub mod placehubs;

pub use analyze::AnalyzeTask;
pub use compress::{BrotliCompressor, CompressTask, Compressor};
pub use gazetteer::{GazetteerSource, IngestGazetteerTask, StaticGazetteerSource};
pub use placehubs::{
    DomainSummary, GuessPlaceHubsTask, PlaceHubGuessOptions, PlaceHubGuessReport, guess_place_hubs,
};

use std::sync::Arc;

use crate::orchestrator::{BackgroundTask, Orchestrator, OrchestratorError, RegistrationOptions};

/// Install every built-in background task type on the orchestrator
///
/// Called once at boot, before [`Orchestrator::start`].
pub fn register_builtin_tasks(
    orchestrator: &Orchestrator,
    pages_dir: std::path::PathBuf,
    readiness_min_fetches: u64,
) -> Result<(), OrchestratorError> {
    let dir = pages_dir.clone();
    orchestrator.register_task_type(
        "compress",
        Arc::new(move |config: &serde_json::Value| {
            Ok(Box::new(CompressTask::from_config(dir.clone(), config)?) as Box<dyn BackgroundTask>)
        }),
        RegistrationOptions { supports_pause: true },
    )?;

    let dir = pages_dir.clone();
    orchestrator.register_task_type(
        "analyze",
        Arc::new(move |config: &serde_json::Value| {
            Ok(Box::new(AnalyzeTask::from_config(dir.clone(), config)?) as Box<dyn BackgroundTask>)
        }),
        RegistrationOptions { supports_pause: true },
    )?;

    orchestrator.register_task_type(
        "ingest-gazetteer",
        Arc::new(|config: &serde_json::Value| {
            Ok(Box::new(IngestGazetteerTask::from_config(config)?) as Box<dyn BackgroundTask>)
        }),
        RegistrationOptions::default(),
    )?;

    orchestrator.register_task_type(
        "guess-place-hubs",
        Arc::new(move |config: &serde_json::Value| {
            Ok(Box::new(GuessPlaceHubsTask::from_config(config, readiness_min_fetches)?) as Box<dyn BackgroundTask>)
        }),
        RegistrationOptions::default(),
    )?;

    Ok(())
}
