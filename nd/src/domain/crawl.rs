//! Crawl job options and worker argument construction

use serde::{Deserialize, Serialize};

/// Extract the host portion of an http(s) URL, lowercased
///
/// Returns `None` for anything that is not an absolute http(s) URL.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    // Strip userinfo and port
    let host = host.rsplit('@').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Fully-parsed options for starting a crawl job
///
/// Both adapters build this from their own surface (CLI flags, HTTP body) and
/// hand it to the facade unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlOptions {
    /// Seed URL
    pub url: String,

    /// Page budget; None means unbounded
    pub max_pages: Option<u64>,

    /// Link depth budget
    pub max_depth: Option<u32>,

    /// Crawl type key (selects worker behavior profiles)
    pub crawl_type: Option<String>,

    /// Extra arguments appended verbatim to the worker command line
    pub worker_args: Vec<String>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_pages: None,
            max_depth: None,
            crawl_type: None,
            worker_args: Vec::new(),
        }
    }
}

impl CrawlOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Validate caller-supplied options; the error text is user-facing
    pub fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("url is required".to_string());
        }
        if host_of(&self.url).is_none() {
            return Err(format!("url must be absolute http(s): {}", self.url));
        }
        if self.max_pages == Some(0) {
            return Err("maxPages must be at least 1".to_string());
        }
        if let Some(depth) = self.max_depth
            && depth > 16
        {
            return Err(format!("maxDepth {} exceeds the supported limit of 16", depth));
        }
        Ok(())
    }

    /// Build the worker argument vector
    ///
    /// The job id and database path are always passed explicitly so the
    /// worker can attach its telemetry to the right row.
    pub fn to_worker_args(&self, job_id: &str, db_path: &str) -> Vec<String> {
        let mut args = vec![
            "--job-id".to_string(),
            job_id.to_string(),
            "--db".to_string(),
            db_path.to_string(),
            "--url".to_string(),
            self.url.clone(),
        ];
        if let Some(max_pages) = self.max_pages {
            args.push("--max-pages".to_string());
            args.push(max_pages.to_string());
        }
        if let Some(max_depth) = self.max_depth {
            args.push("--max-depth".to_string());
            args.push(max_depth.to_string());
        }
        if let Some(ref crawl_type) = self.crawl_type {
            args.push("--crawl-type".to_string());
            args.push(crawl_type.clone());
        }
        args.extend(self.worker_args.iter().cloned());
        args
    }
}
