//! Gazetteer places and guessed place hubs
//!
//! Places are imported from external gazetteer sources; place hubs are URL
//! guesses (or verified landing pages) tying a domain to a place. Both feed
//! readiness judgments for planning.

use serde::{Deserialize, Serialize};

/// A geographic entity from the gazetteer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceRecord {
    /// Row id; 0 until persisted
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// "country", "region" or "city"
    pub kind: String,
    /// Parent country name for regions and cities
    pub country: Option<String>,
    pub population: Option<i64>,
    /// Where the record came from ("wikidata", "osm", "seed", ...)
    pub source: Option<String>,
}

impl PlaceRecord {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            kind: kind.into(),
            country: None,
            population: None,
            source: None,
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A (domain, url) place-hub association
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceHubRecord {
    /// Row id; 0 until persisted
    #[serde(default)]
    pub id: i64,
    pub domain: String,
    pub url: String,
    pub place_name: Option<String>,
    /// Place kind of the hub subject
    pub kind: String,
    /// A crawl confirmed this URL is a real hub
    pub verified: bool,
    /// "guess", "crawl", ...
    pub source: Option<String>,
    pub created_at: i64,
}

impl PlaceHubRecord {
    pub fn guess(domain: impl Into<String>, url: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: 0,
            domain: domain.into(),
            url: url.into(),
            place_name: None,
            kind: kind.into(),
            verified: false,
            source: Some("guess".to_string()),
            created_at: crate::task::now_ms(),
        }
    }
}

/// Prior-signal summary for one domain, used for readiness judgments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSignals {
    pub domain: String,
    /// Queue-event dequeues observed for this host across all crawls
    pub fetch_count: u64,
    pub verified_hubs: u64,
    pub known_hubs: u64,
}

impl DomainSignals {
    /// Enough prior signal to benefit from planning
    pub fn is_ready(&self, min_fetches: u64) -> bool {
        self.fetch_count >= min_fetches || self.verified_hubs > 0
    }
}
