//! Hub URL pattern discovery
//!
//! Successful hub URLs are abstracted into path templates such as
//! `/world/{slot}`; candidates are generated by substituting values back in
//! under a concrete host. Templates are host-independent so books can be
//! shared across domains of the same category. Each template is scored by
//! hit-rate and retired when it stops paying off; retention is a bounded LRU
//! so a long crawl cannot grow the book without limit.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

/// Substitution marker inside a template
pub const SLOT: &str = "{slot}";

/// Samples required before the hit-rate can retire a template
const MIN_SAMPLES: u32 = 5;

#[derive(Debug, Default, Clone)]
struct PatternStats {
    hits: u32,
    misses: u32,
}

impl PatternStats {
    fn rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        if total < MIN_SAMPLES {
            None
        } else {
            Some(self.hits as f64 / total as f64)
        }
    }
}

/// Abstract a hub URL into a path template by generalizing its last segment
///
/// `https://example.com/world/france` becomes `/world/{slot}`. Returns
/// `None` for URLs without a path to generalize.
pub fn abstract_template(url: &str) -> Option<String> {
    let after_scheme = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let path = &after_scheme[after_scheme.find('/')?..];
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }
    let prefix = segments[..segments.len() - 1].join("/");
    Some(if prefix.is_empty() {
        format!("/{SLOT}")
    } else {
        format!("/{prefix}/{SLOT}")
    })
}

/// Bounded store of learned path templates, scored by hit-rate
pub struct PatternBook {
    templates: LruCache<String, PatternStats>,
    min_hit_rate: f64,
}

impl PatternBook {
    pub fn new(capacity: usize, min_hit_rate: f64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            templates: LruCache::new(capacity),
            min_hit_rate,
        }
    }

    /// Learn a template from a verified hub URL
    ///
    /// Returns the template if one could be abstracted.
    pub fn learn(&mut self, url: &str) -> Option<String> {
        let template = abstract_template(url)?;
        if self.templates.get(&template).is_none() {
            debug!(%template, "PatternBook::learn: new template");
            self.templates.put(template.clone(), PatternStats::default());
        }
        Some(template)
    }

    /// A candidate generated from `template` turned out to be a real hub
    pub fn record_hit(&mut self, template: &str) {
        if let Some(stats) = self.templates.get_mut(template) {
            stats.hits += 1;
        }
    }

    /// A candidate generated from `template` was a miss
    ///
    /// Returns true when the template fell below the minimum hit-rate and
    /// was retired.
    pub fn record_miss(&mut self, template: &str) -> bool {
        let retire = match self.templates.get_mut(template) {
            Some(stats) => {
                stats.misses += 1;
                stats.rate().is_some_and(|r| r < self.min_hit_rate)
            }
            None => false,
        };
        if retire {
            debug!(%template, "PatternBook::record_miss: retiring template");
            self.templates.pop(template);
        }
        retire
    }

    /// Drop a template regardless of its score
    pub fn retire(&mut self, template: &str) {
        self.templates.pop(template);
    }

    /// Generate candidate URLs under `host` by substituting `values`
    ///
    /// Output order is deterministic: templates in most-recently-used order,
    /// values in input order, bounded by `limit`. Each result carries the
    /// template it came from so hits and misses can be attributed.
    pub fn expand(&self, host: &str, values: &[String], limit: usize) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (template, _) in self.templates.iter() {
            for value in values {
                if out.len() == limit {
                    return out;
                }
                let path = template.replace(SLOT, &slugify(value));
                out.push((format!("https://{host}{path}"), template.clone()));
            }
        }
        out
    }

    /// Current template strings, most recently used first
    pub fn templates(&self) -> Vec<String> {
        self.templates.iter().map(|(t, _)| t.clone()).collect()
    }

    /// Hit-rate for a template once it has enough samples
    pub fn hit_rate(&self, template: &str) -> Option<f64> {
        self.templates.peek(template).and_then(PatternStats::rate)
    }

    /// Copy templates from another book (cross-domain transfer)
    ///
    /// Stats do not transfer; a borrowed template must earn its keep in the
    /// new domain.
    pub fn adopt_from(&mut self, other: &PatternBook) {
        for template in other.templates() {
            if self.templates.get(&template).is_none() {
                self.templates.put(template, PatternStats::default());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Lowercase a value into a URL path segment
pub(crate) fn slugify(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abstract_template() {
        assert_eq!(
            abstract_template("https://example.com/world/france"),
            Some("/world/{slot}".to_string())
        );
        assert_eq!(abstract_template("https://example.com/politics"), Some("/{slot}".to_string()));
        assert_eq!(abstract_template("https://example.com/world/fr?hl=en"), Some("/world/{slot}".to_string()));
        assert_eq!(abstract_template("https://example.com"), None);
        assert_eq!(abstract_template("not a url"), None);
    }

    #[test]
    fn test_learn_and_expand() {
        let mut book = PatternBook::new(16, 0.2);
        book.learn("https://example.com/world/france").unwrap();

        let candidates = book.expand("example.com", &["Germany".to_string(), "United Kingdom".to_string()], 10);
        let urls: Vec<_> = candidates.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/world/germany",
                "https://example.com/world/united-kingdom",
            ]
        );
    }

    #[test]
    fn test_expand_bounded() {
        let mut book = PatternBook::new(16, 0.2);
        book.learn("https://example.com/world/france").unwrap();
        let values: Vec<String> = (0..20).map(|i| format!("v{i}")).collect();
        assert_eq!(book.expand("example.com", &values, 5).len(), 5);
    }

    #[test]
    fn test_low_hit_rate_retires() {
        let mut book = PatternBook::new(16, 0.5);
        let template = book.learn("https://example.com/world/france").unwrap();

        book.record_hit(&template);
        for _ in 0..3 {
            assert!(!book.record_miss(&template));
        }
        // 1 hit / 5 samples = 0.2 < 0.5
        assert!(book.record_miss(&template));
        assert!(book.is_empty());
    }

    #[test]
    fn test_healthy_template_survives() {
        let mut book = PatternBook::new(16, 0.2);
        let template = book.learn("https://example.com/world/france").unwrap();
        for _ in 0..4 {
            book.record_hit(&template);
        }
        assert!(!book.record_miss(&template));
        assert_eq!(book.hit_rate(&template), Some(0.8));
    }

    #[test]
    fn test_lru_bound() {
        let mut book = PatternBook::new(2, 0.2);
        book.learn("https://example.com/one/x").unwrap();
        book.learn("https://example.com/two/x").unwrap();
        book.learn("https://example.com/three/x").unwrap();
        assert_eq!(book.len(), 2);
        assert!(!book.templates().contains(&"/one/{slot}".to_string()));
    }

    #[test]
    fn test_adopt_carries_template_to_new_host() {
        let mut donor = PatternBook::new(8, 0.2);
        let template = donor.learn("https://a.example/world/fr").unwrap();
        donor.record_hit(&template);

        let mut book = PatternBook::new(8, 0.2);
        book.adopt_from(&donor);
        let candidates = book.expand("b.example", &["spain".to_string()], 4);
        assert_eq!(candidates[0].0, "https://b.example/world/spain");
        // Stats did not transfer
        assert_eq!(book.hit_rate(&template), None);
    }
}
