//! Override rules and identifier matching.
//!
//! An override identifier is either a literal or a pattern whose `*`
//! segments each match exactly one segment of a runtime identifier.
//! Identifiers are split into segments on `/`, `:` and `.`.
//!
//! Resolution order for a given identifier:
//! 1. an override whose identifier equals it exactly;
//! 2. the most specific matching pattern: fewest wildcard segments, then the
//!    longest run of leading literal segments, then the earliest created;
//! 3. nothing, in which case the caller's default applies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::window::{ConsistencyMode, LimitConfig};

const SEPARATORS: &[char] = &['/', ':', '.'];
const WILDCARD: &str = "*";

/// A rate limit override for identifiers matching `identifier` within a
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitOverride {
    pub id: String,
    pub namespace_id: String,
    pub identifier: String,
    pub limit: u64,
    /// Window length in milliseconds
    pub duration: u64,
    #[serde(default, rename = "async")]
    pub async_mode: bool,
    /// Insertion order, used to break ties between equally specific patterns
    #[serde(default)]
    pub created_seq: u64,
}

impl RatelimitOverride {
    pub fn limit_config(&self) -> LimitConfig {
        LimitConfig {
            limit: self.limit,
            duration_ms: self.duration,
            mode: ConsistencyMode::from_async_flag(self.async_mode),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Wildcard,
}

/// An override identifier compiled into segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierPattern {
    segments: Vec<Segment>,
}

impl IdentifierPattern {
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .split(SEPARATORS)
            .map(|segment| {
                if segment == WILDCARD {
                    Segment::Wildcard
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();
        Self { segments }
    }

    pub fn is_literal(&self) -> bool {
        self.wildcard_count() == 0
    }

    pub fn wildcard_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Wildcard))
            .count()
    }

    /// Number of literal segments before the first wildcard.
    pub fn literal_prefix_len(&self) -> usize {
        self.segments
            .iter()
            .take_while(|segment| matches!(segment, Segment::Literal(_)))
            .count()
    }

    pub fn matches(&self, identifier: &[&str]) -> bool {
        self.segments.len() == identifier.len()
            && self
                .segments
                .iter()
                .zip(identifier)
                .all(|(segment, part)| match segment {
                    Segment::Wildcard => true,
                    Segment::Literal(literal) => literal == part,
                })
    }
}

/// The overrides of one namespace, indexed for resolution.
#[derive(Debug, Clone, Default)]
pub struct OverrideSet {
    exact: HashMap<String, RatelimitOverride>,
    /// Patterns ordered from most to least specific
    patterns: Vec<(IdentifierPattern, RatelimitOverride)>,
}

impl OverrideSet {
    pub fn new(overrides: impl IntoIterator<Item = RatelimitOverride>) -> Self {
        let mut exact: HashMap<String, RatelimitOverride> = HashMap::new();
        let mut patterns = Vec::new();

        for rule in overrides {
            let pattern = IdentifierPattern::parse(&rule.identifier);
            if pattern.is_literal() {
                let keep_existing = exact
                    .get(&rule.identifier)
                    .is_some_and(|existing| existing.created_seq <= rule.created_seq);
                if !keep_existing {
                    exact.insert(rule.identifier.clone(), rule);
                }
            } else {
                patterns.push((pattern, rule));
            }
        }

        patterns.sort_by(|(a, a_rule), (b, b_rule)| {
            a.wildcard_count()
                .cmp(&b.wildcard_count())
                .then_with(|| b.literal_prefix_len().cmp(&a.literal_prefix_len()))
                .then_with(|| a_rule.created_seq.cmp(&b_rule.created_seq))
        });

        Self { exact, patterns }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The single override in effect for `identifier`, if any.
    pub fn resolve(&self, identifier: &str) -> Option<&RatelimitOverride> {
        if let Some(rule) = self.exact.get(identifier) {
            return Some(rule);
        }

        let parts: Vec<&str> = identifier.split(SEPARATORS).collect();
        self.patterns
            .iter()
            .find(|(pattern, _)| pattern.matches(&parts))
            .map(|(_, rule)| rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, identifier: &str, limit: u64, created_seq: u64) -> RatelimitOverride {
        RatelimitOverride {
            id: id.to_string(),
            namespace_id: "ns_1".to_string(),
            identifier: identifier.to_string(),
            limit,
            duration: 60_000,
            async_mode: false,
            created_seq,
        }
    }

    #[test]
    fn test_parse_pattern() {
        let pattern = IdentifierPattern::parse("org:*/user.*");
        assert_eq!(pattern.wildcard_count(), 2);
        assert_eq!(pattern.literal_prefix_len(), 1);
        assert!(!pattern.is_literal());
        assert!(IdentifierPattern::parse("user_123").is_literal());
    }

    #[test]
    fn test_wildcard_matches_exactly_one_segment() {
        let pattern = IdentifierPattern::parse("org:*");
        assert!(pattern.matches(&["org", "acme"]));
        assert!(!pattern.matches(&["org"]));
        assert!(!pattern.matches(&["org", "acme", "eng"]));
        assert!(!pattern.matches(&["team", "acme"]));
    }

    #[test]
    fn test_exact_match_beats_wildcard() {
        let set = OverrideSet::new(vec![
            rule("ovr_wild", "org:*", 10, 1),
            rule("ovr_exact", "org:acme", 1000, 2),
        ]);

        assert_eq!(set.resolve("org:acme").unwrap().id, "ovr_exact");
        assert_eq!(set.resolve("org:other").unwrap().id, "ovr_wild");
    }

    #[test]
    fn test_fewer_wildcards_win() {
        let set = OverrideSet::new(vec![
            rule("ovr_two", "org:*:user:*", 10, 1),
            rule("ovr_one", "org:acme:user:*", 20, 2),
        ]);

        assert_eq!(set.resolve("org:acme:user:7").unwrap().id, "ovr_one");
        assert_eq!(set.resolve("org:beta:user:7").unwrap().id, "ovr_two");
    }

    #[test]
    fn test_longer_literal_prefix_wins() {
        let set = OverrideSet::new(vec![
            rule("ovr_late", "*:eu:api", 10, 1),
            rule("ovr_early", "acme:*:api", 20, 2),
        ]);

        assert_eq!(set.resolve("acme:eu:api").unwrap().id, "ovr_early");
    }

    #[test]
    fn test_ties_resolve_to_earliest_created() {
        let set = OverrideSet::new(vec![
            rule("ovr_second", "region.*", 20, 5),
            rule("ovr_first", "region.*", 10, 3),
        ]);

        assert_eq!(set.resolve("region.eu").unwrap().id, "ovr_first");
    }

    #[test]
    fn test_no_match() {
        let set = OverrideSet::new(vec![rule("ovr", "org:*", 10, 1)]);
        assert!(set.resolve("user:1").is_none());
        assert!(OverrideSet::default().resolve("anything").is_none());
    }

    #[test]
    fn test_limit_config_carries_mode() {
        let mut r = rule("ovr", "x", 10, 1);
        r.async_mode = true;
        let config = r.limit_config();
        assert_eq!(config.limit, 10);
        assert_eq!(config.duration_ms, 60_000);
        assert_eq!(config.mode, ConsistencyMode::Async);
    }
}
