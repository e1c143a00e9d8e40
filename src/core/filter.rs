//! Subscription and read filters, compiled once at registration time.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event::EventRecord;
use super::stream::StreamId;

/// Which attribute a predicate inspects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterTarget {
    StreamId,
    EventType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateSpec {
    Prefix(String),
    Suffix(String),
    Regex(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterClause {
    pub target: FilterTarget,
    pub predicate: PredicateSpec,
}

impl FilterClause {
    pub fn stream_prefix(prefix: impl Into<String>) -> Self {
        Self {
            target: FilterTarget::StreamId,
            predicate: PredicateSpec::Prefix(prefix.into()),
        }
    }

    pub fn event_type_prefix(prefix: impl Into<String>) -> Self {
        Self {
            target: FilterTarget::EventType,
            predicate: PredicateSpec::Prefix(prefix.into()),
        }
    }
}

/// Disjunction of clauses. An empty clause list matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub clauses: Vec<FilterClause>,
}

impl FilterSpec {
    pub fn new(clauses: Vec<FilterClause>) -> Self {
        Self { clauses }
    }
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter regex {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

enum Matcher {
    Prefix(String),
    Suffix(String),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Matcher::Suffix(suffix) => value.ends_with(suffix.as_str()),
            Matcher::Regex(regex) => regex.is_match(value),
        }
    }
}

struct CompiledClause {
    target: FilterTarget,
    matcher: Matcher,
}

/// A compiled filter. Evaluation is short-circuit over the disjunction.
pub struct EventFilter {
    clauses: Vec<CompiledClause>,
}

impl EventFilter {
    pub fn compile(spec: &FilterSpec) -> Result<Self, FilterError> {
        let mut clauses = Vec::with_capacity(spec.clauses.len());
        for clause in &spec.clauses {
            let matcher = match &clause.predicate {
                PredicateSpec::Prefix(p) => Matcher::Prefix(p.clone()),
                PredicateSpec::Suffix(s) => Matcher::Suffix(s.clone()),
                PredicateSpec::Regex(pattern) => {
                    let regex =
                        Regex::new(pattern).map_err(|source| FilterError::InvalidRegex {
                            pattern: pattern.clone(),
                            source,
                        })?;
                    Matcher::Regex(regex)
                }
            };
            clauses.push(CompiledClause {
                target: clause.target,
                matcher,
            });
        }
        Ok(Self { clauses })
    }

    pub fn match_all() -> Self {
        Self {
            clauses: Vec::new(),
        }
    }

    pub fn matches(&self, stream: &StreamId, event_type: &str) -> bool {
        if self.clauses.is_empty() {
            return true;
        }
        self.clauses.iter().any(|clause| {
            let value = match clause.target {
                FilterTarget::StreamId => stream.as_str(),
                FilterTarget::EventType => event_type,
            };
            clause.matcher.matches(value)
        })
    }

    pub fn matches_record(&self, record: &EventRecord) -> bool {
        self.matches(&record.stream, &record.event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(name: &str) -> StreamId {
        StreamId::parse(name).unwrap()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = EventFilter::compile(&FilterSpec::default()).unwrap();
        assert!(filter.matches(&stream("anything"), "whatever"));
    }

    #[test]
    fn disjunction_short_circuits_across_targets() {
        let spec = FilterSpec::new(vec![
            FilterClause::stream_prefix("billing-"),
            FilterClause {
                target: FilterTarget::EventType,
                predicate: PredicateSpec::Suffix("-created".to_string()),
            },
        ]);
        let filter = EventFilter::compile(&spec).unwrap();
        assert!(filter.matches(&stream("billing-7"), "irrelevant"));
        assert!(filter.matches(&stream("orders-1"), "order-created"));
        assert!(!filter.matches(&stream("orders-1"), "order-shipped"));
    }

    #[test]
    fn regex_predicate() {
        let spec = FilterSpec::new(vec![FilterClause {
            target: FilterTarget::StreamId,
            predicate: PredicateSpec::Regex("^acct-[0-9]+$".to_string()),
        }]);
        let filter = EventFilter::compile(&spec).unwrap();
        assert!(filter.matches(&stream("acct-42"), "t"));
        assert!(!filter.matches(&stream("acct-x"), "t"));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let spec = FilterSpec::new(vec![FilterClause {
            target: FilterTarget::StreamId,
            predicate: PredicateSpec::Regex("(".to_string()),
        }]);
        assert!(matches!(
            EventFilter::compile(&spec),
            Err(FilterError::InvalidRegex { .. })
        ));
    }
}
