//! Canonical ordered event collection and the merge/dedup engine.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::models::{Event, EventKind};

const NAMED_KIND_PREFIX: &str = "event:";

/// Identity of a logical event across repeated imports.
///
/// Missing optional fields are normalized to the empty string. Free-text event names are
/// prefixed with `event:` so they never share a key with a typed event of the same tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub timestamp_ms: i64,
    pub source: String,
    pub kind: String,
    pub url: String,
}

impl DedupKey {
    pub fn of(event: &Event) -> Self {
        Self {
            timestamp_ms: event.timestamp_ms(),
            source: event.source.clone().unwrap_or_default(),
            kind: match &event.kind {
                EventKind::Named(name) => format!("{NAMED_KIND_PREFIX}{name}"),
                _ => event.kind_tag().to_string(),
            },
            url: event.url.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.timestamp_ms, self.source, self.kind, self.url
        )
    }
}

/// Events in non-decreasing timestamp order with unique dedup keys.
///
/// Snapshots are immutable; [`EventLog::merge`] returns a complete replacement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `self ++ incoming`, keep the first-seen event per key, then sort.
    ///
    /// Ties on timestamp are ordered by dedup key, so the resulting sequence does not depend
    /// on how many merges happened or in which order batches arrived.
    pub fn merge(&self, incoming: Vec<Event>) -> EventLog {
        let mut seen: HashSet<DedupKey> = HashSet::with_capacity(self.events.len() + incoming.len());
        let mut keyed: Vec<(DedupKey, Event)> = self
            .events
            .iter()
            .cloned()
            .chain(incoming)
            .filter_map(|event| {
                let key = DedupKey::of(&event);
                seen.insert(key.clone()).then_some((key, event))
            })
            .collect();

        keyed.sort_by(|(ka, a), (kb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| ka.cmp(kb)));

        EventLog {
            events: keyed.into_iter().map(|(_, event)| event).collect(),
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Sub-log of events matching `filter`. Order is preserved.
    pub fn filtered(&self, filter: &LogFilter) -> EventLog {
        if filter.is_empty() {
            return self.clone();
        }
        EventLog {
            events: self
                .events
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect(),
        }
    }
}

/// User-agent equality and inclusive time-range filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub user_agent: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl LogFilter {
    pub fn is_empty(&self) -> bool {
        self.user_agent.is_none() && self.start_time.is_none() && self.end_time.is_none()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ua) = &self.user_agent {
            if event.user_agent.as_deref() != Some(ua.as_str()) {
                return false;
            }
        }
        if self.start_time.is_some_and(|start| event.timestamp < start) {
            return false;
        }
        if self.end_time.is_some_and(|end| event.timestamp > end) {
            return false;
        }
        true
    }
}

/// Outcome of folding one or more batches into the shared log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: usize,
    pub duplicates: usize,
    pub total: usize,
}

/// The one shared mutable resource: the current snapshot, replaced atomically.
#[derive(Debug, Default)]
pub struct SharedLog {
    current: RwLock<Arc<EventLog>>,
}

impl SharedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<EventLog> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merge `incoming` and swap in the new snapshot.
    pub fn apply(&self, incoming: Vec<Event>) -> MergeOutcome {
        match self.apply_persisted(incoming, |_| Ok::<_, std::convert::Infallible>(())) {
            Ok((outcome, ())) => outcome,
            Err(never) => match never {},
        }
    }

    /// Hand the events not already present to `persist`, and swap in the merged snapshot
    /// only if it succeeds. On error the current snapshot is left untouched.
    ///
    /// The write lock is held across `persist`, so no other merge can interleave.
    pub fn apply_persisted<T, E>(
        &self,
        incoming: Vec<Event>,
        persist: impl FnOnce(&[Event]) -> Result<T, E>,
    ) -> Result<(MergeOutcome, T), E> {
        let candidates = incoming.len();
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);

        let existing: HashSet<DedupKey> = current.events().iter().map(DedupKey::of).collect();
        let mut fresh_keys = HashSet::new();
        let fresh: Vec<Event> = incoming
            .iter()
            .filter(|e| {
                let key = DedupKey::of(e);
                !existing.contains(&key) && fresh_keys.insert(key)
            })
            .cloned()
            .collect();

        let persisted = persist(&fresh)?;

        let merged = current.merge(incoming);
        let added = merged.len() - current.len();
        let outcome = MergeOutcome {
            added,
            duplicates: candidates - added,
            total: merged.len(),
        };
        *current = Arc::new(merged);

        tracing::debug!(
            added = outcome.added,
            duplicates = outcome.duplicates,
            total = outcome.total,
            "event log replaced"
        );

        Ok((outcome, persisted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{admit_line, parse_ndjson};

    fn ev(line: &str) -> Event {
        admit_line(line).unwrap()
    }

    fn sample_batch() -> Vec<Event> {
        vec![
            ev(r#"{"timestamp":"2024-01-02T00:00:00Z","type":"click","url":"/a","source":"f1"}"#),
            ev(r#"{"timestamp":"2024-01-01T00:00:00Z","type":"page_view","url":"/a","source":"f1"}"#),
            ev(r#"{"timestamp":"2024-01-01T00:00:00Z","type":"page_view","url":"/b","source":"f1"}"#),
            ev(r#"{"timestamp":"2024-01-01T00:00:00Z","type":"page_view","url":"/a","source":"f1"}"#),
        ]
    }

    fn is_chronological(log: &EventLog) -> bool {
        log.events()
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp)
    }

    #[test]
    fn test_merge_dedups_within_batch() {
        let log = EventLog::new().merge(sample_batch());
        assert_eq!(log.len(), 3);
        assert!(is_chronological(&log));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = EventLog::new().merge(vec![ev(
            r#"{"timestamp":"2023-12-31T00:00:00Z","type":"session_start"}"#,
        )]);
        let once = base.merge(sample_batch());
        let twice = once.merge(sample_batch());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_order_independent() {
        let b1 = sample_batch();
        let b2 = vec![
            ev(r#"{"timestamp":"2024-01-01T00:00:00Z","type":"click","url":"/a","source":"f2"}"#),
            ev(r#"{"timestamp":"2024-01-03T00:00:00Z","type":"session_end","duration":10}"#),
        ];
        let forward = EventLog::new().merge(b1.clone()).merge(b2.clone());
        let backward = EventLog::new().merge(b2).merge(b1);
        assert_eq!(forward, backward);
        assert!(is_chronological(&forward));
    }

    #[test]
    fn test_first_seen_wins_on_key_collision() {
        // Same key, different element text: the copy already in the log is kept.
        let first = ev(
            r#"{"timestamp":"2024-01-01T00:00:00Z","type":"click","elementText":"old"}"#,
        );
        let second = ev(
            r#"{"timestamp":"2024-01-01T00:00:00Z","type":"click","elementText":"new"}"#,
        );
        let log = EventLog::new().merge(vec![first.clone()]).merge(vec![second]);
        assert_eq!(log.events(), &[first]);
    }

    #[test]
    fn test_missing_fields_normalized_in_key() {
        let a = ev(r#"{"timestamp":"2024-01-01T00:00:00Z","type":"click","url":""}"#);
        let b = ev(r#"{"timestamp":"2024-01-01T00:00:00Z","type":"click"}"#);
        assert_eq!(DedupKey::of(&a), DedupKey::of(&b));
        assert_eq!(DedupKey::of(&b).to_string(), "1704067200000||click|");
    }

    #[test]
    fn test_duplicate_ndjson_import() {
        let text = "{\"timestamp\":\"2024-01-01T00:00:00Z\",\"type\":\"click\"}\n{\"timestamp\":\"2024-01-01T01:00:00Z\",\"type\":\"page_view\",\"url\":\"/\"}\n";
        let once = EventLog::new().merge(parse_ndjson(text, Some("x.jsonl")).events);
        let twice = once.merge(parse_ndjson(text, Some("x.jsonl")).events);
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn test_shared_log_persists_only_fresh_events() {
        let shared = SharedLog::new();
        let (first, fresh) = shared
            .apply_persisted(sample_batch(), |fresh| Ok::<_, ()>(fresh.len()))
            .unwrap();
        assert_eq!(first.added, 3);
        assert_eq!(first.duplicates, 1);
        assert_eq!(fresh, 3);

        let before = shared.snapshot();
        let second = shared.apply(sample_batch());
        assert_eq!(second.added, 0);
        // Old snapshots are never mutated in place.
        assert_eq!(before.len(), 3);
        assert_eq!(shared.snapshot().len(), 3);
    }

    #[test]
    fn test_failed_persist_keeps_snapshot() {
        let shared = SharedLog::new();
        let failed = shared.apply_persisted(sample_batch(), |_| Err::<(), _>("disk full"));
        assert_eq!(failed.unwrap_err(), "disk full");
        assert_eq!(shared.snapshot().len(), 0);

        let (retry, fresh) = shared
            .apply_persisted(sample_batch(), |fresh| Ok::<_, ()>(fresh.len()))
            .unwrap();
        assert_eq!(retry.added, 3);
        assert_eq!(fresh, 3);
    }

    #[test]
    fn test_legacy_name_never_collides_with_typed_kind() {
        let log = EventLog::new().merge(vec![
            ev(r#"{"timestamp":"2024-01-01T00:00:00Z","type":"click"}"#),
            ev(r#"{"timestamp":"2024-01-01T00:00:00Z","event":"click"}"#),
        ]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_filter() {
        let log = EventLog::new().merge(vec![
            ev(r#"{"timestamp":"2024-01-01T00:00:00Z","type":"click","userAgent":"A"}"#),
            ev(r#"{"timestamp":"2024-01-05T00:00:00Z","type":"click","userAgent":"A"}"#),
            ev(r#"{"timestamp":"2024-01-03T00:00:00Z","type":"click","userAgent":"B"}"#),
        ]);
        let filter = LogFilter {
            user_agent: Some("A".to_string()),
            start_time: None,
            end_time: Some("2024-01-04T00:00:00Z".parse().unwrap()),
        };
        let filtered = log.filtered(&filter);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.events()[0].user_agent.as_deref(), Some("A"));
    }
}
