//! Folds events into gap-free, period-aligned series.
//!
//! Tallies are accumulated in a `BTreeMap` keyed by period start, so bin order is the
//! chronological order of the periods and never depends on hashing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bucketing::{contiguous_bins, floor, label, Granularity};
use crate::models::{Bucket, Event, EventKind, Pair};

/// Fold `(timestamp, value)` items into contiguous buckets.
///
/// Every item claims its period even when `fold` ignores its value, so the series spans
/// the first to the last item. Empty input yields an empty series.
pub fn bucketize<V, T, I, F>(items: I, granularity: Granularity, mut fold: F) -> Vec<Bucket<T>>
where
    I: IntoIterator<Item = (DateTime<Utc>, V)>,
    T: Default,
    F: FnMut(&mut T, V),
{
    let mut tallies: BTreeMap<DateTime<Utc>, T> = BTreeMap::new();
    for (ts, value) in items {
        fold(tallies.entry(floor(ts, granularity)).or_default(), value);
    }

    let (Some(&first), Some(&last)) = (tallies.keys().next(), tallies.keys().next_back()) else {
        return Vec::new();
    };

    contiguous_bins(first, last, granularity)
        .into_iter()
        .map(|start| Bucket {
            period_start: start.timestamp_millis(),
            label: label(start, granularity),
            values: tallies.remove(&start).unwrap_or_default(),
        })
        .collect()
}

/// Mutually exclusive activity categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActivityCounts {
    pub page_view: u64,
    pub click: u64,
    pub session: u64,
    pub other: u64,
}

impl ActivityCounts {
    fn record(&mut self, event: &Event) {
        match event.kind {
            EventKind::PageView { .. } => self.page_view += 1,
            EventKind::Click { .. } => self.click += 1,
            EventKind::SessionStart { .. } => self.session += 1,
            _ => self.other += 1,
        }
    }
}

pub fn activity_series(events: &[Event], granularity: Granularity) -> Vec<Bucket<ActivityCounts>> {
    bucketize(
        events.iter().map(|e| (e.timestamp, e)),
        granularity,
        |counts: &mut ActivityCounts, event| counts.record(event),
    )
}

/// Seconds rounded to one decimal place. Every duration metric is reported this way.
pub fn ms_to_seconds(ms: f64) -> f64 {
    (ms / 100.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationTally {
    pub count: u64,
    pub sum_ms: i64,
}

impl DurationTally {
    pub fn add(&mut self, duration_ms: i64) {
        self.count += 1;
        self.sum_ms = self.sum_ms.saturating_add(duration_ms);
    }

    pub fn finish(self) -> DurationStats {
        let avg_ms = if self.count > 0 {
            self.sum_ms as f64 / self.count as f64
        } else {
            0.0
        };
        DurationStats {
            count: self.count,
            sum_seconds: ms_to_seconds(self.sum_ms as f64),
            avg_seconds: ms_to_seconds(avg_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DurationStats {
    pub count: u64,
    pub sum_seconds: f64,
    pub avg_seconds: f64,
}

/// Which duration-bearing events feed a duration series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationView {
    #[default]
    All,
    Sessions,
    Pages,
}

impl DurationView {
    fn accepts(&self, event: &Event) -> bool {
        match self {
            DurationView::All => matches!(
                event.kind,
                EventKind::SessionEnd { .. } | EventKind::PageView { .. }
            ),
            DurationView::Sessions => matches!(event.kind, EventKind::SessionEnd { .. }),
            DurationView::Pages => matches!(event.kind, EventKind::PageView { .. }),
        }
    }
}

pub fn duration_series(
    events: &[Event],
    granularity: Granularity,
    view: DurationView,
) -> Vec<Bucket<DurationStats>> {
    let items = events
        .iter()
        .filter(|e| view.accepts(e))
        .filter_map(|e| e.duration_ms().map(|ms| (e.timestamp, ms)));

    bucketize(items, granularity, DurationTally::add)
        .into_iter()
        .map(|bucket| bucket.map_values(DurationTally::finish))
        .collect()
}

/// Pair durations bucketed by the open timestamp.
pub fn pair_series(pairs: &[Pair], granularity: Granularity) -> Vec<Bucket<DurationStats>> {
    let items = pairs.iter().filter_map(|p| {
        DateTime::from_timestamp_millis(p.open_timestamp).map(|ts| (ts, p.duration_ms))
    });

    bucketize(items, granularity, DurationTally::add)
        .into_iter()
        .map(|bucket| bucket.map_values(DurationTally::finish))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::EventLog;
    use crate::ingest::parse_ndjson;
    use crate::pairing::pair;

    fn log(text: &str) -> EventLog {
        EventLog::new().merge(parse_ndjson(text, None).events)
    }

    #[test]
    fn test_activity_single_day() {
        let log = log(
            r#"{"timestamp":"2024-01-01T00:30:00Z","type":"click"}
{"timestamp":"2024-01-01T23:10:00Z","type":"page_view"}"#,
        );
        let series = activity_series(log.events(), Granularity::Day);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].label, "2024-01-01");
        assert_eq!(
            series[0].values,
            ActivityCounts {
                page_view: 1,
                click: 1,
                session: 0,
                other: 0
            }
        );
    }

    #[test]
    fn test_activity_gap_filled() {
        let log = log(
            r#"{"timestamp":"2024-01-01T10:00:00Z","type":"session_start"}
{"timestamp":"2024-01-04T10:00:00Z","type":"session_end"}
{"timestamp":"2024-01-04T11:00:00Z","event":"homepage loaded"}"#,
        );
        let series = activity_series(log.events(), Granularity::Day);
        let labels: Vec<&str> = series.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["2024-01-01", "2024-01-02", "2024-01-03", "2024-01-04"]);
        assert_eq!(series[1].values, ActivityCounts::default());
        assert_eq!(series[0].values.session, 1);
        assert_eq!(series[3].values.other, 2);
        assert!(series.windows(2).all(|w| w[0].period_start < w[1].period_start));
    }

    #[test]
    fn test_empty_input_yields_empty_series() {
        assert!(activity_series(&[], Granularity::Month).is_empty());
    }

    #[test]
    fn test_duration_series_units() {
        let log = log(
            r#"{"timestamp":"2024-01-01T10:00:00Z","type":"session_end","duration":60}
{"timestamp":"2024-01-01T11:00:00Z","type":"session_end","duration":30.25}
{"timestamp":"2024-01-01T12:00:00Z","type":"page_view","duration":5}
{"timestamp":"2024-01-03T12:00:00Z","type":"session_end","duration":10}
{"timestamp":"2024-01-03T12:30:00Z","type":"tab_visible","duration":600}"#,
        );

        let sessions = duration_series(log.events(), Granularity::Day, DurationView::Sessions);
        assert_eq!(sessions.len(), 3);
        assert_eq!(sessions[0].values.count, 2);
        assert_eq!(sessions[0].values.sum_seconds, 90.3);
        assert_eq!(sessions[0].values.avg_seconds, 45.1);
        assert_eq!(sessions[1].values, DurationStats::default());

        let all = duration_series(log.events(), Granularity::Month, DurationView::All);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].values.count, 4);
        assert_eq!(all[0].values.sum_seconds, 105.3);

        let pages = duration_series(log.events(), Granularity::Day, DurationView::Pages);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].values.sum_seconds, 5.0);
    }

    #[test]
    fn test_duration_tally_saturates() {
        let mut tally = DurationTally::default();
        tally.add(i64::MAX);
        tally.add(i64::MAX);
        assert_eq!(tally.count, 2);
        assert_eq!(tally.sum_ms, i64::MAX);
    }

    #[test]
    fn test_pair_series() {
        let log = log(
            r#"{"timestamp":"2024-01-01T10:00:00Z","event":"homepage loaded"}
{"timestamp":"2024-01-01T10:00:05Z","event":"page closed"}
{"timestamp":"2024-01-01T12:00:00Z","event":"homepage loaded"}
{"timestamp":"2024-01-01T12:00:15Z","event":"page closed"}"#,
        );
        let series = pair_series(&pair(log.events()), Granularity::Hour);
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].label, "2024-01-01 10:00Z");
        assert_eq!(series[0].values.avg_seconds, 5.0);
        assert_eq!(series[1].values.count, 0);
        assert_eq!(series[2].values.sum_seconds, 15.0);
    }
}
