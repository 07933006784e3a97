//! Batch admission: NDJSON and legacy JSON-map parsing.
//!
//! Every line is parsed on its own. A line that is not JSON, or whose timestamp does not
//! parse to an instant, is skipped and reported; it never stops the rest of the batch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::{Event, EventKind, RawEvent};

/// Why a candidate record was not admitted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectReason {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("unparsable timestamp {0}")]
    BadTimestamp(String),
    #[error("duration {0}s exceeds the one-year limit")]
    DurationOutOfRange(f64),
}

/// Longest admitted duration: one year, in seconds.
pub const MAX_DURATION_SECONDS: f64 = 365.0 * 24.0 * 3600.0;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LineFailure {
    pub source: Option<String>,
    /// 1-based line number (entry index for JSON arrays and legacy maps).
    pub line: usize,
    pub reason: String,
}

/// Admitted events plus everything that was skipped.
#[derive(Debug, Default, Clone)]
pub struct ImportBatch {
    pub events: Vec<Event>,
    pub failures: Vec<LineFailure>,
}

impl ImportBatch {
    fn admit(&mut self, source: Option<&str>, line: usize, result: Result<Event, RejectReason>) {
        match result {
            Ok(mut event) => {
                if event.source.is_none() {
                    event.source = source.map(str::to_string);
                }
                self.events.push(event);
            }
            Err(reason) => {
                tracing::debug!(source = source.unwrap_or(""), line, %reason, "record rejected");
                self.failures.push(LineFailure {
                    source: source.map(str::to_string),
                    line,
                    reason: reason.to_string(),
                });
            }
        }
    }

    pub fn extend(&mut self, other: ImportBatch) {
        self.events.extend(other.events);
        self.failures.extend(other.failures);
    }
}

/// Parse an instant: RFC 3339, naive ISO date-time or date (UTC), or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, RejectReason> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| RejectReason::BadTimestamp(n.to_string())),
        Value::Null => Err(RejectReason::MissingTimestamp),
        other => Err(RejectReason::BadTimestamp(other.to_string())),
    }
}

/// Sub-millisecond precision is dropped, matching what the store keeps.
pub fn parse_timestamp_str(s: &str) -> Result<DateTime<Utc>, RejectReason> {
    parse_instant(s).map(|ts| ts.trunc_subsecs(3))
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, RejectReason> {
    let s = s.trim();
    if s.is_empty() {
        return Err(RejectReason::MissingTimestamp);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    Err(RejectReason::BadTimestamp(format!("{s:?}")))
}

/// Non-positive and non-finite durations count as absent; oversized ones reject the record.
fn duration_ms(seconds: Option<f64>) -> Result<Option<i64>, RejectReason> {
    match seconds.filter(|s| s.is_finite() && *s > 0.0) {
        Some(s) if s > MAX_DURATION_SECONDS => Err(RejectReason::DurationOutOfRange(s)),
        Some(s) => Ok(Some((s * 1000.0).round() as i64)),
        None => Ok(None),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl TryFrom<RawEvent> for Event {
    type Error = RejectReason;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let timestamp = parse_timestamp(raw.timestamp.as_ref().unwrap_or(&Value::Null))?;

        let kind = match raw.kind.as_deref().map(str::trim) {
            Some("click") => EventKind::Click {
                element_id: non_empty(raw.element_id),
                element_text: non_empty(raw.element_text),
            },
            Some("page_view") => EventKind::PageView {
                duration_ms: duration_ms(raw.duration)?,
            },
            Some("session_start") => EventKind::SessionStart {
                screen_resolution: non_empty(raw.screen_resolution),
            },
            Some("session_end") => EventKind::SessionEnd {
                duration_ms: duration_ms(raw.duration)?,
            },
            Some("tab_hidden") => EventKind::TabHidden,
            Some("tab_visible") => EventKind::TabVisible {
                duration_ms: duration_ms(raw.duration)?,
            },
            Some(other) if !other.is_empty() => EventKind::Named(other.to_string()),
            _ => EventKind::Named(raw.event.unwrap_or_default()),
        };

        Ok(Event {
            timestamp,
            source: non_empty(raw.source),
            url: non_empty(raw.url),
            user_agent: non_empty(raw.user_agent),
            kind,
        })
    }
}

/// Admit one JSON value as an event.
pub fn admit_value(value: Value) -> Result<Event, RejectReason> {
    if !value.is_object() {
        return Err(RejectReason::NotAnObject);
    }
    let raw: RawEvent =
        serde_json::from_value(value).map_err(|e| RejectReason::InvalidJson(e.to_string()))?;
    Event::try_from(raw)
}

pub fn admit_line(line: &str) -> Result<Event, RejectReason> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| RejectReason::InvalidJson(e.to_string()))?;
    admit_value(value)
}

/// Parse newline-delimited JSON. Blank lines are ignored.
pub fn parse_ndjson(text: &str, source: Option<&str>) -> ImportBatch {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut batch = ImportBatch::default();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        batch.admit(source, idx + 1, admit_line(line));
    }

    batch
}

/// Admit the elements of an already-decoded JSON body (array or single object).
pub fn parse_json_value(value: Value, source: Option<&str>) -> ImportBatch {
    let mut batch = ImportBatch::default();
    match value {
        Value::Array(items) => {
            for (idx, item) in items.into_iter().enumerate() {
                batch.admit(source, idx + 1, admit_value(item));
            }
        }
        other => batch.admit(source, 1, admit_value(other)),
    }
    batch
}

/// Drop `//` comment lines and anything before the first `{` or `[`.
fn sanitize_legacy(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect();
    let joined = kept.join("\n");
    match joined.find(['{', '[']) {
        Some(start) => joined[start..].trim().to_string(),
        None => joined.trim().to_string(),
    }
}

/// Parse the legacy export: one JSON object mapping timestamps to event names.
pub fn parse_legacy_map(text: &str, source: Option<&str>) -> ImportBatch {
    let mut batch = ImportBatch::default();
    let clean = sanitize_legacy(text);

    let map = match serde_json::from_str::<serde_json::Map<String, Value>>(&clean) {
        Ok(map) => map,
        Err(e) => {
            batch.admit(source, 1, Err(RejectReason::InvalidJson(e.to_string())));
            return batch;
        }
    };

    for (idx, (time, name)) in map.into_iter().enumerate() {
        let result = parse_timestamp_str(&time).map(|timestamp| Event {
            timestamp,
            source: None,
            url: None,
            user_agent: None,
            kind: EventKind::Named(match name {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        });
        batch.admit(source, idx + 1, result);
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ndjson_skips_bad_lines() {
        let text = r#"{"timestamp":"2024-01-01T00:30:00Z","type":"click","elementId":"buy"}
not json at all

{"timestamp":"yesterday","type":"page_view"}
{"type":"page_view","url":"/"}
{"timestamp":"2024-01-01T23:10:00Z","type":"page_view","url":"/","duration":12.5}
"#;
        let batch = parse_ndjson(text, Some("a.jsonl"));

        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.failures.len(), 3);
        assert_eq!(
            batch.failures.iter().map(|f| f.line).collect::<Vec<_>>(),
            vec![2, 4, 5]
        );
        assert_eq!(batch.failures[2].reason, "missing timestamp");
        assert_eq!(batch.events[0].source.as_deref(), Some("a.jsonl"));
        assert_eq!(batch.events[1].duration_ms(), Some(12_500));
    }

    #[test]
    fn test_line_source_wins_over_file_source() {
        let text = r#"{"timestamp":"2024-01-01T00:00:00Z","type":"click","source":"tab-1"}"#;
        let batch = parse_ndjson(text, Some("file.jsonl"));
        assert_eq!(batch.events[0].source.as_deref(), Some("tab-1"));
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = parse_timestamp_str("2024-05-01T10:00:00Z").unwrap();
        assert_eq!(parse_timestamp_str("2024-05-01T12:00:00+02:00").unwrap(), expected);
        assert_eq!(parse_timestamp_str("2024-05-01T10:00:00").unwrap(), expected);
        assert_eq!(
            parse_timestamp(&Value::from(expected.timestamp_millis())).unwrap(),
            expected
        );
        assert_eq!(
            parse_timestamp_str("2024-05-01").unwrap(),
            parse_timestamp_str("2024-05-01T00:00:00Z").unwrap()
        );
        assert!(matches!(
            parse_timestamp_str("13/45/2024"),
            Err(RejectReason::BadTimestamp(_))
        ));
    }

    #[test]
    fn test_sub_millisecond_precision_is_truncated() {
        let event =
            admit_line(r#"{"timestamp":"2024-01-01T00:00:00.123456789Z","type":"click"}"#).unwrap();
        let back: Event = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(event.timestamp.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(back, event);
    }

    #[test]
    fn test_duration_on_click_is_ignored() {
        let event =
            admit_line(r#"{"timestamp":"2024-01-01T00:00:00Z","type":"click","duration":9}"#)
                .unwrap();
        assert_eq!(event.duration_ms(), None);
    }

    #[test]
    fn test_oversized_duration_is_rejected() {
        let text = r#"{"timestamp":"2024-01-01T00:00:00Z","type":"session_end","duration":1e300}
{"timestamp":"2024-01-01T00:01:00Z","type":"session_end","duration":1e300}
{"timestamp":"2024-01-01T00:02:00Z","type":"session_end","duration":31536000}
{"timestamp":"2024-01-01T00:03:00Z","type":"click","duration":1e300}"#;
        let batch = parse_ndjson(text, None);

        assert_eq!(batch.failures.len(), 2);
        assert!(matches!(
            admit_line(text.lines().next().unwrap()),
            Err(RejectReason::DurationOutOfRange(_))
        ));
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.events[0].duration_ms(), Some(31_536_000_000));
    }

    #[test]
    fn test_legacy_event_field() {
        let event =
            admit_line(r#"{"timestamp":"2024-01-01T00:00:00Z","event":"page closed"}"#).unwrap();
        assert_eq!(event.kind, EventKind::Named("page closed".to_string()));
        assert!(event.is_close_marker());
    }

    #[test]
    fn test_parse_json_array() {
        let value = serde_json::json!([
            {"timestamp": "2024-01-01T00:00:00Z", "type": "session_start", "screenResolution": "1920x1080"},
            42
        ]);
        let batch = parse_json_value(value, None);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.failures[0].reason, "record is not a JSON object");
    }

    #[test]
    fn test_parse_legacy_map() {
        let text = "// filepath: export.json\n{\n  \"2024-01-01T10:00:00Z\": \"homepage loaded\",\n  \"garbage\": \"page closed\",\n  \"2024-01-01T10:05:00Z\": \"page closed\"\n}";
        let batch = parse_legacy_map(text, Some("export.json"));
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.events[1].kind_tag(), "page closed");
    }

    #[test]
    fn test_event_wire_round_trip() {
        let line = r#"{"timestamp":"2024-01-01T00:00:00.000Z","type":"session_end","url":"/x","duration":30.0,"source":"s"}"#;
        let event = admit_line(line).unwrap();
        let back: Event = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(back, event);
    }
}
