use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Legacy event name that closes an open interval in the pair matcher.
pub const LEGACY_CLOSE_EVENT: &str = "page closed";

/// Telemetry record as it travels on the wire (NDJSON lines, API bodies, store payloads).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_text: Option<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// An admitted event. Only constructed through admission, so the timestamp is always valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RawEvent", try_from = "RawEvent")]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub kind: EventKind,
}

/// Type-dependent part of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Click {
        element_id: Option<String>,
        element_text: Option<String>,
    },
    PageView {
        duration_ms: Option<i64>,
    },
    SessionStart {
        screen_resolution: Option<String>,
    },
    SessionEnd {
        duration_ms: Option<i64>,
    },
    TabHidden,
    TabVisible {
        duration_ms: Option<i64>,
    },
    /// Legacy free-text event name, or a `type` tag this service does not model.
    Named(String),
}

impl Event {
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Type tag used for dedup keys, labels and the wire `type` field.
    pub fn kind_tag(&self) -> &str {
        match &self.kind {
            EventKind::Click { .. } => "click",
            EventKind::PageView { .. } => "page_view",
            EventKind::SessionStart { .. } => "session_start",
            EventKind::SessionEnd { .. } => "session_end",
            EventKind::TabHidden => "tab_hidden",
            EventKind::TabVisible { .. } => "tab_visible",
            EventKind::Named(name) => name,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match self.kind {
            EventKind::PageView { duration_ms }
            | EventKind::SessionEnd { duration_ms }
            | EventKind::TabVisible { duration_ms } => duration_ms,
            _ => None,
        }
    }

    pub fn is_close_marker(&self) -> bool {
        match &self.kind {
            EventKind::SessionEnd { .. } => true,
            EventKind::Named(name) => name == LEGACY_CLOSE_EVENT,
            _ => false,
        }
    }
}

impl From<Event> for RawEvent {
    fn from(event: Event) -> Self {
        let timestamp = Some(serde_json::Value::String(
            event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        ));
        let duration = event.duration_ms().map(|ms| ms as f64 / 1000.0);
        let mut raw = RawEvent {
            timestamp,
            duration,
            url: event.url,
            user_agent: event.user_agent,
            source: event.source,
            ..RawEvent::default()
        };

        match event.kind {
            EventKind::Click {
                element_id,
                element_text,
            } => {
                raw.kind = Some("click".to_string());
                raw.element_id = element_id;
                raw.element_text = element_text;
            }
            EventKind::PageView { .. } => raw.kind = Some("page_view".to_string()),
            EventKind::SessionStart { screen_resolution } => {
                raw.kind = Some("session_start".to_string());
                raw.screen_resolution = screen_resolution;
            }
            EventKind::SessionEnd { .. } => raw.kind = Some("session_end".to_string()),
            EventKind::TabHidden => raw.kind = Some("tab_hidden".to_string()),
            EventKind::TabVisible { .. } => raw.kind = Some("tab_visible".to_string()),
            EventKind::Named(name) => raw.event = Some(name),
        }

        raw
    }
}

/// One period-aligned slice of an aggregated series.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Bucket<T> {
    /// Epoch milliseconds, UTC-aligned to the requested granularity.
    pub period_start: i64,
    pub label: String,
    #[serde(flatten)]
    pub values: T,
}

impl<T> Bucket<T> {
    pub fn map_values<U>(self, f: impl FnOnce(T) -> U) -> Bucket<U> {
        Bucket {
            period_start: self.period_start,
            label: self.label,
            values: f(self.values),
        }
    }
}

/// An open event matched with the nearest following close event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Pair {
    pub open_timestamp: i64,
    pub close_timestamp: i64,
    pub duration_ms: i64,
    pub origin_label: String,
    pub source: Option<String>,
}

/// API Response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Name/count row used by the breakdown reducers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NameCount {
    pub name: String,
    pub count: usize,
}

/// Result of one ingestion request, returned to the caller for user-facing reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub batch_id: uuid::Uuid,
    pub files: usize,
    /// Records admitted by parsing, before dedup.
    pub parsed: usize,
    pub added: usize,
    pub duplicates: usize,
    /// Event Log size after the merge.
    pub total: usize,
    pub failures: Vec<crate::ingest::LineFailure>,
}

/// Multi-file import input from API
#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub files: Vec<ImportFile>,
}

#[derive(Debug, Deserialize)]
pub struct ImportFile {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub format: ImportFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportFormat {
    /// One JSON event per line.
    #[default]
    Ndjson,
    /// A single JSON object mapping timestamps to event names.
    Legacy,
}
