use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use crate::aggregate::{activity_series, ms_to_seconds, ActivityCounts};
use crate::bucketing::Granularity;
use crate::models::{Bucket, Event, EventKind, NameCount};


/// Headline numbers for the dashboard summary cards.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Summary {
    pub total_sessions: usize,
    pub avg_session_duration_seconds: f64,
    pub avg_session_duration: String,
    pub total_page_views: usize,
    pub total_events: usize,
}

/// Session-end durations averaged over the number of session starts.
pub fn summary(events: &[Event]) -> Summary {
    let mut sessions = 0usize;
    let mut page_views = 0usize;
    let mut session_ms = 0i64;

    for event in events {
        match event.kind {
            EventKind::SessionStart { .. } => sessions += 1,
            EventKind::PageView { .. } => page_views += 1,
            EventKind::SessionEnd { duration_ms } => {
                session_ms = session_ms.saturating_add(duration_ms.unwrap_or(0));
            }
            _ => {}
        }
    }

    let avg_ms = if sessions > 0 {
        session_ms as f64 / sessions as f64
    } else {
        0.0
    };
    let avg_seconds = ms_to_seconds(avg_ms);

    Summary {
        total_sessions: sessions,
        avg_session_duration_seconds: avg_seconds,
        avg_session_duration: format_duration(avg_seconds),
        total_page_views: page_views,
        total_events: events.len(),
    }
}

/// `42s`, `7m`, `2h 5m`.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{}s", seconds.round() as i64);
    }
    let minutes = (seconds / 60.0).floor() as i64;
    if minutes < 60 {
        return format!("{minutes}m");
    }
    format!("{}h {}m", minutes / 60, minutes % 60)
}

const BROWSER_RULES: &[(&[&str], &str)] = &[
    (&["Firefox"], "Firefox"),
    (&["Edg"], "Edge"),
    (&["Chrome"], "Chrome"),
    (&["Safari"], "Safari"),
];

const OS_RULES: &[(&[&str], &str)] = &[
    (&["Windows"], "Windows"),
    (&["Android"], "Android"),
    (&["iPhone", "iPad"], "iOS"),
    (&["Mac"], "MacOS"),
    (&["Linux"], "Linux"),
];

fn first_match(ua: &str, rules: &[(&[&str], &'static str)]) -> &'static str {
    rules
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| ua.contains(n)))
        .map(|(_, name)| *name)
        .unwrap_or("Unknown")
}

/// (browser, os) by ordered substring rules; the first rule that matches wins.
pub fn parse_user_agent(ua: &str) -> (&'static str, &'static str) {
    (first_match(ua, BROWSER_RULES), first_match(ua, OS_RULES))
}

fn ranked(counts: BTreeMap<String, usize>) -> Vec<NameCount> {
    let mut rows: Vec<NameCount> = counts
        .into_iter()
        .map(|(name, count)| NameCount { name, count })
        .collect();
    // Stable sort keeps the BTreeMap's name order among equal counts.
    rows.sort_by(|a, b| b.count.cmp(&a.count));
    rows
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceStats {
    pub browsers: Vec<NameCount>,
    pub os: Vec<NameCount>,
}

/// Browser and OS breakdown over distinct user-agent strings.
pub fn device_stats(events: &[Event]) -> DeviceStats {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut browsers: BTreeMap<String, usize> = BTreeMap::new();
    let mut os: BTreeMap<String, usize> = BTreeMap::new();

    for ua in events.iter().filter_map(|e| e.user_agent.as_deref()) {
        if !seen.insert(ua) {
            continue;
        }
        let (browser, system) = parse_user_agent(ua);
        *browsers.entry(browser.to_string()).or_insert(0) += 1;
        *os.entry(system.to_string()).or_insert(0) += 1;
    }

    DeviceStats {
        browsers: ranked(browsers),
        os: ranked(os),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolutionCount {
    pub resolution: String,
    pub count: usize,
}

pub fn resolution_stats(events: &[Event]) -> Vec<ResolutionCount> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for event in events {
        if let EventKind::SessionStart {
            screen_resolution: Some(res),
        } = &event.kind
        {
            *counts.entry(res.clone()).or_insert(0) += 1;
        }
    }

    ranked(counts)
        .into_iter()
        .map(|row| ResolutionCount {
            resolution: row.name,
            count: row.count,
        })
        .collect()
}

/// Tab-visibility engagement, in seconds.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngagementStats {
    pub total_switches: usize,
    pub total_background_time: f64,
    pub active_time: f64,
    pub total_session_time: f64,
}

/// `events` must be chronological. A `tab_visible` without a reported duration is measured
/// from the preceding unmatched `tab_hidden`.
pub fn engagement_stats(events: &[Event]) -> EngagementStats {
    let mut switches = 0usize;
    let mut background_ms = 0i64;
    let mut session_ms = 0i64;
    let mut hidden_since: Option<i64> = None;

    for event in events {
        match event.kind {
            EventKind::TabHidden => {
                switches += 1;
                hidden_since = Some(event.timestamp_ms());
            }
            EventKind::TabVisible { duration_ms } => {
                let measured = hidden_since
                    .take()
                    .map(|since| (event.timestamp_ms() - since).max(0));
                background_ms =
                    background_ms.saturating_add(duration_ms.or(measured).unwrap_or(0));
            }
            EventKind::SessionEnd { duration_ms } => {
                session_ms = session_ms.saturating_add(duration_ms.unwrap_or(0));
            }
            _ => {}
        }
    }

    EngagementStats {
        total_switches: switches,
        total_background_time: ms_to_seconds(background_ms as f64),
        active_time: ms_to_seconds(session_ms.saturating_sub(background_ms).max(0) as f64),
        total_session_time: ms_to_seconds(session_ms as f64),
    }
}

const CLICK_LABEL_CHARS: usize = 30;

fn click_label(element_id: Option<&str>, element_text: Option<&str>) -> String {
    match (element_text.map(str::trim).filter(|t| !t.is_empty()), element_id) {
        (Some(text), _) if text.chars().count() > CLICK_LABEL_CHARS => {
            let head: String = text.chars().take(CLICK_LABEL_CHARS).collect();
            format!("{head}...")
        }
        (Some(text), _) => text.to_string(),
        (None, Some(id)) => id.to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// Clicks per element label, optionally restricted to one page URL.
pub fn click_breakdown(events: &[Event], url: Option<&str>) -> Vec<NameCount> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for event in events {
        let EventKind::Click {
            element_id,
            element_text,
        } = &event.kind
        else {
            continue;
        };
        if url.is_some_and(|u| event.url.as_deref() != Some(u)) {
            continue;
        }
        let label = click_label(element_id.as_deref(), element_text.as_deref());
        *counts.entry(label).or_insert(0) += 1;
    }
    ranked(counts)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PageTime {
    pub url: String,
    pub duration_seconds: f64,
}

/// Summed page-view durations per URL, longest first.
pub fn page_times(events: &[Event]) -> Vec<PageTime> {
    let mut totals: BTreeMap<String, i64> = BTreeMap::new();
    for event in events {
        if let EventKind::PageView {
            duration_ms: Some(ms),
        } = event.kind
        {
            let url = event.url.clone().unwrap_or_else(|| "unknown".to_string());
            let total = totals.entry(url).or_insert(0);
            *total = total.saturating_add(ms);
        }
    }

    let mut rows: Vec<(String, i64)> = totals.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1));
    rows.into_iter()
        .map(|(url, ms)| PageTime {
            url,
            duration_seconds: ms_to_seconds(ms as f64),
        })
        .collect()
}

/// Export bundle: every flat reducer plus the daily activity timeline.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub summary: Summary,
    pub timeline: Vec<Bucket<ActivityCounts>>,
    pub page_times: Vec<PageTime>,
    pub clicks: Vec<NameCount>,
    pub devices: DeviceStats,
    pub resolutions: Vec<ResolutionCount>,
    pub engagement: EngagementStats,
}

pub fn report(events: &[Event]) -> Report {
    Report {
        summary: summary(events),
        timeline: activity_series(events, Granularity::Day),
        page_times: page_times(events),
        clicks: click_breakdown(events, None),
        devices: device_stats(events),
        resolutions: resolution_stats(events),
        engagement: engagement_stats(events),
    }
}
