use crate::models::{Event, Pair};

/// Match every non-close event with the nearest close event that follows it.
///
/// `events` must be in chronological order. A single close may terminate several
/// opens that precede it. Opens with no following close produce nothing.
pub fn pair(events: &[Event]) -> Vec<Pair> {
    let mut pairs = Vec::new();
    let mut next_close: Option<&Event> = None;

    for event in events.iter().rev() {
        if event.is_close_marker() {
            next_close = Some(event);
            continue;
        }
        let Some(close) = next_close else {
            continue;
        };
        let duration_ms = close.timestamp_ms() - event.timestamp_ms();
        if duration_ms < 0 {
            continue;
        }
        pairs.push(Pair {
            open_timestamp: event.timestamp_ms(),
            close_timestamp: close.timestamp_ms(),
            duration_ms,
            origin_label: event.kind_tag().to_string(),
            source: event.source.clone(),
        });
    }

    pairs.reverse();
    pairs
}
