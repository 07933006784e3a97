//! UTC calendar bucketing.
//!
//! Periods are floored in UTC and series are generated contiguously from the first to the
//! last occupied period, so consumers always get one bin per period with no gaps.

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on generated bins; longer spans are truncated.
pub const MAX_BINS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    #[default]
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Start of the UTC period containing `ts`.
pub fn floor(ts: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    let date = ts.date_naive();
    match granularity {
        Granularity::Hour => midnight(date) + Duration::hours(i64::from(ts.hour())),
        Granularity::Day => midnight(date),
        Granularity::Week => {
            // Monday of the ISO week; Sunday counts as day 7.
            let back = u64::from(date.weekday().number_from_monday() - 1);
            midnight(date.checked_sub_days(Days::new(back)).unwrap_or(date))
        }
        Granularity::Month => {
            midnight(date.checked_sub_days(Days::new(u64::from(date.day0()))).unwrap_or(date))
        }
    }
}

pub fn label(period_start: DateTime<Utc>, granularity: Granularity) -> String {
    match granularity {
        Granularity::Hour => period_start.format("%Y-%m-%d %H:00Z").to_string(),
        Granularity::Day | Granularity::Week => period_start.format("%Y-%m-%d").to_string(),
        Granularity::Month => period_start.format("%Y-%m").to_string(),
    }
}

fn next_period(start: DateTime<Utc>, granularity: Granularity) -> Option<DateTime<Utc>> {
    match granularity {
        Granularity::Hour => start.checked_add_signed(Duration::hours(1)),
        Granularity::Day => start.checked_add_signed(Duration::days(1)),
        Granularity::Week => start.checked_add_signed(Duration::weeks(1)),
        // Calendar step; month lengths vary.
        Granularity::Month => start.checked_add_months(Months::new(1)),
    }
}

/// Every period start from `floor(min)` to `floor(max)` inclusive, capped at [`MAX_BINS`].
pub fn contiguous_bins(
    min: DateTime<Utc>,
    max: DateTime<Utc>,
    granularity: Granularity,
) -> Vec<DateTime<Utc>> {
    let end = floor(max, granularity);
    let mut bins = Vec::new();
    let mut cursor = Some(floor(min, granularity));

    while let Some(current) = cursor {
        if current > end {
            break;
        }
        if bins.len() == MAX_BINS {
            tracing::warn!(
                granularity = %granularity,
                max_bins = MAX_BINS,
                "bin series truncated"
            );
            break;
        }
        bins.push(current);
        cursor = next_period(current, granularity);
    }

    bins
}
