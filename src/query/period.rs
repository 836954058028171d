use std::sync::LazyLock;

use chrono::{NaiveDate, Weekday};
use regex::Regex;

use crate::date_util::last_day_of_month;
use crate::error::{Error, Result};
use crate::metrics::{AffectedTimeRange, TimeUnit};

static RE_QUARTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-Q([1-4])$").unwrap());
static RE_WEEK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-W(\d{1,2})$").unwrap());
static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").unwrap());
static RE_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").unwrap());

/// A single rollup bucket, used to scope metric value queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Period {
    Year(i32),
    Quarter(i32, u32),
    Month(i32, u32),
    Week(i32, u32),
    Day(NaiveDate),
}

impl Period {
    /// Parse a period string.
    ///
    /// Supported formats:
    /// - `2023` — year
    /// - `2023-Q2` — quarter
    /// - `2023-06` — month
    /// - `2023-W23` — ISO week
    /// - `2023-06-15` — day
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        // Year: "2023"
        if s.len() == 4 {
            if let Ok(year) = s.parse::<i32>() {
                return Ok(Period::Year(year));
            }
        }

        // Quarter: "2023-Q1" through "2023-Q4"
        if let Some(caps) = RE_QUARTER.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let quarter: u32 = caps[2].parse().unwrap();
            return Ok(Period::Quarter(year, quarter));
        }

        // Week: "2023-W23"
        if let Some(caps) = RE_WEEK.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let week: u32 = caps[2].parse().unwrap();
            if (1..=53).contains(&week) {
                return Ok(Period::Week(year, week));
            }
        }

        // Month: "2023-06"
        if let Some(caps) = RE_MONTH.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let month: u32 = caps[2].parse().unwrap();
            if (1..=12).contains(&month) {
                return Ok(Period::Month(year, month));
            }
        }

        // Day: "2023-06-15"
        if let Some(caps) = RE_DAY.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let month: u32 = caps[2].parse().unwrap();
            let day: u32 = caps[3].parse().unwrap();
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                return Ok(Period::Day(date));
            }
        }

        Err(Error::PeriodParse(format!("unrecognized period: {s}")))
    }

    /// The time unit this period addresses.
    pub fn time_unit(&self) -> TimeUnit {
        match self {
            Period::Year(_) => TimeUnit::Year,
            Period::Quarter(..) => TimeUnit::Quarter,
            Period::Month(..) => TimeUnit::Month,
            Period::Week(..) => TimeUnit::Week,
            Period::Day(_) => TimeUnit::Day,
        }
    }

    /// The inclusive date range covered by this period.
    pub fn date_range(&self) -> AffectedTimeRange {
        match self {
            Period::Year(y) => AffectedTimeRange::new(
                NaiveDate::from_ymd_opt(*y, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(*y, 12, 31).unwrap(),
            ),
            Period::Quarter(y, q) => {
                let start_month = (q - 1) * 3 + 1;
                AffectedTimeRange::new(
                    NaiveDate::from_ymd_opt(*y, start_month, 1).unwrap(),
                    last_day_of_month(*y, q * 3),
                )
            }
            Period::Month(y, m) => AffectedTimeRange::new(
                NaiveDate::from_ymd_opt(*y, *m, 1).unwrap(),
                last_day_of_month(*y, *m),
            ),
            Period::Week(y, w) => {
                let start = NaiveDate::from_isoywd_opt(*y, *w, Weekday::Mon)
                    .unwrap_or_else(|| NaiveDate::from_isoywd_opt(*y, 52, Weekday::Mon).unwrap());
                AffectedTimeRange::new(start, start + chrono::Duration::days(6))
            }
            Period::Day(date) => AffectedTimeRange::new(*date, *date),
        }
    }

    /// Canonical key string.
    pub fn to_key(&self) -> String {
        match self {
            Period::Year(y) => format!("{y}"),
            Period::Quarter(y, q) => format!("{y}-Q{q}"),
            Period::Month(y, m) => format!("{y}-{m:02}"),
            Period::Week(y, w) => format!("{y}-W{w:02}"),
            Period::Day(date) => date.format("%Y-%m-%d").to_string(),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}
