use chrono::{Datelike, Duration, Months, NaiveDate};

use crate::metrics::TimeUnit;

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap() - Duration::days(1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap() - Duration::days(1)
    }
}

/// Get the quarter (1-4) for a given date.
pub fn quarter_of(d: NaiveDate) -> u32 {
    (d.month() - 1) / 3 + 1
}

/// First date of the time-unit bucket containing `d`.
/// Weeks are ISO-8601 (Monday start).
pub fn start_of(d: NaiveDate, unit: TimeUnit) -> NaiveDate {
    match unit {
        TimeUnit::Day => d,
        TimeUnit::Week => d - Duration::days(d.weekday().num_days_from_monday() as i64),
        TimeUnit::Month => NaiveDate::from_ymd_opt(d.year(), d.month(), 1).unwrap(),
        TimeUnit::Quarter => {
            let month = (quarter_of(d) - 1) * 3 + 1;
            NaiveDate::from_ymd_opt(d.year(), month, 1).unwrap()
        }
        TimeUnit::Year => NaiveDate::from_ymd_opt(d.year(), 1, 1).unwrap(),
    }
}

/// Last date of the time-unit bucket containing `d`.
pub fn end_of(d: NaiveDate, unit: TimeUnit) -> NaiveDate {
    match unit {
        TimeUnit::Day => d,
        TimeUnit::Week => start_of(d, TimeUnit::Week) + Duration::days(6),
        TimeUnit::Month => last_day_of_month(d.year(), d.month()),
        TimeUnit::Quarter => last_day_of_month(d.year(), quarter_of(d) * 3),
        TimeUnit::Year => NaiveDate::from_ymd_opt(d.year(), 12, 31).unwrap(),
    }
}

/// Step forward by one time unit. Calendar-aware for month-based units, so
/// stepping from a bucket start always lands on the next bucket start.
pub fn advance(d: NaiveDate, unit: TimeUnit) -> NaiveDate {
    match unit {
        TimeUnit::Day => d + Duration::days(1),
        TimeUnit::Week => d + Duration::days(7),
        TimeUnit::Month => d + Months::new(1),
        TimeUnit::Quarter => d + Months::new(3),
        TimeUnit::Year => d + Months::new(12),
    }
}

/// Whether `d` lies within `[from, to]` inclusive.
pub fn is_between(d: NaiveDate, from: NaiveDate, to: NaiveDate) -> bool {
    d >= from && d <= to
}

/// Whether two dates fall in the same time-unit bucket.
pub fn same_bucket(a: NaiveDate, b: NaiveDate, unit: TimeUnit) -> bool {
    start_of(a, unit) == start_of(b, unit)
}

/// Day-of-year ordinal (1-366).
pub fn day_of_year(d: NaiveDate) -> u32 {
    d.ordinal()
}

/// ISO-8601 week-of-year ordinal (1-53).
pub fn week_of_year(d: NaiveDate) -> u32 {
    d.iso_week().week()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(last_day_of_month(2023, 1), d(2023, 1, 31));
        assert_eq!(last_day_of_month(2023, 2), d(2023, 2, 28));
        assert_eq!(last_day_of_month(2024, 2), d(2024, 2, 29)); // Leap year
        assert_eq!(last_day_of_month(2023, 12), d(2023, 12, 31));
    }

    #[test]
    fn test_quarter_of() {
        assert_eq!(quarter_of(d(2023, 1, 15)), 1);
        assert_eq!(quarter_of(d(2023, 3, 31)), 1);
        assert_eq!(quarter_of(d(2023, 4, 1)), 2);
        assert_eq!(quarter_of(d(2023, 6, 30)), 2);
        assert_eq!(quarter_of(d(2023, 7, 1)), 3);
        assert_eq!(quarter_of(d(2023, 12, 31)), 4);
    }

    #[test]
    fn test_start_of() {
        assert_eq!(start_of(d(2022, 11, 29), TimeUnit::Day), d(2022, 11, 29));
        // 2022-11-29 is a Tuesday; ISO week starts Monday 2022-11-28
        assert_eq!(start_of(d(2022, 11, 29), TimeUnit::Week), d(2022, 11, 28));
        assert_eq!(start_of(d(2022, 11, 28), TimeUnit::Week), d(2022, 11, 28));
        assert_eq!(start_of(d(2022, 11, 29), TimeUnit::Month), d(2022, 11, 1));
        assert_eq!(start_of(d(2022, 11, 29), TimeUnit::Quarter), d(2022, 10, 1));
        assert_eq!(start_of(d(2022, 11, 29), TimeUnit::Year), d(2022, 1, 1));
    }

    #[test]
    fn test_end_of() {
        assert_eq!(end_of(d(2022, 12, 5), TimeUnit::Day), d(2022, 12, 5));
        // 2022-12-05 is a Monday; its ISO week ends Sunday 2022-12-11
        assert_eq!(end_of(d(2022, 12, 5), TimeUnit::Week), d(2022, 12, 11));
        assert_eq!(end_of(d(2022, 12, 5), TimeUnit::Month), d(2022, 12, 31));
        assert_eq!(end_of(d(2022, 11, 2), TimeUnit::Quarter), d(2022, 12, 31));
        assert_eq!(end_of(d(2022, 2, 2), TimeUnit::Quarter), d(2022, 3, 31));
        assert_eq!(end_of(d(2022, 2, 2), TimeUnit::Year), d(2022, 12, 31));
    }

    #[test]
    fn test_advance() {
        assert_eq!(advance(d(2022, 12, 31), TimeUnit::Day), d(2023, 1, 1));
        assert_eq!(advance(d(2022, 11, 28), TimeUnit::Week), d(2022, 12, 5));
        assert_eq!(advance(d(2022, 11, 1), TimeUnit::Month), d(2022, 12, 1));
        assert_eq!(advance(d(2022, 12, 1), TimeUnit::Month), d(2023, 1, 1));
        assert_eq!(advance(d(2022, 10, 1), TimeUnit::Quarter), d(2023, 1, 1));
        assert_eq!(advance(d(2022, 1, 1), TimeUnit::Year), d(2023, 1, 1));
    }

    #[test]
    fn test_same_bucket() {
        assert!(same_bucket(d(2022, 11, 28), d(2022, 12, 4), TimeUnit::Week));
        assert!(!same_bucket(d(2022, 11, 27), d(2022, 11, 28), TimeUnit::Week));
        assert!(same_bucket(d(2022, 11, 1), d(2022, 11, 30), TimeUnit::Month));
        assert!(same_bucket(d(2022, 10, 1), d(2022, 12, 31), TimeUnit::Quarter));
        assert!(!same_bucket(d(2022, 9, 30), d(2022, 10, 1), TimeUnit::Quarter));
        assert!(same_bucket(d(2022, 1, 1), d(2022, 12, 31), TimeUnit::Year));
    }

    #[test]
    fn test_ordinals() {
        assert_eq!(day_of_year(d(2022, 1, 1)), 1);
        assert_eq!(day_of_year(d(2022, 11, 29)), 333);
        assert_eq!(week_of_year(d(2022, 11, 29)), 48);
        assert_eq!(week_of_year(d(2022, 12, 5)), 49);
    }
}
