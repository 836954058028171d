use crate::date_util;
use crate::metrics::{AffectedTimeRange, MetricDefinition, MetricValueEntry, TimeUnit};

/// Extend `series` with a zero-valued placeholder for every bucket of `unit`
/// in `range` that has no entry yet, then sort by date. Bucket membership is
/// unit-normalized (same day/week/month/quarter/year), not exact-date.
/// Re-running on a complete series is a no-op.
pub fn interpolate(
    series: &mut Vec<MetricValueEntry>,
    unit: TimeUnit,
    range: &AffectedTimeRange,
    metric: &MetricDefinition,
) {
    let mut added = 0usize;
    let mut date = range.from;
    while date <= range.to {
        if !series
            .iter()
            .any(|m| date_util::same_bucket(m.date, date, unit))
        {
            series.push(MetricValueEntry::placeholder(
                date,
                unit,
                &metric.id,
                &metric.name,
            ));
            added += 1;
        }
        date = date_util::advance(date, unit);
    }
    series.sort_by_key(|m| m.date);
    log::debug!(
        "interpolate: unit={unit}, range={}..{}, added {added} placeholder(s)",
        range.from,
        range.to
    );
}
