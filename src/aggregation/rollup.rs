use chrono::Datelike;

use crate::date_util;
use crate::metrics::{ordinal_fields, MetricValueEntry, TimeUnit};

/// Fold a series into buckets of a coarser time unit, summing `group_value`
/// and `sub_groups_value` independently per bucket. Bucket dates are the
/// unit starts, the ordinal field of the target unit is set, and every
/// output entry gets a fresh provenance version.
pub fn roll_up_by(entries: &[MetricValueEntry], unit: TimeUnit) -> Vec<MetricValueEntry> {
    log::debug!("roll_up_by: unit={unit}, {} entries in", entries.len());

    let mut rolled: Vec<MetricValueEntry> = Vec::new();
    for current in entries {
        let bucket = date_util::start_of(current.date, unit);
        match rolled.iter_mut().find(|m| m.date == bucket) {
            Some(existing) => {
                existing.group_value += current.group_value;
                existing.sub_groups_value += current.sub_groups_value;
            }
            None => {
                let (day, week, month, quarter) = ordinal_fields(bucket, unit);
                rolled.push(MetricValueEntry {
                    date: bucket,
                    metric_id: current.metric_id.clone(),
                    name: current.name.clone(),
                    time_unit: unit,
                    year: bucket.year(),
                    day,
                    week,
                    month,
                    quarter,
                    group_value: current.group_value,
                    sub_groups_value: current.sub_groups_value,
                    version: 0,
                });
            }
        }
    }
    for m in &mut rolled {
        m.version += 1;
    }
    rolled
}
