use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::date_util;
use crate::error::Error;

/// Granularity of a metric value series. The ordering is the rollup order:
/// finer units fold into coarser ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeUnit {
    pub const ALL: [TimeUnit; 5] = [
        TimeUnit::Day,
        TimeUnit::Week,
        TimeUnit::Month,
        TimeUnit::Quarter,
        TimeUnit::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Quarter => "quarter",
            TimeUnit::Year => "year",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(TimeUnit::Day),
            "week" => Ok(TimeUnit::Week),
            "month" => Ok(TimeUnit::Month),
            "quarter" => Ok(TimeUnit::Quarter),
            "year" => Ok(TimeUnit::Year),
            other => Err(Error::PeriodParse(format!("unrecognized time unit: {other}"))),
        }
    }
}

/// An inclusive date range touched by a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedTimeRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl AffectedTimeRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }

    /// The range extended to whole calendar months. Week and month rollups
    /// need the full month(s) of day metrics, not just the touched days.
    pub fn month_aligned(&self) -> Self {
        self.unit_aligned(TimeUnit::Month)
    }

    /// The range extended to whole buckets of the given unit.
    pub fn unit_aligned(&self, unit: TimeUnit) -> Self {
        Self {
            from: date_util::start_of(self.from, unit),
            to: date_util::end_of(self.to, unit),
        }
    }
}

/// One bucket of a metric's value series for a single group.
///
/// `group_value` is the contribution of entities directly in the group;
/// `sub_groups_value` is the contribution rolled up from descendant groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValueEntry {
    pub date: NaiveDate,
    pub metric_id: String,
    pub name: String,
    pub time_unit: TimeUnit,
    pub year: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub week: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarter: Option<u32>,
    pub group_value: f64,
    pub sub_groups_value: f64,
    pub version: u32,
}

impl MetricValueEntry {
    /// A zero-valued placeholder for a bucket with no recorded activity.
    pub fn placeholder(date: NaiveDate, unit: TimeUnit, metric_id: &str, name: &str) -> Self {
        let (day, week, month, quarter) = ordinal_fields(date, unit);
        Self {
            date,
            metric_id: metric_id.to_string(),
            name: name.to_string(),
            time_unit: unit,
            year: date.year(),
            day,
            week,
            month,
            quarter,
            group_value: 0.0,
            sub_groups_value: 0.0,
            version: 1,
        }
    }

    /// Combined value of the group and its descendants.
    pub fn effective_value(&self) -> f64 {
        self.group_value + self.sub_groups_value
    }
}

/// The ordinal field matching the entry's own unit; the others stay unset.
pub fn ordinal_fields(
    date: NaiveDate,
    unit: TimeUnit,
) -> (Option<u32>, Option<u32>, Option<u32>, Option<u32>) {
    match unit {
        TimeUnit::Day => (Some(date_util::day_of_year(date)), None, None, None),
        TimeUnit::Week => (None, Some(date_util::week_of_year(date)), None, None),
        TimeUnit::Month => (None, None, Some(date.month()), None),
        TimeUnit::Quarter => (None, None, None, Some(date_util::quarter_of(date))),
        TimeUnit::Year => (None, None, None, None),
    }
}

/// Per-unit value series for every group in a hierarchy, keyed by group id.
/// Hierarchy order is always carried separately as an ordered list; this map
/// only stores the computed series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupMetrics {
    groups: BTreeMap<String, BTreeMap<TimeUnit, Vec<MetricValueEntry>>>,
}

impl GroupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_series(&mut self, group_id: &str, unit: TimeUnit, entries: Vec<MetricValueEntry>) {
        self.groups
            .entry(group_id.to_string())
            .or_default()
            .insert(unit, entries);
    }

    pub fn series(&self, group_id: &str, unit: TimeUnit) -> Option<&[MetricValueEntry]> {
        self.groups
            .get(group_id)
            .and_then(|units| units.get(&unit))
            .map(Vec::as_slice)
    }

    pub fn series_mut(&mut self, group_id: &str, unit: TimeUnit) -> Option<&mut Vec<MetricValueEntry>> {
        self.groups.get_mut(group_id).and_then(|units| units.get_mut(&unit))
    }

    pub fn group_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&str, &BTreeMap<TimeUnit, Vec<MetricValueEntry>>)> {
        self.groups.iter().map(|(g, units)| (g.as_str(), units))
    }
}

/// A pipeline transform output column feeding a metric directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPipeline {
    pub pipeline_id: String,
    pub output: String,
}

/// A metric definition. `input_metrics`/`output_metrics` are the edges of
/// the metric dependency DAG (names, resolved to ids at aggregation time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub input_pipelines: Vec<InputPipeline>,
    #[serde(default)]
    pub input_metrics: Vec<String>,
    #[serde(default)]
    pub output_metrics: Vec<String>,
    pub version: u32,
}

/// A per-day aggregate of pipeline output (or of input metrics) for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    pub date: NaiveDate,
    pub group_value: f64,
}

/// The event handed to the aggregation task when a pipeline execution
/// finishes. Mirrors the upstream workflow payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationTaskEvent {
    pub group_context_id: String,
    pub pipeline_id: String,
    pub pipeline_execution_id: String,
    pub transformer: Transformer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformer {
    pub transforms: Vec<Transform>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub outputs: Vec<TransformOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformOutput {
    #[serde(default)]
    pub metrics: Vec<String>,
}

impl AggregationTaskEvent {
    /// Distinct metric names referenced by the execution's transform
    /// outputs, in first-seen order.
    pub fn referenced_metrics(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for transform in &self.transformer.transforms {
            for output in &transform.outputs {
                for name in &output.metrics {
                    if !seen.contains(name) {
                        seen.push(name.clone());
                    }
                }
            }
        }
        seen
    }
}

/// A raw activity record as deposited by a pipeline execution: one date,
/// one group, one value per named output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub group_id: String,
    pub pipeline_id: String,
    pub execution_id: String,
    pub date: NaiveDate,
    pub outputs: BTreeMap<String, f64>,
}
