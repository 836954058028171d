use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::aggregation::interpolate::interpolate;
use crate::aggregation::resolver::MetricGraphResolver;
use crate::aggregation::rollup::roll_up_by;
use crate::aggregation::{
    ActivityStore, AggregationReport, MetricInput, MetricLookup, MetricValueStore,
};
use crate::date_util;
use crate::error::{Error, Result};
use crate::group::explode_group_id;
use crate::metrics::{
    AffectedTimeRange, AggregationResult, AggregationTaskEvent, GroupMetrics, MetricDefinition,
    MetricValueEntry, TimeUnit,
};

/// The rollup chain, applied in order per group. Quarter and year targets
/// pull in persisted source buckets outside the execution's month range
/// before folding, since a quarter cannot be summed from one or two months.
const ROLLUP_CHAIN: [(TimeUnit, TimeUnit); 4] = [
    (TimeUnit::Day, TimeUnit::Week),
    (TimeUnit::Day, TimeUnit::Month),
    (TimeUnit::Month, TimeUnit::Quarter),
    (TimeUnit::Quarter, TimeUnit::Year),
];

/// Aggregates the metrics affected by one pipeline execution: resolves the
/// metric dependency graph, recomputes day values for every group from the
/// leaf upward, rolls them through the time units, and persists the buckets
/// the execution touched.
pub struct AggregationTaskService {
    metrics: Arc<dyn MetricLookup>,
    activities: Arc<dyn ActivityStore>,
    values: Arc<dyn MetricValueStore>,
}

impl AggregationTaskService {
    pub fn new(
        metrics: Arc<dyn MetricLookup>,
        activities: Arc<dyn ActivityStore>,
        values: Arc<dyn MetricValueStore>,
    ) -> Self {
        Self {
            metrics,
            activities,
            values,
        }
    }

    /// Run the aggregation for one pipeline execution event. Returns a
    /// summary of the metrics processed; an event referencing no metrics is
    /// a successful no-op.
    pub async fn process(&self, event: &AggregationTaskEvent) -> Result<AggregationReport> {
        log::info!(
            "aggregation: processing pipeline {} execution {} for group {}",
            event.pipeline_id,
            event.pipeline_execution_id,
            event.group_context_id
        );
        validate_not_empty(&event.group_context_id, "groupContextId")?;
        validate_not_empty(&event.pipeline_id, "pipelineId")?;
        validate_not_empty(&event.pipeline_execution_id, "pipelineExecutionId")?;

        let metric_names = event.referenced_metrics();
        if metric_names.is_empty() {
            log::info!("aggregation: no metrics referenced, nothing to do");
            return Ok(AggregationReport {
                pipeline_id: event.pipeline_id.clone(),
                pipeline_execution_id: event.pipeline_execution_id.clone(),
                metrics_processed: Vec::new(),
                time_range: None,
            });
        }

        // Resolve the whole dependency closure up front; a cyclic graph must
        // fail before any rollup work happens.
        let mut resolver = MetricGraphResolver::new(self.metrics.clone());
        let layers = resolver
            .resolve(&metric_names, &event.group_context_id)
            .await?;

        let time_range_pipeline = self
            .activities
            .affected_time_range(&event.pipeline_id, &event.pipeline_execution_id)
            .await?;
        let time_range_month = time_range_pipeline.month_aligned();

        // The group hierarchy to process, leaf first.
        let mut hierarchy = explode_group_id(&event.group_context_id);
        hierarchy.reverse();

        let mut processed = Vec::new();
        for (layer_index, layer) in layers.iter().enumerate() {
            let input = if layer_index == 0 {
                MetricInput::Pipeline
            } else {
                MetricInput::Metric
            };
            for metric in layer {
                let group_metrics = self
                    .rollup_metric(
                        &hierarchy,
                        &time_range_pipeline,
                        &time_range_month,
                        metric,
                        input,
                    )
                    .await?;
                self.values
                    .save_metrics(
                        &metric.id,
                        &event.pipeline_id,
                        &event.pipeline_execution_id,
                        &group_metrics,
                    )
                    .await?;
                processed.push(metric.name.clone());
            }
        }

        log::info!(
            "aggregation: finished, {} metric(s) persisted",
            processed.len()
        );
        Ok(AggregationReport {
            pipeline_id: event.pipeline_id.clone(),
            pipeline_execution_id: event.pipeline_execution_id.clone(),
            metrics_processed: processed,
            time_range: Some(time_range_pipeline),
        })
    }

    /// Recompute one metric over the whole group hierarchy (leaf first) and
    /// return the affected buckets per group and time unit.
    pub(crate) async fn rollup_metric(
        &self,
        hierarchy: &[String],
        time_range_pipeline: &AffectedTimeRange,
        time_range_month: &AffectedTimeRange,
        metric: &MetricDefinition,
        input: MetricInput,
    ) -> Result<GroupMetrics> {
        log::debug!(
            "rollup: metric {} ({}), groups {:?}, pipeline range {}..{}",
            metric.name,
            metric.id,
            hierarchy,
            time_range_pipeline.from,
            time_range_pipeline.to
        );

        // Input metric name -> id, resolved once per run.
        let mut input_metric_ids: HashMap<String, String> = HashMap::new();
        // Persisted day series per group, fetched once per run.
        let mut existing_day: HashMap<String, Vec<MetricValueEntry>> = HashMap::new();
        let mut group_metrics = GroupMetrics::new();

        for (group_index, group_id) in hierarchy.iter().enumerate() {
            if !existing_day.contains_key(group_id) {
                let fetched = self
                    .values
                    .list_collection_metrics(&metric.id, group_id, TimeUnit::Day, time_range_month)
                    .await?;
                existing_day.insert(group_id.clone(), fetched);
            }

            // Seed the day series: the leaf starts empty; every other group
            // starts from its child's freshly computed series, splicing the
            // child's new effective contribution into its own persisted
            // sub-group total in place of the child's old one.
            let mut day: Vec<MetricValueEntry> = if group_index == 0 {
                Vec::new()
            } else {
                let child_id = &hierarchy[group_index - 1];
                let child_existing = &existing_day[child_id];
                let own_existing = &existing_day[group_id];
                group_metrics
                    .series(child_id, TimeUnit::Day)
                    .unwrap_or(&[])
                    .iter()
                    .map(|m| {
                        let child_old = child_existing
                            .iter()
                            .find(|o| date_util::same_bucket(o.date, m.date, TimeUnit::Day))
                            .map(MetricValueEntry::effective_value)
                            .unwrap_or(0.0);
                        let own_sub = own_existing
                            .iter()
                            .find(|o| date_util::same_bucket(o.date, m.date, TimeUnit::Day))
                            .map(|o| o.sub_groups_value)
                            .unwrap_or(0.0);
                        MetricValueEntry {
                            sub_groups_value: own_sub - child_old + m.effective_value(),
                            group_value: 0.0,
                            ..m.clone()
                        }
                    })
                    .collect()
            };

            // Overlay this group's own persisted contribution.
            for existing in &existing_day[group_id] {
                if let Some(entry) = day
                    .iter_mut()
                    .find(|m| date_util::same_bucket(m.date, existing.date, TimeUnit::Day))
                {
                    entry.group_value = existing.group_value;
                }
            }

            // Values inside the execution range are about to be recomputed.
            for entry in day
                .iter_mut()
                .filter(|m| time_range_pipeline.contains(m.date))
            {
                entry.group_value = 0.0;
            }

            interpolate(&mut day, TimeUnit::Day, time_range_month, metric);

            // Recompute day values for the affected month(s): pipeline-fed
            // metrics aggregate raw pipeline output, parents sum the day
            // values of their input metrics at this group.
            let updated: Vec<AggregationResult> = match input {
                MetricInput::Pipeline => {
                    self.activities
                        .aggregate_pipeline_output(
                            group_id,
                            &metric.input_pipelines,
                            time_range_month,
                        )
                        .await?
                }
                MetricInput::Metric => {
                    self.aggregate_input_metrics(
                        metric,
                        &mut input_metric_ids,
                        group_id,
                        time_range_month,
                    )
                    .await?
                }
            };
            for update in &updated {
                if !time_range_month.contains(update.date) {
                    continue;
                }
                if let Some(entry) = day
                    .iter_mut()
                    .find(|m| date_util::same_bucket(m.date, update.date, TimeUnit::Day))
                {
                    entry.group_value = update.group_value;
                }
            }

            let mut series: BTreeMap<TimeUnit, Vec<MetricValueEntry>> = BTreeMap::new();
            series.insert(TimeUnit::Day, day);

            for (from_unit, to_unit) in ROLLUP_CHAIN {
                // Extended to whole buckets of the target unit, else a part
                // bucket would be aggregated.
                let time_range_unit = time_range_pipeline.unit_aligned(to_unit);

                let mut source = series.get(&from_unit).cloned().unwrap_or_default();
                if to_unit == TimeUnit::Quarter || to_unit == TimeUnit::Year {
                    let existing_units = self
                        .values
                        .list_collection_metrics(&metric.id, group_id, from_unit, &time_range_unit)
                        .await?;
                    for existing in existing_units {
                        if !source
                            .iter()
                            .any(|m| date_util::same_bucket(m.date, existing.date, from_unit))
                        {
                            source.push(existing);
                        }
                    }
                    interpolate(&mut source, from_unit, &time_range_unit, metric);
                }

                let to_roll: Vec<MetricValueEntry> = source
                    .into_iter()
                    .filter(|m| time_range_unit.contains(m.date))
                    .collect();
                series.insert(to_unit, roll_up_by(&to_roll, to_unit));
            }

            for (unit, entries) in series {
                group_metrics.insert_series(group_id, unit, entries);
            }
        }

        // Trim to the buckets the execution actually touched. This can only
        // happen after every group is done: parents consume their children's
        // full month-range series.
        for group_id in hierarchy {
            if let Some(day) = group_metrics.series_mut(group_id, TimeUnit::Day) {
                day.retain(|m| time_range_pipeline.contains(m.date));
            }
            for unit in [TimeUnit::Week, TimeUnit::Month, TimeUnit::Quarter] {
                let time_range_unit = time_range_pipeline.unit_aligned(unit);
                if let Some(entries) = group_metrics.series_mut(group_id, unit) {
                    entries.retain(|m| time_range_unit.contains(m.date));
                }
            }
        }

        Ok(group_metrics)
    }

    /// Sum the day-level `group_value`s of a parent metric's input metrics
    /// for one group. The inputs' sub-group values are excluded: descendant
    /// contributions are accounted for by the parent's own hierarchy walk.
    async fn aggregate_input_metrics(
        &self,
        metric: &MetricDefinition,
        input_metric_ids: &mut HashMap<String, String>,
        group_id: &str,
        time_range_month: &AffectedTimeRange,
    ) -> Result<Vec<AggregationResult>> {
        let mut inputs: Vec<MetricValueEntry> = Vec::new();
        for name in &metric.input_metrics {
            if !input_metric_ids.contains_key(name) {
                let resolved = self
                    .metrics
                    .get_by_name(name, group_id)
                    .await?
                    .ok_or_else(|| Error::MetricNotFound(name.clone()))?;
                input_metric_ids.insert(name.clone(), resolved.id);
            }
            let input_id = &input_metric_ids[name];
            inputs.extend(
                self.values
                    .list_collection_metrics(input_id, group_id, TimeUnit::Day, time_range_month)
                    .await?,
            );
        }

        let mut aggregated: Vec<AggregationResult> = Vec::new();
        for current in inputs {
            match aggregated
                .iter_mut()
                .find(|a| date_util::same_bucket(a.date, current.date, TimeUnit::Day))
            {
                Some(existing) => existing.group_value += current.group_value,
                None => aggregated.push(AggregationResult {
                    date: current.date,
                    group_value: current.group_value,
                }),
            }
        }
        Ok(aggregated)
    }
}

fn validate_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}
