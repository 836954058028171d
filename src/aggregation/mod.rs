pub mod interpolate;
pub mod resolver;
pub mod rollup;
pub mod task;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::metrics::{
    AffectedTimeRange, AggregationResult, GroupMetrics, InputPipeline, MetricDefinition,
    MetricValueEntry, TimeUnit,
};

/// Resolves metric definitions by name within a group context.
#[async_trait]
pub trait MetricLookup: Send + Sync {
    /// Look up a metric definition. `None` means the name is unknown; the
    /// aggregation run fails fast on it.
    async fn get_by_name(
        &self,
        name: &str,
        group_context_id: &str,
    ) -> Result<Option<MetricDefinition>>;
}

/// Read access to the raw activity values deposited by pipeline executions.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// The inclusive day range touched by one pipeline execution.
    async fn affected_time_range(
        &self,
        pipeline_id: &str,
        execution_id: &str,
    ) -> Result<AffectedTimeRange>;

    /// Per-day sums of the latest activity values for the given pipeline
    /// output columns, scoped to one group.
    async fn aggregate_pipeline_output(
        &self,
        group_id: &str,
        pipelines: &[InputPipeline],
        range: &AffectedTimeRange,
    ) -> Result<Vec<AggregationResult>>;
}

/// Read/write access to persisted metric value series.
#[async_trait]
pub trait MetricValueStore: Send + Sync {
    async fn list_collection_metrics(
        &self,
        metric_id: &str,
        group_id: &str,
        time_unit: TimeUnit,
        range: &AffectedTimeRange,
    ) -> Result<Vec<MetricValueEntry>>;

    async fn save_metrics(
        &self,
        metric_id: &str,
        pipeline_id: &str,
        execution_id: &str,
        group_metrics: &GroupMetrics,
    ) -> Result<()>;
}

/// Where a metric's day-level values come from during a rollup: straight
/// from aggregated pipeline output, or from summing its input metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricInput {
    Pipeline,
    Metric,
}

/// Summary returned after an aggregation run completes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationReport {
    pub pipeline_id: String,
    pub pipeline_execution_id: String,
    /// Metric names in processing order (referenced metrics first, then
    /// discovered parents layer by layer).
    pub metrics_processed: Vec<String>,
    pub time_range: Option<AffectedTimeRange>,
}
