pub mod aggregation;
pub mod date_util;
pub mod error;
pub mod group;
pub mod metrics;
pub mod query;
pub mod storage;

pub use aggregation::task::AggregationTaskService;
pub use aggregation::{
    ActivityStore, AggregationReport, MetricInput, MetricLookup, MetricValueStore,
};
pub use error::{Error, Result};
pub use metrics::{
    ActivityRecord, AffectedTimeRange, AggregationTaskEvent, GroupMetrics, InputPipeline,
    MetricDefinition, MetricValueEntry, TimeUnit,
};
pub use query::period::Period;
pub use storage::Database;

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::{NewMetric, WarehouseStatus};

use std::sync::Arc;

use storage::repository;

/// Main entry point for the metrics warehouse.
pub struct MetricDW {
    db: Database,
}

impl MetricDW {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    // ── Aggregation ────────────────────────────────────────────────

    /// Run metric aggregation for one pipeline execution event: resolve the
    /// affected metrics and their parents, recompute the group hierarchy
    /// rollups, and persist the touched buckets.
    pub async fn process_aggregation(
        &self,
        event: &AggregationTaskEvent,
    ) -> Result<AggregationReport> {
        let store: Arc<Database> = Arc::new(self.db.clone());
        let service = AggregationTaskService::new(store.clone(), store.clone(), store);
        service.process(event).await
    }

    // ── Metric definitions ─────────────────────────────────────────

    pub async fn define_metric(&self, new: NewMetric) -> Result<MetricDefinition> {
        if new.name.trim().is_empty() {
            return Err(Error::Validation("metric name must not be empty".into()));
        }
        let existing = self
            .db
            .reader()
            .call({
                let name = new.name.clone();
                move |conn| repository::get_metric_by_name(conn, &name)
            })
            .await?;
        if existing.is_some() {
            return Err(Error::Validation(format!(
                "metric '{}' already exists",
                new.name
            )));
        }
        Ok(self
            .db
            .writer()
            .call(move |conn| repository::insert_metric_definition(conn, &new))
            .await?)
    }

    pub async fn list_metrics(&self) -> Result<Vec<MetricDefinition>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_metric_definitions(conn))
            .await?)
    }

    // ── Activities ─────────────────────────────────────────────────

    /// Store a batch of raw activity records in one transaction. Returns
    /// the number of records stored.
    pub async fn record_activities(&self, records: Vec<ActivityRecord>) -> Result<usize> {
        let count = records.len();
        self.db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                for record in &records {
                    repository::record_activity(&tx, record)?;
                }
                tx.commit()?;
                Ok::<(), rusqlite::Error>(())
            })
            .await?;
        Ok(count)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// List persisted rollups for a metric by name.
    pub async fn list_metric_values(
        &self,
        name: &str,
        group_id: &str,
        unit: TimeUnit,
        range: &AffectedTimeRange,
    ) -> Result<Vec<MetricValueEntry>> {
        let metric = self
            .db
            .reader()
            .call({
                let name = name.to_string();
                move |conn| repository::get_metric_by_name(conn, &name)
            })
            .await?
            .ok_or_else(|| Error::MetricNotFound(name.to_string()))?;

        let group_id = group::normalize(group_id);
        let from = range.from.format("%Y-%m-%d").to_string();
        let to = range.to.format("%Y-%m-%d").to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| {
                repository::list_metric_values(conn, &metric.id, &group_id, unit, &from, &to)
            })
            .await?)
    }

    pub async fn status(&self) -> Result<WarehouseStatus> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::warehouse_status(conn))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    use crate::metrics::{Transform, TransformOutput, Transformer};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn activity(group: &str, execution: &str, date: NaiveDate, value: f64) -> ActivityRecord {
        ActivityRecord {
            group_id: group.to_string(),
            pipeline_id: "pipe1".to_string(),
            execution_id: execution.to_string(),
            date,
            outputs: BTreeMap::from([("co2e".to_string(), value)]),
        }
    }

    fn event(execution: &str) -> AggregationTaskEvent {
        AggregationTaskEvent {
            group_context_id: "/a/b".to_string(),
            pipeline_id: "pipe1".to_string(),
            pipeline_execution_id: execution.to_string(),
            transformer: Transformer {
                transforms: vec![Transform {
                    outputs: vec![TransformOutput {
                        metrics: vec!["ghg".to_string()],
                    }],
                }],
            },
        }
    }

    async fn warehouse_with_ghg_metric() -> MetricDW {
        let dw = MetricDW::new(Database::open_memory().await.unwrap());
        dw.define_metric(NewMetric {
            name: "ghg".to_string(),
            summary: None,
            input_pipelines: vec![InputPipeline {
                pipeline_id: "pipe1".to_string(),
                output: "co2e".to_string(),
            }],
            input_metrics: vec![],
            output_metrics: vec![],
        })
        .await
        .unwrap();
        dw
    }

    fn values(entries: &[MetricValueEntry]) -> Vec<(NaiveDate, f64, f64)> {
        entries
            .iter()
            .map(|m| (m.date, m.group_value, m.sub_groups_value))
            .collect()
    }

    #[tokio::test]
    async fn aggregates_an_execution_end_to_end() {
        let dw = warehouse_with_ghg_metric().await;
        dw.record_activities(vec![
            activity("/a/b", "exec1", d(2023, 6, 10), 10.0),
            activity("/a/b", "exec1", d(2023, 6, 11), 20.0),
            activity("/a/b", "exec1", d(2023, 6, 12), 30.0),
        ])
        .await
        .unwrap();

        let report = dw.process_aggregation(&event("exec1")).await.unwrap();

        assert_eq!(report.metrics_processed, vec!["ghg"]);
        assert_eq!(
            report.time_range,
            Some(AffectedTimeRange::new(d(2023, 6, 10), d(2023, 6, 12)))
        );

        // Day buckets exist only for the pipeline range, per group.
        let year = AffectedTimeRange::new(d(2023, 1, 1), d(2023, 12, 31));
        let days = dw
            .list_metric_values("ghg", "/a/b", TimeUnit::Day, &year)
            .await
            .unwrap();
        assert_eq!(
            values(&days),
            vec![
                (d(2023, 6, 10), 10.0, 0.0),
                (d(2023, 6, 11), 20.0, 0.0),
                (d(2023, 6, 12), 30.0, 0.0),
            ]
        );
        let root_days = dw
            .list_metric_values("ghg", "/", TimeUnit::Day, &year)
            .await
            .unwrap();
        assert_eq!(
            values(&root_days),
            vec![
                (d(2023, 6, 10), 0.0, 10.0),
                (d(2023, 6, 11), 0.0, 20.0),
                (d(2023, 6, 12), 0.0, 30.0),
            ]
        );

        // Weeks extended to their own boundaries: two buckets.
        let weeks = dw
            .list_metric_values("ghg", "/a/b", TimeUnit::Week, &year)
            .await
            .unwrap();
        assert_eq!(
            values(&weeks),
            vec![(d(2023, 6, 5), 30.0, 0.0), (d(2023, 6, 12), 30.0, 0.0)]
        );

        // One month, one quarter, one year bucket; nothing outside.
        let months = dw
            .list_metric_values("ghg", "/a/b", TimeUnit::Month, &year)
            .await
            .unwrap();
        assert_eq!(values(&months), vec![(d(2023, 6, 1), 60.0, 0.0)]);
        let quarters = dw
            .list_metric_values("ghg", "/a", TimeUnit::Quarter, &year)
            .await
            .unwrap();
        assert_eq!(values(&quarters), vec![(d(2023, 4, 1), 0.0, 60.0)]);
        let years = dw
            .list_metric_values("ghg", "/", TimeUnit::Year, &year)
            .await
            .unwrap();
        assert_eq!(values(&years), vec![(d(2023, 1, 1), 0.0, 60.0)]);

        // 3 day + 2 week + 1 month + 1 quarter + 1 year buckets for each of
        // the three groups in the hierarchy.
        let status = dw.status().await.unwrap();
        assert_eq!(status.metric_values, 24);
        assert_eq!(status.metric_definitions, 1);
    }

    #[tokio::test]
    async fn rerunning_the_same_execution_is_idempotent() {
        let dw = warehouse_with_ghg_metric().await;
        dw.record_activities(vec![
            activity("/a/b", "exec1", d(2023, 6, 10), 10.0),
            activity("/a/b", "exec1", d(2023, 6, 12), 30.0),
        ])
        .await
        .unwrap();

        dw.process_aggregation(&event("exec1")).await.unwrap();
        let year = AffectedTimeRange::new(d(2023, 1, 1), d(2023, 12, 31));
        let mut first = Vec::new();
        for group in ["/a/b", "/a", "/"] {
            for unit in TimeUnit::ALL {
                first.push(dw.list_metric_values("ghg", group, unit, &year).await.unwrap());
            }
        }

        dw.process_aggregation(&event("exec1")).await.unwrap();
        let mut second = Vec::new();
        for group in ["/a/b", "/a", "/"] {
            for unit in TimeUnit::ALL {
                second.push(dw.list_metric_values("ghg", group, unit, &year).await.unwrap());
            }
        }

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn later_execution_updates_existing_buckets() {
        let dw = warehouse_with_ghg_metric().await;
        dw.record_activities(vec![
            activity("/a/b", "exec1", d(2023, 6, 10), 10.0),
            activity("/a/b", "exec1", d(2023, 6, 11), 20.0),
            activity("/a/b", "exec1", d(2023, 6, 12), 30.0),
        ])
        .await
        .unwrap();
        dw.process_aggregation(&event("exec1")).await.unwrap();

        // A second execution adds activity later in the same month.
        dw.record_activities(vec![activity("/a/b", "exec2", d(2023, 6, 20), 5.0)])
            .await
            .unwrap();
        dw.process_aggregation(&event("exec2")).await.unwrap();

        let year = AffectedTimeRange::new(d(2023, 1, 1), d(2023, 12, 31));
        let days = dw
            .list_metric_values("ghg", "/a/b", TimeUnit::Day, &year)
            .await
            .unwrap();
        assert_eq!(
            values(&days),
            vec![
                (d(2023, 6, 10), 10.0, 0.0),
                (d(2023, 6, 11), 20.0, 0.0),
                (d(2023, 6, 12), 30.0, 0.0),
                (d(2023, 6, 20), 5.0, 0.0),
            ]
        );

        // The month/quarter/year buckets were recomputed over the whole
        // period, not just the new execution's days.
        let months = dw
            .list_metric_values("ghg", "/a/b", TimeUnit::Month, &year)
            .await
            .unwrap();
        assert_eq!(values(&months), vec![(d(2023, 6, 1), 65.0, 0.0)]);
        let root_months = dw
            .list_metric_values("ghg", "/", TimeUnit::Month, &year)
            .await
            .unwrap();
        assert_eq!(values(&root_months), vec![(d(2023, 6, 1), 0.0, 65.0)]);
        let quarters = dw
            .list_metric_values("ghg", "/a/b", TimeUnit::Quarter, &year)
            .await
            .unwrap();
        assert_eq!(values(&quarters), vec![(d(2023, 4, 1), 65.0, 0.0)]);
        let years = dw
            .list_metric_values("ghg", "/", TimeUnit::Year, &year)
            .await
            .unwrap();
        assert_eq!(values(&years), vec![(d(2023, 1, 1), 0.0, 65.0)]);
    }

    #[tokio::test]
    async fn parent_metric_rolls_up_from_child_metric() {
        let dw = MetricDW::new(Database::open_memory().await.unwrap());
        // "ghg" feeds into "footprint"
        dw.define_metric(NewMetric {
            name: "ghg".to_string(),
            summary: None,
            input_pipelines: vec![InputPipeline {
                pipeline_id: "pipe1".to_string(),
                output: "co2e".to_string(),
            }],
            input_metrics: vec![],
            output_metrics: vec!["footprint".to_string()],
        })
        .await
        .unwrap();
        dw.define_metric(NewMetric {
            name: "footprint".to_string(),
            summary: None,
            input_pipelines: vec![],
            input_metrics: vec!["ghg".to_string()],
            output_metrics: vec![],
        })
        .await
        .unwrap();

        dw.record_activities(vec![
            activity("/a/b", "exec1", d(2023, 6, 10), 10.0),
            activity("/a/b", "exec1", d(2023, 6, 11), 20.0),
        ])
        .await
        .unwrap();

        let report = dw.process_aggregation(&event("exec1")).await.unwrap();

        assert_eq!(report.metrics_processed, vec!["ghg", "footprint"]);

        // The parent reads back the child's just-persisted day values.
        let year = AffectedTimeRange::new(d(2023, 1, 1), d(2023, 12, 31));
        let days = dw
            .list_metric_values("footprint", "/a/b", TimeUnit::Day, &year)
            .await
            .unwrap();
        assert_eq!(
            values(&days),
            vec![(d(2023, 6, 10), 10.0, 0.0), (d(2023, 6, 11), 20.0, 0.0)]
        );
        let root_months = dw
            .list_metric_values("footprint", "/", TimeUnit::Month, &year)
            .await
            .unwrap();
        assert_eq!(values(&root_months), vec![(d(2023, 6, 1), 0.0, 30.0)]);
    }

    #[tokio::test]
    async fn duplicate_metric_name_is_rejected() {
        let dw = warehouse_with_ghg_metric().await;
        let err = dw
            .define_metric(NewMetric {
                name: "ghg".to_string(),
                summary: None,
                input_pipelines: vec![],
                input_metrics: vec![],
                output_metrics: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
