use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::aggregation::{ActivityStore, MetricLookup, MetricValueStore};
use crate::error::{Error, Result};
use crate::metrics::{
    ActivityRecord, AffectedTimeRange, AggregationResult, GroupMetrics, InputPipeline,
    MetricDefinition, MetricValueEntry, TimeUnit,
};
use crate::storage::Database;

/// A metric definition as submitted by the user; the id is assigned on
/// insert.
#[derive(Debug, Clone)]
pub struct NewMetric {
    pub name: String,
    pub summary: Option<String>,
    pub input_pipelines: Vec<InputPipeline>,
    pub input_metrics: Vec<String>,
    pub output_metrics: Vec<String>,
}

/// Row counts and last aggregation time, for `metricdw status`.
#[derive(Debug, Clone, Serialize)]
pub struct WarehouseStatus {
    pub metric_definitions: i64,
    pub activities: i64,
    pub activity_values: i64,
    pub metric_values: i64,
    pub last_aggregation: Option<String>,
}

// ── Metric definitions ─────────────────────────────────────────────

pub fn insert_metric_definition(
    conn: &Connection,
    new: &NewMetric,
) -> std::result::Result<MetricDefinition, rusqlite::Error> {
    conn.execute(
        "INSERT INTO metric_definition (metric_id, name, summary, input_pipelines, input_metrics, output_metrics)
         VALUES ('', ?1, ?2, ?3, ?4, ?5)",
        params![
            new.name,
            new.summary,
            to_json(&new.input_pipelines)?,
            to_json(&new.input_metrics)?,
            to_json(&new.output_metrics)?,
        ],
    )?;
    let rowid = conn.last_insert_rowid();
    let metric_id = format!("m-{rowid:06}");
    conn.execute(
        "UPDATE metric_definition SET metric_id = ?1 WHERE rowid = ?2",
        params![metric_id, rowid],
    )?;
    Ok(MetricDefinition {
        id: metric_id,
        name: new.name.clone(),
        summary: new.summary.clone(),
        input_pipelines: new.input_pipelines.clone(),
        input_metrics: new.input_metrics.clone(),
        output_metrics: new.output_metrics.clone(),
        version: 1,
    })
}

pub fn get_metric_by_name(
    conn: &Connection,
    name: &str,
) -> std::result::Result<Option<MetricDefinition>, rusqlite::Error> {
    conn.query_row(
        "SELECT metric_id, name, summary, input_pipelines, input_metrics, output_metrics, version
         FROM metric_definition WHERE name = ?1",
        params![name],
        metric_from_row,
    )
    .optional()
}

pub fn list_metric_definitions(
    conn: &Connection,
) -> std::result::Result<Vec<MetricDefinition>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT metric_id, name, summary, input_pipelines, input_metrics, output_metrics, version
         FROM metric_definition ORDER BY name",
    )?;
    let rows = stmt.query_map([], metric_from_row)?;
    rows.collect()
}

fn metric_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<MetricDefinition, rusqlite::Error> {
    Ok(MetricDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        summary: row.get(2)?,
        input_pipelines: from_json(3, &row.get::<_, String>(3)?)?,
        input_metrics: from_json(4, &row.get::<_, String>(4)?)?,
        output_metrics: from_json(5, &row.get::<_, String>(5)?)?,
        version: row.get(6)?,
    })
}

// ── Activities ─────────────────────────────────────────────────────

/// Store one activity record: find-or-create the activity row for the
/// (group, pipeline, day), then append a value row per output column.
/// Newer value rows win during aggregation.
pub fn record_activity(
    conn: &Connection,
    record: &ActivityRecord,
) -> std::result::Result<(), rusqlite::Error> {
    let date = record.date.format("%Y-%m-%d").to_string();
    conn.execute(
        "INSERT INTO activity (group_id, pipeline_id, date)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(group_id, pipeline_id, date, type) DO NOTHING",
        params![record.group_id, record.pipeline_id, date],
    )?;
    let activity_id: i64 = conn.query_row(
        "SELECT activity_id FROM activity
         WHERE group_id = ?1 AND pipeline_id = ?2 AND date = ?3 AND type = 'raw'",
        params![record.group_id, record.pipeline_id, date],
        |row| row.get(0),
    )?;
    for (name, val) in &record.outputs {
        conn.execute(
            "INSERT INTO activity_number_value (activity_id, name, execution_id, val)
             VALUES (?1, ?2, ?3, ?4)",
            params![activity_id, name, record.execution_id, val],
        )?;
    }
    Ok(())
}

/// Min/max activity date attributed to one execution's value rows.
pub fn affected_time_range(
    conn: &Connection,
    execution_id: &str,
) -> std::result::Result<Option<(NaiveDate, NaiveDate)>, rusqlite::Error> {
    let (min, max): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(a.date), MAX(a.date)
         FROM activity a
         JOIN (SELECT DISTINCT activity_id FROM activity_number_value WHERE execution_id = ?1) v
           ON v.activity_id = a.activity_id
         WHERE a.type = 'raw'",
        params![execution_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    match (min, max) {
        (Some(min), Some(max)) => Ok(Some((parse_date(0, &min)?, parse_date(1, &max)?))),
        _ => Ok(None),
    }
}

/// Per-day sums of the latest value row per (activity, output column) for
/// the given pipeline outputs in one group.
pub fn aggregate_pipeline_output(
    conn: &Connection,
    group_id: &str,
    pipelines: &[InputPipeline],
    from: &str,
    to: &str,
) -> std::result::Result<Vec<AggregationResult>, rusqlite::Error> {
    if pipelines.is_empty() {
        return Ok(Vec::new());
    }

    let filter = pipelines
        .iter()
        .map(|_| "(a2.pipeline_id = ? AND v2.name = ?)")
        .collect::<Vec<_>>()
        .join(" OR ");
    let sql = format!(
        "SELECT a.date, SUM(v.val)
         FROM activity a
         JOIN activity_number_value v ON v.activity_id = a.activity_id
         JOIN (
             SELECT v2.activity_id, v2.name, MAX(v2.value_id) AS latest_value_id
             FROM activity a2
             JOIN activity_number_value v2 ON v2.activity_id = a2.activity_id
             WHERE a2.group_id = ? AND ({filter})
             GROUP BY v2.activity_id, v2.name
         ) latest ON latest.activity_id = v.activity_id
                 AND latest.name = v.name
                 AND latest.latest_value_id = v.value_id
         WHERE a.type = 'raw' AND a.date >= ? AND a.date <= ?
         GROUP BY a.date
         ORDER BY a.date"
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut idx = 1;
    stmt.raw_bind_parameter(idx, group_id)?;
    idx += 1;
    for pipeline in pipelines {
        stmt.raw_bind_parameter(idx, &pipeline.pipeline_id)?;
        stmt.raw_bind_parameter(idx + 1, &pipeline.output)?;
        idx += 2;
    }
    stmt.raw_bind_parameter(idx, from)?;
    stmt.raw_bind_parameter(idx + 1, to)?;

    let mut aggregates = Vec::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let date: String = row.get(0)?;
        let value: Option<f64> = row.get(1)?;
        aggregates.push(AggregationResult {
            date: parse_date(0, &date)?,
            group_value: value.unwrap_or(0.0),
        });
    }
    Ok(aggregates)
}

// ── Metric values ──────────────────────────────────────────────────

pub fn upsert_metric_value(
    conn: &Connection,
    metric_id: &str,
    group_id: &str,
    pipeline_id: &str,
    execution_id: &str,
    entry: &MetricValueEntry,
) -> std::result::Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO metric_value (
            metric_id, group_id, time_unit, date, name, year,
            day, week, month, quarter, group_value, sub_groups_value,
            version, pipeline_id, execution_id, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, datetime('now'))
        ON CONFLICT(metric_id, group_id, time_unit, date) DO UPDATE SET
            name=excluded.name, year=excluded.year, day=excluded.day,
            week=excluded.week, month=excluded.month, quarter=excluded.quarter,
            group_value=excluded.group_value, sub_groups_value=excluded.sub_groups_value,
            version=excluded.version, pipeline_id=excluded.pipeline_id,
            execution_id=excluded.execution_id, updated_at=excluded.updated_at",
        params![
            metric_id,
            group_id,
            entry.time_unit.as_str(),
            entry.date.format("%Y-%m-%d").to_string(),
            entry.name,
            entry.year,
            entry.day,
            entry.week,
            entry.month,
            entry.quarter,
            entry.group_value,
            entry.sub_groups_value,
            entry.version,
            pipeline_id,
            execution_id,
        ],
    )?;
    Ok(())
}

pub fn list_metric_values(
    conn: &Connection,
    metric_id: &str,
    group_id: &str,
    time_unit: TimeUnit,
    from: &str,
    to: &str,
) -> std::result::Result<Vec<MetricValueEntry>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT date, metric_id, name, year, day, week, month, quarter,
                group_value, sub_groups_value, version
         FROM metric_value
         WHERE metric_id = ?1 AND group_id = ?2 AND time_unit = ?3
           AND date >= ?4 AND date <= ?5
         ORDER BY date",
    )?;
    let rows = stmt.query_map(
        params![metric_id, group_id, time_unit.as_str(), from, to],
        |row| {
            let date: String = row.get(0)?;
            Ok(MetricValueEntry {
                date: parse_date(0, &date)?,
                metric_id: row.get(1)?,
                name: row.get(2)?,
                time_unit,
                year: row.get(3)?,
                day: row.get(4)?,
                week: row.get(5)?,
                month: row.get(6)?,
                quarter: row.get(7)?,
                group_value: row.get(8)?,
                sub_groups_value: row.get(9)?,
                version: row.get(10)?,
            })
        },
    )?;
    rows.collect()
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> std::result::Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> std::result::Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

// ── Status ─────────────────────────────────────────────────────────

pub fn warehouse_status(conn: &Connection) -> std::result::Result<WarehouseStatus, rusqlite::Error> {
    let metric_definitions: i64 =
        conn.query_row("SELECT COUNT(*) FROM metric_definition", [], |row| row.get(0))?;
    let activities: i64 = conn.query_row("SELECT COUNT(*) FROM activity", [], |row| row.get(0))?;
    let activity_values: i64 =
        conn.query_row("SELECT COUNT(*) FROM activity_number_value", [], |row| row.get(0))?;
    let metric_values: i64 =
        conn.query_row("SELECT COUNT(*) FROM metric_value", [], |row| row.get(0))?;
    let last_aggregation: Option<String> = conn
        .query_row("SELECT MAX(updated_at) FROM metric_value", [], |row| row.get(0))
        .ok()
        .flatten();
    Ok(WarehouseStatus {
        metric_definitions,
        activities,
        activity_values,
        metric_values,
        last_aggregation,
    })
}

// ── Helpers ────────────────────────────────────────────────────────

fn to_json<T: serde::Serialize>(value: &T) -> std::result::Result<String, rusqlite::Error> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: &str,
) -> std::result::Result<T, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_date(idx: usize, raw: &str) -> std::result::Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ── Collaborator trait implementations ─────────────────────────────

#[async_trait]
impl MetricLookup for Database {
    async fn get_by_name(
        &self,
        name: &str,
        _group_context_id: &str,
    ) -> Result<Option<MetricDefinition>> {
        let name = name.to_string();
        Ok(self
            .reader()
            .call(move |conn| get_metric_by_name(conn, &name))
            .await?)
    }
}

#[async_trait]
impl ActivityStore for Database {
    async fn affected_time_range(
        &self,
        pipeline_id: &str,
        execution_id: &str,
    ) -> Result<AffectedTimeRange> {
        let execution = execution_id.to_string();
        let range = self
            .reader()
            .call(move |conn| affected_time_range(conn, &execution))
            .await?;
        match range {
            Some((from, to)) => Ok(AffectedTimeRange::new(from, to)),
            None => Err(Error::NotFound(format!(
                "no activity data found for pipeline '{pipeline_id}', execution '{execution_id}'"
            ))),
        }
    }

    async fn aggregate_pipeline_output(
        &self,
        group_id: &str,
        pipelines: &[InputPipeline],
        range: &AffectedTimeRange,
    ) -> Result<Vec<AggregationResult>> {
        let group_id = group_id.to_string();
        let pipelines = pipelines.to_vec();
        let from = range.from.format("%Y-%m-%d").to_string();
        let to = range.to.format("%Y-%m-%d").to_string();
        Ok(self
            .reader()
            .call(move |conn| aggregate_pipeline_output(conn, &group_id, &pipelines, &from, &to))
            .await?)
    }
}

#[async_trait]
impl MetricValueStore for Database {
    async fn list_collection_metrics(
        &self,
        metric_id: &str,
        group_id: &str,
        time_unit: TimeUnit,
        range: &AffectedTimeRange,
    ) -> Result<Vec<MetricValueEntry>> {
        let metric_id = metric_id.to_string();
        let group_id = group_id.to_string();
        let from = range.from.format("%Y-%m-%d").to_string();
        let to = range.to.format("%Y-%m-%d").to_string();
        Ok(self
            .reader()
            .call(move |conn| {
                list_metric_values(conn, &metric_id, &group_id, time_unit, &from, &to)
            })
            .await?)
    }

    async fn save_metrics(
        &self,
        metric_id: &str,
        pipeline_id: &str,
        execution_id: &str,
        group_metrics: &GroupMetrics,
    ) -> Result<()> {
        let metric_id = metric_id.to_string();
        let pipeline_id = pipeline_id.to_string();
        let execution_id = execution_id.to_string();
        let group_metrics = group_metrics.clone();
        self.writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (group_id, units) in group_metrics.iter() {
                    for entries in units.values() {
                        for entry in entries {
                            upsert_metric_value(
                                &tx,
                                &metric_id,
                                group_id,
                                &pipeline_id,
                                &execution_id,
                                entry,
                            )?;
                        }
                    }
                }
                tx.commit()?;
                Ok::<(), rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn new_metric(name: &str) -> NewMetric {
        NewMetric {
            name: name.to_string(),
            summary: Some("test metric".to_string()),
            input_pipelines: vec![InputPipeline {
                pipeline_id: "pipe1".to_string(),
                output: "co2e".to_string(),
            }],
            input_metrics: vec!["child".to_string()],
            output_metrics: vec!["parent".to_string()],
        }
    }

    fn record(
        group_id: &str,
        execution_id: &str,
        date: NaiveDate,
        outputs: &[(&str, f64)],
    ) -> ActivityRecord {
        ActivityRecord {
            group_id: group_id.to_string(),
            pipeline_id: "pipe1".to_string(),
            execution_id: execution_id.to_string(),
            date,
            outputs: outputs
                .iter()
                .map(|(name, val)| (name.to_string(), *val))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn metric_definition_round_trip() {
        let db = Database::open_memory().await.unwrap();
        let created = db
            .writer()
            .call(|conn| insert_metric_definition(conn, &new_metric("ghg")))
            .await
            .unwrap();
        assert_eq!(created.id, "m-000001");

        let fetched = db
            .reader()
            .call(|conn| get_metric_by_name(conn, "ghg"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, created);

        let missing = db
            .reader()
            .call(|conn| get_metric_by_name(conn, "nope"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn aggregate_uses_latest_value_per_output() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                record_activity(conn, &record("/a", "exec1", d(2023, 6, 10), &[("co2e", 10.0)]))?;
                record_activity(conn, &record("/a", "exec1", d(2023, 6, 11), &[("co2e", 20.0)]))?;
                // exec2 reprocesses 06-10: its value replaces exec1's
                record_activity(conn, &record("/a", "exec2", d(2023, 6, 10), &[("co2e", 99.0)]))?;
                // different output column, ignored by the filter below
                record_activity(conn, &record("/a", "exec2", d(2023, 6, 10), &[("other", 5.0)]))?;
                // different group, ignored
                record_activity(conn, &record("/b", "exec1", d(2023, 6, 10), &[("co2e", 7.0)]))?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        let pipelines = vec![InputPipeline {
            pipeline_id: "pipe1".to_string(),
            output: "co2e".to_string(),
        }];
        let aggregates = db
            .reader()
            .call(move |conn| {
                aggregate_pipeline_output(conn, "/a", &pipelines, "2023-06-01", "2023-06-30")
            })
            .await
            .unwrap();

        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[0].date, d(2023, 6, 10));
        assert_eq!(aggregates[0].group_value, 99.0);
        assert_eq!(aggregates[1].date, d(2023, 6, 11));
        assert_eq!(aggregates[1].group_value, 20.0);
    }

    #[tokio::test]
    async fn affected_time_range_spans_executions_values() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                record_activity(conn, &record("/a", "exec1", d(2023, 6, 10), &[("co2e", 1.0)]))?;
                record_activity(conn, &record("/a", "exec1", d(2023, 6, 12), &[("co2e", 2.0)]))?;
                record_activity(conn, &record("/a", "exec2", d(2023, 7, 1), &[("co2e", 3.0)]))?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        let range = ActivityStore::affected_time_range(&db, "pipe1", "exec1")
            .await
            .unwrap();
        assert_eq!(range.from, d(2023, 6, 10));
        assert_eq!(range.to, d(2023, 6, 12));

        let err = ActivityStore::affected_time_range(&db, "pipe1", "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn metric_values_upsert_and_list() {
        let db = Database::open_memory().await.unwrap();
        let mut entry =
            MetricValueEntry::placeholder(d(2023, 6, 10), TimeUnit::Day, "m-000001", "ghg");
        entry.group_value = 10.0;

        let mut gm = GroupMetrics::new();
        gm.insert_series("/a", TimeUnit::Day, vec![entry.clone()]);
        MetricValueStore::save_metrics(&db, "m-000001", "pipe1", "exec1", &gm)
            .await
            .unwrap();

        let range = AffectedTimeRange::new(d(2023, 6, 1), d(2023, 6, 30));
        let listed = db
            .list_collection_metrics("m-000001", "/a", TimeUnit::Day, &range)
            .await
            .unwrap();
        assert_eq!(listed, vec![entry.clone()]);

        // Upsert replaces the bucket in place.
        entry.group_value = 25.0;
        entry.version = 2;
        let mut gm = GroupMetrics::new();
        gm.insert_series("/a", TimeUnit::Day, vec![entry.clone()]);
        MetricValueStore::save_metrics(&db, "m-000001", "pipe1", "exec2", &gm)
            .await
            .unwrap();

        let listed = db
            .list_collection_metrics("m-000001", "/a", TimeUnit::Day, &range)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].group_value, 25.0);
        assert_eq!(listed[0].version, 2);
    }
}
