use std::collections::HashSet;
use std::sync::Arc;

use crate::aggregation::MetricLookup;
use crate::error::{Error, Result};
use crate::metrics::MetricDefinition;

/// Walks the metric dependency graph breadth-first, starting from the
/// metrics referenced by a pipeline execution and following `output_metrics`
/// edges layer by layer. A metric id reached twice aborts the walk: the
/// graph must be a DAG, and a metric may contribute to a run only once.
///
/// State is per aggregation run; create a fresh resolver per invocation.
pub struct MetricGraphResolver {
    lookup: Arc<dyn MetricLookup>,
    visited: HashSet<String>,
}

impl MetricGraphResolver {
    pub fn new(lookup: Arc<dyn MetricLookup>) -> Self {
        Self {
            lookup,
            visited: HashSet::new(),
        }
    }

    /// Resolve the referenced metrics and their transitive parents into
    /// processing layers: `layers[0]` are the pipeline-fed metrics, each
    /// following layer holds the parents of the previous one. A metric's
    /// rollup must complete before its parents run, so callers process the
    /// layers in order.
    pub async fn resolve(
        &mut self,
        names: &[String],
        group_context_id: &str,
    ) -> Result<Vec<Vec<MetricDefinition>>> {
        let mut current = Vec::new();
        for name in dedup(names.iter()) {
            let metric = self.fetch(&name, group_context_id).await?;
            self.visited.insert(metric.id.clone());
            current.push(metric);
        }

        let mut layers = Vec::new();
        while !current.is_empty() {
            let parent_names = dedup(current.iter().flat_map(|m| m.output_metrics.iter()));
            log::debug!(
                "resolver: layer {} resolved ({} metric(s)), {} parent name(s) to follow",
                layers.len(),
                current.len(),
                parent_names.len()
            );

            let mut next = Vec::new();
            for name in parent_names {
                let metric = self.fetch(&name, group_context_id).await?;
                if !self.visited.insert(metric.id.clone()) {
                    return Err(Error::CircularDependency(metric.id));
                }
                next.push(metric);
            }
            layers.push(current);
            current = next;
        }
        Ok(layers)
    }

    async fn fetch(&self, name: &str, group_context_id: &str) -> Result<MetricDefinition> {
        self.lookup
            .get_by_name(name, group_context_id)
            .await?
            .ok_or_else(|| Error::MetricNotFound(name.to_string()))
    }
}

fn dedup<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        if !out.iter().any(|n| n == name) {
            out.push(name.clone());
        }
    }
    out
}
