//! Metric definitions for experiment criteria
//!
//! Before routing changes, the definitions of every metric named in
//! `spec.criteria` are copied into `status.metrics` so the analytics service
//! sees exactly what the experiment was judged on.

use crate::crd::experiment::{Criterion, MetricDefinition};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("unknown metric {0}")]
    UnknownMetric(String),

    #[error("failed to read metric definitions from {path}: {reason}")]
    Load { path: String, reason: String },
}

#[async_trait]
pub trait MetricsReader: Send + Sync {
    /// Definitions for every metric the criteria reference
    async fn read_metrics(
        &self,
        criteria: &[Criterion],
    ) -> Result<BTreeMap<String, MetricDefinition>, MetricsError>;
}

/// Definitions held in memory, optionally loaded from a JSON file
/// (`{"<metric>": {"queryTemplate": ..., "isCounter": ...}}`)
#[derive(Debug, Default, Clone)]
pub struct StaticMetricsReader {
    definitions: BTreeMap<String, MetricDefinition>,
}

impl StaticMetricsReader {
    pub fn new(definitions: BTreeMap<String, MetricDefinition>) -> Self {
        Self { definitions }
    }

    pub fn from_file(path: &Path) -> Result<Self, MetricsError> {
        let load_err = |reason: String| MetricsError::Load {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let definitions = serde_json::from_str(&raw).map_err(|e| load_err(e.to_string()))?;
        Ok(Self { definitions })
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[async_trait]
impl MetricsReader for StaticMetricsReader {
    async fn read_metrics(
        &self,
        criteria: &[Criterion],
    ) -> Result<BTreeMap<String, MetricDefinition>, MetricsError> {
        criteria
            .iter()
            .map(|c| {
                self.definitions
                    .get(&c.metric)
                    .map(|d| (c.metric.clone(), d.clone()))
                    .ok_or_else(|| MetricsError::UnknownMetric(c.metric.clone()))
            })
            .collect()
    }
}
