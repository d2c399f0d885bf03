//! Progress read model for batch introspection endpoints.

use super::batch::{BatchDefinition, BatchStatus, BatchType};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Snapshot of a batch's progress accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub pending_jobs: u32,
    pub percent_complete: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<NaiveDateTime>,
}

impl From<&BatchDefinition> for BatchProgress {
    fn from(batch: &BatchDefinition) -> Self {
        let finished = batch.completed_jobs + batch.failed_jobs;
        let pending_jobs = batch.total_jobs.saturating_sub(finished);
        let percent_complete = if batch.total_jobs == 0 {
            0.0
        } else {
            f64::from(finished) * 100.0 / f64::from(batch.total_jobs)
        };

        Self {
            batch_id: batch.id,
            batch_type: batch.batch_type,
            status: batch.status,
            total_jobs: batch.total_jobs,
            completed_jobs: batch.completed_jobs,
            failed_jobs: batch.failed_jobs,
            pending_jobs,
            percent_complete,
            name: batch.options.name.clone(),
            created: batch.created,
            completed_at: batch.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchOptions, JsonMap};

    #[test]
    fn percent_complete_counts_both_outcomes() {
        let now = chrono::NaiveDate::from_ymd_opt(2025, 2, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let batch = BatchDefinition {
            id: Uuid::new_v4(),
            batch_type: BatchType::Parallel,
            status: BatchStatus::Running,
            total_jobs: 4,
            completed_jobs: 2,
            failed_jobs: 1,
            context: JsonMap::new(),
            options: BatchOptions::default(),
            queue_name: None,
            queue_config: None,
            created: now,
            modified: now,
            completed_at: None,
            jobs: vec![],
        };

        let progress = BatchProgress::from(&batch);
        assert_eq!(progress.pending_jobs, 1);
        assert!((progress.percent_complete - 75.0).abs() < f64::EPSILON);
    }
}
