//! # Analysis Run Model
//!
//! Domain-level record of one item's analysis: which sub-units were
//! requested and which have completed, in order. A crash mid-item resumes
//! from `incomplete_units()` rather than restarting the whole item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::error::{AnalystError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AnalysisRun {
    pub run_id: i64,
    pub item_id: i64,
    /// JSON array of sub-unit labels, in processing order
    pub requested_units: String,
    /// JSON array of sub-unit labels already completed
    pub completed_units: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisRun {
    pub fn requested(&self) -> Result<Vec<String>> {
        decode_units(self.run_id, "requested_units", &self.requested_units)
    }

    pub fn completed(&self) -> Result<Vec<String>> {
        decode_units(self.run_id, "completed_units", &self.completed_units)
    }

    /// Requested sub-units not yet completed, preserving request order
    pub fn incomplete_units(&self) -> Result<Vec<String>> {
        let completed = self.completed()?;
        Ok(self
            .requested()?
            .into_iter()
            .filter(|unit| !completed.contains(unit))
            .collect())
    }

    pub async fn find_by_id(pool: &SqlitePool, run_id: i64) -> Result<Option<AnalysisRun>> {
        let run = sqlx::query_as::<_, AnalysisRun>("SELECT * FROM analysis_runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(pool)
            .await?;
        Ok(run)
    }

    pub async fn find_for_item(pool: &SqlitePool, item_id: i64) -> Result<Option<AnalysisRun>> {
        let run = sqlx::query_as::<_, AnalysisRun>(
            "SELECT * FROM analysis_runs WHERE item_id = ?1 ORDER BY run_id DESC LIMIT 1",
        )
        .bind(item_id)
        .fetch_optional(pool)
        .await?;
        Ok(run)
    }
}

fn decode_units(run_id: i64, column: &str, raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| {
        AnalystError::DatabaseError(format!(
            "Corrupt {column} JSON for run {run_id}: {e}"
        ))
    })
}
