//! # Work Item Model
//!
//! One unit of batch work (e.g. one ticker), decomposable into ordered
//! sub-units (e.g. fiscal years). `completed_units` / `total_units` support
//! partial resume inside a single item: a crash mid-item resumes at the next
//! incomplete sub-unit, never from scratch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::error::{AnalystError, Result};
use crate::state_machine::ItemState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkItem {
    pub item_id: i64,
    pub job_id: i64,
    pub unit_key: String,
    pub status: String,
    pub attempts: i64,
    pub run_id: Option<i64>,
    pub completed_units: i64,
    pub total_units: i64,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Parse the persisted status into the closed state enumeration
    pub fn state(&self) -> Result<ItemState> {
        self.status.parse().map_err(|_| {
            AnalystError::StateTransitionError(format!(
                "Invalid state in database for item {}: {}",
                self.item_id, self.status
            ))
        })
    }

    pub async fn find_by_id(pool: &SqlitePool, item_id: i64) -> Result<Option<WorkItem>> {
        let item = sqlx::query_as::<_, WorkItem>("SELECT * FROM work_items WHERE item_id = ?1")
            .bind(item_id)
            .fetch_optional(pool)
            .await?;
        Ok(item)
    }

    pub async fn find_by_unit_key(
        pool: &SqlitePool,
        job_id: i64,
        unit_key: &str,
    ) -> Result<Option<WorkItem>> {
        let item = sqlx::query_as::<_, WorkItem>(
            "SELECT * FROM work_items WHERE job_id = ?1 AND unit_key = ?2",
        )
        .bind(job_id)
        .bind(unit_key)
        .fetch_optional(pool)
        .await?;
        Ok(item)
    }

    pub async fn list_for_job(pool: &SqlitePool, job_id: i64) -> Result<Vec<WorkItem>> {
        let items = sqlx::query_as::<_, WorkItem>(
            "SELECT * FROM work_items WHERE job_id = ?1 ORDER BY item_id",
        )
        .bind(job_id)
        .fetch_all(pool)
        .await?;
        Ok(items)
    }

    pub async fn list_with_status(
        pool: &SqlitePool,
        job_id: i64,
        state: ItemState,
    ) -> Result<Vec<WorkItem>> {
        let items = sqlx::query_as::<_, WorkItem>(
            "SELECT * FROM work_items WHERE job_id = ?1 AND status = ?2 ORDER BY item_id",
        )
        .bind(job_id)
        .bind(state.to_string())
        .fetch_all(pool)
        .await?;
        Ok(items)
    }
}
