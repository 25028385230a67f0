//! # Credential Usage Ledger
//!
//! Per-credential, per-day request counts keyed by the credential's
//! fixed-length suffix (the full secret is never persisted). Advisory for
//! observability and pool hydration after restart, not authoritative
//! billing.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CredentialUsage {
    pub credential_suffix: String,
    pub usage_date: NaiveDate,
    pub requests_used: i64,
    pub updated_at: DateTime<Utc>,
}

impl CredentialUsage {
    pub async fn for_date(pool: &SqlitePool, date: NaiveDate) -> Result<Vec<CredentialUsage>> {
        let rows = sqlx::query_as::<_, CredentialUsage>(
            "SELECT * FROM credential_usage WHERE usage_date = ?1 ORDER BY credential_suffix",
        )
        .bind(date)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn find(
        pool: &SqlitePool,
        suffix: &str,
        date: NaiveDate,
    ) -> Result<Option<CredentialUsage>> {
        let row = sqlx::query_as::<_, CredentialUsage>(
            "SELECT * FROM credential_usage WHERE credential_suffix = ?1 AND usage_date = ?2",
        )
        .bind(suffix)
        .bind(date)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }
}
