//! # Analysis Seam
//!
//! The domain callback contract the scheduler drives. Prompt construction
//! and response parsing live with the collaborator implementing
//! [`Analyzer`]; the core only requires that the callback is idempotent at
//! sub-unit granularity and raises quota/limit failures distinguishably from
//! other errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::ReservedCredential;

/// One unit of batch work: a key (e.g. a ticker) plus its ordered sub-units
/// (e.g. fiscal years). Sub-units are processed in the order given and
/// resumed from the first incomplete one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub unit_key: String,
    pub sub_units: Vec<String>,
}

impl WorkUnit {
    pub fn new(unit_key: impl Into<String>, sub_units: Vec<String>) -> Self {
        Self {
            unit_key: unit_key.into(),
            sub_units,
        }
    }

    /// A unit with no further decomposition: the key is its only sub-unit
    pub fn single(unit_key: impl Into<String>) -> Self {
        let unit_key = unit_key.into();
        Self {
            sub_units: vec![unit_key.clone()],
            unit_key,
        }
    }
}

/// Result payload of one successful sub-unit analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub unit_key: String,
    pub sub_unit: String,
    pub content: serde_json::Value,
}

/// Failures the domain callback can raise. The gateway's classifier maps
/// these onto retry / bench-credential / fail-item decisions.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Provider signalled a quota or rate ceiling for this credential
    #[error("quota or rate limit reached: {0}")]
    QuotaExceeded(String),

    /// Transient infrastructure failure, safe to retry
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The request itself is unsatisfiable, retrying cannot help
    #[error("request is unsatisfiable: {0}")]
    InvalidRequest(String),

    /// Anything the callback could not classify itself
    #[error("provider failure: {0}")]
    Other(String),
}

/// Domain analysis callback, supplied per job. Must be safely retryable at
/// the sub-unit granularity.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        credential: &ReservedCredential,
        unit_key: &str,
        sub_unit: &str,
    ) -> std::result::Result<AnalysisReport, AnalysisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_unit_uses_key_as_sub_unit() {
        let unit = WorkUnit::single("AAPL");
        assert_eq!(unit.unit_key, "AAPL");
        assert_eq!(unit.sub_units, vec!["AAPL".to_string()]);
    }

    #[test]
    fn test_error_display_distinguishes_quota() {
        let quota = AnalysisError::QuotaExceeded("429".into());
        let transient = AnalysisError::Transient("connection reset".into());
        assert!(quota.to_string().contains("quota"));
        assert!(transient.to_string().contains("transient"));
    }
}
