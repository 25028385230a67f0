//! # Failure Classification
//!
//! The seam between transient infrastructure failure (retry) and
//! content/limit failure (do not retry, or do not retry with the same
//! credential). Classification is a strategy, not hard-coded: the domain
//! callback's error reporting quality varies by provider, so deployments
//! can swap in their own mapping.

use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisError;

/// How a failed call should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient; retry with backoff up to the configured bound
    Retryable,
    /// The credential hit its quota or a rate ceiling; bench it and try
    /// another credential rather than burning a retry
    QuotaExhausted,
    /// The request is unsatisfiable regardless of retries
    Permanent,
}

pub trait FailureClassifier: Send + Sync {
    fn classify(&self, error: &AnalysisError) -> FailureKind;
}

/// Default classification: trust the typed variant first, fall back to
/// message heuristics for errors the callback could not classify itself.
/// Unknown errors are treated as retryable (bounded), never permanent, so a
/// misreported transient failure cannot silently drop an item.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardFailureClassifier;

impl StandardFailureClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl FailureClassifier for StandardFailureClassifier {
    fn classify(&self, error: &AnalysisError) -> FailureKind {
        match error {
            AnalysisError::QuotaExceeded(_) => FailureKind::QuotaExhausted,
            AnalysisError::Transient(_) => FailureKind::Retryable,
            AnalysisError::InvalidRequest(_) => FailureKind::Permanent,
            AnalysisError::Other(message) => classify_message(message),
        }
    }
}

fn classify_message(message: &str) -> FailureKind {
    let lowered = message.to_lowercase();
    if lowered.contains("quota")
        || lowered.contains("rate limit")
        || lowered.contains("resource exhausted")
        || lowered.contains("429")
    {
        FailureKind::QuotaExhausted
    } else if lowered.contains("invalid request")
        || lowered.contains("not found")
        || lowered.contains("400")
        || lowered.contains("404")
    {
        FailureKind::Permanent
    } else {
        FailureKind::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_variants_win() {
        let classifier = StandardFailureClassifier::new();
        assert_eq!(
            classifier.classify(&AnalysisError::QuotaExceeded("daily cap".into())),
            FailureKind::QuotaExhausted
        );
        assert_eq!(
            classifier.classify(&AnalysisError::Transient("reset by peer".into())),
            FailureKind::Retryable
        );
        assert_eq!(
            classifier.classify(&AnalysisError::InvalidRequest("empty prompt".into())),
            FailureKind::Permanent
        );
    }

    #[test]
    fn test_message_heuristics() {
        let classifier = StandardFailureClassifier::new();
        assert_eq!(
            classifier.classify(&AnalysisError::Other("HTTP 429 Too Many Requests".into())),
            FailureKind::QuotaExhausted
        );
        assert_eq!(
            classifier.classify(&AnalysisError::Other("model not found".into())),
            FailureKind::Permanent
        );
        // Unknowns stay retryable so misclassification cannot drop an item
        assert_eq!(
            classifier.classify(&AnalysisError::Other("something odd".into())),
            FailureKind::Retryable
        );
    }
}
