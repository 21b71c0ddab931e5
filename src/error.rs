//! Error types for the inference core.
//!
//! Anything recoverable within one inference cycle becomes a warning log and
//! an empty result; anything else propagates to the service loop, which logs
//! and moves on to the next KPI. The process never exits on a per-cycle
//! failure.

use thiserror::Error;

/// Errors raised by the inference core.
#[derive(Debug, Error)]
pub enum InferError {
    /// Malformed or incomplete event; the event is dropped and the pipeline
    /// continues.
    #[error("failed to parse event data: {0}")]
    DataParse(String),

    /// Unresolvable metric-to-entity mapping; the event is dropped.
    #[error("metadata lookup failed: {0}")]
    Metadata(String),

    /// Graph database failure beyond a missing edge collection.
    #[error("graph database error: {0}")]
    Db(String),

    /// Unsupported policy, invalid parameters, or a zero-sum transition row;
    /// the inference cycle is aborted.
    #[error("inference error: {0}")]
    Inference(String),

    /// The aggregator has no triggering KPI this poll; the caller sleeps and
    /// retries.
    #[error("no triggering kpi event available")]
    NoKpi,
}

pub type Result<T> = std::result::Result<T, InferError>;

impl InferError {
    /// True when the service loop should treat the error as routine and keep
    /// polling without logging a warning.
    pub fn is_no_kpi(&self) -> bool {
        matches!(self, InferError::NoKpi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InferError::DataParse("missing Resource.metric".to_string());
        assert!(err.to_string().contains("missing Resource.metric"));
        assert!(!err.is_no_kpi());
    }

    #[test]
    fn test_no_kpi_is_routine() {
        assert!(InferError::NoKpi.is_no_kpi());
    }
}
