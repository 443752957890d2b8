//! Error types for the indicator aggregation engine

use thiserror::Error;

use crate::types::Frequency;

/// Errors that can occur while configuring or running aggregations
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Failed to parse input record: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Indicator {indicator} is not defined for {frequency} frequency")]
    UnsupportedFrequency {
        indicator: &'static str,
        frequency: Frequency,
    },

    #[error("Failed to persist result {name}: {reason}")]
    PersistError { name: String, reason: String },
}
