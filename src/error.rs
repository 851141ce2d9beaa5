use thiserror::Error;

/// Structural failures surfaced to callers. Bad individual samples never end up here,
/// they are absorbed as missing values.
#[derive(Debug, Error)]
pub enum WelError {
    #[error("partition {partition} unavailable: {reason}")]
    PartitionUnavailable { partition: String, reason: String },

    #[error("failed to evaluate expression '{expression}': {reason}")]
    ExpressionEval { expression: String, reason: String },

    #[error("invalid time window: {0}")]
    InvalidWindow(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no data loaded; call ensure_coverage first")]
    NotLoaded,
}

impl WelError {
    pub fn partition(partition: impl Into<String>, reason: impl ToString) -> Self {
        WelError::PartitionUnavailable {
            partition: partition.into(),
            reason: reason.to_string(),
        }
    }

    pub fn expression(expression: impl Into<String>, reason: impl ToString) -> Self {
        WelError::ExpressionEval {
            expression: expression.into(),
            reason: reason.to_string(),
        }
    }
}

pub type WelResult<T> = std::result::Result<T, WelError>;
