use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheKey;

/// Failures surfaced by the Query Executor boundary and batch loaders.
///
/// Network and timeout failures are absorbed by the coalescer (fail-open).
/// Malformed filters and response-shape mismatches indicate wiring bugs and
/// are logged loudly before the same fail-open default is applied.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("relay network error: {message}")]
    Network { message: String },
    #[error("relay query timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("query executor failed: {message}")]
    Executor { message: String },
    #[error("malformed filter: {reason}")]
    MalformedFilter { reason: String },
    #[error("batch loader returned {actual} values for {expected} keys")]
    ResponseShape { expected: usize, actual: usize },
}

impl QueryError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn executor(message: impl Into<String>) -> Self {
        Self::Executor {
            message: message.into(),
        }
    }

    pub fn malformed_filter(reason: impl Into<String>) -> Self {
        Self::MalformedFilter {
            reason: reason.into(),
        }
    }

    /// Wiring bugs rather than transient network conditions.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedFilter { .. } | Self::ResponseShape { .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("no timeline cached under `{key}`")]
    UnknownTimeline { key: CacheKey },
    #[error("malformed filter: {reason}")]
    MalformedFilter { reason: String },
}

impl CacheError {
    pub fn unknown_timeline(key: &CacheKey) -> Self {
        Self::UnknownTimeline { key: key.clone() }
    }

    pub fn malformed_filter(reason: impl Into<String>) -> Self {
        Self::MalformedFilter {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programming_errors_are_classified() {
        assert!(QueryError::malformed_filter("missing tag").is_programming_error());
        assert!(
            QueryError::ResponseShape {
                expected: 2,
                actual: 1
            }
            .is_programming_error()
        );
        assert!(!QueryError::network("connection reset").is_programming_error());
        assert!(
            !QueryError::Timeout {
                after: Duration::from_secs(1)
            }
            .is_programming_error()
        );
    }

    #[test]
    fn messages_carry_context() {
        let err = QueryError::ResponseShape {
            expected: 3,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "batch loader returned 1 values for 3 keys"
        );
    }
}
