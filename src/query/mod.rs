//! Query Executor collaborator.
//!
//! The relay wire protocol lives outside this crate. Everything here talks to
//! it through [`QueryExecutor`], which is handed filters and a hard deadline
//! and returns whatever records the relays produced.

mod filter;
mod record;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::lock::{rw_read, rw_write};
use crate::error::QueryError;

pub use filter::Filter;
pub use record::{EntityId, Record};

const SOURCE: &str = "query";

/// Per-call options passed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Hard deadline for the network call.
    pub timeout: Duration,
}

/// Issues filter queries against the relay network.
///
/// Implementations may return partial, reordered or duplicated records.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn query(
        &self,
        filters: &[Filter],
        options: QueryOptions,
    ) -> Result<Vec<Record>, QueryError>;
}

/// Run `executor.query` and convert an elapsed deadline into
/// [`QueryError::Timeout`].
pub async fn query_with_deadline(
    executor: &dyn QueryExecutor,
    filters: &[Filter],
    options: QueryOptions,
) -> Result<Vec<Record>, QueryError> {
    match tokio::time::timeout(options.timeout, executor.query(filters, options)).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout {
            after: options.timeout,
        }),
    }
}

/// Shared, swappable reference to the configured executor.
///
/// Loaders resolve the executor at flush time, so rebinding the handle takes
/// effect for every batch flushed afterwards.
#[derive(Clone)]
pub struct ExecutorHandle {
    current: Arc<RwLock<Arc<dyn QueryExecutor>>>,
}

impl ExecutorHandle {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            current: Arc::new(RwLock::new(executor)),
        }
    }

    pub fn current(&self) -> Arc<dyn QueryExecutor> {
        Arc::clone(&rw_read(&self.current, SOURCE, "executor.current"))
    }

    pub fn replace(&self, executor: Arc<dyn QueryExecutor>) {
        *rw_write(&self.current, SOURCE, "executor.replace") = executor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stalled;

    #[async_trait]
    impl QueryExecutor for Stalled {
        async fn query(
            &self,
            _filters: &[Filter],
            _options: QueryOptions,
        ) -> Result<Vec<Record>, QueryError> {
            std::future::pending().await
        }
    }

    struct Fixed(Vec<Record>);

    #[async_trait]
    impl QueryExecutor for Fixed {
        async fn query(
            &self,
            _filters: &[Filter],
            _options: QueryOptions,
        ) -> Result<Vec<Record>, QueryError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_turns_into_timeout_error() {
        let options = QueryOptions {
            timeout: Duration::from_millis(250),
        };
        let err = query_with_deadline(&Stalled, &[Filter::new()], options)
            .await
            .expect_err("stalled executor must time out");
        assert!(matches!(err, QueryError::Timeout { after } if after == options.timeout));
    }

    #[tokio::test]
    async fn handle_rebinds_executor() {
        let handle = ExecutorHandle::new(Arc::new(Fixed(vec![Record::new("a", 1)])));
        let options = QueryOptions {
            timeout: Duration::from_secs(1),
        };

        let first = handle.current().query(&[], options).await.expect("records");
        assert_eq!(first.len(), 1);

        handle.replace(Arc::new(Fixed(Vec::new())));
        let second = handle.current().query(&[], options).await.expect("records");
        assert!(second.is_empty());
    }
}
