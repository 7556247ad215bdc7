/*!
 * Transaction Helper Utilities
 *
 * Every aggregate (requisition, quotation, purchase order) is written inside its own
 * database transaction guarded by a `version` compare-and-swap. A lost swap surfaces as
 * `ServiceError::ConcurrentModification`, the transaction is dropped (rolled back) and the
 * whole read-modify-write attempt is replayed here.
 */

use crate::errors::ServiceError;
use metrics::counter;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry with linear backoff for optimistic aggregate transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }
}

/// Begins a transaction, mapping the connection error into the service error space.
pub async fn begin(db: &DatabaseConnection) -> Result<DatabaseTransaction, ServiceError> {
    db.begin().await.map_err(ServiceError::db_error)
}

/// Commits a transaction, mapping the error into the service error space.
pub async fn commit(txn: DatabaseTransaction) -> Result<(), ServiceError> {
    txn.commit().await.map_err(ServiceError::db_error)
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, or the policy's
/// attempts are exhausted, in which case a `ServiceError::Conflict` is returned.
///
/// # Example
///
/// ```rust,ignore
/// let outcome = retry_on_conflict(&policy, "confirm_purchase_order", move || {
///     self.confirm_once(actor, request)
/// })
/// .await?;
/// ```
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut tries = 0u32;

    loop {
        tries += 1;
        match attempt().await {
            Err(err) if err.is_retryable() => {
                counter!("stateset_procurement.conflict.retry", 1, "operation" => operation.to_string());
                if tries >= max_attempts {
                    warn!(operation, attempts = tries, error = %err, "Optimistic concurrency retries exhausted");
                    return Err(ServiceError::Conflict(format!(
                        "{} gave up after {} attempts: {}",
                        operation, tries, err
                    )));
                }
                debug!(operation, attempt = tries, error = %err, "Retrying after concurrent modification");
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff * tries).await;
                }
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[tokio::test]
    async fn retries_until_the_swap_wins() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_on_conflict(&RetryPolicy::immediate(5), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ServiceError::ConcurrentModification(Uuid::nil()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_conflict() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry_on_conflict(&RetryPolicy::immediate(3), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::ConcurrentModification(Uuid::nil()))
        })
        .await;

        assert_matches!(result, Err(ServiceError::Conflict(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn business_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry_on_conflict(&RetryPolicy::immediate(3), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::ValidationError("nope".into()))
        })
        .await;

        assert_matches!(result, Err(ServiceError::ValidationError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
