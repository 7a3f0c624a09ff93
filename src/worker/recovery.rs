//! Panic recovery for worker operations.
//!
//! A single misbehaving job must not take a worker (or the pool) down:
//! panics are captured, logged, and converted to errors.

use crate::types::{Error, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Execute a function with panic recovery.
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(payload) => {
            let message = extract_panic_message(&payload);
            tracing::error!(operation = operation_name, panic = %message, "panic recovered");
            Err(Error::internal(format!(
                "panic in {}: {}",
                operation_name, message
            )))
        }
    }
}

/// Async variant: the future itself is polled normally; only panics in
/// its construction and polling surface here via the task boundary.
pub async fn with_recovery_async<F, Fut, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(operation()).await {
        Ok(result) => result,
        Err(join_err) => {
            let message = if join_err.is_panic() {
                "task panicked".to_string()
            } else {
                join_err.to_string()
            };
            tracing::error!(operation = operation_name, error = %message, "async panic recovered");
            Err(Error::internal(format!(
                "panic in {}: {}",
                operation_name, message
            )))
        }
    }
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_recovery_success() {
        let result = with_recovery(|| Ok(42), "op");
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_with_recovery_error_passthrough() {
        let result: Result<()> = with_recovery(|| Err(Error::validation("boom")), "op");
        assert!(result.unwrap_err().to_string().contains("boom"));
    }

    #[test]
    fn test_with_recovery_panic() {
        let result: Result<()> = with_recovery(|| panic!("exploded"), "op");
        let message = result.unwrap_err().to_string();
        assert!(message.contains("panic in op"));
        assert!(message.contains("exploded"));
    }

    #[tokio::test]
    async fn test_with_recovery_async_success() {
        let result = with_recovery_async(|| async { Ok(7) }, "op").await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_recovery_async_panic() {
        let result: Result<()> = with_recovery_async(
            || async {
                panic!("async explosion");
            },
            "op",
        )
        .await;
        assert!(result.is_err());
    }
}
