//! Timeout wrapper for async operations.

use graphvec_core::GraphvecError;
use std::future::Future;
use std::time::Duration;

/// Wraps an async operation with a timeout.
///
/// An elapsed timeout surfaces as [`GraphvecError::Timeout`] converted into
/// the operation's own error type.
pub async fn with_timeout<F, Fut, T, E>(duration: Duration, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<GraphvecError>,
{
    tokio::time::timeout(duration, f()).await.map_err(|_| {
        E::from(GraphvecError::Timeout(format!(
            "Operation timed out after {duration:?}"
        )))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphvec_core::{Classify, ErrorKind};

    #[tokio::test]
    async fn test_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), || async { Ok::<_, GraphvecError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exceeded() {
        let result = with_timeout(Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, GraphvecError>(42)
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, GraphvecError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result = with_timeout(Duration::from_secs(1), || async {
            Err::<i32, _>(GraphvecError::invalid_input("empty"))
        })
        .await;

        assert!(matches!(result, Err(GraphvecError::InvalidInput(_))));
    }
}
