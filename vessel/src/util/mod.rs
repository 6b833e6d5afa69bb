//! Small shared utilities.

pub(crate) mod fdio;

use std::future::Future;
use std::time::Duration;

use vessel_shared::{VesselError, VesselResult};

/// Run `fut` under a deadline, mapping expiry to [`VesselError::Timeout`].
pub async fn with_timeout<F, T>(what: &str, limit: Duration, fut: F) -> VesselResult<T>
where
    F: Future<Output = VesselResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(VesselError::Timeout(format!(
            "{what} did not complete within {limit:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_expires() {
        let err = with_timeout("sleep", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn test_timeout_passes_result_through() {
        let value = with_timeout("quick", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
