//! Fixed-backoff retry for exchange calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::ExchangeError;

/// Run `call` until it succeeds or fails with an application error.
///
/// Transport errors sleep `backoff` and try again, with no attempt limit.
pub async fn retry_transient<T, F, Fut>(
    operation: &str,
    backoff: Duration,
    mut call: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Exchange call failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
