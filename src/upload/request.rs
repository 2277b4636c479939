//! Retry harness shared by init, part and complete requests.

use crate::{Error, Result};
use std::{future::Future, time::Duration};
use tokio::time::sleep;

pub const MAX_ATTEMPTS: u32 = 3;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);

/// Run `op` up to [`MAX_ATTEMPTS`] times, doubling the backoff after each
/// failed attempt (1s, 2s). Only transport failures and 5xx responses are
/// retried; anything else is returned immediately. `on_retry` runs before
/// every backoff sleep so callers can rewind shared state (part uploads
/// roll back their progress contribution there).
///
/// # Errors
/// The last observed error once the attempt budget is exhausted
pub async fn with_retries<T, F, Fut, R>(what: &str, mut op: F, mut on_retry: R) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(),
{
    let mut delay = INITIAL_BACKOFF;

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                log::warn!(
                    "{what}: attempt {attempt}/{MAX_ATTEMPTS} failed: {err}, retrying in {}s",
                    delay.as_secs()
                );

                on_retry();
                sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }

    // the loop always returns on the final attempt
    Err(Error::Cancelled)
}

/// Split a response into success and [`Error::Server`], buffering the error
/// body before the response is dropped so it can be surfaced exactly once.
///
/// # Errors
/// `Server` for any non-2xx status
pub async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();

    Err(Error::Server {
        status: status.as_u16(),
        body,
    })
}
