// SPDX-License-Identifier: Apache-2.0
//! Linear-backoff retry for the cloud HTTP provider clients (C6).
//!
//! Cloud providers (OpenAI-compatible, Anthropic, Google) retry 5xx
//! responses, connection resets, and timeouts up to [`DEFAULT_MAX_RETRIES`]
//! times with a linearly increasing delay. Ollama and other `localhost`
//! drivers talk to a process on the same machine and never retry — a local
//! server that returns 5xx or times out isn't going to recover by waiting.

use std::time::Duration;

use tracing::warn;

/// Retries on 5xx / connection errors; linear backoff doubles the attempt
/// count each time (500ms, 1000ms, 1500ms, ...).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Sends an HTTP request built by `build`, retrying on 5xx responses and
/// connect/timeout errors up to `max_retries` times with linear backoff.
///
/// `build` is called once per attempt so each retry sends a fresh request
/// (headers and body are rebuilt from the caller's owned data rather than
/// cloning an in-flight `RequestBuilder`).
pub async fn send_with_retry<F>(
    driver_name: &str,
    max_retries: u32,
    build: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = build().send().await;
        match outcome {
            Ok(resp) if resp.status().is_server_error() && attempt < max_retries => {
                attempt += 1;
                warn!(
                    driver = driver_name,
                    attempt,
                    status = %resp.status(),
                    "retrying after server error"
                );
                tokio::time::sleep(BACKOFF_STEP * attempt).await;
            }
            Ok(resp) => return Ok(resp),
            Err(e) if (e.is_connect() || e.is_timeout()) && attempt < max_retries => {
                attempt += 1;
                warn!(driver = driver_name, attempt, error = %e, "retrying after transport error");
                tokio::time::sleep(BACKOFF_STEP * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
