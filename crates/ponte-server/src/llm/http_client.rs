// crates/ponte-server/src/llm/http_client.rs
// Shared HTTP client for all runtime endpoints, with retry and backoff

use crate::config::EnvConfig;
use crate::error::{PonteError, Result};
use rand::Rng;
use reqwest::Client;
use std::time::Duration;
use tracing::warn;

/// Default maximum attempts for transient failures (total, not extra retries)
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base backoff duration between attempts (doubles each attempt)
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
/// Default ceiling on a single backoff sleep
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);
/// Connect timeout for all requests
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client shared by the LLM transport and the lifecycle manager.
///
/// Retries only transient failures: connection errors, request timeouts,
/// and 5xx responses. 4xx is a permanent client error and surfaces
/// immediately.
pub struct LlmHttpClient {
    client: Client,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl LlmHttpClient {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
        }
    }

    pub fn from_env(config: &EnvConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_base_delay,
            config.retry_max_delay,
        )
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Execute a request built by `build`, retrying transient failures.
    /// Returns the response body as text on success. The builder closure is
    /// invoked fresh per attempt; per-request timeouts belong in the builder.
    pub async fn execute_with_retry<F>(&self, request_id: &str, build: F) -> Result<String>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 1;

        loop {
            let response_result = build(&self.client).send().await;

            match response_result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }

                    let body = response.text().await.unwrap_or_default();

                    if status.is_server_error() && attempt < self.max_attempts {
                        let backoff = self.backoff_for(attempt);
                        warn!(
                            request_id = %request_id,
                            status = %status,
                            attempt,
                            "Transient server error, retrying in {:?}",
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }

                    if status.is_server_error() {
                        return Err(PonteError::Transport(format!(
                            "runtime returned {} after {} attempts: {}",
                            status, attempt, body
                        )));
                    }

                    // 4xx: permanent, never retried
                    return Err(PonteError::RuntimeApi {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(e) => {
                    let transient = e.is_connect() || e.is_timeout();
                    if transient && attempt < self.max_attempts {
                        let backoff = self.backoff_for(attempt);
                        warn!(
                            request_id = %request_id,
                            error = %e,
                            attempt,
                            "Request failed, retrying in {:?}",
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }
                    if transient {
                        return Err(PonteError::Transport(format!(
                            "request failed after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    return Err(PonteError::Http(e));
                }
            }
        }
    }

    /// Exponential backoff with +/-50% jitter, capped at `max_backoff`.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_backoff);
        let jitter: f64 = rand::rng().random_range(0.5..=1.5);
        capped.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP stub that answers each connection with the next scripted
    /// status code, then `200` with body `ok` once the script runs out.
    async fn spawn_stub(statuses: Vec<u16>) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let n = hits_clone.fetch_add(1, Ordering::SeqCst) as usize;
                let status = statuses.get(n).copied().unwrap_or(200);

                // Drain the request head; bodies here are tiny.
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;

                let body = if status == 200 { "ok" } else { "boom" };
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    fn fast_client() -> LlmHttpClient {
        LlmHttpClient::new(3, Duration::from_millis(50), Duration::from_millis(400))
    }

    #[tokio::test]
    async fn test_two_500s_then_success() {
        let (url, hits) = spawn_stub(vec![500, 500, 200]).await;
        let client = fast_client();

        let started = std::time::Instant::now();
        let body = client
            .execute_with_retry("test", |c| c.get(&url))
            .await
            .unwrap();

        assert_eq!(body, "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // Two backoffs of >= 25ms and >= 50ms (worst-case downward jitter)
        assert!(started.elapsed() >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn test_500s_exhaust_attempts() {
        let (url, hits) = spawn_stub(vec![500, 500, 500, 500]).await;
        let client = fast_client();

        let err = client
            .execute_with_retry("test", |c| c.get(&url))
            .await
            .unwrap_err();

        assert!(matches!(err, PonteError::Transport(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_4xx_not_retried() {
        let (url, hits) = spawn_stub(vec![404]).await;
        let client = fast_client();

        let err = client
            .execute_with_retry("test", |c| c.get(&url))
            .await
            .unwrap_err();

        match err {
            PonteError::RuntimeApi { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "boom");
            }
            other => panic!("expected RuntimeApi, got {:?}", other),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_retries() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = LlmHttpClient::new(2, Duration::from_millis(10), Duration::from_millis(50));
        let err = client
            .execute_with_retry("test", |c| c.get(format!("http://{}", addr)))
            .await
            .unwrap_err();

        assert!(matches!(err, PonteError::Transport(_)));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let client = LlmHttpClient::new(5, Duration::from_secs(1), Duration::from_secs(10));
        // Jitter is 0.5x-1.5x, so bound checks use the extremes.
        let first = client.backoff_for(1);
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));
        let fourth = client.backoff_for(4);
        assert!(fourth >= Duration::from_secs(4));
        let huge = client.backoff_for(30);
        assert!(huge <= Duration::from_secs(15)); // 10s cap * 1.5 jitter
    }
}
