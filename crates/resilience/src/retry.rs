use jarvis_core::config::RetrySettings;
use jarvis_core::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub retry_on_timeout: bool,
    pub retry_on_connection_error: bool,
    pub retry_on_status_codes: HashSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            exponential_base: s.exponential_base,
            retry_on_timeout: s.retry_on_timeout,
            retry_on_connection_error: s.retry_on_connection_error,
            retry_on_status_codes: s.retry_on_status_codes.iter().copied().collect(),
        }
    }
}

impl RetryConfig {
    /// `base_delay * exponential_base^attempt`, capped at `max_delay`. `attempt` is 0-indexed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status_codes.contains(&status)
    }
}

/// HTTP client that retries transient failures with exponential backoff.
///
/// Statuses in `retry_on_status_codes` are retried; everything else, including
/// 4xx other than 429, is handed back to the caller on the first attempt.
#[derive(Clone)]
pub struct RetryableClient {
    transport: Arc<dyn HttpTransport>,
    config: RetryConfig,
}

impl RetryableClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: RetryConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.request(HttpRequest::get(url)).await
    }

    pub async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<HttpResponse> {
        self.request(HttpRequest::post(url).json(body)).await
    }

    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let max_retries = self.config.max_retries;
        let url = request.url.clone();
        let mut attempt: u32 = 0;

        loop {
            let attempts = attempt + 1;
            let can_retry = attempt < max_retries;

            match self.transport.send(request.clone()).await {
                Ok(response) => {
                    if !self.config.should_retry_status(response.status) {
                        if attempt > 0 {
                            debug!(url = %url, attempts, status = response.status, "Request settled after retry");
                        }
                        return Ok(response);
                    }
                    if can_retry {
                        self.backoff(attempt, &format!("HTTP {}", response.status), &url)
                            .await;
                    } else {
                        let status = response.status;
                        return Err(Error::ServiceUnavailable {
                            message: format!("Service error from {}: HTTP {}", url, status),
                            retry_after: Some(if status == 429 { 60 } else { 30 }),
                            status: Some(status),
                            attempts: Some(attempts),
                        });
                    }
                }
                Err(TransportError::Timeout(e)) => {
                    if self.config.retry_on_timeout && can_retry {
                        self.backoff(attempt, "Timeout", &url).await;
                    } else {
                        warn!(url = %url, attempts, error = %e, "Request timed out");
                        return Err(Error::Timeout {
                            message: format!("Request to {} timed out after {} attempts", url, attempts),
                            attempts: Some(attempts),
                        });
                    }
                }
                Err(TransportError::Connect(e)) => {
                    if self.config.retry_on_connection_error && can_retry {
                        self.backoff(attempt, "Connection error", &url).await;
                    } else {
                        warn!(url = %url, attempts, error = %e, "Connection failed");
                        return Err(Error::ServiceUnavailable {
                            message: format!("Failed to connect to {} after {} attempts", url, attempts),
                            retry_after: Some(60),
                            status: None,
                            attempts: Some(attempts),
                        });
                    }
                }
                Err(TransportError::Other(e)) => {
                    return Err(Error::Network(format!("Request to {} failed: {}", url, e)));
                }
            }

            attempt += 1;
        }
    }

    async fn backoff(&self, attempt: u32, reason: &str, url: &str) {
        let delay = self.config.delay_for(attempt);
        warn!(
            url = %url,
            reason,
            attempt = attempt + 1,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Retrying request"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed script of outcomes, then repeats the last one.
    struct ScriptedTransport {
        script: Mutex<VecDeque<std::result::Result<u16, TransportError>>>,
        last: std::result::Result<u16, TransportError>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<std::result::Result<u16, TransportError>>) -> Arc<Self> {
            let last = script.last().cloned().unwrap_or(Ok(200));
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, _request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front().unwrap_or_else(|| self.last.clone());
            next.map(|status| HttpResponse::new(status, format!("status {}", status)))
        }
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let cfg = RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            ..RetryConfig::default()
        };
        assert_eq!(cfg.delay_for(0), Duration::from_secs(1));
        assert_eq!(cfg.delay_for(1), Duration::from_secs(2));
        assert_eq!(cfg.delay_for(3), Duration::from_secs(8));
        assert_eq!(cfg.delay_for(4), Duration::from_secs(10));
        assert_eq!(cfg.delay_for(200), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_503_three_times_then_200() {
        let transport = ScriptedTransport::new(vec![Ok(503), Ok(503), Ok(503), Ok(200)]);
        let client = RetryableClient::new(transport.clone(), fast_config(3));
        let resp = client.get("https://api.weather.gov/points").await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_404_is_never_retried() {
        let transport = ScriptedTransport::new(vec![Ok(404), Ok(200)]);
        let client = RetryableClient::new(transport.clone(), fast_config(3));
        let resp = client.get("https://api.weather.gov/missing").await.unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_5xx_reports_status_and_attempts() {
        let transport = ScriptedTransport::new(vec![Ok(502)]);
        let client = RetryableClient::new(transport.clone(), fast_config(2));
        match client.get("https://calendar.example.com").await {
            Err(Error::ServiceUnavailable { status, attempts, retry_after, .. }) => {
                assert_eq!(status, Some(502));
                assert_eq!(attempts, Some(3));
                assert_eq!(retry_after, Some(30));
            }
            other => panic!("unexpected: {:?}", other.map(|r| r.status)),
        }
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_timeouts_become_timeout_error() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout("slow".into()))]);
        let client = RetryableClient::new(transport.clone(), fast_config(1));
        match client.get("https://slow.example.com").await {
            Err(Error::Timeout { attempts, .. }) => assert_eq!(attempts, Some(2)),
            other => panic!("unexpected: {:?}", other.map(|r| r.status)),
        }
    }

    #[tokio::test]
    async fn test_connection_errors_respect_flag() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Connect("refused".into())), Ok(200)]);
        let mut cfg = fast_config(3);
        cfg.retry_on_connection_error = false;
        let client = RetryableClient::new(transport.clone(), cfg);
        match client.get("http://hue.local").await {
            Err(Error::ServiceUnavailable { attempts, retry_after, .. }) => {
                assert_eq!(attempts, Some(1));
                assert_eq!(retry_after, Some(60));
            }
            other => panic!("unexpected: {:?}", other.map(|r| r.status)),
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_connection_error_recovers() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Connect("refused".into())), Ok(200)]);
        let client = RetryableClient::new(transport.clone(), fast_config(3));
        assert_eq!(client.get("http://hue.local").await.unwrap().status, 200);
        assert_eq!(transport.calls(), 2);
    }
}
