use jarvis_core::config::ResilienceConfig;
use jarvis_core::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::client::build_http_client;
use crate::retry::{RetryConfig, RetryableClient};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// Retrying HTTP client guarded by a circuit breaker.
///
/// One breaker attempt covers the whole retry sequence, so a request that
/// exhausts its retries counts as a single failure.
#[derive(Clone)]
pub struct ResilientClient {
    retry: RetryableClient,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientClient {
    pub fn new(retry: RetryableClient, breaker: Arc<CircuitBreaker>) -> Self {
        Self { retry, breaker }
    }

    /// Client for one external service, wired from the `resilience` config section.
    pub fn for_service(service: &str, base_url: &str, config: &ResilienceConfig) -> Self {
        let http = build_http_client(
            config.proxy.as_deref(),
            &config.no_proxy,
            base_url,
            Duration::from_millis(config.request_timeout_ms),
        );
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(http));
        Self::new(
            RetryableClient::new(transport, RetryConfig::from(&config.retry)),
            Arc::new(CircuitBreaker::new(
                service,
                CircuitBreakerConfig::from(&config.breaker),
            )),
        )
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.breaker.call(|| self.retry.request(request)).await
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.request(HttpRequest::get(url)).await
    }

    pub async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<HttpResponse> {
        self.request(HttpRequest::post(url).json(body)).await
    }
}
