pub mod circuit_breaker;
pub mod client;
pub mod resilient;
pub mod retry;
pub mod transport;

pub use circuit_breaker::{Admission, BreakerPermit, BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use client::build_http_client;
pub use resilient::ResilientClient;
pub use retry::{RetryConfig, RetryableClient};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
