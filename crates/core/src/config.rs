use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Capability that receives requests nobody else can serve.
    /// An empty string disables the fallback.
    #[serde(default = "default_fallback_capability")]
    pub fallback_capability: String,
}

fn default_queue_size() -> usize {
    1000
}

fn default_fallback_capability() -> String {
    "chat".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            fallback_capability: default_fallback_capability(),
        }
    }
}

impl NetworkConfig {
    pub fn fallback(&self) -> Option<&str> {
        let name = self.fallback_capability.trim();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorConfig {
    #[serde(default = "default_aggregator_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_aggregator_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_aggregator_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl AggregatorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Budget for a single capability inside a wave.
    #[serde(default = "default_capability_timeout_ms")]
    pub capability_timeout_ms: u64,
    /// Budget for a whole orchestrated request, all waves included.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_capability_timeout_ms() -> u64 {
    15_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capability_timeout_ms: default_capability_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl OrchestratorConfig {
    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
    #[serde(default = "default_true")]
    pub retry_on_connection_error: bool,
    #[serde(default = "default_retry_status_codes")]
    pub retry_on_status_codes: Vec<u16>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            retry_on_timeout: true,
            retry_on_connection_error: true,
            retry_on_status_codes: default_retry_status_codes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceConfig {
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Proxy for outbound calls to external services.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Hosts that bypass `proxy` ("localhost", "*.local", ".example.com").
    #[serde(default)]
    pub no_proxy: Vec<String>,
    #[serde(default = "default_http_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerSettings::default(),
            retry: RetrySettings::default(),
            proxy: None,
            no_proxy: Vec::new(),
            request_timeout_ms: default_http_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let raw = r#"{
  "network": { "fallbackCapability": "" },
  "resilience": { "retry": { "maxRetries": 5 } }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.network.queue_size, 1000);
        assert_eq!(cfg.network.fallback(), None);
        assert_eq!(cfg.resilience.retry.max_retries, 5);
        assert_eq!(cfg.resilience.retry.base_delay_ms, 1000);
        assert_eq!(cfg.resilience.retry.retry_on_status_codes, vec![429, 500, 502, 503, 504]);
        assert_eq!(cfg.resilience.breaker.failure_threshold, 5);
        assert_eq!(cfg.orchestrator.capability_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_default_fallback_is_chat() {
        let cfg = Config::default();
        assert_eq!(cfg.network.fallback(), Some("chat"));
        assert_eq!(cfg.aggregator.default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().join("jarvis"));
        assert!(Config::load_or_default(&paths).is_ok());

        let mut cfg = Config::default();
        cfg.resilience.proxy = Some("http://proxy.local:8080".to_string());
        cfg.aggregator.sweep_interval_ms = 250;
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.resilience.proxy.as_deref(), Some("http://proxy.local:8080"));
        assert_eq!(loaded.aggregator.sweep_interval(), Duration::from_millis(250));
    }
}
