use jarvis_core::config::BreakerSettings;
use jarvis_core::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(s: &BreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(s.recovery_timeout_ms),
            half_open_max_calls: s.half_open_max_calls.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    pub half_open_calls: u32,
    /// Seconds since the last recorded failure.
    pub last_failure_secs_ago: Option<f64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_calls: u32,
    /// Bumped on every entry into half-open; trial permits carry it.
    epoch: u64,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// One of the limited trial calls while half-open.
    Trial,
}

/// Outcome slot for an admitted call.
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// A trial permit dropped unsettled (cancelled future, panic) counts as a
/// failed trial and reopens the breaker.
#[must_use = "an unsettled trial permit reopens the breaker"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    epoch: u64,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.breaker.abandon_trial(self.epoch);
        }
    }
}

/// Per-service circuit breaker.
///
/// Closed counts consecutive failures; at the threshold it opens and rejects
/// every call until `recovery_timeout` has passed since the last failure. It
/// then admits up to `half_open_max_calls` probes; one success closes it, one
/// failure reopens it.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_calls: 0,
                epoch: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Decide whether a call may proceed, moving Open to HalfOpen when the recovery window has passed.
    pub fn admit(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner.last_failure.map(|t| t.elapsed());
            match elapsed {
                Some(e) if e < self.config.recovery_timeout => {
                    let remaining = self.config.recovery_timeout - e;
                    let retry_after = remaining.as_secs_f64().ceil().max(1.0) as u64;
                    return Err(Error::service_unavailable(
                        format!("Circuit breaker '{}' is open", self.name),
                        Some(retry_after),
                    ));
                }
                _ => {
                    info!(breaker = %self.name, "Circuit breaker entering half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_calls = 0;
                    inner.epoch += 1;
                }
            }
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_calls >= self.config.half_open_max_calls {
                return Err(Error::service_unavailable(
                    format!("Circuit breaker '{}' is half-open, probe in flight", self.name),
                    Some(5),
                ));
            }
            inner.half_open_calls += 1;
            return Ok(self.permit(Admission::Trial, inner.epoch));
        }

        Ok(self.permit(Admission::Normal, inner.epoch))
    }

    fn permit(&self, admission: Admission, epoch: u64) -> BreakerPermit<'_> {
        BreakerPermit {
            breaker: self,
            admission,
            epoch,
            settled: false,
        }
    }

    /// A trial from the current half-open window ended without an outcome.
    fn abandon_trial(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.state != CircuitState::HalfOpen || inner.epoch != epoch {
            return;
        }
        warn!(breaker = %self.name, "Half-open trial abandoned, circuit breaker reopened");
        inner.state = CircuitState::Open;
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.half_open_calls = 0;
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "Circuit breaker closed after successful probe");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.half_open_calls = 0;
                inner.last_failure = None;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Probe failed, circuit breaker reopened");
                inner.state = CircuitState::Open;
                inner.half_open_calls = 0;
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "Circuit breaker opened"
                );
                inner.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Run `f` under the breaker. Rejected calls never invoke `f`.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.admit()?;
        match f().await {
            Ok(v) => {
                permit.success();
                Ok(v)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    pub fn call_sync<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let permit = self.admit()?;
        let out = f();
        match &out {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        out
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.half_open_calls = 0;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs_f64(),
            half_open_calls: inner.half_open_calls,
            last_failure_secs_ago: inner.last_failure.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

/// Named breakers, one per external service, created on first use.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with(name, self.default_config.clone())
    }

    /// `config` only applies when the breaker does not exist yet.
    pub fn get_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<BreakerStats> = map.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        let map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        for breaker in map.values() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
