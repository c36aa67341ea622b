use jarvis_core::config::AggregatorConfig;
use jarvis_core::ErrorResponse;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// When a multi-provider request counts as answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// First response or error.
    First,
    /// Every expected provider replied.
    All,
    /// More than half of the expected providers replied.
    Majority,
    /// Whatever arrived by the deadline.
    Timeout,
}

impl AggregationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationStrategy::First => "first",
            AggregationStrategy::All => "all",
            AggregationStrategy::Majority => "majority",
            AggregationStrategy::Timeout => "timeout",
        }
    }
}

pub const ALL_PROVIDERS_FAILED: &str = "All providers failed";
pub const NO_RESPONSES: &str = "No responses received";

/// Final answer for an aggregated request.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResponse {
    pub request_id: String,
    pub capability: String,
    pub success: bool,
    pub content: Value,
    pub error: Option<String>,
    pub strategy: AggregationStrategy,
    pub received_from: Vec<String>,
    pub expected_from: Vec<String>,
    pub response_count: usize,
    pub error_count: usize,
    pub timed_out: bool,
}

impl AggregatedResponse {
    fn failure(request_id: &str, capability: &str, strategy: AggregationStrategy, message: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            capability: capability.to_string(),
            success: false,
            content: json!({ "error": message }),
            error: Some(message.to_string()),
            strategy,
            received_from: Vec::new(),
            expected_from: Vec::new(),
            response_count: 0,
            error_count: 0,
            timed_out: false,
        }
    }

    /// The most specific error text available: the first provider error, else the aggregate one.
    pub fn error_message(&self) -> Option<String> {
        if self.success {
            return None;
        }
        self.content
            .get("errors")
            .and_then(|e| e.get(0))
            .and_then(|e| e.get("error"))
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .or_else(|| self.error.clone())
    }

    /// Content on success, `{"error": ...}` otherwise.
    pub fn into_result(self) -> Value {
        match self.error_message() {
            None => self.content,
            Some(msg) => json!({ "error": msg }),
        }
    }
}

struct ResponseTracker {
    capability: String,
    expected: Vec<String>,
    strategy: AggregationStrategy,
    timeout: Duration,
    created_at: Instant,
    responses: Vec<(String, Value)>,
    errors: Vec<(String, Value)>,
    received_from: Vec<String>,
    completion: Option<oneshot::Sender<AggregatedResponse>>,
}

impl ResponseTracker {
    fn is_resolved(&self) -> bool {
        self.completion.is_none()
    }

    fn deadline(&self) -> Instant {
        self.created_at + self.timeout
    }

    fn answered_expected(&self) -> usize {
        self.expected
            .iter()
            .filter(|p| self.received_from.contains(p))
            .count()
    }

    fn is_complete(&self) -> bool {
        match self.strategy {
            AggregationStrategy::First => !self.received_from.is_empty(),
            AggregationStrategy::All => self.answered_expected() == self.expected.len(),
            AggregationStrategy::Majority => self.answered_expected() > self.expected.len() / 2,
            AggregationStrategy::Timeout => false,
        }
    }

    fn build(&self, request_id: &str, timed_out: bool) -> AggregatedResponse {
        let mut result = AggregatedResponse {
            request_id: request_id.to_string(),
            capability: self.capability.clone(),
            success: true,
            content: Value::Null,
            error: None,
            strategy: self.strategy,
            received_from: self.received_from.clone(),
            expected_from: self.expected.clone(),
            response_count: self.responses.len(),
            error_count: self.errors.len(),
            timed_out,
        };

        if self.responses.is_empty() {
            let message = if self.errors.is_empty() {
                NO_RESPONSES
            } else {
                ALL_PROVIDERS_FAILED
            };
            let errors: Vec<Value> = self
                .errors
                .iter()
                .map(|(from, content)| {
                    json!({ "agent": from, "error": ErrorResponse::from_content(content).message })
                })
                .collect();
            result.success = false;
            result.error = Some(message.to_string());
            result.content = json!({ "error": message, "errors": errors });
            return result;
        }

        result.content = match self.strategy {
            AggregationStrategy::First => self.responses[0].1.clone(),
            _ => merge_responses(&self.responses, &self.errors),
        };
        result
    }

    /// Deliver the result once. Later calls are no-ops.
    fn resolve(&mut self, request_id: &str, timed_out: bool) {
        if let Some(tx) = self.completion.take() {
            let result = self.build(request_id, timed_out);
            debug!(
                request_id,
                strategy = self.strategy.as_str(),
                success = result.success,
                timed_out,
                "Aggregation resolved"
            );
            let _ = tx.send(result);
        }
    }
}

/// Merge successful replies: `response` texts joined by newlines, object
/// fields unioned (arrays concatenated, otherwise first writer wins), the first
/// error kept under `error`.
fn merge_responses(responses: &[(String, Value)], errors: &[(String, Value)]) -> Value {
    let mut merged = Map::new();
    let mut texts: Vec<String> = Vec::new();
    let mut loose: Vec<Value> = Vec::new();

    for (_, content) in responses {
        match content {
            Value::Object(fields) => {
                for (key, value) in fields {
                    if key == "response" {
                        if let Some(text) = value.as_str() {
                            texts.push(text.to_string());
                            continue;
                        }
                    }
                    if let Some(existing) = merged.get_mut(key) {
                        if let (Value::Array(existing), Value::Array(items)) = (existing, value) {
                            existing.extend(items.iter().cloned());
                        }
                    } else {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::String(text) => texts.push(text.clone()),
            Value::Null => {}
            other => loose.push(other.clone()),
        }
    }

    if !texts.is_empty() {
        merged.insert("response".to_string(), Value::String(texts.join("\n")));
    }
    if !loose.is_empty() {
        merged.entry("values").or_insert(Value::Array(loose));
    }
    if let Some((from, content)) = errors.first() {
        merged.entry("error").or_insert_with(|| {
            Value::String(format!("{}: {}", from, ErrorResponse::from_content(content).message))
        });
    }
    Value::Object(merged)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatorStats {
    pub tracked: usize,
    pub pending: usize,
    pub resolved: usize,
    pub by_strategy: BTreeMap<String, usize>,
}

struct AggregatorInner {
    default_timeout: Duration,
    sweep_interval: Duration,
    trackers: Mutex<HashMap<String, ResponseTracker>>,
    shutdown_tx: broadcast::Sender<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Correlates several replies to one request under an [`AggregationStrategy`].
#[derive(Clone)]
pub struct ResponseAggregator {
    inner: Arc<AggregatorInner>,
}

/// Handle returned by [`ResponseAggregator::register_request`].
pub struct PendingAggregation {
    request_id: String,
    capability: String,
    strategy: AggregationStrategy,
    deadline: Instant,
    rx: oneshot::Receiver<AggregatedResponse>,
    aggregator: Weak<AggregatorInner>,
}

impl PendingAggregation {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the result. Never outlives the tracker's deadline.
    pub async fn wait(mut self) -> AggregatedResponse {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => return result,
            Ok(Err(_)) => return self.dropped(),
            Err(_) => {}
        }

        if let Some(inner) = self.aggregator.upgrade() {
            ResponseAggregator { inner }.expire(&self.request_id).await;
        }
        match self.rx.try_recv() {
            Ok(result) => result,
            Err(_) => self.dropped(),
        }
    }

    fn dropped(&self) -> AggregatedResponse {
        let mut result = AggregatedResponse::failure(&self.request_id, &self.capability, self.strategy, NO_RESPONSES);
        result.timed_out = true;
        result
    }
}

impl ResponseAggregator {
    pub fn new(config: &AggregatorConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(AggregatorInner {
                default_timeout: config.default_timeout(),
                sweep_interval: config.sweep_interval(),
                trackers: Mutex::new(HashMap::new()),
                shutdown_tx,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Start tracking `request_id`. `timeout` falls back to the configured default.
    pub async fn register_request(
        &self,
        request_id: &str,
        capability: &str,
        expected_providers: Vec<String>,
        strategy: AggregationStrategy,
        timeout: Option<Duration>,
    ) -> PendingAggregation {
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();

        let mut tracker = ResponseTracker {
            capability: capability.to_string(),
            expected: expected_providers,
            strategy,
            timeout,
            created_at,
            responses: Vec::new(),
            errors: Vec::new(),
            received_from: Vec::new(),
            completion: Some(tx),
        };

        if tracker.expected.is_empty() {
            debug!(request_id, capability, "No providers to wait for");
            tracker.resolve(request_id, false);
        }

        let mut trackers = self.inner.trackers.lock().await;
        if let Some(mut old) = trackers.insert(request_id.to_string(), tracker) {
            warn!(request_id, "Request re-registered, resolving the previous tracker");
            old.resolve(request_id, true);
        }
        drop(trackers);

        PendingAggregation {
            request_id: request_id.to_string(),
            capability: capability.to_string(),
            strategy,
            deadline: created_at + timeout,
            rx,
            aggregator: Arc::downgrade(&self.inner),
        }
    }

    /// Record one reply. Returns false when the request is unknown or already resolved.
    pub async fn add_response(&self, request_id: &str, from_agent: &str, content: Value, is_error: bool) -> bool {
        let mut trackers = self.inner.trackers.lock().await;
        let Some(tracker) = trackers.get_mut(request_id) else {
            return false;
        };
        if tracker.is_resolved() {
            return false;
        }

        if is_error {
            tracker.errors.push((from_agent.to_string(), content));
        } else {
            tracker.responses.push((from_agent.to_string(), content));
        }
        if !tracker.received_from.iter().any(|p| p == from_agent) {
            tracker.received_from.push(from_agent.to_string());
        }

        if tracker.is_complete() {
            tracker.resolve(request_id, false);
        }
        true
    }

    /// Resolve `request_id` with what it has, marking it timed out.
    pub async fn expire(&self, request_id: &str) {
        let mut trackers = self.inner.trackers.lock().await;
        if let Some(tracker) = trackers.get_mut(request_id) {
            tracker.resolve(request_id, true);
        }
    }

    pub async fn is_tracking(&self, request_id: &str) -> bool {
        self.inner.trackers.lock().await.contains_key(request_id)
    }

    /// Resolve every expired tracker, then purge resolved ones and those past
    /// twice their timeout. Returns the number purged.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut trackers = self.inner.trackers.lock().await;

        for (request_id, tracker) in trackers.iter_mut() {
            if !tracker.is_resolved() && now >= tracker.deadline() {
                tracker.resolve(request_id, true);
            }
        }

        let before = trackers.len();
        trackers.retain(|_, t| !t.is_resolved() && now < t.created_at + t.timeout * 2);
        before - trackers.len()
    }

    pub async fn stats(&self) -> AggregatorStats {
        let trackers = self.inner.trackers.lock().await;
        let mut stats = AggregatorStats {
            tracked: trackers.len(),
            ..AggregatorStats::default()
        };
        for tracker in trackers.values() {
            if tracker.is_resolved() {
                stats.resolved += 1;
            } else {
                stats.pending += 1;
            }
            *stats
                .by_strategy
                .entry(tracker.strategy.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Spawn the periodic sweep. Calling it twice keeps the first task.
    pub async fn start(&self) {
        let mut sweeper = self.inner.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.sweep_interval;
        let shutdown = self.inner.shutdown_tx.subscribe();
        *sweeper = Some(tokio::spawn(run_sweep(weak, interval, shutdown)));
    }

    pub async fn stop(&self) {
        let handle = self.inner.sweeper.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.inner.shutdown_tx.send(());
            if let Err(e) = handle.await {
                warn!(error = %e, "Aggregator sweep task failed");
            }
        }
    }
}

async fn run_sweep(inner: Weak<AggregatorInner>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    info!(interval_ms = every.as_millis() as u64, "Response aggregator sweep started");
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let purged = ResponseAggregator { inner }.sweep().await;
                if purged > 0 {
                    debug!(purged, "Purged aggregation trackers");
                }
            }
            _ = shutdown.recv() => {
                info!("Response aggregator sweep stopping");
                break;
            }
        }
    }
}
