use chrono::{DateTime, Utc};
use jarvis_core::{ErrorResponse, Message, MessageKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A capability request this agent sent and is still waiting on.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTask {
    pub request_id: String,
    pub capability: String,
    /// Providers the request was sent to.
    pub providers: Vec<String>,
    pub data: Value,
    pub responses: Vec<(String, Value)>,
    pub errors: Vec<(String, ErrorResponse)>,
    pub created_at: DateTime<Utc>,
}

impl ActiveTask {
    fn has_replied(&self, agent: &str) -> bool {
        self.responses.iter().any(|(from, _)| from == agent)
            || self.errors.iter().any(|(from, _)| from == agent)
    }

    /// Expected providers that have not answered yet.
    pub fn outstanding(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| !self.has_replied(p))
            .cloned()
            .collect()
    }
}

/// Outcome of recording a reply against the initiator's own records.
#[derive(Debug, Clone)]
pub enum ReplyProgress {
    /// Still waiting on `remaining` providers.
    Pending { remaining: usize },
    /// Every provider answered; the record has been removed.
    Complete(ActiveTask),
    /// No record for this request id, or the message is not a reply.
    Unknown,
}

/// Per-agent table of outstanding capability requests, keyed by request id.
#[derive(Clone, Default)]
pub struct ActiveTasks {
    tasks: Arc<Mutex<HashMap<String, ActiveTask>>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, request_id: &str, capability: &str, providers: Vec<String>, data: Value) {
        let task = ActiveTask {
            request_id: request_id.to_string(),
            capability: capability.to_string(),
            providers,
            data,
            responses: Vec::new(),
            errors: Vec::new(),
            created_at: Utc::now(),
        };
        let mut tasks = self.tasks.lock().await;
        if tasks.insert(request_id.to_string(), task).is_some() {
            tracing::warn!(request_id, "Replaced an active task with the same request id");
        }
    }

    /// Apply a `capability_response` or `error` message to its record.
    pub async fn record_reply(&self, msg: &Message) -> ReplyProgress {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(msg.request_id()) else {
            return ReplyProgress::Unknown;
        };

        let from = msg.from_agent().to_string();
        match msg.kind() {
            MessageKind::CapabilityResponse => task.responses.push((from, msg.content().clone())),
            MessageKind::Error => task
                .errors
                .push((from, ErrorResponse::from_content(msg.content()))),
            _ => return ReplyProgress::Unknown,
        }

        let remaining = task.outstanding().len();
        if remaining > 0 {
            return ReplyProgress::Pending { remaining };
        }
        match tasks.remove(msg.request_id()) {
            Some(done) => ReplyProgress::Complete(done),
            None => ReplyProgress::Unknown,
        }
    }

    pub async fn get(&self, request_id: &str) -> Option<ActiveTask> {
        self.tasks.lock().await.get(request_id).cloned()
    }

    pub async fn remove(&self, request_id: &str) -> Option<ActiveTask> {
        self.tasks.lock().await.remove(request_id)
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Outstanding requests, oldest first.
    pub async fn list(&self) -> Vec<ActiveTask> {
        let tasks = self.tasks.lock().await;
        let mut list: Vec<ActiveTask> = tasks.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Drop records that have waited longer than `max_age`. Returns how many were removed.
    pub async fn cleanup_older_than(&self, max_age: std::time::Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, t| t.created_at > cutoff);
        let removed = before - tasks.len();
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up stale active tasks");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jarvis_core::Error;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_after_every_provider_replies() {
        let tasks = ActiveTasks::new();
        tasks
            .track("req-1", "get_weather", vec!["weather".into(), "search".into()], json!({"city": "Oslo"}))
            .await;

        let resp = Message::capability_response("weather", "nlu", json!({"temp": 4}), "req-1", "m-1");
        assert!(matches!(
            tasks.record_reply(&resp).await,
            ReplyProgress::Pending { remaining: 1 }
        ));
        assert_eq!(tasks.get("req-1").await.unwrap().outstanding(), vec!["search".to_string()]);

        let err = Message::error("search", "nlu", &Error::timeout("slow").to_response(), "req-1", Some("m-2"));
        match tasks.record_reply(&err).await {
            ReplyProgress::Complete(task) => {
                assert_eq!(task.responses.len(), 1);
                assert_eq!(task.errors[0].1.error_type, "TimeoutError");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(tasks.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_request_and_non_reply() {
        let tasks = ActiveTasks::new();
        let resp = Message::capability_response("weather", "nlu", json!({}), "nope", "m-1");
        assert!(matches!(tasks.record_reply(&resp).await, ReplyProgress::Unknown));

        tasks.track("req-2", "chat", vec!["chat".into()], Value::Null).await;
        let req = Message::capability_request("chat", "nlu", "chat", Value::Null, "req-2");
        assert!(matches!(tasks.record_reply(&req).await, ReplyProgress::Unknown));
        assert_eq!(tasks.len().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_older_than() {
        let tasks = ActiveTasks::new();
        tasks.track("old", "chat", vec!["chat".into()], Value::Null).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tasks.track("new", "chat", vec!["chat".into()], Value::Null).await;

        assert_eq!(tasks.cleanup_older_than(std::time::Duration::from_millis(10)).await, 1);
        assert!(tasks.get("old").await.is_none());
        assert!(tasks.get("new").await.is_some());
    }
}
