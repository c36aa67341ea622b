use async_trait::async_trait;
use jarvis_core::{Error, Message, MessageKind, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::correlation::{ActiveTasks, ReplyProgress};
use crate::network::{AgentNetwork, WeakNetwork};

/// State every agent carries: identity, capability set, the back-reference
/// to its network and the requests it has initiated.
pub struct AgentCore {
    name: String,
    capabilities: BTreeSet<String>,
    network: OnceLock<WeakNetwork>,
    active_tasks: ActiveTasks,
}

impl AgentCore {
    pub fn new<I, S>(name: &str, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            network: OnceLock::new(),
            active_tasks: ActiveTasks::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn active_tasks(&self) -> &ActiveTasks {
        &self.active_tasks
    }

    pub(crate) fn attach(&self, network: WeakNetwork) {
        if self.network.set(network).is_err() {
            warn!(agent = %self.name, "Agent already attached to a network, keeping the first");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.network.get().is_some()
    }

    /// The network this agent was registered with, if it is still alive.
    pub fn network(&self) -> Result<AgentNetwork> {
        self.network
            .get()
            .and_then(WeakNetwork::upgrade)
            .ok_or_else(|| Error::Agent(format!("agent '{}' is not attached to a live network", self.name)))
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.network()?.send_message(message).await
    }

    /// Ask every provider of `capability` and remember whom we are waiting on.
    pub async fn request_capability(&self, capability: &str, data: Value, request_id: &str) -> Result<Vec<String>> {
        let network = self.network()?;
        // Track first so a fast reply cannot beat the record.
        let expected = network.providers_for(capability).await;
        if !expected.is_empty() {
            self.active_tasks
                .track(request_id, capability, expected, data.clone())
                .await;
        }
        let providers = network
            .request_capability(&self.name, capability, data, request_id)
            .await;
        if !matches!(&providers, Ok(p) if !p.is_empty()) {
            self.active_tasks.remove(request_id).await;
        }
        providers
    }

    /// Answer `original` with `result`, keeping its request id and replying to its message id.
    pub async fn send_capability_response(&self, original: &Message, result: Value) -> Result<()> {
        let reply = Message::capability_response(
            &self.name,
            original.from_agent(),
            result,
            original.request_id(),
            original.id(),
        );
        self.send_message(reply).await
    }

    pub async fn send_error(&self, original: &Message, error: &Error) -> Result<()> {
        let reply = Message::error(
            &self.name,
            original.from_agent(),
            &error.to_response(),
            original.request_id(),
            Some(original.id()),
        );
        self.send_message(reply).await
    }

    pub async fn record_reply(&self, msg: &Message) -> ReplyProgress {
        self.active_tasks.record_reply(msg).await
    }
}

/// Identity half of an agent.
pub trait Agent: Send + Sync {
    fn core(&self) -> &AgentCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn capabilities(&self) -> &BTreeSet<String> {
        self.core().capabilities()
    }

    fn description(&self) -> &str {
        ""
    }
}

/// One handler per message kind. Only capability requests must be handled;
/// replies default to updating the agent's own active tasks.
#[async_trait]
pub trait MessageHandler: Agent {
    async fn on_capability_request(&self, msg: &Message) -> Result<()>;

    async fn on_capability_response(&self, msg: &Message) -> Result<()> {
        if let ReplyProgress::Complete(task) = self.core().record_reply(msg).await {
            debug!(
                agent = %self.name(),
                request_id = %task.request_id,
                responses = task.responses.len(),
                "All providers answered"
            );
        }
        Ok(())
    }

    async fn on_error(&self, msg: &Message) -> Result<()> {
        if let Some(err) = msg.error_response() {
            warn!(
                agent = %self.name(),
                from = %msg.from_agent(),
                request_id = %msg.request_id(),
                error_type = %err.error_type,
                error = %err.message,
                "Received error reply"
            );
        }
        self.core().record_reply(msg).await;
        Ok(())
    }

    async fn on_custom(&self, kind: &str, msg: &Message) -> Result<()> {
        debug!(agent = %self.name(), kind, from = %msg.from_agent(), "Ignoring custom message");
        Ok(())
    }
}

/// Route `msg` to the handler for its kind.
pub async fn dispatch(agent: &dyn MessageHandler, msg: &Message) -> Result<()> {
    match msg.kind() {
        MessageKind::CapabilityRequest => agent.on_capability_request(msg).await,
        MessageKind::CapabilityResponse => agent.on_capability_response(msg).await,
        MessageKind::Error => agent.on_error(msg).await,
        MessageKind::Custom(kind) => agent.on_custom(kind, msg).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Echo {
        core: AgentCore,
        seen: Mutex<Vec<String>>,
    }

    impl Agent for Echo {
        fn core(&self) -> &AgentCore {
            &self.core
        }
    }

    #[async_trait]
    impl MessageHandler for Echo {
        async fn on_capability_request(&self, msg: &Message) -> Result<()> {
            self.seen.lock().unwrap().push(format!("request:{}", msg.capability().unwrap_or("")));
            Ok(())
        }

        async fn on_custom(&self, kind: &str, _msg: &Message) -> Result<()> {
            self.seen.lock().unwrap().push(format!("custom:{}", kind));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let echo = Echo {
            core: AgentCore::new("echo", ["chat"]),
            seen: Mutex::new(Vec::new()),
        };
        let req = Message::capability_request("nlu", "echo", "chat", json!({}), "r1");
        dispatch(&echo, &req).await.unwrap();
        let ping = Message::new("nlu", Some("echo"), MessageKind::Custom("ping".into()), json!({}), "r2");
        dispatch(&echo, &ping).await.unwrap();
        let resp = Message::capability_response("x", "echo", json!({}), "r3", "m");
        dispatch(&echo, &resp).await.unwrap();

        assert_eq!(*echo.seen.lock().unwrap(), vec!["request:chat", "custom:ping"]);
        assert_eq!(echo.name(), "echo");
        assert!(echo.capabilities().contains("chat"));
    }

    #[tokio::test]
    async fn test_detached_core_cannot_send() {
        let core = AgentCore::new("lonely", Vec::<String>::new());
        assert!(!core.is_attached());
        let err = core
            .request_capability("chat", Value::Null, "r1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Agent(_)));
    }
}
