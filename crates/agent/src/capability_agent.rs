use async_trait::async_trait;
use jarvis_core::{Capability, CapabilityDescriptor, Error, Message, Result};
use jarvis_resilience::CircuitBreakerRegistry;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::agent::{Agent, AgentCore, MessageHandler};

/// Agent that answers capability requests by invoking local [`Capability`]
/// implementations, optionally each behind its own circuit breaker.
pub struct CapabilityAgent {
    core: AgentCore,
    description: String,
    capabilities: HashMap<String, Arc<dyn Capability>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl CapabilityAgent {
    pub fn new(name: &str, capabilities: Vec<Arc<dyn Capability>>) -> Self {
        let capabilities: HashMap<String, Arc<dyn Capability>> = capabilities
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        Self {
            core: AgentCore::new(name, capabilities.keys().cloned()),
            description: String::new(),
            capabilities,
            breakers: None,
        }
    }

    /// Guard every invocation with the breaker named after the capability.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        let mut list: Vec<CapabilityDescriptor> = self.capabilities.values().map(|c| c.descriptor()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Run `capability` directly, bypassing the network.
    pub async fn invoke(&self, capability: &str, data: Value) -> Result<Value> {
        let cap = self.capabilities.get(capability).ok_or_else(|| {
            Error::CapabilityNotFound(format!("{} does not provide '{}'", self.name(), capability))
        })?;
        match &self.breakers {
            Some(registry) => {
                let breaker = registry.get(capability);
                breaker.call(|| cap.invoke(data)).await
            }
            None => cap.invoke(data).await,
        }
    }
}

impl Agent for CapabilityAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn description(&self) -> &str {
        &self.description
    }
}

#[async_trait]
impl MessageHandler for CapabilityAgent {
    async fn on_capability_request(&self, msg: &Message) -> Result<()> {
        let capability = msg.capability().unwrap_or_default();
        debug!(agent = %self.name(), capability, request_id = %msg.request_id(), "Invoking capability");
        let result = self.invoke(capability, msg.data().clone()).await?;
        self.core.send_capability_response(msg, result).await
    }
}

/// Closure-backed [`Capability`].
pub struct FnCapability<F> {
    name: String,
    description: String,
    handler: F,
}

impl<F, Fut> FnCapability<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    pub fn new(name: &str, handler: F) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            handler,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        (self.handler)(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::AgentNetwork;
    use jarvis_core::{Config, MessageKind};
    use jarvis_resilience::{CircuitBreakerConfig, CircuitState};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn weather() -> Arc<dyn Capability> {
        Arc::new(
            FnCapability::new("weather", |data: Value| async move {
                let city = data["parameters"]["city"].as_str().unwrap_or("here").to_string();
                Ok(json!({ "response": format!("Sunny in {}", city) }))
            })
            .with_description("Current conditions"),
        )
    }

    #[tokio::test]
    async fn test_serves_requests_over_the_network() {
        let net = AgentNetwork::new(&Config::default());
        let agent = CapabilityAgent::new("weather_agent", vec![weather()]).with_description("Weather lookups");
        assert_eq!(agent.descriptors()[0].description, "Current conditions");
        net.register_agent(Arc::new(agent)).await;
        net.start().await;

        let waiter = net.expect_response("w1").await;
        net.request_capability("jarvis", "weather", json!({"parameters": {"city": "Oslo"}}), "w1")
            .await
            .unwrap();
        let reply = waiter.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(*reply.kind(), MessageKind::CapabilityResponse);
        assert_eq!(reply.content()["response"], "Sunny in Oslo");
        net.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_capability_is_not_found() {
        let agent = CapabilityAgent::new("weather_agent", vec![weather()]);
        let err = agent.invoke("forecast", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::CapabilityNotFound(_)));
    }

    #[tokio::test]
    async fn test_breaker_stops_calling_failing_capability() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let flaky: Arc<dyn Capability> = Arc::new(FnCapability::new("search", move |_data: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Value, _>(Error::service_unavailable("search backend down", Some(10))) }
        }));
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }));
        let agent = CapabilityAgent::new("search_agent", vec![flaky]).with_breakers(registry.clone());

        for _ in 0..3 {
            assert!(agent.invoke("search", Value::Null).await.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.get("search").state(), CircuitState::Open);
    }
}
