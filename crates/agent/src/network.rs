use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use jarvis_core::config::{Config, NetworkConfig};
use jarvis_core::{Error, Message, MessageKind, Result};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{dispatch, MessageHandler};
use crate::aggregator::ResponseAggregator;

struct AgentSlot {
    agent: Arc<dyn MessageHandler>,
    lane: mpsc::UnboundedSender<Message>,
}

struct NetworkInner {
    config: NetworkConfig,
    tx: mpsc::Sender<Message>,
    /// Parked here while the delivery loop is not running.
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    agents: RwLock<HashMap<String, AgentSlot>>,
    /// capability -> providers, in registration order.
    registry: RwLock<HashMap<String, Vec<String>>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    aggregator: ResponseAggregator,
    shutdown_tx: broadcast::Sender<()>,
    delivery: Mutex<Option<JoinHandle<Option<mpsc::Receiver<Message>>>>>,
}

/// In-process message bus and capability registry.
///
/// Cloning is cheap; every clone is the same network. Agents only ever hold a
/// [`WeakNetwork`].
#[derive(Clone)]
pub struct AgentNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Clone)]
pub struct WeakNetwork {
    inner: Weak<NetworkInner>,
}

impl WeakNetwork {
    pub fn upgrade(&self) -> Option<AgentNetwork> {
        self.inner.upgrade().map(|inner| AgentNetwork { inner })
    }
}

/// Pending `wait_for_response`, registered before the request goes out.
pub struct ResponseWaiter {
    request_id: String,
    rx: oneshot::Receiver<Message>,
    network: WeakNetwork,
}

impl ResponseWaiter {
    /// First `capability_response` or `error` for the request, or `Error::Timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(Error::Network(format!(
                "response waiter for '{}' was dropped",
                self.request_id
            ))),
            Err(_) => {
                if let Some(network) = self.network.upgrade() {
                    network.inner.waiters.lock().await.remove(&self.request_id);
                }
                Err(Error::Timeout {
                    message: format!(
                        "No response for request '{}' within {}ms",
                        self.request_id,
                        timeout.as_millis()
                    ),
                    attempts: None,
                })
            }
        }
    }
}

fn not_found(capability: &str) -> Error {
    Error::CapabilityNotFound(format!("No agent is available to handle '{}'", capability))
}

impl AgentNetwork {
    pub fn new(config: &Config) -> Self {
        Self::with_aggregator(config.network.clone(), ResponseAggregator::new(&config.aggregator))
    }

    pub fn with_aggregator(config: NetworkConfig, aggregator: ResponseAggregator) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(NetworkInner {
                config,
                tx,
                rx: Mutex::new(Some(rx)),
                agents: RwLock::new(HashMap::new()),
                registry: RwLock::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
                aggregator,
                shutdown_tx,
                delivery: Mutex::new(None),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakNetwork {
        WeakNetwork {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn aggregator(&self) -> &ResponseAggregator {
        &self.inner.aggregator
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Add `agent`, record its capabilities and start its delivery lane.
    /// A second agent with the same name replaces the first.
    pub async fn register_agent(&self, agent: Arc<dyn MessageHandler>) {
        let name = agent.name().to_string();
        agent.core().attach(self.downgrade());

        let (lane_tx, lane_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(agent.clone(), lane_rx, self.downgrade()));

        let replaced = self
            .inner
            .agents
            .write()
            .await
            .insert(
                name.clone(),
                AgentSlot {
                    agent: agent.clone(),
                    lane: lane_tx,
                },
            )
            .is_some();
        if replaced {
            warn!(agent = %name, "Replacing agent registered under the same name");
        }

        {
            let mut registry = self.inner.registry.write().await;
            for providers in registry.values_mut() {
                providers.retain(|p| p != &name);
            }
            for capability in agent.capabilities() {
                registry.entry(capability.clone()).or_default().push(name.clone());
            }
            registry.retain(|_, providers| !providers.is_empty());
        }

        info!(
            agent = %name,
            capabilities = ?agent.capabilities(),
            "Agent registered"
        );
    }

    /// Remove an agent and its capability entries. Its lane drains and exits.
    pub async fn unregister_agent(&self, name: &str) -> bool {
        let removed = self.inner.agents.write().await.remove(name).is_some();
        if removed {
            let mut registry = self.inner.registry.write().await;
            for providers in registry.values_mut() {
                providers.retain(|p| p != name);
            }
            registry.retain(|_, providers| !providers.is_empty());
            info!(agent = %name, "Agent unregistered");
        }
        removed
    }

    /// Queue a message for delivery. Waits only for queue capacity.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.inner
            .tx
            .send(message)
            .await
            .map_err(|_| Error::Network("agent network queue is closed".to_string()))
    }

    pub async fn broadcast(&self, from_agent: &str, kind: MessageKind, content: Value, request_id: &str) -> Result<()> {
        self.send_message(Message::broadcast(from_agent, kind, content, request_id))
            .await
    }

    /// Send one `capability_request` to every provider of `capability` and
    /// return them. No providers yields an empty list.
    pub async fn request_capability(
        &self,
        from_agent: &str,
        capability: &str,
        data: Value,
        request_id: &str,
    ) -> Result<Vec<String>> {
        let providers = self.providers_for(capability).await;
        if providers.is_empty() {
            warn!(capability, from = from_agent, request_id, "No providers for capability");
            return Ok(providers);
        }

        for provider in &providers {
            let msg = Message::capability_request(from_agent, provider, capability, data.clone(), request_id);
            self.send_message(msg).await?;
        }
        debug!(
            capability,
            from = from_agent,
            request_id,
            providers = providers.len(),
            "Capability requested"
        );
        Ok(providers)
    }

    /// Like [`request_capability`](Self::request_capability), but re-routes to
    /// the configured fallback capability when nobody provides `capability`.
    pub async fn request_capability_or_fallback(
        &self,
        from_agent: &str,
        capability: &str,
        data: Value,
        request_id: &str,
    ) -> Result<Vec<String>> {
        let providers = self
            .request_capability(from_agent, capability, data.clone(), request_id)
            .await?;
        if !providers.is_empty() {
            return Ok(providers);
        }

        let fallback = match self.inner.config.fallback() {
            Some(f) if f != capability => f.to_string(),
            _ => return Err(not_found(capability)),
        };

        let routed = match data {
            Value::Object(mut fields) => {
                fields.insert("original_capability".to_string(), json!(capability));
                Value::Object(fields)
            }
            other => json!({ "original_capability": capability, "data": other }),
        };
        let providers = self
            .request_capability(from_agent, &fallback, routed, request_id)
            .await?;
        if providers.is_empty() {
            return Err(not_found(capability));
        }
        info!(capability, fallback = %fallback, request_id, "Routed request to fallback capability");
        Ok(providers)
    }

    /// Register interest in the first reply for `request_id`. Call before sending.
    pub async fn expect_response(&self, request_id: &str) -> ResponseWaiter {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .waiters
            .lock()
            .await
            .insert(request_id.to_string(), tx)
            .is_some()
        {
            warn!(request_id, "Replaced an existing response waiter");
        }
        ResponseWaiter {
            request_id: request_id.to_string(),
            rx,
            network: self.downgrade(),
        }
    }

    pub async fn wait_for_response(&self, request_id: &str, timeout: Duration) -> Result<Message> {
        self.expect_response(request_id).await.wait(timeout).await
    }

    pub async fn providers_for(&self, capability: &str) -> Vec<String> {
        self.inner
            .registry
            .read()
            .await
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn has_capability(&self, capability: &str) -> bool {
        self.inner
            .registry
            .read()
            .await
            .get(capability)
            .map_or(false, |p| !p.is_empty())
    }

    /// Snapshot of the capability registry.
    pub async fn capabilities(&self) -> BTreeMap<String, Vec<String>> {
        self.inner
            .registry
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.agents.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn agent(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.inner
            .agents
            .read()
            .await
            .get(name)
            .map(|slot| slot.agent.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.delivery.lock().await.is_some()
    }

    /// Spawn the delivery loop and the aggregator sweep.
    pub async fn start(&self) {
        let mut delivery = self.inner.delivery.lock().await;
        if delivery.is_some() {
            warn!("Agent network already running");
            return;
        }
        let Some(rx) = self.inner.rx.lock().await.take() else {
            error!("Agent network queue receiver missing, cannot start");
            return;
        };
        let shutdown = self.inner.shutdown_tx.subscribe();
        *delivery = Some(tokio::spawn(run_delivery(self.downgrade(), rx, shutdown)));
        drop(delivery);

        self.inner.aggregator.start().await;
        info!(queue_size = self.inner.config.queue_size, "Agent network started");
    }

    /// Stop delivery and wait for the loop to exit. Queued messages stay queued.
    pub async fn stop(&self) {
        let handle = self.inner.delivery.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.inner.shutdown_tx.send(());
            match handle.await {
                Ok(Some(rx)) => *self.inner.rx.lock().await = Some(rx),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Delivery loop task failed"),
            }
        }
        self.inner.aggregator.stop().await;
        info!("Agent network stopped");
    }

    /// Feed reply messages to waiters and the aggregator. True if anyone took it.
    async fn resolve_reply(&self, msg: &Message) -> bool {
        let mut consumed = false;

        let waiter = self.inner.waiters.lock().await.remove(msg.request_id());
        if let Some(tx) = waiter {
            consumed = tx.send(msg.clone()).is_ok();
        }

        let is_error = matches!(msg.kind(), MessageKind::Error);
        if self
            .inner
            .aggregator
            .add_response(msg.request_id(), msg.from_agent(), msg.content().clone(), is_error)
            .await
        {
            consumed = true;
        }
        consumed
    }

    async fn deliver(&self, msg: Message) {
        let consumed = msg.kind().is_reply() && self.resolve_reply(&msg).await;

        let agents = self.inner.agents.read().await;
        match msg.to_agent().map(str::to_string) {
            Some(target) => match agents.get(&target) {
                Some(slot) => {
                    if slot.lane.send(msg).is_err() {
                        warn!(agent = %target, "Agent lane closed, message dropped");
                    }
                }
                None if consumed => {
                    debug!(target = %target, kind = %msg.kind(), "Reply consumed without a registered recipient");
                }
                None => {
                    warn!(
                        target = %target,
                        from = %msg.from_agent(),
                        kind = %msg.kind(),
                        "Message for unknown agent dropped"
                    );
                }
            },
            None => {
                for (name, slot) in agents.iter() {
                    if name == msg.from_agent() {
                        continue;
                    }
                    if slot.lane.send(msg.clone()).is_err() {
                        warn!(agent = %name, "Agent lane closed, broadcast skipped");
                    }
                }
            }
        }
    }
}

async fn run_delivery(
    network: WeakNetwork,
    mut rx: mpsc::Receiver<Message>,
    mut shutdown: broadcast::Receiver<()>,
) -> Option<mpsc::Receiver<Message>> {
    debug!("Delivery loop started");
    let mut stopped = false;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                stopped = true;
                break;
            }
            next = rx.recv() => {
                let Some(msg) = next else { break };
                let Some(net) = network.upgrade() else { break };
                net.deliver(msg).await;
            }
        }
    }

    debug!(stopped, "Delivery loop exited");
    stopped.then_some(rx)
}

/// One task per agent: handlers start in arrival order and run concurrently.
async fn run_lane(
    agent: Arc<dyn MessageHandler>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    network: WeakNetwork,
) {
    let mut in_flight = FuturesUnordered::new();

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(msg) => in_flight.push(handle_message(agent.clone(), msg, network.clone())),
                None => break,
            },
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
        }
    }

    while in_flight.next().await.is_some() {}
    debug!(agent = %agent.name(), "Agent lane closed");
}

async fn handle_message(agent: Arc<dyn MessageHandler>, msg: Message, network: WeakNetwork) {
    let outcome = AssertUnwindSafe(dispatch(agent.as_ref(), &msg))
        .catch_unwind()
        .await;

    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(payload) => Error::Agent(format!("handler panicked: {}", panic_message(payload.as_ref()))),
    };

    error!(
        agent = %agent.name(),
        kind = %msg.kind(),
        from = %msg.from_agent(),
        request_id = %msg.request_id(),
        error = %err,
        "Message handler failed"
    );

    if !matches!(msg.kind(), MessageKind::CapabilityRequest) {
        return;
    }
    let Some(network) = network.upgrade() else {
        return;
    };
    let reply = Message::error(
        agent.name(),
        msg.from_agent(),
        &err.to_response(),
        msg.request_id(),
        Some(msg.id()),
    );
    if let Err(e) = network.send_message(reply).await {
        warn!(error = %e, "Failed to return handler error to requester");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentCore};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Records everything it receives; answers requests unless told to fail.
    struct Recorder {
        core: AgentCore,
        log: StdMutex<Vec<Message>>,
        mode: &'static str,
    }

    impl Recorder {
        fn new(name: &str, capabilities: &[&str], mode: &'static str) -> Arc<Self> {
            Arc::new(Self {
                core: AgentCore::new(name, capabilities.iter().copied()),
                log: StdMutex::new(Vec::new()),
                mode,
            })
        }

        fn received(&self) -> Vec<Message> {
            self.log.lock().unwrap().clone()
        }
    }

    impl Agent for Recorder {
        fn core(&self) -> &AgentCore {
            &self.core
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_capability_request(&self, msg: &Message) -> Result<()> {
            self.log.lock().unwrap().push(msg.clone());
            match self.mode {
                "fail" => Err(Error::InvalidParameter("date must be ISO-8601".into())),
                "panic" => panic!("bridge driver crashed"),
                "silent" => Ok(()),
                _ => {
                    self.core
                        .send_capability_response(msg, json!({"response": format!("{} ok", self.name())}))
                        .await
                }
            }
        }

        async fn on_capability_response(&self, msg: &Message) -> Result<()> {
            self.log.lock().unwrap().push(msg.clone());
            self.core.record_reply(msg).await;
            Ok(())
        }

        async fn on_error(&self, msg: &Message) -> Result<()> {
            self.log.lock().unwrap().push(msg.clone());
            Ok(())
        }

        async fn on_custom(&self, _kind: &str, msg: &Message) -> Result<()> {
            self.log.lock().unwrap().push(msg.clone());
            Ok(())
        }
    }

    async fn network() -> AgentNetwork {
        let net = AgentNetwork::new(&Config::default());
        net.start().await;
        net
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_request_reaches_exactly_the_providers() {
        let net = network().await;
        let a = Recorder::new("weather_a", &["get_weather"], "silent");
        let b = Recorder::new("weather_b", &["get_weather", "chat"], "silent");
        let c = Recorder::new("lights", &["lights_on"], "silent");
        for agent in [a.clone(), b.clone(), c.clone()] {
            net.register_agent(agent).await;
        }

        let providers = net
            .request_capability("nlu", "get_weather", json!({"city": "Bergen"}), "req-1")
            .await
            .unwrap();
        assert_eq!(providers, vec!["weather_a", "weather_b"]);
        settle().await;

        for agent in [&a, &b] {
            let got = agent.received();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].capability(), Some("get_weather"));
            assert_eq!(got[0].data()["city"], "Bergen");
        }
        assert!(c.received().is_empty());
        net.stop().await;
    }

    #[tokio::test]
    async fn test_no_provider_returns_empty_list() {
        let net = network().await;
        let providers = net
            .request_capability("nlu", "teleport", Value::Null, "req-2")
            .await
            .unwrap();
        assert!(providers.is_empty());
        net.stop().await;
    }

    #[tokio::test]
    async fn test_fifo_per_sender_and_target() {
        let net = network().await;
        let sink = Recorder::new("sink", &["log"], "silent");
        net.register_agent(sink.clone()).await;

        for i in 0..100 {
            let msg = Message::new("src", Some("sink"), MessageKind::Custom("seq".into()), json!(i), "req-3");
            net.send_message(msg).await.unwrap();
        }
        settle().await;

        let order: Vec<i64> = sink
            .received()
            .iter()
            .map(|m| m.content().as_i64().unwrap())
            .collect();
        assert_eq!(order, (0..100).collect::<Vec<i64>>());
        net.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let net = network().await;
        let a = Recorder::new("a", &[], "silent");
        let b = Recorder::new("b", &[], "silent");
        net.register_agent(a.clone()).await;
        net.register_agent(b.clone()).await;

        net.broadcast("a", MessageKind::Custom("status".into()), json!({}), "req-4")
            .await
            .unwrap();
        settle().await;
        assert!(a.received().is_empty());
        assert_eq!(b.received().len(), 1);
        assert!(b.received()[0].is_broadcast());
        net.stop().await;
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_message() {
        let net = network().await;
        let cal = Recorder::new("calendar", &["add_event"], "fail");
        let nlu = Recorder::new("nlu", &[], "silent");
        net.register_agent(cal.clone()).await;
        net.register_agent(nlu.clone()).await;

        let waiter = net.expect_response("req-5").await;
        net.request_capability("nlu", "add_event", json!({"date": "tomorrow"}), "req-5")
            .await
            .unwrap();
        let reply = waiter.wait(Duration::from_secs(2)).await.unwrap();

        assert_eq!(reply.kind(), &MessageKind::Error);
        let err = reply.error_response().unwrap();
        assert_eq!(err.error_type, "InvalidParameterError");
        assert_eq!(err.message, "date must be ISO-8601");
        assert_eq!(reply.reply_to(), Some(cal.received()[0].id()));

        settle().await;
        assert_eq!(nlu.received().len(), 1);
        net.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_delivery() {
        let net = network().await;
        let roku = Recorder::new("roku", &["roku_power"], "panic");
        let chat = Recorder::new("chat", &["chat"], "echo");
        net.register_agent(roku).await;
        net.register_agent(chat).await;

        let reply = {
            let waiter = net.expect_response("req-6").await;
            net.request_capability("nlu", "roku_power", Value::Null, "req-6")
                .await
                .unwrap();
            waiter.wait(Duration::from_secs(2)).await.unwrap()
        };
        let err = reply.error_response().unwrap();
        assert_eq!(err.error_type, "AgentError");
        assert!(err.message.contains("bridge driver crashed"));

        let waiter = net.expect_response("req-7").await;
        net.request_capability("nlu", "chat", Value::Null, "req-7").await.unwrap();
        let ok = waiter.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(ok.content()["response"], "chat ok");
        net.stop().await;
    }

    #[tokio::test]
    async fn test_fallback_routes_to_chat() {
        let net = network().await;
        let chat = Recorder::new("chat", &["chat"], "silent");
        net.register_agent(chat.clone()).await;

        let providers = net
            .request_capability_or_fallback("nlu", "play_music", json!({"song": "x"}), "req-8")
            .await
            .unwrap();
        assert_eq!(providers, vec!["chat"]);
        settle().await;
        let got = chat.received();
        assert_eq!(got[0].capability(), Some("chat"));
        assert_eq!(got[0].data()["original_capability"], "play_music");
        assert_eq!(got[0].data()["song"], "x");
        net.stop().await;
    }

    #[tokio::test]
    async fn test_missing_fallback_is_capability_not_found() {
        let net = network().await;
        let err = net
            .request_capability_or_fallback("nlu", "play_music", Value::Null, "req-9")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityNotFound(_)));
        assert!(err.to_string().contains("play_music"));
        net.stop().await;
    }

    #[tokio::test]
    async fn test_wait_for_response_times_out() {
        let net = network().await;
        let err = net
            .wait_for_response("never", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        net.stop().await;
    }

    #[tokio::test]
    async fn test_reregistering_replaces_capabilities() {
        let net = network().await;
        net.register_agent(Recorder::new("hue", &["lights_on", "lights_off"], "silent"))
            .await;
        net.register_agent(Recorder::new("hue", &["lights_on"], "silent")).await;

        assert_eq!(net.providers_for("lights_on").await, vec!["hue"]);
        assert!(!net.has_capability("lights_off").await);
        assert_eq!(net.agent_names().await, vec!["hue"]);

        assert!(net.unregister_agent("hue").await);
        assert!(net.capabilities().await.is_empty());
        net.stop().await;
    }

    #[tokio::test]
    async fn test_agent_request_tracks_active_task() {
        let net = network().await;
        let nlu = Recorder::new("nlu", &[], "silent");
        net.register_agent(nlu.clone()).await;
        net.register_agent(Recorder::new("w1", &["get_weather"], "echo")).await;
        net.register_agent(Recorder::new("w2", &["get_weather"], "echo")).await;

        let providers = nlu
            .core
            .request_capability("get_weather", json!({}), "req-10")
            .await
            .unwrap();
        assert_eq!(providers.len(), 2);
        assert!(nlu.core.active_tasks().get("req-10").await.is_some());

        settle().await;
        assert!(nlu.core.active_tasks().get("req-10").await.is_none());
        assert_eq!(nlu.received().len(), 2);
        net.stop().await;
    }

    #[tokio::test]
    async fn test_restart_keeps_queue() {
        let net = network().await;
        let sink = Recorder::new("sink", &[], "silent");
        net.register_agent(sink.clone()).await;
        net.stop().await;
        assert!(!net.is_running().await);

        let msg = Message::new("src", Some("sink"), MessageKind::Custom("late".into()), json!(1), "r");
        net.send_message(msg).await.unwrap();
        net.start().await;
        settle().await;
        assert_eq!(sink.received().len(), 1);
        net.stop().await;
    }
}
