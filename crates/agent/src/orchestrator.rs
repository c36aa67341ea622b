use async_trait::async_trait;
use futures::future::join_all;
use jarvis_core::config::OrchestratorConfig;
use jarvis_core::{Error, Message, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentCore, MessageHandler};
use crate::aggregator::AggregationStrategy;
use crate::dag::DependencyGraph;
use crate::network::AgentNetwork;

pub const ORCHESTRATE_CAPABILITY: &str = "orchestrate_tasks";
pub const NO_AGENT_AVAILABLE: &str = "No agent is available to handle that request.";

const SUMMARY_LINE_LIMIT: usize = 280;

/// One capability invocation inside an orchestrated request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    pub capability: String,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_deserializing)]
    pub result: Option<Value>,
}

impl Task {
    pub fn new(capability: &str) -> Self {
        Self {
            capability: capability.to_string(),
            parameters: json!({}),
            ..Self::default()
        }
    }

    pub fn assigned_to(mut self, agent: &str) -> Self {
        self.assigned_agent = Some(agent.to_string());
        self
    }

    pub fn depending_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_intent(mut self, intent: &str) -> Self {
        self.intent = intent.to_string();
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A DAG request as produced by request analysis.
#[derive(Debug, Clone, Default)]
pub struct DagRequest {
    pub request_id: String,
    pub graph: DependencyGraph,
    /// The user's original utterance, used when a capability has no intent.
    pub prompt: String,
    pub intents: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, Value>,
}

impl DagRequest {
    pub fn new(request_id: &str, graph: DependencyGraph) -> Self {
        Self {
            request_id: request_id.to_string(),
            graph,
            ..Self::default()
        }
    }

    /// Parse `{"dag": {...}, "prompt": "...", "intents": {...}, "parameters": {...}}`.
    pub fn from_data(request_id: &str, data: &Value) -> Result<Self> {
        let graph = DependencyGraph::from_json(data.get("dag").unwrap_or(&Value::Null))?;
        let intents = match data.get("intents") {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => BTreeMap::new(),
        };
        let parameters = match data.get("parameters") {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => BTreeMap::new(),
        };
        Ok(Self {
            request_id: request_id.to_string(),
            graph,
            prompt: data
                .get("prompt")
                .and_then(|p| p.as_str())
                .unwrap_or_default()
                .to_string(),
            intents,
            parameters,
        })
    }
}

/// Aggregate outcome of an orchestrated request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestrationResult {
    pub request_id: String,
    /// capability -> result; failures are `{"error": ...}`.
    pub results: BTreeMap<String, Value>,
    /// Completed steps in execution order: `{capability, from_agent, result, wave}`.
    pub context_history: Vec<Value>,
    /// Capabilities left out because nobody provides them.
    pub dropped: Vec<String>,
    /// A dependency cycle forced sequential execution.
    pub fell_back: bool,
    pub timed_out: Vec<String>,
    /// The executed tasks in plan order, each with its `result` filled in.
    pub tasks: Vec<Task>,
}

impl OrchestrationResult {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// `(capability, message)` for every step that ended in an error.
    pub fn errors(&self) -> Vec<(&str, &str)> {
        self.results
            .iter()
            .filter_map(|(cap, r)| r.get("error").and_then(|e| e.as_str()).map(|e| (cap.as_str(), e)))
            .collect()
    }

    pub fn to_value(&self) -> Value {
        json!({
            "results": self.results,
            "context_history": self.context_history,
            "dropped": self.dropped,
            "fell_back": self.fell_back,
            "timed_out": self.timed_out,
            "tasks": self.tasks,
        })
    }

    /// Short human-readable account, one line per step.
    pub fn summary(&self) -> String {
        if self.results.is_empty() {
            return NO_AGENT_AVAILABLE.to_string();
        }
        self.context_history
            .iter()
            .map(|step| {
                let capability = step["capability"].as_str().unwrap_or("unknown");
                let result = &step["result"];
                let line = if let Some(err) = result.get("error").and_then(|e| e.as_str()) {
                    format!("{}: failed ({})", capability, err)
                } else if let Some(text) = result.get("response").and_then(|r| r.as_str()) {
                    format!("{}: {}", capability, text)
                } else if let Some(text) = result.as_str() {
                    format!("{}: {}", capability, text)
                } else {
                    format!("{}: {}", capability, result)
                };
                truncate(&line, SUMMARY_LINE_LIMIT)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

/// Which earlier results a step sees in `context.previous_results`.
#[derive(Debug, Clone, Copy)]
enum ContextScope {
    /// Only the step's declared dependencies.
    Dependencies,
    /// Declared dependencies, or every earlier step when none are declared.
    EarlierSteps,
}

struct StepOutcome {
    result: Value,
    from_agent: Option<String>,
    timed_out: bool,
}

/// Runs dependency graphs of capability requests over an [`AgentNetwork`].
///
/// Each wave is sent concurrently; the next wave starts once every request in
/// the current one has answered, failed or timed out. Replies are collected
/// through the network's response aggregator, one sub-request per capability.
pub struct DagOrchestrator {
    network: AgentNetwork,
    name: String,
    capability_timeout: Duration,
    request_timeout: Duration,
}

impl DagOrchestrator {
    /// `name` is the sender on every request; replies are addressed to it.
    pub fn new(network: AgentNetwork, name: &str, config: &OrchestratorConfig) -> Self {
        Self {
            network,
            name: name.to_string(),
            capability_timeout: config.capability_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    pub fn with_timeouts(mut self, capability_timeout: Duration, request_timeout: Duration) -> Self {
        self.capability_timeout = capability_timeout;
        self.request_timeout = request_timeout;
        self
    }

    pub async fn execute_graph(&self, request_id: &str, graph: DependencyGraph) -> OrchestrationResult {
        self.execute(DagRequest::new(request_id, graph)).await
    }

    pub async fn execute(&self, request: DagRequest) -> OrchestrationResult {
        let registry = self.network.capabilities().await;
        let (graph, dropped) = request
            .graph
            .retain_known(|c| registry.get(c).map_or(false, |p| !p.is_empty()));
        let plan = graph.plan();

        info!(
            request_id = %request.request_id,
            capabilities = graph.len(),
            waves = plan.waves.len(),
            dropped = dropped.len(),
            fell_back = plan.fell_back,
            "Executing capability graph"
        );

        let tasks: Vec<Task> = graph
            .capabilities()
            .map(|cap| {
                let intent = request.intents.get(cap).cloned().unwrap_or_default();
                let prompt = if !intent.is_empty() {
                    intent.clone()
                } else if !request.prompt.is_empty() {
                    request.prompt.clone()
                } else {
                    format!("Perform '{}'.", cap)
                };
                Task {
                    capability: cap.to_string(),
                    assigned_agent: None,
                    depends_on: graph.dependencies(cap).to_vec(),
                    intent,
                    prompt,
                    parameters: request.parameters.get(cap).cloned().unwrap_or_else(|| json!({})),
                    result: None,
                }
            })
            .collect();

        let index: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.capability.as_str(), i))
            .collect();
        let waves: Vec<Vec<usize>> = plan
            .waves
            .iter()
            .map(|wave| wave.iter().filter_map(|c| index.get(c.as_str()).copied()).collect())
            .collect();
        let keys: Vec<String> = tasks.iter().map(|t| t.capability.clone()).collect();

        let mut result = self
            .run(&request.request_id, tasks, &keys, &waves, ContextScope::Dependencies)
            .await;
        result.dropped = dropped;
        result.fell_back = plan.fell_back;
        result
    }

    /// Run `tasks` strictly in order, one per wave.
    pub async fn execute_sequence(&self, request_id: &str, tasks: Vec<Task>) -> OrchestrationResult {
        let registry = self.network.capabilities().await;
        let agents: HashSet<String> = self.network.agent_names().await.into_iter().collect();

        let mut dropped = Vec::new();
        let mut kept = Vec::new();
        for task in tasks {
            let reachable = match &task.assigned_agent {
                Some(agent) => agents.contains(agent),
                None => registry.get(&task.capability).map_or(false, |p| !p.is_empty()),
            };
            if reachable {
                kept.push(task);
            } else {
                warn!(capability = %task.capability, agent = ?task.assigned_agent, "Task has no reachable agent, skipping");
                dropped.push(task.capability);
            }
        }

        // Repeated capabilities get "#n" suffixes so every step keeps its result.
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let keys: Vec<String> = kept
            .iter()
            .map(|t| {
                let n = seen.entry(t.capability.as_str()).or_insert(0);
                *n += 1;
                if *n == 1 {
                    t.capability.clone()
                } else {
                    format!("{}#{}", t.capability, n)
                }
            })
            .collect();
        let waves: Vec<Vec<usize>> = (0..kept.len()).map(|i| vec![i]).collect();

        info!(request_id, steps = kept.len(), dropped = dropped.len(), "Executing task sequence");
        let mut result = self
            .run(request_id, kept, &keys, &waves, ContextScope::EarlierSteps)
            .await;
        result.dropped = dropped;
        result
    }

    async fn run(
        &self,
        request_id: &str,
        mut tasks: Vec<Task>,
        keys: &[String],
        waves: &[Vec<usize>],
        scope: ContextScope,
    ) -> OrchestrationResult {
        let deadline = Instant::now() + self.request_timeout;
        let mut result = OrchestrationResult {
            request_id: request_id.to_string(),
            ..OrchestrationResult::default()
        };
        let mut responders: HashMap<String, Option<String>> = HashMap::new();

        for (wave_no, wave) in waves.iter().enumerate() {
            if Instant::now() >= deadline {
                for &idx in wave {
                    let key = &keys[idx];
                    warn!(request_id, capability = %key, "Request deadline passed before dispatch");
                    let failed = json!({ "error": "Request timed out before this step could run" });
                    result.context_history.push(json!({
                        "capability": key,
                        "from_agent": Value::Null,
                        "result": failed,
                        "wave": wave_no,
                    }));
                    tasks[idx].result = Some(failed.clone());
                    result.results.insert(key.clone(), failed);
                    result.timed_out.push(key.clone());
                }
                continue;
            }

            let dispatches = wave.iter().map(|&idx| {
                let previous = self.previous_results(&tasks[idx], &result, &responders, scope);
                self.run_step(request_id, &keys[idx], &tasks[idx], previous, deadline)
            });
            let outcomes = join_all(dispatches).await;

            for (&idx, outcome) in wave.iter().zip(outcomes) {
                let key = &keys[idx];
                result.context_history.push(json!({
                    "capability": key,
                    "from_agent": outcome.from_agent,
                    "result": outcome.result,
                    "wave": wave_no,
                }));
                if outcome.timed_out {
                    result.timed_out.push(key.clone());
                }
                responders.insert(key.clone(), outcome.from_agent);
                tasks[idx].result = Some(outcome.result.clone());
                result.results.insert(key.clone(), outcome.result);
            }
        }
        result.tasks = tasks;

        debug!(
            request_id,
            steps = result.results.len(),
            errors = result.errors().len(),
            "Orchestration finished"
        );
        result
    }

    fn previous_results(
        &self,
        task: &Task,
        so_far: &OrchestrationResult,
        responders: &HashMap<String, Option<String>>,
        scope: ContextScope,
    ) -> Vec<Value> {
        let entry = |key: &str, value: &Value| {
            json!({
                "capability": key,
                "from_agent": responders.get(key).cloned().flatten(),
                "result": value,
            })
        };

        match scope {
            ContextScope::EarlierSteps if task.depends_on.is_empty() => so_far
                .context_history
                .iter()
                .map(|step| {
                    let key = step["capability"].as_str().unwrap_or_default();
                    entry(key, &step["result"])
                })
                .collect(),
            _ => task
                .depends_on
                .iter()
                .filter_map(|dep| so_far.results.get(dep).map(|r| entry(dep, r)))
                .collect(),
        }
    }

    async fn run_step(
        &self,
        request_id: &str,
        key: &str,
        task: &Task,
        previous: Vec<Value>,
        deadline: Instant,
    ) -> StepOutcome {
        let sub_id = format!("{}:{}", request_id, key);
        let data = json!({
            "intent": task.intent,
            "prompt": task.prompt,
            "parameters": task.parameters,
            "context": { "previous_results": previous },
        });

        let expected = match &task.assigned_agent {
            Some(agent) => vec![agent.clone()],
            None => self.network.providers_for(&task.capability).await,
        };
        let budget = self
            .capability_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let pending = self
            .network
            .aggregator()
            .register_request(&sub_id, &task.capability, expected, AggregationStrategy::First, Some(budget))
            .await;

        let sent = match &task.assigned_agent {
            Some(agent) => {
                let msg = Message::capability_request(&self.name, agent, &task.capability, data, &sub_id);
                self.network.send_message(msg).await
            }
            None => self
                .network
                .request_capability(&self.name, &task.capability, data, &sub_id)
                .await
                .map(|_| ()),
        };
        if let Err(e) = sent {
            warn!(request_id, capability = %task.capability, error = %e, "Failed to dispatch step");
            self.network.aggregator().expire(&sub_id).await;
            return StepOutcome {
                result: json!({ "error": e.to_string() }),
                from_agent: None,
                timed_out: false,
            };
        }
        debug!(request_id, capability = %task.capability, sub_request = %sub_id, "Step dispatched");

        let response = pending.wait().await;
        let from_agent = response.received_from.first().cloned();
        if response.timed_out && from_agent.is_none() {
            warn!(
                request_id,
                capability = %task.capability,
                budget_ms = budget.as_millis() as u64,
                "Step timed out"
            );
            return StepOutcome {
                result: json!({ "error": format!("Timed out waiting for '{}'", task.capability) }),
                from_agent,
                timed_out: true,
            };
        }

        StepOutcome {
            result: response.into_result(),
            from_agent,
            timed_out: false,
        }
    }
}

/// Agent serving `orchestrate_tasks`: runs a DAG or task list on behalf of
/// the requester and replies with the collected results.
pub struct OrchestratorAgent {
    core: AgentCore,
    config: OrchestratorConfig,
}

impl OrchestratorAgent {
    pub fn new(name: &str, config: OrchestratorConfig) -> Self {
        Self {
            core: AgentCore::new(name, [ORCHESTRATE_CAPABILITY]),
            config,
        }
    }

    async fn orchestrate(&self, msg: &Message) -> Result<OrchestrationResult> {
        let data = msg.data();
        let orchestrator = DagOrchestrator::new(self.core.network()?, self.name(), &self.config);

        if let Some(tasks) = data.get("tasks") {
            let tasks: Vec<Task> = serde_json::from_value(tasks.clone())
                .map_err(|e| Error::InvalidParameter(format!("invalid task list: {}", e)))?;
            return Ok(orchestrator.execute_sequence(msg.request_id(), tasks).await);
        }
        let request = DagRequest::from_data(msg.request_id(), data)?;
        Ok(orchestrator.execute(request).await)
    }
}

impl Agent for OrchestratorAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn description(&self) -> &str {
        "Runs multi-capability requests in dependency order"
    }
}

#[async_trait]
impl MessageHandler for OrchestratorAgent {
    async fn on_capability_request(&self, msg: &Message) -> Result<()> {
        match msg.capability() {
            Some(ORCHESTRATE_CAPABILITY) => {}
            other => {
                return Err(Error::CapabilityNotFound(format!(
                    "{} does not provide '{}'",
                    self.name(),
                    other.unwrap_or_default()
                )))
            }
        }

        let result = self.orchestrate(msg).await?;
        let mut reply = result.to_value();
        reply["response"] = Value::String(result.summary());
        self.core.send_capability_response(msg, reply).await
    }
}
