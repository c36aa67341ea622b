pub mod agent;
pub mod aggregator;
pub mod capability_agent;
pub mod correlation;
pub mod dag;
pub mod network;
pub mod orchestrator;

pub use agent::{dispatch, Agent, AgentCore, MessageHandler};
pub use aggregator::{AggregatedResponse, AggregationStrategy, AggregatorStats, PendingAggregation, ResponseAggregator};
pub use capability_agent::{CapabilityAgent, FnCapability};
pub use correlation::{ActiveTask, ActiveTasks, ReplyProgress};
pub use dag::{DependencyGraph, ExecutionPlan};
pub use network::{AgentNetwork, ResponseWaiter, WeakNetwork};
pub use orchestrator::{
    DagOrchestrator, DagRequest, OrchestrationResult, OrchestratorAgent, Task, ORCHESTRATE_CAPABILITY,
};
