use jarvis_core::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Capability dependency map for one orchestrated request, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: Vec<(String, Vec<String>)>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `capability` with its dependencies. Adding it again replaces them.
    pub fn add<I, S>(&mut self, capability: &str, depends_on: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut deps: Vec<String> = Vec::new();
        for dep in depends_on {
            let dep = dep.into();
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        match self.nodes.iter_mut().find(|(name, _)| name == capability) {
            Some((_, existing)) => *existing = deps,
            None => self.nodes.push((capability.to_string(), deps)),
        }
        self
    }

    pub fn with<I, S>(mut self, capability: &str, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add(capability, depends_on);
        self
    }

    /// Build from a hash map. Keys are sorted so the result is deterministic.
    pub fn from_map(map: &HashMap<String, Vec<String>>) -> Self {
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        let mut graph = Self::new();
        for key in keys {
            graph.add(key, map[key].iter().cloned());
        }
        graph
    }

    /// Parse `{"capability": ["dep", ...], ...}`, keeping the object's key order.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidParameter("dag must be an object of capability -> [dependencies]".into()))?;
        let mut graph = Self::new();
        for (capability, deps) in obj {
            let deps = match deps {
                Value::Null => Vec::new(),
                Value::Array(items) => items
                    .iter()
                    .map(|d| {
                        d.as_str().map(str::to_string).ok_or_else(|| {
                            Error::InvalidParameter(format!("dependency of '{}' must be a string", capability))
                        })
                    })
                    .collect::<Result<Vec<String>>>()?,
                _ => {
                    return Err(Error::InvalidParameter(format!(
                        "dependencies of '{}' must be an array",
                        capability
                    )))
                }
            };
            graph.add(capability, deps);
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|(name, _)| name.as_str())
    }

    pub fn dependencies(&self, capability: &str) -> &[String] {
        self.nodes
            .iter()
            .find(|(name, _)| name == capability)
            .map(|(_, deps)| deps.as_slice())
            .unwrap_or(&[])
    }

    /// Keep only capabilities for which `known` holds; dependencies on
    /// anything not kept are removed. Returns the graph and the dropped names.
    pub fn retain_known<F>(&self, known: F) -> (DependencyGraph, Vec<String>)
    where
        F: Fn(&str) -> bool,
    {
        let mut dropped = Vec::new();
        let mut kept: Vec<(String, Vec<String>)> = Vec::new();
        for (name, deps) in &self.nodes {
            if known(name) {
                kept.push((name.clone(), deps.clone()));
            } else {
                warn!(capability = %name, "No provider for capability, dropping it from the plan");
                dropped.push(name.clone());
            }
        }

        let names: HashSet<String> = kept.iter().map(|(n, _)| n.clone()).collect();
        for (name, deps) in kept.iter_mut() {
            let before = deps.len();
            deps.retain(|d| names.contains(d));
            if deps.len() != before {
                debug!(capability = %name, "Removed dependencies that are not part of the plan");
            }
        }
        (DependencyGraph { nodes: kept }, dropped)
    }

    /// Peel the graph into waves. A cycle yields a one-per-wave linear order.
    pub fn plan(&self) -> ExecutionPlan {
        let mut done: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&(String, Vec<String>)> = self.nodes.iter().collect();
        let mut waves: Vec<Vec<String>> = Vec::new();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|(_, deps)| deps.iter().all(|d| done.contains(d.as_str())));
            remaining = blocked;
            if ready.is_empty() {
                break;
            }
            for node in ready.iter().copied() {
                done.insert(node.0.as_str());
            }
            waves.push(ready.iter().map(|(name, _)| name.clone()).collect());
        }

        if remaining.is_empty() {
            return ExecutionPlan {
                waves,
                fell_back: false,
                blocked: Vec::new(),
            };
        }

        let blocked: Vec<String> = remaining.iter().map(|(name, _)| name.clone()).collect();
        warn!(blocked = ?blocked, "Dependency cycle detected, falling back to sequential order");
        let linear = waves.into_iter().flatten().chain(blocked.iter().cloned());
        ExecutionPlan {
            waves: linear.map(|c| vec![c]).collect(),
            fell_back: true,
            blocked,
        }
    }
}

/// Waves of capabilities; each wave runs concurrently, waves run in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub waves: Vec<Vec<String>>,
    /// True when a cycle forced the linear fallback.
    pub fell_back: bool,
    /// Capabilities that could not be ordered: cycle members and what depends on them.
    pub blocked: Vec<String>,
}

impl ExecutionPlan {
    /// Strictly sequential plan, one capability per wave.
    pub fn linear<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            waves: capabilities.into_iter().map(|c| vec![c.into()]).collect(),
            fell_back: false,
            blocked: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    pub fn order(&self) -> Vec<&str> {
        self.waves.iter().flatten().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_independent_then_dependent() {
        let graph = DependencyGraph::new()
            .with("lights_on", Vec::<String>::new())
            .with("get_schedule", Vec::<String>::new())
            .with("send_summary", ["lights_on", "get_schedule"]);
        let plan = graph.plan();
        assert!(!plan.fell_back);
        assert_eq!(
            plan.waves,
            vec![
                vec!["lights_on".to_string(), "get_schedule".to_string()],
                vec!["send_summary".to_string()],
            ]
        );
    }

    #[test]
    fn test_diamond() {
        let graph = DependencyGraph::new()
            .with("d", ["b", "c"])
            .with("b", ["a"])
            .with("c", ["a"])
            .with("a", Vec::<String>::new());
        assert_eq!(graph.plan().waves, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_cycle_falls_back_to_linear() {
        let graph = DependencyGraph::new()
            .with("x", Vec::<String>::new())
            .with("a", ["b"])
            .with("b", ["a"])
            .with("c", ["a"]);
        let plan = graph.plan();
        assert!(plan.fell_back);
        assert_eq!(plan.blocked, vec!["a", "b", "c"]);
        assert_eq!(plan.order(), vec!["x", "a", "b", "c"]);
        assert!(plan.waves.iter().all(|w| w.len() == 1));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let plan = DependencyGraph::new().with("loop", ["loop"]).plan();
        assert!(plan.fell_back);
        assert_eq!(plan.order(), vec!["loop"]);
    }

    #[test]
    fn test_retain_known_strips_dependencies() {
        let graph = DependencyGraph::new()
            .with("teleport", Vec::<String>::new())
            .with("send_summary", ["teleport", "get_schedule"])
            .with("get_schedule", Vec::<String>::new());
        let (kept, dropped) = graph.retain_known(|c| c != "teleport");
        assert_eq!(dropped, vec!["teleport"]);
        assert_eq!(kept.dependencies("send_summary"), ["get_schedule".to_string()]);
        assert_eq!(kept.plan().waves, vec![vec!["get_schedule"], vec!["send_summary"]]);
    }

    #[test]
    fn test_from_json_and_map() {
        let graph = DependencyGraph::from_json(&json!({
            "get_schedule": [],
            "add_event": ["get_schedule"],
        }))
        .unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.dependencies("add_event"), ["get_schedule".to_string()]);

        // Object keys keep their written order, which decides the cycle fallback.
        let cyclic = DependencyGraph::from_json(&json!({ "play_music": ["dim_lights"], "dim_lights": ["play_music"] }))
            .unwrap();
        assert_eq!(cyclic.capabilities().collect::<Vec<_>>(), vec!["play_music", "dim_lights"]);
        assert_eq!(cyclic.plan().order(), vec!["play_music", "dim_lights"]);

        assert!(DependencyGraph::from_json(&json!(["a"])).is_err());
        assert!(DependencyGraph::from_json(&json!({"a": [1]})).is_err());

        let mut map = HashMap::new();
        map.insert("b".to_string(), vec!["a".to_string()]);
        map.insert("a".to_string(), vec![]);
        let graph = DependencyGraph::from_map(&map);
        assert_eq!(graph.capabilities().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_linear_plan() {
        let plan = ExecutionPlan::linear(["a", "b"]);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.order(), vec!["a", "b"]);
    }
}
