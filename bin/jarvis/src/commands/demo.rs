use jarvis_agent::{
    AgentNetwork, CapabilityAgent, FnCapability, OrchestratorAgent, ORCHESTRATE_CAPABILITY,
};
use jarvis_core::{Capability, Config, Error, MessageKind, Paths};
use jarvis_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const CLI_AGENT: &str = "cli";

fn lights() -> Arc<dyn Capability> {
    Arc::new(
        FnCapability::new("lights_on", |data: Value| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let room = data["parameters"]["room"].as_str().unwrap_or("living room").to_string();
            Ok(json!({ "response": format!("Lights on in the {}", room), "room": room }))
        })
        .with_description("Switch the lights on"),
    )
}

fn calendar(fail: bool) -> Arc<dyn Capability> {
    Arc::new(
        FnCapability::new("get_schedule", move |_data: Value| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            if fail {
                return Err(Error::service_unavailable("calendar service is down", Some(30)));
            }
            Ok(json!({
                "response": "2 events today",
                "events": [
                    { "time": "09:30", "title": "Standup" },
                    { "time": "14:00", "title": "Dentist" },
                ],
            }))
        })
        .with_description("Read today's calendar"),
    )
}

fn notify() -> Arc<dyn Capability> {
    Arc::new(
        FnCapability::new("send_summary", |data: Value| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let parts: Vec<String> = data["context"]["previous_results"]
                .as_array()
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(|prev| {
                    let result = &prev["result"];
                    match result.get("error").and_then(|e| e.as_str()) {
                        Some(err) => format!("{} failed: {}", prev["capability"].as_str().unwrap_or("?"), err),
                        None => result["response"].as_str().unwrap_or_default().to_string(),
                    }
                })
                .collect();
            Ok(json!({ "response": format!("Sent summary: {}", parts.join("; ")) }))
        })
        .with_description("Notify the user"),
    )
}

pub async fn run(sequential: bool, fail_calendar: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(&Paths::new())?;
    let network = AgentNetwork::new(&config);
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::from(
        &config.resilience.breaker,
    )));

    network
        .register_agent(Arc::new(
            CapabilityAgent::new("lights", vec![lights()]).with_description("Home automation"),
        ))
        .await;
    network
        .register_agent(Arc::new(
            CapabilityAgent::new("calendar", vec![calendar(fail_calendar)])
                .with_breakers(breakers.clone())
                .with_description("Calendar access"),
        ))
        .await;
    network
        .register_agent(Arc::new(
            CapabilityAgent::new("notify", vec![notify()]).with_description("Notifications"),
        ))
        .await;
    network
        .register_agent(Arc::new(OrchestratorAgent::new(
            "orchestrator",
            config.orchestrator.clone(),
        )))
        .await;
    network.start().await;

    println!("Agents:");
    for (capability, providers) in network.capabilities().await {
        println!("  {:<18} {}", capability, providers.join(", "));
    }
    println!();

    let request_id = uuid::Uuid::new_v4().to_string();
    let data = if sequential {
        json!({
            "tasks": [
                { "capability": "lights_on", "parameters": { "room": "kitchen" } },
                { "capability": "get_schedule" },
                { "capability": "send_summary", "depends_on": ["lights_on", "get_schedule"] },
            ]
        })
    } else {
        json!({
            "dag": {
                "lights_on": [],
                "get_schedule": [],
                "send_summary": ["lights_on", "get_schedule"],
            },
            "prompt": "Turn on the lights, check my calendar and send me a summary",
            "parameters": { "lights_on": { "room": "kitchen" } },
        })
    };

    info!(request_id = %request_id, sequential, "Submitting demo request");
    let started = Instant::now();
    let waiter = network.expect_response(&request_id).await;
    network
        .request_capability(CLI_AGENT, ORCHESTRATE_CAPABILITY, data, &request_id)
        .await?;
    let reply = waiter
        .wait(config.orchestrator.request_timeout() + Duration::from_secs(5))
        .await?;
    let elapsed = started.elapsed();

    if *reply.kind() == MessageKind::Error {
        let err = reply.error_response().map(|e| e.message).unwrap_or_default();
        println!("❌ Orchestration failed: {}", err);
    } else {
        let content = reply.content();
        println!("Response:");
        for line in content["response"].as_str().unwrap_or_default().lines() {
            println!("  {}", line);
        }
        println!();
        println!("Results:");
        println!("{}", serde_json::to_string_pretty(&content["results"])?);
        if content["fell_back"].as_bool().unwrap_or(false) {
            println!("⚠ dependency cycle detected, ran sequentially");
        }
    }
    println!();
    println!("Finished in {:?}", elapsed);

    for stats in breakers.all_stats() {
        println!(
            "Breaker {:<14} {} ({} failures)",
            stats.name,
            stats.state.as_str(),
            stats.failure_count
        );
    }

    network.stop().await;
    Ok(())
}
