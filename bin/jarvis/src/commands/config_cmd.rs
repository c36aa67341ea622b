use jarvis_core::{Config, Paths};
use std::io::{self, Write};

/// Show the current configuration as pretty-printed JSON.
pub async fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let json = serde_json::to_value(&config)?;

    println!();
    println!("📋 Current Configuration");
    println!(
        "  File: {}{}",
        paths.config_file().display(),
        if paths.config_file().exists() { "" } else { " (not found, showing defaults)" }
    );
    println!();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

pub async fn path() -> anyhow::Result<()> {
    println!("{}", Paths::new().config_file().display());
    Ok(())
}

/// Write the default configuration, asking before overwriting.
pub async fn init(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();

    if paths.config_file().exists() && !force {
        print!("Config already exists. Overwrite? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    paths.ensure_dirs()?;
    Config::default().save(&paths.config_file())?;
    println!("✓ Created config: {}", paths.config_file().display());
    println!();
    println!("Next steps:");
    println!("  1. Edit {} to tune timeouts and retry policy", paths.config_file().display());
    println!("  2. Run `jarvis status` to verify configuration");
    println!("  3. Run `jarvis demo` to watch a request run across agents");
    Ok(())
}

/// Print the JSON Schema for the configuration file.
pub async fn schema() -> anyhow::Result<()> {
    let schema = serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "JarvisConfig",
        "description": "jarvis configuration file (~/.jarvis/config.json)",
        "type": "object",
        "properties": {
            "network": {
                "type": "object",
                "properties": {
                    "queueSize": { "type": "integer", "default": 1000, "description": "Capacity of the central message queue" },
                    "fallbackCapability": { "type": "string", "default": "chat", "description": "Capability asked when nobody provides the requested one; empty disables" }
                }
            },
            "aggregator": {
                "type": "object",
                "properties": {
                    "defaultTimeoutMs": { "type": "integer", "default": 30000 },
                    "sweepIntervalMs": { "type": "integer", "default": 1000, "description": "How often expired aggregations are resolved" }
                }
            },
            "orchestrator": {
                "type": "object",
                "properties": {
                    "capabilityTimeoutMs": { "type": "integer", "default": 15000, "description": "Wait per capability request" },
                    "requestTimeoutMs": { "type": "integer", "default": 60000, "description": "Deadline for a whole orchestrated request" }
                }
            },
            "resilience": {
                "type": "object",
                "properties": {
                    "breaker": {
                        "type": "object",
                        "properties": {
                            "failureThreshold": { "type": "integer", "default": 5 },
                            "recoveryTimeoutMs": { "type": "integer", "default": 60000 },
                            "halfOpenMaxCalls": { "type": "integer", "default": 1 }
                        }
                    },
                    "retry": {
                        "type": "object",
                        "properties": {
                            "maxRetries": { "type": "integer", "default": 3 },
                            "baseDelayMs": { "type": "integer", "default": 1000 },
                            "maxDelayMs": { "type": "integer", "default": 60000 },
                            "exponentialBase": { "type": "number", "default": 2.0 },
                            "retryOnTimeout": { "type": "boolean", "default": true },
                            "retryOnConnectionError": { "type": "boolean", "default": true },
                            "retryOnStatusCodes": {
                                "type": "array",
                                "items": { "type": "integer" },
                                "default": [429, 500, 502, 503, 504]
                            }
                        }
                    },
                    "proxy": { "type": "string", "description": "Proxy URL for outbound HTTP" },
                    "noProxy": { "type": "array", "items": { "type": "string" }, "description": "Hosts that bypass the proxy" },
                    "requestTimeoutMs": { "type": "integer", "default": 30000 }
                }
            }
        }
    });

    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
