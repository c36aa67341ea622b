use jarvis_core::{Config, Paths};
use jarvis_resilience::{CircuitBreakerConfig, RetryConfig};

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("jarvis status");
    println!("=============");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found, using defaults)" }
    );
    let config = Config::load_or_default(&paths)?;
    println!();

    println!("Network:");
    println!("  queue size:        {}", config.network.queue_size);
    println!(
        "  fallback:          {}",
        config.network.fallback().unwrap_or("(disabled)")
    );
    println!();

    println!("Aggregator:");
    println!("  default timeout:   {:?}", config.aggregator.default_timeout());
    println!("  sweep interval:    {:?}", config.aggregator.sweep_interval());
    println!();

    println!("Orchestrator:");
    println!("  per capability:    {:?}", config.orchestrator.capability_timeout());
    println!("  per request:       {:?}", config.orchestrator.request_timeout());
    println!();

    let breaker = CircuitBreakerConfig::from(&config.resilience.breaker);
    println!("Circuit breaker:");
    println!("  failure threshold: {}", breaker.failure_threshold);
    println!("  recovery timeout:  {:?}", breaker.recovery_timeout);
    println!("  half-open probes:  {}", breaker.half_open_max_calls);
    println!();

    let retry = RetryConfig::from(&config.resilience.retry);
    let mut codes: Vec<u16> = retry.retry_on_status_codes.iter().copied().collect();
    codes.sort_unstable();
    let delays: Vec<String> = (0..retry.max_retries)
        .map(|attempt| format!("{:?}", retry.delay_for(attempt)))
        .collect();
    println!("Retry:");
    println!("  max retries:       {}", retry.max_retries);
    println!("  backoff:           {}", if delays.is_empty() { "-".to_string() } else { delays.join(", ") });
    println!("  on timeout:        {}", retry.retry_on_timeout);
    println!("  on connect error:  {}", retry.retry_on_connection_error);
    println!("  on status:         {:?}", codes);
    println!();

    println!("HTTP:");
    println!(
        "  proxy:             {}",
        config.resilience.proxy.as_deref().unwrap_or("(none)")
    );
    if !config.resilience.no_proxy.is_empty() {
        println!("  no proxy:          {}", config.resilience.no_proxy.join(", "));
    }
    println!("  request timeout:   {}ms", config.resilience.request_timeout_ms);

    if !config_exists {
        println!();
        println!("Run `jarvis config init` to write a config file.");
    }
    Ok(())
}
