use anyhow::{Context, Result};
use clap::Parser;
use ldap_client_core::metrics::PoolStatisticsSnapshot;
use ldap_client_core::server_set::EndpointStats;
use ldap_client_core::{ClientConfig, LdapConnectionPool, ServerSet, ServerSetStrategy};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ldap-ping")]
#[command(about = "Check LDAP servers: connect through a server set or pool and run \"Who am I?\"")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server URI (ldap:// or ldaps://); repeat for several servers. Ignored with --config.
    #[arg(short, long, value_name = "URI")]
    uri: Vec<String>,

    /// Endpoint selection: single, failover_ordered, round_robin, random
    #[arg(short, long, value_name = "STRATEGY", value_parser = parse_strategy)]
    strategy: Option<ServerSetStrategy>,

    /// Number of checks to run
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Check connections out of a pool instead of dialing per check
    #[arg(short, long)]
    pool: bool,

    /// Print a JSON report instead of log lines
    #[arg(long)]
    json: bool,

    /// Print Prometheus metrics after the checks
    #[arg(long)]
    metrics: bool,

    /// Trace protocol traffic (all debug categories)
    #[arg(long)]
    trace_protocol: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_strategy(value: &str) -> Result<ServerSetStrategy, String> {
    serde_yaml::from_str(value).map_err(|_| {
        format!("unknown strategy {value:?} (single, failover_ordered, round_robin, random)")
    })
}

#[derive(Serialize)]
struct CheckResult {
    attempt: usize,
    endpoint: Option<String>,
    identity: Option<String>,
    error: Option<String>,
    elapsed_ms: u128,
}

#[derive(Serialize)]
struct CheckReport {
    results: Vec<CheckResult>,
    endpoints: Vec<EndpointStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pool: Option<PoolStatisticsSnapshot>,
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = if let Some(path) = &args.config {
        info!("Configuration source: file {:?}", path);
        ClientConfig::from_file(path)?
    } else if !args.uri.is_empty() {
        ClientConfig::from_uris(&args.uri)
    } else {
        anyhow::bail!("Set --config <FILE> or at least one --uri <URI>");
    };
    if let Some(strategy) = args.strategy {
        config.servers.strategy = strategy;
    }
    if args.trace_protocol {
        config.debug.enabled = Some(true);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_client_core={},ldap_ping={},info", log_level, log_level))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    info!("Configuration loaded:");
    info!("  Strategy: {:?}", config.servers.strategy);
    info!("  Servers: {}", config.servers.endpoints.len());
    info!("  Bind: {}", config.bind.as_ref().map_or("none", |b| b.method.as_str()));

    let pool = if args.pool {
        Some(
            LdapConnectionPool::from_config(&config)
                .await
                .context("Start connection pool")?,
        )
    } else {
        None
    };
    let server_set = match &pool {
        Some(pool) => Arc::clone(pool.server_set()),
        None => Arc::new(ServerSet::from_config(&config)?),
    };

    let mut results = Vec::with_capacity(args.count);
    for attempt in 1..=args.count {
        let started = Instant::now();
        let outcome = match &pool {
            Some(pool) => match pool.checkout().await {
                Ok(conn) => {
                    let endpoint = conn.endpoint().to_string();
                    (Some(endpoint), conn.who_am_i().await)
                }
                Err(e) => (None, Err(e)),
            },
            None => match server_set.get_connection().await {
                Ok(conn) => {
                    let endpoint = conn.endpoint().to_string();
                    let identity = conn.who_am_i().await;
                    conn.close().await;
                    (Some(endpoint), identity)
                }
                Err(e) => (None, Err(e)),
            },
        };
        let (endpoint, identity) = outcome;
        let result = match identity {
            Ok(identity) => {
                info!(attempt, endpoint = endpoint.as_deref().unwrap_or("-"), identity = %identity, "check ok");
                CheckResult {
                    attempt,
                    endpoint,
                    identity: Some(identity),
                    error: None,
                    elapsed_ms: started.elapsed().as_millis(),
                }
            }
            Err(e) => {
                error!(attempt, endpoint = endpoint.as_deref().unwrap_or("-"), "check failed: {}", e);
                CheckResult {
                    attempt,
                    endpoint,
                    identity: None,
                    error: Some(e.to_string()),
                    elapsed_ms: started.elapsed().as_millis(),
                }
            }
        };
        results.push(result);
    }

    let failures = results.iter().filter(|r| r.error.is_some()).count();
    let report = CheckReport {
        results,
        endpoints: server_set.endpoint_stats(),
        pool: pool.as_ref().map(|p| p.statistics()),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for stats in &report.endpoints {
            info!(
                "  {}: {} attempts, {} failures",
                stats.endpoint, stats.attempts, stats.failures
            );
        }
    }
    if args.metrics {
        print!("{}", server_set.metrics().render());
        if let Some(pool) = &pool {
            print!("{}", pool.render_metrics());
        }
    }
    if let Some(pool) = &pool {
        pool.close().await;
    }

    if failures > 0 {
        anyhow::bail!("{} of {} checks failed", failures, args.count);
    }
    Ok(())
}
