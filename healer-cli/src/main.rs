//! Battle Healer operator CLI.
//!
//! Thin wrapper over the healing supervisor plus queue/log inspection
//! against the healing backend.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use healer_core::planner::{LlmPlanner, LlmPlannerConfig};
use healer_core::state::HttpRequestSpec;
use healer_core::supervisor::{DegradationConfig, HealParams, Supervisor};
use healer_core::BackendClient;

#[derive(Debug, Parser)]
#[command(name = "healer", about = "Battle Healer operator CLI", version)]
struct Cli {
    /// Healing backend URL.
    #[arg(
        long,
        global = true,
        env = "HEALER_BACKEND_URL",
        default_value = "http://localhost:8000"
    )]
    backend: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a request through the healing supervisor.
    Heal(HealArgs),
    /// Show queue metrics.
    QueueStatus,
    /// Inspect healing logs.
    Logs(LogsArgs),
}

#[derive(Debug, Parser)]
struct HealArgs {
    /// Target URL, joined with the region endpoint when relative.
    #[arg(long, default_value = "/external-api")]
    url: String,

    #[arg(long, default_value = "GET")]
    method: String,

    /// Extra request header as `name: value`; repeatable.
    #[arg(long = "header", value_name = "NAME: VALUE")]
    headers: Vec<String>,

    /// JSON request body.
    #[arg(long)]
    body: Option<String>,

    /// Region endpoint to start from; repeatable.
    #[arg(long = "region")]
    regions: Vec<String>,

    #[arg(long)]
    request_id: Option<String>,

    #[arg(long)]
    max_cycles: Option<u32>,

    /// Simulation triggers forwarded to the demo upstream.
    #[arg(long)]
    simulate: Option<String>,

    /// Cache key for the stale-cache fallback.
    #[arg(long)]
    cache_key: Option<String>,

    /// Disable the stale-cache fallback.
    #[arg(long)]
    no_stale_cache: bool,

    /// Disable the synthetic-mock fallback.
    #[arg(long)]
    no_mock: bool,

    /// Use the model-backed planner; reads HEALER_PLANNER_API_KEY.
    #[arg(long)]
    llm_planner: bool,
}

#[derive(Debug, Parser)]
struct LogsArgs {
    /// Correlation id to filter by.
    #[arg(long)]
    correlation_id: Option<String>,

    #[arg(long, default_value_t = 25)]
    limit: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Heal(args) => run_heal(&cli.backend, args).await?,
        Command::QueueStatus => run_queue_status(&cli.backend).await?,
        Command::Logs(args) => run_logs(&cli.backend, args).await?,
    };
    std::process::exit(code);
}

async fn run_heal(backend: &str, args: HealArgs) -> Result<i32> {
    let mut headers = parse_headers(&args.headers)?;
    if let Some(simulate) = &args.simulate {
        headers.insert("X-Healer-Simulate".to_string(), simulate.clone());
    }

    let mut request = HttpRequestSpec::new(&args.method);
    request.headers = headers;
    if let Some(body) = &args.body {
        request.body =
            Some(serde_json::from_str(body).context("request body is not valid JSON")?);
    }

    let mut supervisor = Supervisor::new(backend);
    if args.llm_planner {
        let api_key = std::env::var("HEALER_PLANNER_API_KEY")
            .context("--llm-planner requires HEALER_PLANNER_API_KEY")?;
        supervisor = supervisor.with_planner(Arc::new(LlmPlanner::new(LlmPlannerConfig::new(
            &api_key,
        ))));
    }

    let mut params = HealParams::new(&args.url, request);
    params.regions = (!args.regions.is_empty()).then(|| args.regions.clone());
    params.request_id = args.request_id;
    params.max_cycles = args.max_cycles;
    params.degradation = Some(DegradationConfig {
        cache_key: args.cache_key,
        enable_stale_cache: !args.no_stale_cache,
        enable_mock: !args.no_mock,
        ..DegradationConfig::default()
    });

    let outcome = supervisor.run(params).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.success { 0 } else { 1 })
}

async fn run_queue_status(backend: &str) -> Result<i32> {
    let status = BackendClient::new(backend)
        .queue_status()
        .await
        .context("queue status unavailable")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(0)
}

async fn run_logs(backend: &str, args: LogsArgs) -> Result<i32> {
    let logs = BackendClient::new(backend)
        .logs(args.correlation_id.as_deref(), args.limit)
        .await
        .context("logs unavailable")?;
    println!("{}", serde_json::to_string_pretty(&logs)?);
    Ok(0)
}

fn parse_headers(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once(':') else {
            bail!("header '{entry}' is not in 'name: value' form");
        };
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}
