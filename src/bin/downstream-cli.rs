//! Issue one traced, circuit-broken downstream call from the command line.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::json;

use downstream_http::client::{DownstreamClientBuilder, DownstreamResponse};
use downstream_http::config::{load_config, ClientConfig};
use downstream_http::context::{logging_context, tracer, SpanPurpose};
use downstream_http::observability::{logging::init_logging, metrics::init_metrics};

#[derive(Parser)]
#[command(name = "downstream-cli")]
#[command(about = "Send a request through the downstream HTTP client", long_about = None)]
struct Cli {
    /// Target URL
    url: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra header, `name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not wrap the call in its own subspan
    #[arg(long)]
    no_subspan: bool,

    /// Overall request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Expose Prometheus metrics while the call runs
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ClientConfig::default(),
    };

    init_logging(&config.observability)?;

    if cli.metrics || config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut builder = DownstreamClientBuilder::from_config(&config);
    if cli.no_subspan {
        builder = builder.perform_subspans(false);
    }
    if let Some(ms) = cli.timeout_ms {
        builder = builder.request_timeout(Duration::from_millis(ms));
    }
    let client = builder.build()?;

    let request_id = uuid::Uuid::new_v4().to_string();
    logging_context::put("request_id", request_id.clone());
    let span = tracer::start_span_in_current_context("downstream-cli", SpanPurpose::Local);

    let mut request = client.new_request(cli.url.as_str(), &cli.method)?;
    for header in &cli.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| format!("header '{header}' is not in 'name: value' form"))?;
        request
            .builder_mut()
            .header(name.trim(), value.trim())
            .map_err(|e| e.to_string())?;
    }
    if let Some(data) = cli.data {
        request.builder_mut().body(data);
    }

    tracing::info!(
        method = %request.http_method(),
        url = %request.url(),
        request_id = %request_id,
        "Sending downstream request"
    );

    let started = Instant::now();
    let outcome = client
        .execute(request, |response: DownstreamResponse| Ok(response))
        .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    span.close();

    let summary = match &outcome {
        Ok(response) => json!({
            "request_id": request_id,
            "trace_id": span.trace_id(),
            "status": response.status_code(),
            "elapsed_ms": elapsed_ms,
            "body": response.text(),
        }),
        Err(error) => json!({
            "request_id": request_id,
            "trace_id": span.trace_id(),
            "error": error.to_string(),
            "breaker_open": error.is_breaker_open(),
            "elapsed_ms": elapsed_ms,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if outcome.is_err() {
        std::process::exit(1);
    }
    Ok(())
}
