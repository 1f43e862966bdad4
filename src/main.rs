//! Zentinel gRPC Mock - CLI Entry Point

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_agent_grpc_mock::config::parse_duration;
use zentinel_agent_grpc_mock::{
    Call, CallContext, CallOutcome, Metadata, MockConfig, MockServer, Payload, ResponseWriter,
    RpcShape, Status, TransportError,
};

#[derive(Parser, Debug)]
#[command(
    name = "zentinel-agent-grpc-mock",
    about = "gRPC mock engine for Zentinel - stub matching and scripted streaming responses",
    version
)]
struct Args {
    /// Path to stub file
    #[arg(short, long, default_value = "grpc-mock.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print an example stub file and exit
    #[arg(long)]
    print_config: bool,

    /// Validate stub file and exit
    #[arg(long)]
    validate: bool,

    /// Replay one call, as "package.Service/Method"
    #[arg(long, value_name = "SERVICE/METHOD")]
    call: Option<String>,

    /// Call shape (unary, client_stream, server_stream, bidirectional)
    #[arg(long, default_value = "unary")]
    shape: RpcShape,

    /// Request message as JSON; repeat for streaming calls
    #[arg(short, long = "request", value_name = "JSON")]
    requests: Vec<String>,

    /// Request header as name=value; may be repeated
    #[arg(short = 'H', long = "header", value_name = "NAME=VALUE")]
    headers: Vec<String>,

    /// Call deadline (e.g. "500ms", "2s")
    #[arg(long)]
    timeout: Option<String>,
}

/// Prints every response event as one JSON line on stdout.
struct StdoutWriter {
    out: tokio::io::Stdout,
}

impl StdoutWriter {
    fn new() -> Self {
        Self {
            out: tokio::io::stdout(),
        }
    }

    async fn emit(&mut self, event: Value) -> Result<(), TransportError> {
        let mut line =
            serde_json::to_vec(&event).map_err(|e| TransportError::Rejected(e.to_string()))?;
        line.push(b'\n');
        self.out.write_all(&line).await?;
        self.out.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ResponseWriter for StdoutWriter {
    async fn set_headers(&mut self, headers: &Metadata) -> Result<(), TransportError> {
        self.emit(json!({"event": "headers", "headers": headers})).await
    }

    async fn send(&mut self, message: Payload) -> Result<(), TransportError> {
        self.emit(json!({"event": "message", "message": message})).await
    }

    async fn set_trailers(&mut self, trailers: &Metadata) -> Result<(), TransportError> {
        self.emit(json!({"event": "trailers", "trailers": trailers})).await
    }

    async fn end(&mut self, status: &Status) -> Result<(), TransportError> {
        self.emit(json!({"event": "end", "status": status})).await
    }
}

fn build_call(route: &str, args: &Args) -> Result<Call> {
    let (service, method) = route
        .rsplit_once('/')
        .filter(|(s, m)| !s.is_empty() && !m.is_empty())
        .with_context(|| format!("Invalid call '{}', expected SERVICE/METHOD", route))?;

    let mut call = Call::new(service.trim_start_matches('/'), method, args.shape);

    for header in &args.headers {
        let (name, value) = header
            .split_once('=')
            .with_context(|| format!("Invalid header '{}', expected NAME=VALUE", header))?;
        call = call.with_header(name.trim().to_lowercase(), value.trim());
    }

    for (i, raw) in args.requests.iter().enumerate() {
        let request: Payload = serde_json::from_str(raw)
            .with_context(|| format!("Request {} is not a JSON object", i))?;
        call = call.with_request(request);
    }

    Ok(call)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout only carries response events
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../demos/default-stubs.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading stubs");
        MockConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else if args.validate || args.call.is_some() {
        anyhow::bail!("Stub file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no stubs)");
        MockConfig::default()
    };

    if args.validate {
        println!("Configuration is valid ({} stubs defined)", config.stubs.len());
        return Ok(());
    }

    let Some(route) = args.call.as_deref() else {
        println!("Loaded {} stubs; pass --call SERVICE/METHOD to replay a call", config.stubs.len());
        return Ok(());
    };

    let call = build_call(route, &args)?;
    let server = MockServer::new(config);

    let mut ctx = CallContext::new();
    if let Some(timeout) = &args.timeout {
        let timeout = parse_duration(timeout).with_context(|| format!("Invalid timeout '{}'", timeout))?;
        ctx = ctx.with_timeout(timeout);
    }

    let token = ctx.cancellation().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let mut writer = StdoutWriter::new();
    match server.handle(&call, &ctx, &mut writer).await? {
        CallOutcome::Served(execution) => {
            info!(
                sends = execution.sends,
                data = execution.data,
                ends = execution.ends,
                "Call served"
            );
            Ok(())
        }
        CallOutcome::Exhausted { stub_id } => {
            anyhow::bail!("Stub '{}' is exhausted", stub_id)
        }
    }
}
