//! Tandem Server - demo JSON-RPC endpoint and command-line client.
//!
//! `serve` runs a listener with the demo method/stream table and prints the
//! bound port as `RPC_PORT=<port>` on stdout. `call` performs one call
//! against a running endpoint and prints the result as JSON.

mod demo;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tandem_rpc::{ConnectConfig, Connection, Credentials, ListenConfig, Listener};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "Bidirectional JSON-RPC 2.0 over WebSocket and HTTP")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo methods and streams
    Serve(ServeArgs),
    /// Call a method on a running endpoint
    Call(CallArgs),
}

#[derive(ClapArgs, Debug)]
struct AuthArgs {
    /// Username for Basic authentication (requires --password)
    #[arg(long)]
    username: Option<String>,

    /// Password for Basic authentication
    #[arg(long)]
    password: Option<String>,

    /// Bearer token (ignored when username and password are given)
    #[arg(long)]
    token: Option<String>,
}

impl AuthArgs {
    fn credentials(&self) -> Credentials {
        Credentials::from_parts(
            self.username.clone(),
            self.password.clone(),
            self.token.clone(),
        )
    }
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Refuse one-shot HTTP calls
    #[arg(long)]
    no_http: bool,

    /// Refuse WebSocket upgrades
    #[arg(long)]
    no_websocket: bool,

    /// Timeout for reverse calls, in milliseconds
    #[arg(long, default_value = "10000")]
    timeout_ms: u64,

    #[command(flatten)]
    auth: AuthArgs,
}

#[derive(ClapArgs, Debug)]
struct CallArgs {
    /// Endpoint URL (http, https, ws or wss)
    url: String,

    /// Method to call
    method: String,

    /// Parameters; each is parsed as JSON, or taken as a string if it is not
    params: Vec<String>,

    /// Call timeout, in milliseconds
    #[arg(long, default_value = "10000")]
    timeout_ms: u64,

    #[command(flatten)]
    auth: AuthArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve(serve_args) => serve(serve_args).await,
        Command::Call(call_args) => call(call_args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    info!("Starting Tandem RPC Server");

    let config = ListenConfig::default()
        .with_credentials(args.auth.credentials())
        .with_http(!args.no_http)
        .with_websocket(!args.no_websocket)
        .with_call_timeout(Duration::from_millis(args.timeout_ms));

    let callee = Arc::new(demo::callee());
    let handle = Listener::new(callee.clone(), config)
        .on_caller(|caller| info!("Peer connected as caller {}", caller.id()))
        .bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;

    // Print port for the parent process to read (intentional stdout)
    println!("RPC_PORT={}", handle.port());

    info!("RPC server running on {}", handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    handle.shutdown();
    callee.shutdown();
    Ok(())
}

async fn call(args: CallArgs) -> Result<()> {
    let config = ConnectConfig::new(args.url.as_str())
        .with_credentials(args.auth.credentials())
        .with_call_timeout(Duration::from_millis(args.timeout_ms));
    let conn = Connection::new(config, None)?;

    let params = args.params.iter().map(|raw| parse_param(raw)).collect();
    let result = conn
        .execute(&args.method, params)
        .await
        .with_context(|| format!("call to {} failed", args.method))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Parse one command-line parameter as JSON, falling back to a plain string.
fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
