//! Tandem RPC - command line server and client for the tandem runtime.
//!
//! `serve` exposes the demonstration `arith` service over TCP; `call` invokes
//! any remote method through a connection pool and prints the result.

mod server;
mod service;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;
use tandem_core::{CallContext, ConnectionPool, ServerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tandem-rpc")]
#[command(about = "JSON-RPC server and client for the tandem runtime")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demonstration `arith` service
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Handle each connection's requests one at a time
        #[arg(long)]
        sequential: bool,

        /// Admit at most this many requests per second
        #[arg(long)]
        rate_limit: Option<u32>,

        /// Maximum simultaneous connections
        #[arg(long, default_value_t = ServerConfig::MAX_CONNECTIONS)]
        max_connections: usize,
    },

    /// Call a remote method and print its result as JSON
    Call {
        /// Server address, e.g. 127.0.0.1:4000
        #[arg(long)]
        addr: String,

        /// Fully qualified method name, e.g. arith.Add
        method: String,

        /// Positional params, each a JSON value
        params: Vec<String>,

        /// Call timeout in milliseconds
        #[arg(long, default_value = "20000")]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only RPC_PORT and call results
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            port,
            host,
            sequential,
            rate_limit,
            max_connections,
        } => {
            let options = server::ServeOptions {
                host,
                port,
                sequential,
                rate_limit,
                max_connections,
            };
            serve(options).await
        }
        Command::Call {
            addr,
            method,
            params,
            timeout_ms,
        } => call(&addr, &method, &params, Duration::from_millis(timeout_ms)).await,
    }
}

async fn serve(options: server::ServeOptions) -> Result<()> {
    info!("Starting Tandem RPC Server");

    let handle = server::start_server(&options).await?;

    // Print port for the parent process to read (intentional stdout)
    println!("RPC_PORT={}", handle.port());

    info!("RPC server running on {}", handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}

async fn call(addr: &str, method: &str, raw_params: &[String], timeout: Duration) -> Result<()> {
    let params = raw_params
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            serde_json::from_str::<Value>(raw)
                .with_context(|| format!("param {} is not valid JSON: {}", i, raw))
        })
        .collect::<Result<Vec<_>>>()?;

    let pool = ConnectionPool::connect(addr, 1)?;
    let ctx = CallContext::background().with_timeout(timeout);
    let result = pool
        .dispatch(method, &ctx, params)
        .await
        .with_context(|| format!("call to {} at {} failed", method, addr))?;

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}
