//! Server wiring for the `serve` subcommand.

use crate::service::Arith;
use std::sync::Arc;
use tandem_core::{RateLimiter, Server, ServerHandle};
use tracing::info;

/// Options taken from the command line.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub sequential: bool,
    pub rate_limit: Option<u32>,
    pub max_connections: usize,
}

/// Build the server, register the demonstration services and start listening.
///
/// Returns the running handle; the actual port is available from it when
/// `port` is 0.
pub async fn start_server(options: &ServeOptions) -> anyhow::Result<ServerHandle> {
    let mut server = Server::new().with_max_connections(options.max_connections);

    if options.sequential {
        server = server.with_sequential_dispatch();
    }
    if let Some(rate) = options.rate_limit {
        server = server.with_limiter(RateLimiter::per_second(rate)?);
        info!("Admission limited to {} requests per second", rate);
    }

    server.register("arith", Arc::new(Arith::default()))?;

    let addr = format!("{}:{}", options.host, options.port);
    let handle = server.listen(&addr).await?;

    Ok(handle)
}
