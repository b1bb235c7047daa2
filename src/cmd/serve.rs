//! Gateway server command: `assistant-gateway serve`.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use assistant_gateway::config::GatewayConfig;
use assistant_gateway::server;

pub async fn cmd_serve(
    mut config: GatewayConfig,
    port: Option<u16>,
    host: Option<String>,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    for warning in config.validate() {
        warn!("config: {}", warning);
    }
    server::start_server(Arc::new(config)).await
}
