//! Binary entrypoint: load configuration, wire the gateway, serve HTTP.

use std::sync::Arc;

use mcp_gateway::config::GatewayConfig;
use mcp_gateway::error::Result;
use mcp_gateway::gateway::{build_router, GatewayBuilder};
use mcp_gateway::observability::init_tracing;
use mcp_gateway::server::Server;
use mcp_gateway::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::load()?;
    init_tracing(&config)?;

    let gateway = Arc::new(GatewayBuilder::new(config.clone()).build().await?);
    let state = AppState::new(gateway.clone(), Arc::new(config.clone()));

    let app = build_router().with_state(state);

    let server = Server::new(config);
    let result = server.serve(app).await;

    gateway.shutdown().await.map_err(|e| mcp_gateway::error::Error::Internal(e.to_string()))?;

    result
}
