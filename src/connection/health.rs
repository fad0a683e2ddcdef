// ABOUTME: Health check strategies for a single upstream connection
// ABOUTME: Five closed probes from a liveness ping up to a comprehensive check

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::McpClient;

/// How a connection judges whether its upstream is usable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckStrategy {
    /// Client reports itself connected
    #[default]
    BasicPing,
    /// Tool or resource listing succeeds
    CapabilityCheck,
    /// Tool listing succeeds and the first tool has a usable name
    ToolInvocation,
    /// Resource listing succeeds
    ResourceAccess,
    /// Every other strategy must pass
    Comprehensive,
}

impl HealthCheckStrategy {
    /// Run this strategy's probe against `client`
    ///
    /// Client errors count as a failed probe; the caller bounds the time.
    pub async fn probe(self, client: &dyn McpClient) -> bool {
        match self {
            Self::BasicPing => basic_ping(client),
            Self::CapabilityCheck => capability_check(client).await,
            Self::ToolInvocation => tool_invocation(client).await,
            Self::ResourceAccess => resource_access(client).await,
            Self::Comprehensive => comprehensive(client).await,
        }
    }
}

fn basic_ping(client: &dyn McpClient) -> bool {
    client.is_connected()
}

async fn capability_check(client: &dyn McpClient) -> bool {
    match client.list_tools().await {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "Tool listing failed, trying resources");
            client.list_resources().await.is_ok()
        }
    }
}

async fn tool_invocation(client: &dyn McpClient) -> bool {
    match client.list_tools().await {
        Ok(tools) => tools
            .first()
            .map_or(true, |tool| !tool.name.trim().is_empty()),
        Err(e) => {
            debug!(error = %e, "Tool listing failed");
            false
        }
    }
}

async fn resource_access(client: &dyn McpClient) -> bool {
    match client.list_resources().await {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "Resource listing failed");
            false
        }
    }
}

async fn comprehensive(client: &dyn McpClient) -> bool {
    basic_ping(client)
        && capability_check(client).await
        && tool_invocation(client).await
        && resource_access(client).await
}
