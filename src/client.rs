// ABOUTME: Client collaborator contract for a single upstream MCP server
//
// The resilience layer never inspects protocol framing. Everything it needs from
// an upstream server goes through the `McpClient` trait: connect/disconnect,
// liveness, tool calls, resource reads and catalog listing. A `ClientFactory`
// produces one client per configured server when the pool registers it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ServerConfig;

/// Errors reported by an upstream client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Transport-level failure (process died, pipe closed, spawn failed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered with a protocol-level error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The client is closed and cannot serve requests
    #[error("Client closed")]
    Closed,
}

/// A tool advertised by an upstream server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name as exposed by the server
    pub name: String,

    /// Optional human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolDescriptor {
    /// Create a descriptor with only a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// A resource advertised by an upstream server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource URI
    pub uri: String,

    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Opaque async client for one upstream server
///
/// Implementations own the subprocess/transport. All calls may be issued
/// concurrently from several tasks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait McpClient: Send + Sync {
    /// Establish the connection (spawn + handshake)
    async fn connect(&self) -> Result<(), ClientError>;

    /// Tear the connection down
    async fn disconnect(&self) -> Result<(), ClientError>;

    /// Whether the transport currently reports itself connected
    fn is_connected(&self) -> bool;

    /// Invoke a tool
    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ClientError>;

    /// Read a resource
    async fn read_resource(&self, uri: &str) -> Result<Value, ClientError>;

    /// List the tools the server advertises
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError>;

    /// List the resources the server advertises
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, ClientError>;
}

/// Creates the client for a server when it is added to the pool
pub trait ClientFactory: Send + Sync {
    /// Build a fresh, not-yet-connected client for `server`
    fn create(&self, server: &ServerConfig) -> Arc<dyn McpClient>;
}

impl<F> ClientFactory for F
where
    F: Fn(&ServerConfig) -> Arc<dyn McpClient> + Send + Sync,
{
    fn create(&self, server: &ServerConfig) -> Arc<dyn McpClient> {
        self(server)
    }
}
