// ABOUTME: Degraded-mode fallback chain producing substitute responses
// ABOUTME: Strategies are tried in configured order until one yields a payload

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One step of the fallback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Last live response for the same operation, if within the cache window
    CachedResponse,
    /// Structurally valid empty result
    DefaultResponse,
    /// Result flagged as a fallback with an explanatory message
    ErrorResponse,
}

/// Which client operation a payload stands in for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Tool,
    Resource,
}

impl OperationKind {
    /// Empty success payload for this operation kind
    pub fn default_payload(self) -> Value {
        match self {
            Self::Tool => json!({ "content": [], "isError": false }),
            Self::Resource => json!({ "contents": [] }),
        }
    }

    /// Payload marking the call as served by a fallback
    pub fn error_payload(self, message: &str) -> Value {
        match self {
            Self::Tool => json!({
                "content": [{ "type": "text", "text": message }],
                "isError": true,
                "fallback": true,
            }),
            Self::Resource => json!({
                "contents": [],
                "error": message,
                "fallback": true,
            }),
        }
    }
}

/// Walk `strategies` in order and return the first payload one yields
///
/// `cached` is the fresh cache entry for the operation, if any.
pub fn resolve(
    strategies: &[FallbackStrategy],
    kind: OperationKind,
    cached: Option<Value>,
    message: &str,
) -> Option<(FallbackStrategy, Value)> {
    let mut cached = cached;
    strategies.iter().find_map(|strategy| {
        let payload = match strategy {
            FallbackStrategy::CachedResponse => cached.take(),
            FallbackStrategy::DefaultResponse => Some(kind.default_payload()),
            FallbackStrategy::ErrorResponse => Some(kind.error_payload(message)),
        };
        payload.map(|value| (*strategy, value))
    })
}
