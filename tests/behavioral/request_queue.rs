// ABOUTME: Behavioral tests for pool backpressure
// Concurrency cap, bounded wait list and whole-request timeouts

use std::time::Duration;

use futures_util::future::join_all;
use mcp_resilience::{PoolConfig, ResilienceError, ServerConfig};
use serde_json::json;

use super::fixtures::{fast_resilience, scripted_pool, ScriptedFactory};

fn tight_pool_config(max_concurrent_requests: usize, max_queue_size: usize) -> PoolConfig {
    PoolConfig {
        max_concurrent_requests,
        max_queue_size,
        resilience: fast_resilience(),
        ..PoolConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_requests_beyond_capacity_and_queue_are_rejected() {
    let (pool, _factory) = scripted_pool(
        tight_pool_config(1, 1),
        ScriptedFactory::new().with_latency(Duration::from_millis(100)),
    );
    pool.add_server(ServerConfig::new("slow", "mcp"), None).await.unwrap();

    let calls = (0..5).map(|i| pool.call_tool("echo", json!({ "i": i }), None));
    let results = join_all(calls).await;

    let rejected: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(rejected.len(), 3);
    for err in &rejected {
        assert!(err.to_string().contains("queue is full"), "{err}");
    }
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);

    let metrics = pool.get_metrics();
    assert_eq!(metrics.total_requests, 5);
    assert_eq!(metrics.rejected_requests, 3);
    assert_eq!(metrics.successful_requests, 2);
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_times_out() {
    let config = PoolConfig {
        request_timeout: Duration::from_millis(150),
        ..tight_pool_config(1, 5)
    };
    let (pool, _factory) = scripted_pool(
        config,
        ScriptedFactory::new().with_latency(Duration::from_millis(100)),
    );
    pool.add_server(ServerConfig::new("slow", "mcp"), None).await.unwrap();

    // The second call waits 100ms for a slot, then needs another 100ms
    let (first, second) = tokio::join!(
        pool.call_tool("echo", json!({}), None),
        pool.call_tool("echo", json!({}), None),
    );

    assert!(first.is_ok());
    let err = second.unwrap_err();
    assert!(matches!(err, ResilienceError::Timeout { .. }), "{err}");
    assert!(err.to_string().contains("timed out after 150ms"));

    let metrics = pool.get_metrics();
    assert_eq!(metrics.timed_out_requests, 1);
    assert_eq!(metrics.failed_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_slot_is_released_after_each_request() {
    let (pool, _factory) = scripted_pool(tight_pool_config(1, 0), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();

    for _ in 0..5 {
        pool.call_tool("echo", json!({}), None).await.unwrap();
    }

    let status = pool.get_system_status();
    assert_eq!(status.queue.in_flight, 0);
    assert_eq!(status.queue.waiting, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_queued_work() {
    let (pool, _factory) = scripted_pool(tight_pool_config(1, 1), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    pool.shutdown().await;

    let err = pool.read_resource("file:///x", None).await.unwrap_err();
    assert!(matches!(err, ResilienceError::ShuttingDown));
}
