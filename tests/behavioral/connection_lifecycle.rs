// ABOUTME: Behavioral tests for a single resilient connection
// Connect retries with backoff, circuit breaking, health-driven degradation and
// the degraded-mode response cache

use std::sync::Arc;
use std::time::Duration;

use mcp_resilience::config::{CircuitBreakerConfig, HealthCheckConfig, RetryConfig};
use mcp_resilience::{
    CircuitBreakerState, ConnectionEvent, ConnectionState, McpClient, ResilienceConfig,
    ResilientConnection,
};
use pretty_assertions::assert_eq;
use serde_json::json;

use super::fixtures::{fast_resilience, strict_resilience, ScriptedClient};

fn connection(client: &Arc<ScriptedClient>, config: ResilienceConfig) -> ResilientConnection {
    let client: Arc<dyn McpClient> = Arc::clone(client) as Arc<dyn McpClient>;
    ResilientConnection::new("scripted", client, config)
}

#[tokio::test(start_paused = true)]
async fn test_connect_succeeds_after_two_failures() {
    let client = Arc::new(ScriptedClient::new("scripted").failing_connects(2));
    let conn = connection(&client, fast_resilience());

    conn.connect().await.expect("third attempt should connect");

    let stats = conn.stats();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(stats.total_connections, 3);
    assert_eq!(stats.successful_connections, 1);
    assert_eq!(stats.failed_connections, 2);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(client.connect_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_stay_within_jitter_bounds() {
    let client = Arc::new(ScriptedClient::new("scripted").failing_connects(2));
    let mut config = fast_resilience();
    config.retry = RetryConfig {
        max_retry_attempts: 3,
        base_retry_delay: Duration::from_millis(100),
        max_retry_delay: Duration::from_millis(10_000),
        retry_jitter_factor: 0.5,
    };
    let conn = connection(&client, config);

    conn.connect().await.unwrap();

    let times = client.connect_times();
    assert_eq!(times.len(), 3);
    for (attempt, pair) in times.windows(2).enumerate() {
        let delay = pair[1] - pair[0];
        let base = Duration::from_millis(100 * (1 << attempt));
        assert!(delay >= base, "attempt {attempt}: {delay:?} below {base:?}");
        assert!(
            delay <= base.mul_f64(1.5),
            "attempt {attempt}: {delay:?} above jitter bound"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_max_attempts() {
    let client = Arc::new(ScriptedClient::new("scripted").failing_connects(10));
    let conn = connection(&client, fast_resilience());

    let err = conn.connect().await.unwrap_err();

    assert!(err.to_string().contains("after 3 attempts"), "{err}");
    assert_eq!(client.connect_calls(), 3);
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert!(!conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_leaves_failed_state() {
    let client = Arc::new(ScriptedClient::new("scripted").failing_connects(3));
    let conn = connection(&client, fast_resilience());
    assert!(conn.connect().await.is_err());

    conn.reconnect().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(client.connect_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_rejects_without_calling_client() {
    let client = Arc::new(ScriptedClient::new("scripted").failing_calls(2));
    let mut config = strict_resilience();
    config.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        ..CircuitBreakerConfig::default()
    };
    let conn = connection(&client, config);
    conn.connect().await.unwrap();

    assert!(conn.call_tool("echo", json!({})).await.is_err());
    assert!(conn.call_tool("echo", json!({})).await.is_err());
    assert_eq!(conn.circuit_breaker_state(), CircuitBreakerState::Open);
    assert_eq!(conn.state(), ConnectionState::CircuitOpen);

    let err = conn.call_tool("echo", json!({})).await.unwrap_err();
    assert!(err.to_string().contains("Circuit breaker is OPEN"), "{err}");
    assert_eq!(client.operation_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_successful_probe_after_recovery_timeout_closes_circuit() {
    let client = Arc::new(ScriptedClient::new("scripted").failing_calls(1));
    let mut config = strict_resilience();
    config.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_millis(1_000),
        half_open_max_attempts: 3,
    };
    let conn = connection(&client, config);
    conn.connect().await.unwrap();

    assert!(conn.call_tool("echo", json!({})).await.is_err());
    assert_eq!(conn.state(), ConnectionState::CircuitOpen);

    tokio::time::sleep(Duration::from_millis(1_001)).await;
    let value = conn.call_tool("echo", json!({ "n": 1 })).await.unwrap();

    assert_eq!(value["args"]["n"], 1);
    assert_eq!(conn.circuit_breaker_state(), CircuitBreakerState::Closed);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_health_failures_wait_for_open_circuit_before_reconnecting() {
    let client = Arc::new(ScriptedClient::new("scripted"));
    let mut config = strict_resilience();
    config.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(58),
        ..CircuitBreakerConfig::default()
    };
    config.health_check = HealthCheckConfig {
        interval: Duration::from_secs(5),
        timeout: Duration::from_secs(1),
        consecutive_failure_threshold: 1,
        recovery_check_interval: Duration::from_secs(5),
        ..HealthCheckConfig::default()
    };
    let conn = connection(&client, config);
    conn.connect().await.unwrap();

    client.set_reachable(false);
    client.fail_calls_from_now(1);
    assert!(conn.call_tool("echo", json!({})).await.is_err());
    assert_eq!(conn.state(), ConnectionState::CircuitOpen);

    // Probes at 5s..20s fail but the breaker still blocks connect attempts
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(conn.state(), ConnectionState::CircuitOpen);
    assert_eq!(client.connect_calls(), 1);
    assert_eq!(client.disconnect_calls(), 0);
    assert_eq!(conn.stats().total_connections, 1);

    // The failed probe at 60s is past the deadline; its reconnect is the half-open attempt
    tokio::time::sleep(Duration::from_secs(42)).await;
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.circuit_breaker_state(), CircuitBreakerState::Closed);
    assert_eq!(client.connect_calls(), 2);
    assert_eq!(conn.stats().total_connections, 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_while_open_circuit_fails_fast() {
    let client = Arc::new(ScriptedClient::new("scripted").failing_calls(1));
    let mut config = strict_resilience();
    config.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 1,
        ..CircuitBreakerConfig::default()
    };
    let conn = connection(&client, config);
    conn.connect().await.unwrap();
    assert!(conn.call_tool("echo", json!({})).await.is_err());

    let err = conn.reconnect().await.unwrap_err();

    assert!(err.to_string().contains("Circuit breaker is OPEN"), "{err}");
    assert_eq!(conn.state(), ConnectionState::CircuitOpen);
    assert_eq!(client.disconnect_calls(), 0);
    assert_eq!(conn.stats().total_connections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reconnects_share_one_cycle() {
    let client = Arc::new(ScriptedClient::new("scripted"));
    let mut config = strict_resilience();
    config.health_check = HealthCheckConfig {
        consecutive_failure_threshold: 1,
        ..HealthCheckConfig::default()
    };
    let conn = connection(&client, config);
    conn.connect().await.unwrap();

    // The failed check starts a background reconnect; the explicit one joins it
    client.set_reachable(false);
    assert!(!conn.force_health_check().await);
    conn.reconnect().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(client.disconnect_calls(), 1);
    assert_eq!(client.connect_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_health_checks_degrade_then_recover() {
    let client = Arc::new(ScriptedClient::new("scripted"));
    let conn = connection(&client, fast_resilience());
    conn.connect().await.unwrap();

    client.set_reachable(false);
    for _ in 0..2 {
        assert!(!conn.force_health_check().await);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
    assert!(!conn.force_health_check().await);
    assert_eq!(conn.state(), ConnectionState::Degraded);
    assert!(conn.is_available());
    assert!(!conn.is_healthy());

    client.set_reachable(true);
    assert!(conn.force_health_check().await);
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.stats().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_health_timer_drives_degradation_and_recovery() {
    let client = Arc::new(ScriptedClient::new("scripted"));
    let mut config = fast_resilience();
    config.health_check = HealthCheckConfig {
        interval: Duration::from_millis(1_000),
        timeout: Duration::from_millis(500),
        recovery_check_interval: Duration::from_millis(400),
        ..HealthCheckConfig::default()
    };
    let conn = connection(&client, config);
    conn.connect().await.unwrap();

    // Probes at 1s, 2s and 3s fail
    client.set_reachable(false);
    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert_eq!(conn.state(), ConnectionState::Degraded);

    // Degraded connections are probed on the faster recovery interval (3.4s)
    client.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_connection_serves_cache_within_window() {
    let client = Arc::new(ScriptedClient::new("scripted"));
    let mut config = fast_resilience();
    config.degraded_mode.cache_responses = Duration::from_millis(1_000);
    let conn = connection(&client, config);
    conn.connect().await.unwrap();

    let live = conn.call_tool("echo", json!({ "n": 1 })).await.unwrap();

    client.set_reachable(false);
    for _ in 0..3 {
        conn.force_health_check().await;
    }
    assert_eq!(conn.state(), ConnectionState::Degraded);

    let cached = conn.call_tool("echo", json!({ "n": 2 })).await.unwrap();
    assert_eq!(cached, live);
    assert_eq!(client.operation_calls(), 1);

    tokio::time::sleep(Duration::from_millis(1_001)).await;
    let fresh = conn.call_tool("echo", json!({ "n": 3 })).await.unwrap();
    assert_eq!(fresh["args"]["n"], 3);
    assert_eq!(client.operation_calls(), 2);

    conn.clear_cache();
    let after_clear = conn.call_tool("echo", json!({ "n": 4 })).await.unwrap();
    assert_eq!(after_clear["args"]["n"], 4);
    assert_eq!(client.operation_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_mode_answers_for_unreachable_server() {
    let client = Arc::new(ScriptedClient::new("scripted").failing_calls(1));
    let conn = connection(&client, fast_resilience());
    conn.connect().await.unwrap();

    // Nothing cached yet, so the default response stands in
    let tool = conn.call_tool("echo", json!({})).await.unwrap();
    assert_eq!(tool, json!({ "content": [], "isError": false }));

    conn.disconnect().await.unwrap();
    let resource = conn.read_resource("file:///notes.md").await.unwrap();
    assert_eq!(resource, json!({ "contents": [] }));
}

#[tokio::test(start_paused = true)]
async fn test_state_changes_are_published() {
    let client = Arc::new(ScriptedClient::new("scripted"));
    let conn = connection(&client, fast_resilience());
    let mut events = conn.subscribe();

    conn.connect().await.unwrap();
    conn.disconnect().await.unwrap();

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::StateChange {
            new_state,
            old_state,
        } = event
        {
            transitions.push((old_state, new_state));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Connected),
            (ConnectionState::Connected, ConnectionState::Disconnected),
        ]
    );
}
