// ABOUTME: Behavioral tests for pool routing, failover, recovery and alerting
// Exercises the pool manager through its public API with scripted upstreams

use std::time::Duration;

use mcp_resilience::config::{
    AlertThresholds, CircuitBreakerConfig, HealthCheckConfig, PoolConfigUpdate,
    ResilienceConfigUpdate,
};
use mcp_resilience::pool::{FailoverStrategy, LoadBalancingStrategy};
use mcp_resilience::{
    AlertSeverity, CircuitBreakerState, ConnectionState, PoolConfig, PoolEvent, ResilienceConfig,
    ResilienceError, ServerConfig,
};
use pretty_assertions::assert_eq;
use serde_json::json;

use super::fixtures::{fast_resilience, scripted_pool, strict_resilience, ScriptedFactory};

fn pool_config(resilience: ResilienceConfig) -> PoolConfig {
    PoolConfig {
        resilience,
        ..PoolConfig::default()
    }
}

/// Let event forwarders catch up
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_alternates_between_two_servers() {
    let (pool, factory) = scripted_pool(pool_config(fast_resilience()), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("A", "mcp-a"), None).await.unwrap();
    pool.add_server(ServerConfig::new("B", "mcp-b"), None).await.unwrap();

    for _ in 0..4 {
        pool.call_tool("echo", json!({}), None).await.unwrap();
    }

    assert_eq!(factory.routes(), vec!["A", "B", "A", "B"]);
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_share_is_even() {
    let (pool, factory) = scripted_pool(pool_config(fast_resilience()), ScriptedFactory::new());
    for name in ["a", "b", "c"] {
        pool.add_server(ServerConfig::new(name, "mcp"), None).await.unwrap();
    }

    for _ in 0..10 {
        pool.read_resource("file:///readme", None).await.unwrap();
    }

    let routes = factory.routes();
    let counts: Vec<usize> = ["a", "b", "c"]
        .iter()
        .map(|name| routes.iter().filter(|r| r == name).count())
        .collect();
    let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
    assert!(spread <= 1, "uneven share: {counts:?}");
}

#[tokio::test(start_paused = true)]
async fn test_capacity_limit_rejects_extra_server() {
    let config = PoolConfig {
        max_total_connections: 2,
        ..pool_config(fast_resilience())
    };
    let (pool, _factory) = scripted_pool(config, ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    pool.add_server(ServerConfig::new("b", "mcp"), None).await.unwrap();

    let err = pool
        .add_server(ServerConfig::new("c", "mcp"), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Maximum connection limit reached"));
    assert_eq!(pool.server_names(), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_preferred_server_with_open_circuit_is_skipped() {
    let (pool, factory) = scripted_pool(pool_config(strict_resilience()), ScriptedFactory::new());
    let overrides = ResilienceConfigUpdate {
        circuit_breaker: Some(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }),
        ..ResilienceConfigUpdate::default()
    };
    pool.add_server(ServerConfig::new("primary", "mcp"), Some(overrides))
        .await
        .unwrap();
    pool.add_server(ServerConfig::new("backup", "mcp"), None).await.unwrap();

    factory.client("primary").fail_calls_from_now(1);
    assert!(pool.call_tool("echo", json!({}), Some("primary")).await.is_err());
    assert_eq!(
        pool.connection("primary").unwrap().state(),
        ConnectionState::CircuitOpen
    );

    let value = pool.call_tool("echo", json!({}), Some("primary")).await.unwrap();
    assert_eq!(value["server"], "backup");
    assert_eq!(factory.client("primary").operation_calls(), 1);

    // Past the recovery timeout the preferred server takes the half-open call
    tokio::time::sleep(Duration::from_secs(61)).await;
    let value = pool.call_tool("echo", json!({}), Some("primary")).await.unwrap();
    assert_eq!(value["server"], "primary");
    assert_eq!(
        pool.connection("primary").unwrap().state(),
        ConnectionState::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_recovers_through_pool_routing() {
    let mut resilience = strict_resilience();
    resilience.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(1),
        ..CircuitBreakerConfig::default()
    };
    let (pool, factory) = scripted_pool(pool_config(resilience), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("solo", "mcp"), None).await.unwrap();
    let connection = pool.connection("solo").unwrap();

    factory.client("solo").fail_calls_from_now(1);
    assert!(pool.call_tool("echo", json!({}), None).await.is_err());
    assert_eq!(connection.state(), ConnectionState::CircuitOpen);

    // Inside the recovery window there is nothing to route to
    let err = pool.call_tool("echo", json!({}), None).await.unwrap_err();
    assert!(matches!(err, ResilienceError::NoAvailableServer), "{err}");

    // Passing health checks alone leave the circuit to its next call
    tokio::time::sleep(Duration::from_secs(600)).await;
    let value = pool.call_tool("echo", json!({ "n": 1 }), None).await.unwrap();

    assert_eq!(value["server"], "solo");
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.circuit_breaker_state(), CircuitBreakerState::Closed);
    assert_eq!(factory.client("solo").operation_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_immediate_failover_recovers_the_request() {
    let config = PoolConfig {
        failover: FailoverStrategy::Immediate,
        ..pool_config(strict_resilience())
    };
    let (pool, factory) = scripted_pool(config, ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    pool.add_server(ServerConfig::new("b", "mcp"), None).await.unwrap();
    factory.client("a").fail_calls_from_now(1);

    let value = pool.call_tool("echo", json!({}), None).await.unwrap();

    assert_eq!(value["server"], "b");
    assert_eq!(factory.routes(), vec!["a", "b"]);
    assert_eq!(pool.get_metrics().failed_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_failover_surfaces_the_error() {
    let (pool, factory) = scripted_pool(pool_config(strict_resilience()), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    pool.add_server(ServerConfig::new("b", "mcp"), None).await.unwrap();
    factory.client("a").fail_calls_from_now(1);

    assert!(pool.call_tool("echo", json!({}), None).await.is_err());
    assert_eq!(pool.get_metrics().failed_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_least_connections_after_config_update() {
    let (pool, factory) = scripted_pool(pool_config(fast_resilience()), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    pool.add_server(ServerConfig::new("b", "mcp"), None).await.unwrap();

    pool.update_config(PoolConfigUpdate {
        load_balancing: Some(LoadBalancingStrategy::LeastConnections),
        ..PoolConfigUpdate::default()
    });

    // With nothing in flight the first registered server wins every time
    for _ in 0..3 {
        pool.call_tool("echo", json!({}), None).await.unwrap();
    }
    assert_eq!(factory.routes(), vec!["a", "a", "a"]);
}

#[tokio::test(start_paused = true)]
async fn test_config_update_reaches_connections() {
    let (pool, _factory) = scripted_pool(pool_config(fast_resilience()), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();

    pool.update_config(PoolConfigUpdate {
        resilience: Some(ResilienceConfigUpdate {
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            }),
            ..ResilienceConfigUpdate::default()
        }),
        ..PoolConfigUpdate::default()
    });

    let connection = pool.connection("a").unwrap();
    assert_eq!(connection.config().circuit_breaker.failure_threshold, 1);
    assert_eq!(pool.config().resilience.circuit_breaker.failure_threshold, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_server_raises_alert_and_recovers_on_demand() {
    let (pool, factory) = scripted_pool(
        pool_config(fast_resilience()),
        ScriptedFactory::new().with_connect_failures("flaky", 3),
    );
    let mut events = pool.subscribe();

    pool.add_server(ServerConfig::new("flaky", "mcp"), None).await.unwrap();
    settle().await;

    let connection = pool.connection("flaky").unwrap();
    assert_eq!(connection.state(), ConnectionState::Failed);
    let alerts = pool.get_alerts(false);
    assert!(alerts
        .iter()
        .any(|a| a.severity == AlertSeverity::Critical && a.message.contains("FAILED")));
    assert!(alerts.iter().any(|a| a.severity == AlertSeverity::Error));

    pool.force_recovery("flaky").await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(factory.client("flaky").connect_calls(), 4);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert!(names.contains(&"serverAdded"));
    assert!(names.contains(&"connectionStateChange"));
    assert!(names.contains(&"alert"));
}

#[tokio::test(start_paused = true)]
async fn test_force_recovery_runs_one_reconnect_cycle() {
    let mut resilience = strict_resilience();
    resilience.health_check = HealthCheckConfig {
        consecutive_failure_threshold: 1,
        ..HealthCheckConfig::default()
    };
    let (pool, factory) = scripted_pool(pool_config(resilience), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    let client = factory.client("a");

    client.set_reachable(false);
    pool.force_recovery("a").await.unwrap();
    settle().await;

    assert_eq!(client.disconnect_calls(), 1);
    assert_eq!(client.connect_calls(), 2);
    assert_eq!(pool.connection("a").unwrap().state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_server_is_not_routed_to() {
    let (pool, _factory) = scripted_pool(
        pool_config(fast_resilience()),
        ScriptedFactory::new().with_connect_failures("down", 3),
    );
    pool.add_server(ServerConfig::new("down", "mcp"), None).await.unwrap();
    pool.add_server(ServerConfig::new("up", "mcp"), None).await.unwrap();

    for _ in 0..3 {
        let value = pool.call_tool("echo", json!({}), Some("down")).await.unwrap();
        assert_eq!(value["server"], "up");
    }
}

#[tokio::test(start_paused = true)]
async fn test_remove_server_then_route_to_remaining() {
    let (pool, factory) = scripted_pool(pool_config(fast_resilience()), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    pool.add_server(ServerConfig::new("b", "mcp"), None).await.unwrap();
    let mut events = pool.subscribe();

    pool.remove_server("a").await.unwrap();
    pool.remove_server("never-added").await.unwrap();

    for _ in 0..2 {
        pool.call_tool("echo", json!({}), None).await.unwrap();
    }
    assert_eq!(factory.routes(), vec!["b", "b"]);
    assert!(!factory.client("a").is_connected_now());
    let mut removed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::ServerRemoved { server_name } = event {
            removed.push(server_name);
        }
    }
    assert_eq!(removed, vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn test_threshold_alerts_and_acknowledgement() {
    let config = PoolConfig {
        alert_thresholds: AlertThresholds {
            unhealthy_server_percent: 40.0,
            ..AlertThresholds::default()
        },
        ..pool_config(fast_resilience())
    };
    let (pool, factory) = scripted_pool(config, ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    pool.add_server(ServerConfig::new("b", "mcp"), None).await.unwrap();

    // Three failed probes put "b" into degraded mode, which is not healthy
    factory.client("b").set_reachable(false);
    let b = pool.connection("b").unwrap();
    for _ in 0..3 {
        b.force_health_check().await;
    }

    let metrics = pool.collect_system_metrics();
    assert_eq!(metrics.healthy_servers, 1);
    assert_eq!(metrics.unhealthy_servers, 1);

    let alert = pool
        .get_alerts(false)
        .into_iter()
        .find(|a| a.message.contains("1 of 2 servers unhealthy"))
        .expect("unhealthy share alert");
    assert_eq!(alert.severity, AlertSeverity::Error);

    assert!(pool.acknowledge_alert(alert.id));
    assert!(!pool.acknowledge_alert(alert.id));
    assert!(pool.get_alerts(false).iter().all(|a| a.id != alert.id));
    assert!(pool.get_alerts(true).iter().any(|a| a.id == alert.id));

    // The breach persists but has already been reported
    for _ in 0..3 {
        pool.collect_system_metrics();
    }
    let repeats = pool
        .get_alerts(true)
        .iter()
        .filter(|a| a.message.contains("servers unhealthy"))
        .count();
    assert_eq!(repeats, 1);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_timer_publishes_updates() {
    let config = PoolConfig {
        metrics_interval: Duration::from_millis(500),
        ..pool_config(fast_resilience())
    };
    let (pool, _factory) = scripted_pool(config, ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    let mut events = pool.subscribe();

    tokio::time::sleep(Duration::from_millis(600)).await;

    let mut saw_metrics = false;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::MetricsUpdated { metrics } = event {
            assert_eq!(metrics.total_servers, 1);
            saw_metrics = true;
        }
    }
    assert!(saw_metrics);
    assert!(pool.get_system_status().last_metrics.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_system_status_and_server_stats() {
    let (pool, _factory) = scripted_pool(pool_config(fast_resilience()), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    pool.add_server(ServerConfig::new("b", "mcp"), None).await.unwrap();
    pool.call_tool("echo", json!({}), Some("b")).await.unwrap();

    let stats = pool.get_server_stats(Some("b"));
    assert_eq!(stats.len(), 1);
    assert_eq!(stats["b"].total_operations, 1);
    assert_eq!(pool.get_server_stats(None).len(), 2);

    let status = pool.get_system_status();
    let names: Vec<_> = status.servers.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert!(status.servers.iter().all(|s| s.healthy && !s.idle));
    assert_eq!(status.queue.in_flight, 0);
    assert!(!status.shutting_down);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects_every_server() {
    let (pool, factory) = scripted_pool(pool_config(fast_resilience()), ScriptedFactory::new());
    pool.add_server(ServerConfig::new("a", "mcp"), None).await.unwrap();
    pool.add_server(ServerConfig::new("b", "mcp"), None).await.unwrap();

    assert!(pool.shutdown().await.is_empty());

    assert!(!factory.client("a").is_connected_now());
    assert!(!factory.client("b").is_connected_now());
    assert!(pool.get_system_status().shutting_down);
    assert!(pool
        .add_server(ServerConfig::new("c", "mcp"), None)
        .await
        .is_err());
}
