// ABOUTME: Pool metrics: request counters, system snapshots and alert thresholds
//
// Tracks:
// - Requests: total, successful, failed, rejected (queue full), timed out
// - Servers: healthy vs unhealthy, response time averaged across connections
// - Per-server error rate between two collections, for threshold alerts

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alerts::{Alert, AlertSeverity};
use crate::config::AlertThresholds;

/// Pool-level request counters
#[derive(Debug, Default)]
pub struct PoolCounters {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rejected_requests: AtomicU64,
    timed_out_requests: AtomicU64,
}

/// Point-in-time copy of [`PoolCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

impl PoolCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_started(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_succeeded(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue-full rejection; also counted as failed
    pub fn request_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
        self.request_failed();
    }

    /// Request timeout; also counted as failed
    pub fn request_timed_out(&self) {
        self.timed_out_requests.fetch_add(1, Ordering::Relaxed);
        self.request_failed();
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total_requests.load(Ordering::Relaxed),
            successful: self.successful_requests.load(Ordering::Relaxed),
            failed: self.failed_requests.load(Ordering::Relaxed),
            rejected: self.rejected_requests.load(Ordering::Relaxed),
            timed_out: self.timed_out_requests.load(Ordering::Relaxed),
        }
    }
}

/// What metrics collection reads from one connection
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSample {
    pub name: String,
    pub healthy: bool,
    pub total_operations: u64,
    pub failed_operations: u64,
    pub consecutive_failures: u32,
    pub average_response_time_ms: f64,
}

/// Snapshot of the whole pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub unhealthy_servers: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub timed_out_requests: u64,
    pub average_response_time_ms: f64,
    pub error_rate_percent: f64,
    /// Requests waiting for a slot
    pub queue_size: usize,
    pub in_flight_requests: usize,
    /// Unacknowledged alerts at collection time
    pub alerts: Vec<Alert>,
}

impl SystemMetrics {
    /// Aggregate connection samples and request counters
    #[allow(clippy::cast_precision_loss)]
    pub fn aggregate(
        samples: &[ServerSample],
        counters: CounterSnapshot,
        queue_size: usize,
        in_flight_requests: usize,
        alerts: Vec<Alert>,
    ) -> Self {
        let healthy_servers = samples.iter().filter(|s| s.healthy).count();

        // Response time weighted by each server's operation count
        let operations: u64 = samples.iter().map(|s| s.total_operations).sum();
        let average_response_time_ms = if operations == 0 {
            0.0
        } else {
            samples
                .iter()
                .map(|s| s.average_response_time_ms * s.total_operations as f64)
                .sum::<f64>()
                / operations as f64
        };

        let error_rate_percent = if counters.total == 0 {
            0.0
        } else {
            counters.failed as f64 / counters.total as f64 * 100.0
        };

        Self {
            timestamp: Utc::now(),
            total_servers: samples.len(),
            healthy_servers,
            unhealthy_servers: samples.len() - healthy_servers,
            total_requests: counters.total,
            successful_requests: counters.successful,
            failed_requests: counters.failed,
            rejected_requests: counters.rejected,
            timed_out_requests: counters.timed_out,
            average_response_time_ms,
            error_rate_percent,
            queue_size,
            in_flight_requests,
            alerts,
        }
    }
}

/// Which threshold a breach crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreachKind {
    ErrorRate,
    ConsecutiveFailures,
    ResponseTime,
    UnhealthyServers,
}

/// An alert the thresholds call for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertCandidate {
    pub kind: BreachKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub server_name: Option<String>,
}

impl AlertCandidate {
    fn new(kind: BreachKind, severity: AlertSeverity, message: String, server_name: Option<&str>) -> Self {
        Self {
            kind,
            severity,
            message,
            server_name: server_name.map(str::to_string),
        }
    }
}

/// Breaches seen at the last collection
///
/// A breach alerts once when it starts; it can alert again only after a
/// collection where it was no longer breached.
#[derive(Debug, Default)]
pub struct BreachTracker {
    active: HashSet<(BreachKind, Option<String>)>,
}

impl BreachTracker {
    /// Keep the breaches that were not active last time, and remember the
    /// current set
    pub fn starting(&mut self, candidates: Vec<AlertCandidate>) -> Vec<AlertCandidate> {
        let current: HashSet<_> = candidates
            .iter()
            .map(|candidate| (candidate.kind, candidate.server_name.clone()))
            .collect();
        let previous = std::mem::replace(&mut self.active, current);
        candidates
            .into_iter()
            .filter(|candidate| !previous.contains(&(candidate.kind, candidate.server_name.clone())))
            .collect()
    }

    /// Drop breaches for a server that left the pool
    pub fn forget_server(&mut self, server_name: &str) {
        self.active
            .retain(|(_, name)| name.as_deref() != Some(server_name));
    }
}

/// Compare a collection against the alert thresholds
///
/// `previous` holds each server's (total, failed) operation counts from the
/// last collection and is updated in place, so error rates cover exactly one
/// metrics interval.
#[allow(clippy::cast_precision_loss)]
pub fn evaluate_thresholds(
    thresholds: &AlertThresholds,
    metrics: &SystemMetrics,
    samples: &[ServerSample],
    previous: &mut HashMap<String, (u64, u64)>,
) -> Vec<AlertCandidate> {
    let mut alerts = Vec::new();

    for sample in samples {
        let (prev_total, prev_failed) = previous
            .insert(
                sample.name.clone(),
                (sample.total_operations, sample.failed_operations),
            )
            .unwrap_or((0, 0));
        let total = sample.total_operations.saturating_sub(prev_total);
        let failed = sample.failed_operations.saturating_sub(prev_failed);
        if total > 0 {
            let rate = failed as f64 / total as f64 * 100.0;
            if rate > thresholds.error_rate_percent {
                alerts.push(AlertCandidate::new(
                    BreachKind::ErrorRate,
                    AlertSeverity::Warning,
                    format!(
                        "Server '{}' error rate {rate:.1}% exceeds {:.1}%",
                        sample.name, thresholds.error_rate_percent
                    ),
                    Some(&sample.name),
                ));
            }
        }

        if sample.consecutive_failures > thresholds.consecutive_failures_threshold {
            alerts.push(AlertCandidate::new(
                BreachKind::ConsecutiveFailures,
                AlertSeverity::Error,
                format!(
                    "Server '{}' has {} consecutive failures",
                    sample.name, sample.consecutive_failures
                ),
                Some(&sample.name),
            ));
        }
    }
    previous.retain(|name, _| samples.iter().any(|s| &s.name == name));

    if metrics.average_response_time_ms > thresholds.response_time_ms {
        alerts.push(AlertCandidate::new(
            BreachKind::ResponseTime,
            AlertSeverity::Warning,
            format!(
                "Average response time {:.0}ms exceeds {:.0}ms",
                metrics.average_response_time_ms, thresholds.response_time_ms
            ),
            None,
        ));
    }

    if metrics.total_servers > 0 {
        let unhealthy_percent =
            metrics.unhealthy_servers as f64 / metrics.total_servers as f64 * 100.0;
        if unhealthy_percent > thresholds.unhealthy_server_percent {
            alerts.push(AlertCandidate::new(
                BreachKind::UnhealthyServers,
                AlertSeverity::Error,
                format!(
                    "{} of {} servers unhealthy ({unhealthy_percent:.0}%)",
                    metrics.unhealthy_servers, metrics.total_servers
                ),
                None,
            ));
        }
    }

    alerts
}
