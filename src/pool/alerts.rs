// ABOUTME: Operator alerts raised by the pool manager
// ABOUTME: Bounded in-memory log with one-way acknowledgement

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// An alert raised on a threshold breach or connection failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Alert history, trimmed oldest-first beyond `max_alerts`
#[derive(Debug)]
pub struct AlertLog {
    max_alerts: usize,
    alerts: VecDeque<Alert>,
}

impl AlertLog {
    pub fn new(max_alerts: usize) -> Self {
        Self {
            max_alerts,
            alerts: VecDeque::new(),
        }
    }

    /// Record a new alert and return it
    pub fn push(
        &mut self,
        severity: AlertSeverity,
        message: impl Into<String>,
        server_name: Option<&str>,
    ) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            severity,
            message: message.into(),
            server_name: server_name.map(str::to_string),
            timestamp: Utc::now(),
            acknowledged: false,
        };
        self.alerts.push_back(alert.clone());
        self.trim();
        alert
    }

    /// Mark an alert acknowledged
    ///
    /// Returns true only for the first acknowledgement of a known alert.
    pub fn acknowledge(&mut self, id: Uuid) -> bool {
        match self.alerts.iter_mut().find(|alert| alert.id == id) {
            Some(alert) if !alert.acknowledged => {
                alert.acknowledged = true;
                true
            }
            _ => false,
        }
    }

    /// Alerts oldest first
    pub fn list(&self, include_acknowledged: bool) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|alert| include_acknowledged || !alert.acknowledged)
            .cloned()
            .collect()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.alerts.iter().filter(|alert| !alert.acknowledged).count()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn set_max_alerts(&mut self, max_alerts: usize) {
        self.max_alerts = max_alerts;
        self.trim();
    }

    fn trim(&mut self) {
        while self.alerts.len() > self.max_alerts {
            self.alerts.pop_front();
        }
    }
}
