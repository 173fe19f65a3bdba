// ABOUTME: Alert records and the in-memory alert book with acknowledge/resolve lifecycle
// ABOUTME: Resolved alerts older than the retention window are purged

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MigratorError, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CriticalError,
    ThresholdExceeded,
    PatternDetected,
    SystemHealth,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::CriticalError => "critical_error",
            AlertKind::ThresholdExceeded => "threshold_exceeded",
            AlertKind::PatternDetected => "pattern_detected",
            AlertKind::SystemHealth => "system_health",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub job_id: Option<String>,
    pub error_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            severity,
            title: title.into(),
            message: message.into(),
            job_id: None,
            error_id: None,
            created_at: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            resolution_note: None,
        }
    }

    pub fn for_job(mut self, job_id: Option<&str>) -> Self {
        self.job_id = job_id.map(str::to_string);
        self
    }

    pub fn for_error(mut self, error_id: &str) -> Self {
        self.error_id = Some(error_id.to_string());
        self
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[derive(Debug, Default)]
pub struct AlertBook {
    alerts: Vec<Alert>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, alert: Alert) {
        self.alerts.push(alert);
    }

    pub fn all(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn unresolved(&self) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|a| !a.is_resolved())
            .cloned()
            .collect()
    }

    fn find_mut(&mut self, alert_id: &str) -> Result<&mut Alert, MigratorError> {
        self.alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| MigratorError::AlertNotFound(alert_id.to_string()))
    }

    /// Acknowledging twice keeps the first actor and timestamp.
    pub fn acknowledge(&mut self, alert_id: &str, actor: &str) -> Result<Alert, MigratorError> {
        let alert = self.find_mut(alert_id)?;
        if alert.acknowledged_at.is_none() {
            alert.acknowledged_by = Some(actor.to_string());
            alert.acknowledged_at = Some(Utc::now());
        }
        Ok(alert.clone())
    }

    /// Resolving also acknowledges an alert nobody acknowledged yet.
    pub fn resolve(
        &mut self,
        alert_id: &str,
        actor: &str,
        note: Option<String>,
    ) -> Result<Alert, MigratorError> {
        let alert = self.find_mut(alert_id)?;
        let now = Utc::now();
        if alert.acknowledged_at.is_none() {
            alert.acknowledged_by = Some(actor.to_string());
            alert.acknowledged_at = Some(now);
        }
        if alert.resolved_at.is_none() {
            alert.resolved_by = Some(actor.to_string());
            alert.resolved_at = Some(now);
            alert.resolution_note = note;
        }
        Ok(alert.clone())
    }

    /// Drop alerts resolved before `now - retention_days`. Returns how many went.
    pub fn purge_resolved(&mut self, retention_days: i64, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::days(retention_days);
        let before = self.alerts.len();
        self.alerts
            .retain(|a| a.resolved_at.map_or(true, |resolved| resolved >= cutoff));
        before - self.alerts.len()
    }
}
