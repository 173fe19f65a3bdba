// ABOUTME: Audit trail for job submissions, lifecycle outcomes and alert handling
// ABOUTME: Entries go to an injected sink; the default sink logs on the `audit` target

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    JobSubmitted,
    JobRejected,
    JobCompleted,
    JobFailed,
    JobCancelled,
    AlertAcknowledged,
    AlertResolved,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::JobSubmitted => "job_submitted",
            AuditAction::JobRejected => "job_rejected",
            AuditAction::JobCompleted => "job_completed",
            AuditAction::JobFailed => "job_failed",
            AuditAction::JobCancelled => "job_cancelled",
            AuditAction::AlertAcknowledged => "alert_acknowledged",
            AuditAction::AlertResolved => "alert_resolved",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub actor: String,
    /// Job or alert id.
    pub resource_id: Option<String>,
    pub organization_id: Option<String>,
    pub success: bool,
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, actor: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            actor: actor.into(),
            resource_id: None,
            organization_id: None,
            success: true,
            details: None,
        }
    }

    pub fn resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn organization(mut self, id: impl Into<String>) -> Self {
        self.organization_id = Some(id.into());
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> anyhow::Result<()>;
}

/// Writes each entry as a structured `tracing` event.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        tracing::info!(
            target: "audit",
            action = %entry.action,
            actor = %entry.actor,
            resource_id = entry.resource_id.as_deref().unwrap_or(""),
            organization_id = entry.organization_id.as_deref().unwrap_or(""),
            success = entry.success,
            details = %entry.details.as_ref().map(|d| d.to_string()).unwrap_or_default(),
            "Audit"
        );
        Ok(())
    }
}
