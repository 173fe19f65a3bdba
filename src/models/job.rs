// ABOUTME: Job lifecycle, progress snapshot and error record types
// ABOUTME: Status transitions are monotonic: pending -> running -> completed|failed|cancelled

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::options::{CloneType, MigrationOptions};
use super::phase::Phase;
use crate::error::{ErrorCode, MigratorError, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: Phase,
    pub name: String,
    pub status: PhaseStatus,
    pub percentage: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCounters {
    pub tables_migrated: u64,
    pub tables_total: u64,
    pub rows_migrated: u64,
    pub rows_total: u64,
    pub storage_objects_migrated: u64,
    pub storage_objects_total: u64,
    pub functions_migrated: u64,
    pub functions_total: u64,
}

/// Progress snapshot. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub overall_percentage: f64,
    pub current_phase: Option<Phase>,
    pub phases: Vec<PhaseProgress>,
    pub counters: MigrationCounters,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            overall_percentage: 0.0,
            current_phase: None,
            phases: Phase::ALL
                .iter()
                .map(|phase| PhaseProgress {
                    phase: *phase,
                    name: phase.display_name().to_string(),
                    status: PhaseStatus::Pending,
                    percentage: 0.0,
                    started_at: None,
                    completed_at: None,
                    details: None,
                })
                .collect(),
            counters: MigrationCounters::default(),
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseProgress> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Copy with one phase entry changed.
    pub fn with_phase(&self, phase: Phase, update: impl FnOnce(&mut PhaseProgress)) -> Self {
        let mut next = self.clone();
        if let Some(entry) = next.phases.iter_mut().find(|p| p.phase == phase) {
            update(entry);
        }
        next
    }

    /// Copy with the overall percentage raised to `percentage`; never lowers it.
    pub fn advanced_to(&self, percentage: f64) -> Self {
        let mut next = self.clone();
        next.overall_percentage = next.overall_percentage.max(percentage.clamp(0.0, 100.0));
        next
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// One fault observed while running a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub severity: Severity,
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
    pub auto_recoverable: bool,
    pub recovery_attempted: bool,
    pub recovery_succeeded: bool,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl ErrorRecord {
    pub fn new(
        phase: Phase,
        code: ErrorCode,
        severity: Severity,
        message: impl Into<String>,
        details: Option<String>,
        auto_recoverable: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            phase,
            severity,
            code,
            message: message.into(),
            details,
            auto_recoverable,
            recovery_attempted: false,
            recovery_succeeded: false,
            recovered_at: None,
        }
    }

    /// A strategy answered this fault; whether it worked is known later.
    pub fn mark_recovery_attempted(&mut self) {
        self.recovery_attempted = true;
    }

    /// The phase that raised this fault went on to finish.
    pub fn mark_recovered(&mut self, at: DateTime<Utc>) {
        self.recovery_attempted = true;
        self.recovery_succeeded = true;
        self.recovered_at = Some(at);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub source_project_ref: String,
    pub target_project_ref: Option<String>,
    pub target_project_name: String,
    pub organization_id: String,
    pub requested_by: String,
    pub status: JobStatus,
    pub clone_type: CloneType,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_duration_secs: u64,
    pub actual_duration_secs: Option<u64>,
    pub error_log: Vec<ErrorRecord>,
    pub options: MigrationOptions,
    pub progress: Progress,
}

impl Job {
    pub fn new(options: MigrationOptions, requested_by: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_project_ref: options.source_project_ref.clone(),
            target_project_ref: None,
            target_project_name: options.target_project_name.clone(),
            organization_id: options.organization_id.clone(),
            requested_by: requested_by.into(),
            status: JobStatus::Pending,
            clone_type: options.clone_type,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration_secs: options.estimated_duration().as_secs(),
            actual_duration_secs: None,
            error_log: Vec::new(),
            options,
            progress: Progress::new(),
        }
    }

    /// Move to `to`, rejecting anything that is not a forward lifecycle step.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), MigratorError> {
        if !self.status.can_transition_to(to) {
            return Err(MigratorError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        match to {
            JobStatus::Running => self.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(now);
                let started = self.started_at.unwrap_or(self.created_at);
                self.actual_duration_secs =
                    Some((now - started).num_seconds().max(0) as u64);
            }
            JobStatus::Pending => {}
        }
        self.status = to;
        Ok(())
    }
}
