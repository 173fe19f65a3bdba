// ABOUTME: Lifecycle events published by the orchestrator on a broadcast channel
// ABOUTME: Subscribers get clones; slow subscribers lag instead of blocking the publisher

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{ErrorRecord, Phase, Progress};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEvent {
    JobStarted {
        job_id: String,
    },
    JobCompleted {
        job_id: String,
        duration_secs: u64,
    },
    JobFailed {
        job_id: String,
        phase: Option<Phase>,
        message: String,
        /// No further automatic action will happen.
        manual_intervention: bool,
    },
    JobCancelled {
        job_id: String,
    },
    PhaseStarted {
        job_id: String,
        phase: Phase,
    },
    PhaseCompleted {
        job_id: String,
        phase: Phase,
    },
    PhaseSkipped {
        job_id: String,
        phase: Phase,
        reason: String,
    },
    ProgressUpdated {
        job_id: String,
        progress: Progress,
    },
    FaultRecorded {
        job_id: String,
        error: ErrorRecord,
    },
    /// An earlier fault's phase finished after recovery; `error` carries the
    /// updated recovery flags.
    FaultRecovered {
        job_id: String,
        error: ErrorRecord,
    },
    ManualInterventionRequired {
        job_id: String,
        phase: Phase,
        error: ErrorRecord,
        message: String,
    },
    RollbackCompleted {
        job_id: String,
        phase: Phase,
        checkpoint_id: String,
    },
    RetryScheduled {
        job_id: String,
        phase: Phase,
        strategy: Option<String>,
        attempt: u32,
        delay_ms: u64,
    },
}

impl MigrationEvent {
    pub fn job_id(&self) -> &str {
        match self {
            MigrationEvent::JobStarted { job_id }
            | MigrationEvent::JobCompleted { job_id, .. }
            | MigrationEvent::JobFailed { job_id, .. }
            | MigrationEvent::JobCancelled { job_id }
            | MigrationEvent::PhaseStarted { job_id, .. }
            | MigrationEvent::PhaseCompleted { job_id, .. }
            | MigrationEvent::PhaseSkipped { job_id, .. }
            | MigrationEvent::ProgressUpdated { job_id, .. }
            | MigrationEvent::FaultRecorded { job_id, .. }
            | MigrationEvent::FaultRecovered { job_id, .. }
            | MigrationEvent::ManualInterventionRequired { job_id, .. }
            | MigrationEvent::RollbackCompleted { job_id, .. }
            | MigrationEvent::RetryScheduled { job_id, .. } => job_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MigrationEvent::JobStarted { .. } => "job_started",
            MigrationEvent::JobCompleted { .. } => "job_completed",
            MigrationEvent::JobFailed { .. } => "job_failed",
            MigrationEvent::JobCancelled { .. } => "job_cancelled",
            MigrationEvent::PhaseStarted { .. } => "phase_started",
            MigrationEvent::PhaseCompleted { .. } => "phase_completed",
            MigrationEvent::PhaseSkipped { .. } => "phase_skipped",
            MigrationEvent::ProgressUpdated { .. } => "progress_updated",
            MigrationEvent::FaultRecorded { .. } => "fault_recorded",
            MigrationEvent::FaultRecovered { .. } => "fault_recovered",
            MigrationEvent::ManualInterventionRequired { .. } => "manual_intervention_required",
            MigrationEvent::RollbackCompleted { .. } => "rollback_completed",
            MigrationEvent::RetryScheduled { .. } => "retry_scheduled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationEvent::JobCompleted { .. }
                | MigrationEvent::JobFailed { .. }
                | MigrationEvent::JobCancelled { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MigrationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.tx.subscribe()
    }

    /// Publish without waiting; having no subscribers is fine.
    pub fn emit(&self, event: MigrationEvent) {
        tracing::trace!(job_id = event.job_id(), event = event.name(), "Event");
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = MigrationEvent::PhaseSkipped {
            job_id: "job-1".into(),
            phase: Phase::StorageMigration,
            reason: "disabled".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "phase_skipped");
        assert_eq!(value["phase"], "storage_migration");
        assert_eq!(event.job_id(), "job-1");
    }

    #[tokio::test]
    async fn test_bus_delivers_to_every_subscriber() {
        let bus = EventBus::new(8);
        bus.emit(MigrationEvent::JobStarted { job_id: "lost".into() });

        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.emit(MigrationEvent::JobCancelled { job_id: "job".into() });

        assert_eq!(first.recv().await.unwrap().name(), "job_cancelled");
        assert!(second.recv().await.unwrap().is_terminal());
    }
}
