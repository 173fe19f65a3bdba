// ABOUTME: Migration orchestrator owning job lifecycle, the phase pipeline and per-org limits
// ABOUTME: Jobs run on their own tasks; callers poll status or subscribe to events

pub mod events;
pub mod history;
mod phases;
mod runner;

pub use events::{EventBus, MigrationEvent};
pub use history::{InMemoryJobHistory, JobHistory};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::audit::{AuditAction, AuditEntry, AuditSink, TracingAuditSink};
use crate::config::OrchestratorSettings;
use crate::error::MigratorError;
use crate::models::{Job, JobStatus, MigrationOptions, Progress};
use crate::monitoring::LoadGauge;
use crate::recovery::{RecoveryEngine, SqlRollbackHooks};
use crate::remote::{DataTransfer, ProjectManagementClient, SchemaInspector};

/// External services the phases call into.
#[derive(Clone)]
pub struct Collaborators {
    pub projects: Arc<dyn ProjectManagementClient>,
    pub inspector: Arc<dyn SchemaInspector>,
    pub transfer: Arc<dyn DataTransfer>,
}

struct JobEntry {
    job: Job,
    cancel: Arc<AtomicBool>,
}

/// Highest overall percentage a job can report before it completes.
const MAX_RUNNING_PERCENTAGE: f64 = 99.0;

pub(crate) struct Inner {
    settings: OrchestratorSettings,
    /// Single point of serialization for submissions and job state.
    jobs: Mutex<HashMap<String, JobEntry>>,
    collaborators: Collaborators,
    engine: Arc<RecoveryEngine>,
    events: EventBus,
    audit: Arc<dyn AuditSink>,
    history: Arc<dyn JobHistory>,
}

impl Inner {
    /// Apply `f` to a registered job. `None` when the job is not in the active set.
    fn with_job<R>(&self, job_id: &str, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.jobs.lock().get_mut(job_id).map(|entry| f(&mut entry.job))
    }

    fn snapshot(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().get(job_id).map(|entry| entry.job.clone())
    }

    /// Replace the progress of a running job and publish it.
    ///
    /// Ignored once the job left `running`. The overall percentage never goes
    /// down and only reaches 100 when the job completes.
    fn update_progress(&self, job_id: &str, update: impl FnOnce(&Progress) -> Progress) -> bool {
        let published = self.with_job(job_id, |job| {
            if job.status != JobStatus::Running {
                return None;
            }
            let mut next = update(&job.progress);
            next.overall_percentage = next
                .overall_percentage
                .min(MAX_RUNNING_PERCENTAGE)
                .max(job.progress.overall_percentage);
            job.progress = next.clone();
            Some(next)
        });

        match published.flatten() {
            Some(progress) => {
                self.events.emit(MigrationEvent::ProgressUpdated {
                    job_id: job_id.to_string(),
                    progress,
                });
                true
            }
            None => false,
        }
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.record(&entry).await {
            tracing::warn!(error = %e, action = %entry.action, "Failed to write audit entry");
        }
    }
}

pub struct OrchestratorBuilder {
    settings: OrchestratorSettings,
    collaborators: Collaborators,
    engine: Option<Arc<RecoveryEngine>>,
    audit: Arc<dyn AuditSink>,
    history: Arc<dyn JobHistory>,
}

impl OrchestratorBuilder {
    pub fn recovery(mut self, engine: Arc<RecoveryEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn history(mut self, history: Arc<dyn JobHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn build(self) -> MigrationOrchestrator {
        let engine = self.engine.unwrap_or_else(|| {
            Arc::new(RecoveryEngine::new(
                crate::checkpoint::DEFAULT_CHECKPOINT_LIMIT,
                Arc::new(SqlRollbackHooks::new(self.collaborators.projects.clone())),
            ))
        });
        MigrationOrchestrator {
            inner: Arc::new(Inner {
                events: EventBus::new(self.settings.event_channel_capacity),
                settings: self.settings,
                jobs: Mutex::new(HashMap::new()),
                collaborators: self.collaborators,
                engine,
                audit: self.audit,
                history: self.history,
            }),
        }
    }
}

#[derive(Clone)]
pub struct MigrationOrchestrator {
    inner: Arc<Inner>,
}

impl MigrationOrchestrator {
    pub fn builder(settings: OrchestratorSettings, collaborators: Collaborators) -> OrchestratorBuilder {
        OrchestratorBuilder {
            settings,
            collaborators,
            engine: None,
            audit: Arc::new(TracingAuditSink),
            history: Arc::new(InMemoryJobHistory::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.inner.events.subscribe()
    }

    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.inner.engine
    }

    /// Validate, register and launch a clone job. Returns its id without
    /// waiting for any phase to run.
    ///
    /// # Errors
    ///
    /// [`MigratorError::Validation`] for bad options and
    /// [`MigratorError::ConcurrencyLimit`] when the organization is at its cap.
    /// Either way no job is registered.
    pub async fn start(
        &self,
        options: MigrationOptions,
        requested_by: &str,
    ) -> Result<String, MigratorError> {
        if let Err(e) = options.validate() {
            tracing::warn!(organization = %options.organization_id, error = %e, "Rejected invalid migration options");
            self.inner
                .audit(
                    AuditEntry::new(AuditAction::JobRejected, requested_by)
                        .organization(&options.organization_id)
                        .failed()
                        .details(serde_json::json!({ "reason": e.to_string() })),
                )
                .await;
            return Err(e);
        }

        let job = Job::new(options, requested_by);
        let job_id = job.id.clone();
        let organization = job.organization_id.clone();
        let estimated = job.estimated_duration_secs;
        let cancel = Arc::new(AtomicBool::new(false));
        let limit = self.inner.settings.max_concurrent_jobs_per_org;

        let admitted = {
            let mut jobs = self.inner.jobs.lock();
            let active = jobs
                .values()
                .filter(|e| e.job.organization_id == organization && !e.job.status.is_terminal())
                .count();
            if active >= limit {
                false
            } else {
                jobs.insert(
                    job_id.clone(),
                    JobEntry {
                        job,
                        cancel: cancel.clone(),
                    },
                );
                true
            }
        };

        if !admitted {
            let err = MigratorError::ConcurrencyLimit {
                organization: organization.clone(),
                limit,
            };
            tracing::warn!(organization = %organization, limit, "Concurrency limit reached");
            self.inner
                .audit(
                    AuditEntry::new(AuditAction::JobRejected, requested_by)
                        .organization(&organization)
                        .failed()
                        .details(serde_json::json!({ "reason": err.to_string() })),
                )
                .await;
            return Err(err);
        }

        tracing::info!(
            job_id = %job_id,
            organization = %organization,
            estimated_secs = estimated,
            "Migration job submitted"
        );
        self.inner
            .audit(
                AuditEntry::new(AuditAction::JobSubmitted, requested_by)
                    .resource(&job_id)
                    .organization(&organization)
                    .details(serde_json::json!({ "estimated_duration_secs": estimated })),
            )
            .await;

        tokio::spawn(runner::run_job(self.inner.clone(), job_id.clone(), cancel));
        Ok(job_id)
    }

    /// Read-only snapshot, from the active set or history.
    pub async fn status(&self, job_id: &str) -> Option<Job> {
        if let Some(job) = self.inner.snapshot(job_id) {
            return Some(job);
        }
        match self.inner.history.get(job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Job history lookup failed");
                None
            }
        }
    }

    /// Cancel a pending or running job. A running phase finishes first; the job
    /// stops at the next phase boundary.
    pub async fn cancel(&self, job_id: &str, actor: &str) -> Result<Job, MigratorError> {
        let cancelled = {
            let mut jobs = self.inner.jobs.lock();
            match jobs.get_mut(job_id) {
                Some(entry) => {
                    entry.job.transition(JobStatus::Cancelled)?;
                    entry.job.progress = Progress {
                        overall_percentage: 0.0,
                        ..entry.job.progress.clone()
                    };
                    entry.cancel.store(true, Ordering::SeqCst);
                    Some(entry.job.clone())
                }
                None => None,
            }
        };

        let job = match cancelled {
            Some(job) => job,
            None => {
                return Err(match self.inner.history.get(job_id).await {
                    Ok(Some(job)) => MigratorError::InvalidTransition {
                        job_id: job.id,
                        from: job.status,
                        to: JobStatus::Cancelled,
                    },
                    _ => MigratorError::JobNotFound(job_id.to_string()),
                });
            }
        };

        tracing::info!(job_id, actor, "Migration job cancelled");
        self.inner.engine.release(job_id);
        self.inner.events.emit(MigrationEvent::JobCancelled {
            job_id: job_id.to_string(),
        });
        self.inner
            .audit(
                AuditEntry::new(AuditAction::JobCancelled, actor)
                    .resource(job_id)
                    .organization(&job.organization_id),
            )
            .await;
        Ok(job)
    }

    /// Jobs still pending or running.
    pub fn active_jobs(&self) -> Vec<Job> {
        self.inner
            .jobs
            .lock()
            .values()
            .filter(|e| !e.job.status.is_terminal())
            .map(|e| e.job.clone())
            .collect()
    }

    /// Everything in the active set, including failed and cancelled jobs kept for inspection.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.jobs.lock().values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Resolve once the job reaches a terminal status.
    pub async fn wait_for(&self, job_id: &str) -> Option<Job> {
        let mut events = self.subscribe();
        loop {
            let job = self.status(job_id).await?;
            if job.status.is_terminal() {
                return Some(job);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return self.status(job_id).await,
            }
        }
    }
}

impl LoadGauge for MigrationOrchestrator {
    fn in_flight(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .values()
            .filter(|e| !e.job.status.is_terminal())
            .count()
    }

    fn capacity(&self) -> usize {
        self.inner.settings.global_capacity
    }
}
