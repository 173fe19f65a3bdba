// ABOUTME: Drives one job through the phase pipeline on its own task
// ABOUTME: Wraps each phase with checkpointing, fault classification and recovery decisions

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::phases::{execute, reset_counters, rollback_instructions, PhaseContext, PhaseState};
use super::{Inner, MigrationEvent};
use crate::audit::{AuditAction, AuditEntry};
use crate::checkpoint::Checkpoint;
use crate::error::{classify, MigratorError};
use crate::models::{ErrorRecord, JobStatus, Phase, PhaseStatus, Progress};
use crate::recovery::RecoveryAction;

enum PhaseOutcome {
    Completed,
    Skipped,
}

/// Why a phase ended the job.
struct PhaseFailure {
    message: String,
    manual_intervention: bool,
}

pub(super) async fn run_job(inner: Arc<Inner>, job_id: String, cancel: Arc<AtomicBool>) {
    let started = inner.with_job(&job_id, |job| job.transition(JobStatus::Running));
    match started {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            // Cancelled before the task got going.
            tracing::debug!(job_id = %job_id, error = %e, "Job did not start");
            return;
        }
        None => return,
    }

    let Some(options) = inner.with_job(&job_id, |job| Arc::new(job.options.clone())) else {
        return;
    };
    tracing::info!(job_id = %job_id, clone_type = %options.clone_type, "Migration job started");
    inner.events.emit(MigrationEvent::JobStarted {
        job_id: job_id.clone(),
    });

    let state = Arc::new(Mutex::new(PhaseState::default()));

    for phase in Phase::ALL {
        if cancel.load(Ordering::SeqCst) {
            tracing::info!(job_id = %job_id, phase = %phase, "Stopping cancelled job at phase boundary");
            return;
        }

        if !options.phase_enabled(phase) {
            skip_phase(&inner, &job_id, phase, "Disabled by job configuration");
            continue;
        }

        let ctx = PhaseContext {
            inner: inner.clone(),
            job_id: job_id.clone(),
            phase,
            options: options.clone(),
            state: state.clone(),
        };

        match run_phase(&ctx).await {
            Ok(PhaseOutcome::Completed) | Ok(PhaseOutcome::Skipped) => {}
            Err(failure) => {
                fail_job(&inner, &job_id, phase, failure).await;
                return;
            }
        }
    }

    if cancel.load(Ordering::SeqCst) {
        return;
    }
    complete_job(&inner, &job_id).await;
}

async fn run_phase(ctx: &PhaseContext) -> Result<PhaseOutcome, PhaseFailure> {
    let inner = &ctx.inner;
    let job_id = ctx.job_id.as_str();
    let phase = ctx.phase;
    let ceiling = inner.settings.phase_retry_ceiling;
    let mut retries = 0u32;
    // Faults this phase raised; they count as recovered once it finishes.
    let mut episode: Vec<String> = Vec::new();

    mark_phase_running(inner, job_id, phase);
    inner.events.emit(MigrationEvent::PhaseStarted {
        job_id: job_id.to_string(),
        phase,
    });
    tracing::info!(job_id, phase = %phase, "Phase started");

    loop {
        let progress = inner.with_job(job_id, |job| {
            (job.status == JobStatus::Running).then(|| job.progress.clone())
        });
        let Some(progress) = progress.flatten() else {
            return Err(PhaseFailure {
                message: format!("Job {} is no longer running", job_id),
                manual_intervention: false,
            });
        };
        let (checkpoint_state, instructions) = {
            let state = ctx.state.lock();
            (
                state.checkpoint_blob(),
                rollback_instructions(phase, &state, &ctx.options),
            )
        };
        inner
            .engine
            .create_checkpoint(job_id, phase, &progress, checkpoint_state, instructions);

        let err = match execute(phase, ctx.clone()).await {
            Ok(()) => {
                inner.engine.resolve(job_id);
                settle_recovered(inner, job_id, &episode);
                finish_phase(inner, job_id, phase, PhaseStatus::Completed, None);
                inner.events.emit(MigrationEvent::PhaseCompleted {
                    job_id: job_id.to_string(),
                    phase,
                });
                tracing::info!(job_id, phase = %phase, "Phase completed");
                return Ok(PhaseOutcome::Completed);
            }
            Err(err) => err,
        };
        if !is_running(inner, job_id) {
            tracing::info!(job_id, phase = %phase, error = %format!("{:#}", err), "Ignoring fault of a job that stopped running");
            return Err(PhaseFailure {
                message: format!("{:#}", err),
                manual_intervention: false,
            });
        }

        let classification = classify(&err);
        let mut record = ErrorRecord::new(
            phase,
            classification.code,
            classification.severity,
            err.to_string(),
            Some(format!("{:#}", err)),
            classification.auto_recoverable,
        );
        tracing::warn!(
            job_id,
            phase = %phase,
            code = %record.code,
            severity = %record.severity,
            error = %format!("{:#}", err),
            "Phase fault"
        );

        let mut decision = inner.engine.handle_error(job_id, &record, phase).await;
        if decision.action == RecoveryAction::Rollback && !phase.is_rollback_safe() {
            decision.action = RecoveryAction::ManualIntervention;
            decision.message = format!("{} cannot be rolled back", phase);
        }
        let retrying = matches!(
            decision.action,
            RecoveryAction::Retry | RecoveryAction::Rollback
        );
        let exhausted = retrying && retries >= ceiling;
        record.mark_recovery_attempted();
        push_error(inner, job_id, &record);
        episode.push(record.id.clone());

        match decision.action {
            RecoveryAction::Retry | RecoveryAction::Rollback => {
                if exhausted {
                    inner.engine.discard(job_id);
                    return Err(PhaseFailure {
                        message: format!(
                            "{} failed after {} retries: {}",
                            phase, retries, record.message
                        ),
                        manual_intervention: false,
                    });
                }
                retries += 1;

                let restored = if decision.action == RecoveryAction::Rollback {
                    match rollback_phase(ctx).await {
                        Ok(checkpoint) => Some(checkpoint),
                        Err(e) => {
                            return Err(manual(ctx, &record, format!("Rollback failed: {:#}", e)));
                        }
                    }
                } else {
                    decision.rolled_back_to.take()
                };
                if let Some(checkpoint) = restored {
                    restore_checkpoint(ctx, &checkpoint);
                }

                inner.events.emit(MigrationEvent::RetryScheduled {
                    job_id: job_id.to_string(),
                    phase,
                    strategy: decision.strategy.clone(),
                    attempt: retries,
                    delay_ms: decision.delay.as_millis() as u64,
                });
                tracing::info!(
                    job_id,
                    phase = %phase,
                    attempt = retries,
                    delay_ms = decision.delay.as_millis() as u64,
                    "Retrying phase"
                );
                tokio::time::sleep(decision.delay).await;
            }
            RecoveryAction::Skip => {
                settle_recovered(inner, job_id, &episode);
                finish_phase(
                    inner,
                    job_id,
                    phase,
                    PhaseStatus::Skipped,
                    Some(decision.message.clone()),
                );
                inner.events.emit(MigrationEvent::PhaseSkipped {
                    job_id: job_id.to_string(),
                    phase,
                    reason: decision.message,
                });
                tracing::warn!(job_id, phase = %phase, "Phase skipped after fault");
                return Ok(PhaseOutcome::Skipped);
            }
            RecoveryAction::ManualIntervention => {
                return Err(manual(ctx, &record, decision.message));
            }
        }
    }
}

fn manual(ctx: &PhaseContext, record: &ErrorRecord, message: String) -> PhaseFailure {
    ctx.inner.events.emit(MigrationEvent::ManualInterventionRequired {
        job_id: ctx.job_id.clone(),
        phase: ctx.phase,
        error: record.clone(),
        message: message.clone(),
    });
    tracing::error!(job_id = %ctx.job_id, phase = %ctx.phase, code = %record.code, "Manual intervention required");
    PhaseFailure {
        message: format!("{}: {}", record.message, message),
        manual_intervention: true,
    }
}

/// Roll back to the latest checkpoint taken for this phase.
async fn rollback_phase(ctx: &PhaseContext) -> anyhow::Result<Checkpoint> {
    let checkpoint = ctx
        .inner
        .engine
        .checkpoints()
        .latest_for_phase(&ctx.job_id, ctx.phase)
        .ok_or_else(|| {
            MigratorError::Migration(format!("No checkpoint recorded for {}", ctx.phase))
        })?;
    ctx.inner
        .engine
        .rollback_to_checkpoint(&ctx.job_id, &checkpoint.id)
        .await
}

/// Bring progress and phase state back to `checkpoint` without lowering the
/// overall percentage.
fn restore_checkpoint(ctx: &PhaseContext, checkpoint: &Checkpoint) {
    ctx.state.lock().reset(checkpoint.phase);
    let phase = ctx.phase;
    ctx.inner.update_progress(&ctx.job_id, |current| {
        let mut restored = Progress {
            overall_percentage: current.overall_percentage,
            current_phase: Some(phase),
            ..checkpoint.progress.clone()
        }
        .with_phase(phase, |p| {
            p.status = PhaseStatus::Running;
            p.details = Some("Restored from checkpoint".to_string());
        });
        reset_counters(checkpoint.phase, &mut restored.counters);
        restored
    });
    ctx.inner.events.emit(MigrationEvent::RollbackCompleted {
        job_id: ctx.job_id.clone(),
        phase: checkpoint.phase,
        checkpoint_id: checkpoint.id.clone(),
    });
}

fn is_running(inner: &Inner, job_id: &str) -> bool {
    inner
        .with_job(job_id, |job| job.status == JobStatus::Running)
        .unwrap_or(false)
}

fn push_error(inner: &Inner, job_id: &str, record: &ErrorRecord) {
    inner.with_job(job_id, |job| job.error_log.push(record.clone()));
    inner.events.emit(MigrationEvent::FaultRecorded {
        job_id: job_id.to_string(),
        error: record.clone(),
    });
}

/// Flag the faults in `episode` as recovered and tell subscribers.
fn settle_recovered(inner: &Inner, job_id: &str, episode: &[String]) {
    if episode.is_empty() {
        return;
    }
    let now = Utc::now();
    let recovered = inner
        .with_job(job_id, |job| {
            job.error_log
                .iter_mut()
                .filter(|record| episode.contains(&record.id))
                .map(|record| {
                    record.mark_recovered(now);
                    record.clone()
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    for error in recovered {
        tracing::debug!(job_id, error_id = %error.id, code = %error.code, "Fault recovered");
        inner.events.emit(MigrationEvent::FaultRecovered {
            job_id: job_id.to_string(),
            error,
        });
    }
}

fn mark_phase_running(inner: &Inner, job_id: &str, phase: Phase) {
    inner.update_progress(job_id, |progress| {
        let mut next = progress.with_phase(phase, |p| {
            p.status = PhaseStatus::Running;
            p.started_at = Some(Utc::now());
        });
        next.current_phase = Some(phase);
        next.advanced_to(phase.overall_at(0.0))
    });
}

fn finish_phase(
    inner: &Inner,
    job_id: &str,
    phase: Phase,
    status: PhaseStatus,
    details: Option<String>,
) {
    inner.update_progress(job_id, |progress| {
        progress
            .with_phase(phase, |p| {
                p.status = status;
                p.percentage = 100.0;
                p.completed_at = Some(Utc::now());
                if details.is_some() {
                    p.details = details;
                }
            })
            .advanced_to(phase.overall_at(100.0))
    });
}

fn skip_phase(inner: &Inner, job_id: &str, phase: Phase, reason: &str) {
    finish_phase(
        inner,
        job_id,
        phase,
        PhaseStatus::Skipped,
        Some(reason.to_string()),
    );
    inner.events.emit(MigrationEvent::PhaseSkipped {
        job_id: job_id.to_string(),
        phase,
        reason: reason.to_string(),
    });
    tracing::info!(job_id, phase = %phase, reason, "Phase skipped");
}

async fn fail_job(inner: &Inner, job_id: &str, phase: Phase, failure: PhaseFailure) {
    let failed = inner.with_job(job_id, |job| {
        job.transition(JobStatus::Failed)?;
        job.progress = job.progress.with_phase(phase, |p| {
            p.status = PhaseStatus::Failed;
            p.details = Some(failure.message.clone());
        });
        Ok::<_, MigratorError>((job.organization_id.clone(), job.requested_by.clone()))
    });

    let (organization, requested_by) = match failed {
        Some(Ok(who)) => who,
        // Cancelled while the phase was running.
        _ => return,
    };

    inner.engine.release(job_id);
    tracing::error!(
        job_id,
        phase = %phase,
        manual_intervention = failure.manual_intervention,
        error = %failure.message,
        "Migration job failed"
    );
    inner.events.emit(MigrationEvent::JobFailed {
        job_id: job_id.to_string(),
        phase: Some(phase),
        message: failure.message.clone(),
        manual_intervention: failure.manual_intervention,
    });
    inner
        .audit(
            AuditEntry::new(AuditAction::JobFailed, requested_by)
                .resource(job_id)
                .organization(organization)
                .failed()
                .details(serde_json::json!({
                    "phase": phase,
                    "error": failure.message,
                    "manual_intervention": failure.manual_intervention,
                })),
        )
        .await;
}

async fn complete_job(inner: &Inner, job_id: &str) {
    let completed = inner.with_job(job_id, |job| {
        job.transition(JobStatus::Completed)?;
        let mut progress = job.progress.advanced_to(100.0);
        progress.current_phase = None;
        job.progress = progress;
        Ok::<_, MigratorError>(job.clone())
    });

    let job = match completed {
        Some(Ok(job)) => job,
        _ => return,
    };

    if let Err(e) = inner.history.record(&job).await {
        tracing::warn!(job_id, error = %e, "Failed to record job history; keeping job in the active set");
    } else {
        inner.jobs.lock().remove(job_id);
    }
    inner.engine.release(job_id);

    inner.events.emit(MigrationEvent::ProgressUpdated {
        job_id: job_id.to_string(),
        progress: job.progress.clone(),
    });
    let duration_secs = job.actual_duration_secs.unwrap_or_default();
    tracing::info!(job_id, duration_secs, "Migration job completed");
    inner.events.emit(MigrationEvent::JobCompleted {
        job_id: job_id.to_string(),
        duration_secs,
    });
    inner
        .audit(
            AuditEntry::new(AuditAction::JobCompleted, job.requested_by.clone())
                .resource(job_id)
                .organization(job.organization_id.clone())
                .details(serde_json::json!({ "duration_secs": duration_secs })),
        )
        .await;
}
