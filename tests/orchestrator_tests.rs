// ABOUTME: End-to-end orchestrator tests against in-memory collaborators
// ABOUTME: Covers admission, cancellation, the phase pipeline and recovery decisions

mod common;

use common::*;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

use project_migrator::audit::AuditAction;
use project_migrator::error::{ApiError, ErrorCode, MigratorError};
use project_migrator::models::{CloneType, Job, JobStatus, Phase, PhaseStatus};
use project_migrator::orchestrator::MigrationEvent;

async fn finish(h: &Harness, job_id: &str) -> Job {
    timeout(GENEROUS, h.orchestrator.wait_for(job_id))
        .await
        .expect("job did not finish")
        .expect("job vanished")
}

fn drain(events: &mut broadcast::Receiver<MigrationEvent>) -> Vec<MigrationEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn test_full_clone_completes() {
    let h = harness();
    let mut events = h.orchestrator.subscribe();

    let job_id = h.orchestrator.start(options(), "alice").await.unwrap();
    let job = finish(&h, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.overall_percentage, 100.0);
    assert_eq!(job.target_project_ref.as_deref(), Some("target1"));
    assert!(job.error_log.is_empty());
    assert!(job
        .progress
        .phases
        .iter()
        .all(|p| p.status == PhaseStatus::Completed));
    assert_eq!(job.progress.counters.rows_migrated, 290);
    assert_eq!(job.progress.counters.tables_migrated, 2);
    assert_eq!(job.progress.counters.storage_objects_migrated, 2);
    assert_eq!(job.progress.counters.functions_migrated, 1);

    assert_eq!(h.transfer.rows_in("target1", "public.users"), 250);
    assert_eq!(h.transfer.rows_in("target1", "public.orders"), 40);
    assert_eq!(h.projects.objects_in("target1", "avatars"), 2);
    assert!(h.projects.function_in("target1", "hello").is_some());
    assert!(h.projects.config_of("target1").unwrap().auth.is_some());

    let queries = h.projects.queries();
    assert!(queries
        .iter()
        .any(|(r, sql)| r == "target1" && sql.starts_with("CREATE PUBLICATION")));
    assert_eq!(queries.last().map(|(_, sql)| sql.as_str()), Some("ANALYZE"));

    // Completed jobs leave the active set but stay visible.
    assert!(h.orchestrator.active_jobs().is_empty());
    assert!(h.orchestrator.jobs().is_empty());
    assert_eq!(
        h.orchestrator.status(&job_id).await.unwrap().status,
        JobStatus::Completed
    );

    let actions: Vec<AuditAction> = h.audit.entries().iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::JobSubmitted, AuditAction::JobCompleted]);

    let seen = drain(&mut events);
    assert!(matches!(seen.first(), Some(MigrationEvent::JobStarted { .. })));
    assert!(matches!(seen.last(), Some(MigrationEvent::JobCompleted { .. })));
    let phases_completed = seen
        .iter()
        .filter(|e| matches!(e, MigrationEvent::PhaseCompleted { .. }))
        .count();
    assert_eq!(phases_completed, 10);
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic_and_reaches_100_only_on_completion() {
    let h = harness();
    let mut events = h.orchestrator.subscribe();

    let job_id = h.orchestrator.start(options(), "alice").await.unwrap();
    finish(&h, &job_id).await;

    let mut last = 0.0;
    let mut completed = false;
    for event in drain(&mut events) {
        match event {
            MigrationEvent::ProgressUpdated { progress, .. } => {
                assert!(progress.overall_percentage >= last);
                assert_eq!(progress.overall_percentage == 100.0, completed);
                last = progress.overall_percentage;
            }
            MigrationEvent::PhaseCompleted {
                phase: Phase::Cutover,
                ..
            } => completed = true,
            _ => {}
        }
    }
    assert_eq!(last, 100.0);
}

#[tokio::test(start_paused = true)]
async fn test_schema_only_skips_data() {
    let h = harness();
    let mut events = h.orchestrator.subscribe();
    let mut opts = options();
    opts.clone_type = CloneType::SchemaOnly;

    let job_id = h.orchestrator.start(opts, "alice").await.unwrap();
    let job = finish(&h, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.progress.phase(Phase::DataMigration).unwrap().status,
        PhaseStatus::Skipped
    );
    assert_eq!(h.transfer.batches(), 0);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        MigrationEvent::PhaseSkipped {
            phase: Phase::DataMigration,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_options_are_rejected_without_a_job() {
    let h = harness();
    let mut opts = options();
    opts.parallel_threads = 25;

    let err = h.orchestrator.start(opts, "alice").await.unwrap_err();
    assert!(matches!(err, MigratorError::Validation(_)));
    assert!(h.orchestrator.jobs().is_empty());
    assert_eq!(h.projects.created_projects(), 0);

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::JobRejected);
    assert!(!entries[0].success);
}

#[tokio::test(start_paused = true)]
async fn test_sixth_job_for_an_organization_is_rejected() {
    let h = harness();
    h.projects.never_healthy();

    let mut admitted = Vec::new();
    for _ in 0..5 {
        admitted.push(h.orchestrator.start(options(), "alice").await.unwrap());
    }

    let err = h.orchestrator.start(options(), "alice").await.unwrap_err();
    assert!(matches!(
        err,
        MigratorError::ConcurrencyLimit { limit: 5, .. }
    ));
    assert_eq!(h.orchestrator.active_jobs().len(), 5);

    // Other organizations have their own budget.
    let mut other = options();
    other.organization_id = "other-org".into();
    h.orchestrator.start(other, "bob").await.unwrap();

    // Cancelling frees a slot.
    h.orchestrator.cancel(&admitted[0], "alice").await.unwrap();
    h.orchestrator.start(options(), "alice").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_pending_job() {
    let h = harness();
    h.projects.never_healthy();
    let mut events = h.orchestrator.subscribe();

    let job_id = h.orchestrator.start(options(), "alice").await.unwrap();
    let job = h.orchestrator.cancel(&job_id, "alice").await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.progress.overall_percentage, 0.0);
    assert!(job.completed_at.is_some());

    // The runner stops at the next boundary and leaves the job cancelled.
    tokio::time::sleep(Duration::from_secs(600)).await;
    let job = h.orchestrator.status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.error_log.is_empty());
    assert!(h.orchestrator.active_jobs().is_empty());

    let err = h.orchestrator.cancel(&job_id, "alice").await.unwrap_err();
    assert!(matches!(err, MigratorError::InvalidTransition { .. }));

    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, MigrationEvent::JobCancelled { .. })));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, MigrationEvent::JobFailed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_job_stops_at_phase_boundary() {
    let h = harness();
    h.projects.never_healthy();
    let mut events = h.orchestrator.subscribe();

    let job_id = h.orchestrator.start(options(), "alice").await.unwrap();
    // Preparation is now polling the target project.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        h.orchestrator.status(&job_id).await.unwrap().status,
        JobStatus::Running
    );

    let job = h.orchestrator.cancel(&job_id, "alice").await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    // Past the polling bound, so preparation gives up while the job is cancelled.
    tokio::time::sleep(Duration::from_secs(600)).await;
    let job = h.orchestrator.status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.progress.overall_percentage, 0.0);
    assert!(job.error_log.is_empty());
    assert!(h.orchestrator.active_jobs().is_empty());

    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, MigrationEvent::JobCancelled { .. })));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, MigrationEvent::JobFailed { .. })));
    assert!(!seen.iter().any(|e| matches!(
        e,
        MigrationEvent::PhaseStarted { phase, .. } if *phase != Phase::Preparation
    )));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_rejects_unknown_and_finished_jobs() {
    let h = harness();

    let err = h.orchestrator.cancel("no-such-job", "alice").await.unwrap_err();
    assert!(matches!(err, MigratorError::JobNotFound(_)));

    let job_id = h.orchestrator.start(options(), "alice").await.unwrap();
    finish(&h, &job_id).await;

    let err = h.orchestrator.cancel(&job_id, "alice").await.unwrap_err();
    assert!(matches!(
        err,
        MigratorError::InvalidTransition {
            from: JobStatus::Completed,
            ..
        }
    ));
    assert_eq!(
        h.orchestrator.status(&job_id).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_persistent_timeouts_fail_the_job_after_growing_delays() {
    let h = harness();
    h.transfer.always_time_out();
    let mut events = h.orchestrator.subscribe();

    let job_id = h.orchestrator.start(options(), "alice").await.unwrap();
    let job = finish(&h, &job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_log.len(), 4);
    assert!(job
        .error_log
        .iter()
        .all(|e| e.code == ErrorCode::ConnectionTimeout && e.phase == Phase::DataMigration));
    // Every retry was tried and none led to a finished phase.
    assert!(job
        .error_log
        .iter()
        .all(|e| e.recovery_attempted && !e.recovery_succeeded && e.recovered_at.is_none()));
    assert_eq!(
        job.progress.phase(Phase::DataMigration).unwrap().status,
        PhaseStatus::Failed
    );
    assert!(job.progress.overall_percentage < 100.0);

    // Failed jobs stay in the active set for inspection.
    assert_eq!(h.orchestrator.jobs().len(), 1);
    assert!(h.orchestrator.active_jobs().is_empty());

    let seen = drain(&mut events);
    let delays: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            MigrationEvent::RetryScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1000, 2000, 4000]);
    assert!(seen.iter().any(|e| matches!(
        e,
        MigrationEvent::JobFailed {
            manual_intervention: false,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_transient_timeout_resumes_without_recopying() {
    let h = harness();
    h.transfer.time_out_next(1);
    let mut opts = options();
    opts.parallel_threads = 1;
    let mut events = h.orchestrator.subscribe();

    let job_id = h.orchestrator.start(opts, "alice").await.unwrap();
    let job = finish(&h, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error_log.len(), 1);
    assert!(job.error_log[0].recovery_succeeded);
    assert!(job.error_log[0].recovered_at.is_some());
    let fault_id = job.error_log[0].id.clone();
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        MigrationEvent::FaultRecovered { error, .. } if error.id == fault_id && error.recovery_succeeded
    )));
    assert_eq!(h.transfer.rows_in("target1", "public.users"), 250);
    assert_eq!(h.transfer.rows_in("target1", "public.orders"), 40);
    assert!(h.orchestrator.recovery().recovery_context(&job_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_requires_manual_intervention() {
    let h = harness();
    h.transfer
        .fail_next_with(MigratorError::Permission("permission denied for table users".into()));
    let mut events = h.orchestrator.subscribe();
    let mut opts = options();
    opts.parallel_threads = 1;

    let job_id = h.orchestrator.start(opts, "alice").await.unwrap();
    let job = finish(&h, &job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_log.len(), 1);
    assert_eq!(job.error_log[0].code, ErrorCode::PermissionDenied);
    assert!(job.error_log[0].recovery_attempted);
    assert!(!job.error_log[0].recovery_succeeded);

    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, MigrationEvent::ManualInterventionRequired { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        MigrationEvent::JobFailed {
            manual_intervention: true,
            phase: Some(Phase::DataMigration),
            ..
        }
    )));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, MigrationEvent::RetryScheduled { .. })));

    let failed = h
        .audit
        .entries()
        .into_iter()
        .find(|e| e.action == AuditAction::JobFailed)
        .unwrap();
    assert_eq!(failed.resource_id.as_deref(), Some(job_id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_component_is_skipped() {
    let h = harness();
    h.projects.fail(
        "list_functions",
        ApiError::new(Some(501), "edge functions are not available on this tier"),
        1,
    );

    let job_id = h.orchestrator.start(options(), "alice").await.unwrap();
    let job = finish(&h, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.progress.phase(Phase::EdgeFunctionsMigration).unwrap().status,
        PhaseStatus::Skipped
    );
    assert_eq!(job.error_log.len(), 1);
    assert_eq!(job.error_log[0].code, ErrorCode::FeatureNotSupported);
    assert!(h.projects.function_in("target1", "hello").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_system_error_rolls_back_and_retries() {
    let h = harness();
    h.projects
        .fail("update_config", ApiError::new(Some(500), "internal server error"), 1);
    let mut events = h.orchestrator.subscribe();

    let job_id = h.orchestrator.start(options(), "alice").await.unwrap();
    let job = finish(&h, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error_log.len(), 1);
    assert_eq!(job.error_log[0].code, ErrorCode::SystemError);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        MigrationEvent::RollbackCompleted {
            phase: Phase::ConfigurationMigration,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_rollback_truncates_partial_copies_before_recopying() {
    let h = harness();
    let mut opts = options();
    opts.parallel_threads = 1;
    opts.batch_size = 100;
    // The second batch of `public.users` dies after the first landed.
    h.transfer
        .fail_call(2, MigratorError::Migration("out of memory".into()));
    let mut events = h.orchestrator.subscribe();

    let job_id = h.orchestrator.start(opts, "alice").await.unwrap();
    let job = finish(&h, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.transfer.rows_in("target1", "public.users"), 250);
    assert_eq!(h.transfer.rows_in("target1", "public.orders"), 40);
    assert_eq!(job.progress.counters.rows_migrated, 290);

    assert_eq!(job.error_log.len(), 1);
    assert_eq!(job.error_log[0].code, ErrorCode::SystemError);
    assert_eq!(job.error_log[0].phase, Phase::DataMigration);
    assert!(job.error_log[0].recovery_succeeded);

    let queries = h.projects.queries();
    assert!(queries.iter().any(|(project, sql)| project == "target1"
        && sql == "TRUNCATE TABLE \"public\".\"users\" CASCADE"));
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        MigrationEvent::RollbackCompleted {
            phase: Phase::DataMigration,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_target_fails_preparation() {
    let h = harness();
    h.projects.never_healthy();

    let job_id = h.orchestrator.start(options(), "alice").await.unwrap();
    let job = finish(&h, &job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_log.len(), 1);
    assert_eq!(job.error_log[0].phase, Phase::Preparation);
    assert_eq!(job.error_log[0].code, ErrorCode::RequestTimeout);
    assert_eq!(h.projects.created_projects(), 1);
}
