// ABOUTME: Side effects recovery strategies perform against the outside world
// ABOUTME: Rollback SQL runs on the target project; cleanup and repair only log by default

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::error::MigratorError;
use crate::models::{ErrorRecord, Phase};
use crate::remote::ProjectManagementClient;

#[async_trait]
pub trait RecoveryHooks: Send + Sync {
    /// Release whatever conflicting or locked resource caused the fault.
    async fn cleanup_resources(
        &self,
        job_id: &str,
        phase: Phase,
        error: &ErrorRecord,
    ) -> anyhow::Result<()>;

    /// Try to repair data so the phase can be retried. `Ok(false)` means no repair was possible.
    async fn repair_data(
        &self,
        job_id: &str,
        phase: Phase,
        error: &ErrorRecord,
    ) -> anyhow::Result<bool>;

    /// Apply one rollback instruction of `checkpoint`.
    async fn apply_rollback_instruction(
        &self,
        job_id: &str,
        checkpoint: &Checkpoint,
        instruction: &str,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct LoggingHooks;

#[async_trait]
impl RecoveryHooks for LoggingHooks {
    async fn cleanup_resources(
        &self,
        job_id: &str,
        phase: Phase,
        error: &ErrorRecord,
    ) -> anyhow::Result<()> {
        tracing::info!(job_id, phase = %phase, code = %error.code, "Cleaning up conflicting resources");
        Ok(())
    }

    async fn repair_data(
        &self,
        job_id: &str,
        phase: Phase,
        error: &ErrorRecord,
    ) -> anyhow::Result<bool> {
        tracing::warn!(
            job_id,
            phase = %phase,
            code = %error.code,
            "No data repair available for this fault"
        );
        Ok(false)
    }

    async fn apply_rollback_instruction(
        &self,
        job_id: &str,
        checkpoint: &Checkpoint,
        instruction: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(
            job_id,
            checkpoint_id = %checkpoint.id,
            instruction,
            "Rollback instruction"
        );
        Ok(())
    }
}

/// Replays rollback instructions as SQL on the target project recorded in the
/// checkpoint state. Cleanup and repair behave like [`LoggingHooks`].
pub struct SqlRollbackHooks {
    projects: Arc<dyn ProjectManagementClient>,
}

impl SqlRollbackHooks {
    pub fn new(projects: Arc<dyn ProjectManagementClient>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl RecoveryHooks for SqlRollbackHooks {
    async fn cleanup_resources(
        &self,
        job_id: &str,
        phase: Phase,
        error: &ErrorRecord,
    ) -> anyhow::Result<()> {
        LoggingHooks.cleanup_resources(job_id, phase, error).await
    }

    async fn repair_data(
        &self,
        job_id: &str,
        phase: Phase,
        error: &ErrorRecord,
    ) -> anyhow::Result<bool> {
        LoggingHooks.repair_data(job_id, phase, error).await
    }

    async fn apply_rollback_instruction(
        &self,
        job_id: &str,
        checkpoint: &Checkpoint,
        instruction: &str,
    ) -> anyhow::Result<()> {
        let project_ref = checkpoint
            .state
            .get("target_ref")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                MigratorError::Migration(format!(
                    "Checkpoint {} does not name a target project",
                    checkpoint.id
                ))
            })?;

        tracing::info!(
            job_id,
            checkpoint_id = %checkpoint.id,
            project_ref,
            instruction,
            "Applying rollback instruction"
        );
        self.projects
            .run_query(project_ref, instruction)
            .await
            .with_context(|| format!("Failed to run rollback SQL on {}", project_ref))?;
        Ok(())
    }
}
