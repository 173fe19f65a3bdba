// ABOUTME: Error recovery engine choosing retry, skip, rollback or manual intervention for a fault
// ABOUTME: Owns the checkpoint store and per-job recovery contexts for each failure episode

pub mod context;
pub mod hooks;
pub mod strategy;

pub use context::{RecoveryAttempt, RecoveryContext};
pub use hooks::{LoggingHooks, RecoveryHooks, SqlRollbackHooks};
pub use strategy::{
    builtin_strategies, BackoffKind, BackoffPolicy, RecoveryRequest, RecoveryStrategy,
    StrategyExecutor, StrategyOutcome, StrategyRegistry,
};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::MigratorError;
use crate::models::{ErrorRecord, Phase, Progress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Skip,
    Rollback,
    ManualIntervention,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Rollback => "rollback",
            RecoveryAction::ManualIntervention => "manual_intervention",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the phase runner should do about a fault.
#[derive(Debug, Clone)]
pub struct RecoveryDecision {
    pub action: RecoveryAction,
    /// Wait before acting; only non-zero for retries.
    pub delay: Duration,
    pub strategy: Option<String>,
    /// Episode attempt number this decision was made on.
    pub attempt: u32,
    pub rolled_back_to: Option<Checkpoint>,
    pub message: String,
}

impl RecoveryDecision {
    fn manual(attempt: u32, strategy: Option<String>, message: impl Into<String>) -> Self {
        Self {
            action: RecoveryAction::ManualIntervention,
            delay: Duration::ZERO,
            strategy,
            attempt,
            rolled_back_to: None,
            message: message.into(),
        }
    }

    pub fn is_manual(&self) -> bool {
        self.action == RecoveryAction::ManualIntervention
    }
}

pub struct RecoveryEngine {
    registry: RwLock<StrategyRegistry>,
    checkpoints: CheckpointStore,
    contexts: Mutex<HashMap<String, RecoveryContext>>,
    hooks: Arc<dyn RecoveryHooks>,
}

impl RecoveryEngine {
    /// Engine with the built-in strategies.
    pub fn new(checkpoint_limit: usize, hooks: Arc<dyn RecoveryHooks>) -> Self {
        Self::with_registry(StrategyRegistry::with_builtin(), checkpoint_limit, hooks)
    }

    pub fn with_registry(
        registry: StrategyRegistry,
        checkpoint_limit: usize,
        hooks: Arc<dyn RecoveryHooks>,
    ) -> Self {
        Self {
            registry: RwLock::new(registry),
            checkpoints: CheckpointStore::new(checkpoint_limit),
            contexts: Mutex::new(HashMap::new()),
            hooks,
        }
    }

    pub fn register_strategy(&self, strategy: RecoveryStrategy) {
        tracing::info!(strategy = %strategy.id, priority = strategy.priority, "Registered recovery strategy");
        self.registry.write().register(strategy);
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.registry
            .read()
            .ids()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn hooks(&self) -> &dyn RecoveryHooks {
        self.hooks.as_ref()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Decide how to react to `error`, raised by `phase` of `job_id`.
    ///
    /// Applicable strategies run in priority order while the episode's attempt
    /// counter is within their retry budget. A successful retry wins; any other
    /// action is returned as soon as a strategy produces it. Nothing left to try
    /// means manual intervention.
    pub async fn handle_error(
        &self,
        job_id: &str,
        error: &ErrorRecord,
        phase: Phase,
    ) -> RecoveryDecision {
        let attempt = {
            let mut contexts = self.contexts.lock();
            let context = contexts.entry(job_id.to_string()).or_default();
            context.attempt += 1;
            context.errors.push(error.clone());
            context.attempt
        };

        let strategies = self.registry.read().applicable(error.code);
        if strategies.is_empty() {
            tracing::warn!(job_id, phase = %phase, code = %error.code, "No recovery strategy handles this fault");
            self.discard(job_id);
            return RecoveryDecision::manual(
                attempt,
                None,
                format!("No recovery strategy handles {}", error.code),
            );
        }

        let request = RecoveryRequest {
            job_id,
            phase,
            error,
            attempt,
        };

        for strategy in strategies {
            if attempt > strategy.max_attempts() {
                tracing::debug!(
                    job_id,
                    strategy = %strategy.id,
                    attempt,
                    "Strategy retry budget exhausted"
                );
                continue;
            }

            let started = Instant::now();
            let outcome = match strategy.executor.execute(self, &request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(job_id, strategy = %strategy.id, error = %format!("{:#}", e), "Recovery strategy failed");
                    StrategyOutcome::failed(RecoveryAction::Retry, format!("{:#}", e))
                }
            };
            self.record_attempt(job_id, &strategy.id, attempt, &outcome, started.elapsed());

            match outcome.action {
                RecoveryAction::Retry if outcome.success => {
                    let delay = strategy.backoff.delay(attempt);
                    tracing::info!(
                        job_id,
                        phase = %phase,
                        strategy = %strategy.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Recovery scheduled a retry"
                    );
                    return RecoveryDecision {
                        action: RecoveryAction::Retry,
                        delay,
                        strategy: Some(strategy.id.clone()),
                        attempt,
                        rolled_back_to: outcome.restored,
                        message: outcome.message,
                    };
                }
                RecoveryAction::Retry => continue,
                action => {
                    tracing::info!(
                        job_id,
                        phase = %phase,
                        strategy = %strategy.id,
                        action = %action,
                        "Recovery decided"
                    );
                    if matches!(
                        action,
                        RecoveryAction::ManualIntervention | RecoveryAction::Skip
                    ) {
                        self.discard(job_id);
                    }
                    return RecoveryDecision {
                        action,
                        delay: Duration::ZERO,
                        strategy: Some(strategy.id.clone()),
                        attempt,
                        rolled_back_to: outcome.restored,
                        message: outcome.message,
                    };
                }
            }
        }

        tracing::warn!(job_id, phase = %phase, code = %error.code, attempt, "Recovery exhausted");
        self.discard(job_id);
        RecoveryDecision::manual(
            attempt,
            None,
            format!("All recovery strategies for {} are exhausted", error.code),
        )
    }

    fn record_attempt(
        &self,
        job_id: &str,
        strategy_id: &str,
        attempt: u32,
        outcome: &StrategyOutcome,
        duration: Duration,
    ) {
        if let Some(context) = self.contexts.lock().get_mut(job_id) {
            context.attempts.push(RecoveryAttempt {
                strategy_id: strategy_id.to_string(),
                attempt,
                success: outcome.success,
                action: outcome.action,
                duration,
                at: Utc::now(),
                message: outcome.message.clone(),
            });
        }
    }

    /// Snapshot of the current failure episode, if one is open.
    pub fn recovery_context(&self, job_id: &str) -> Option<RecoveryContext> {
        self.contexts.lock().get(job_id).cloned()
    }

    /// Close the episode after the faulty phase succeeded.
    pub fn resolve(&self, job_id: &str) {
        if let Some(context) = self.contexts.lock().remove(job_id) {
            tracing::info!(
                job_id,
                attempts = context.attempts.len(),
                "Recovery episode resolved"
            );
        }
    }

    pub fn discard(&self, job_id: &str) {
        self.contexts.lock().remove(job_id);
    }

    /// Drop everything held for a job that reached a terminal status.
    pub fn release(&self, job_id: &str) {
        self.discard(job_id);
        self.checkpoints.clear(job_id);
    }

    pub fn create_checkpoint(
        &self,
        job_id: &str,
        phase: Phase,
        progress: &Progress,
        state: serde_json::Value,
        rollback_instructions: Vec<String>,
    ) -> Checkpoint {
        self.checkpoints
            .create(job_id, phase, progress, state, rollback_instructions)
    }

    /// Replay the checkpoint's rollback instructions in order, then forget every
    /// later checkpoint. One failed instruction fails the whole rollback.
    pub async fn rollback_to_checkpoint(
        &self,
        job_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint> {
        let checkpoint = self
            .checkpoints
            .get(job_id, checkpoint_id)
            .ok_or_else(|| {
                MigratorError::Migration(format!(
                    "Checkpoint {} not found for job {}",
                    checkpoint_id, job_id
                ))
            })?;

        if !checkpoint.rollback_eligible {
            return Err(MigratorError::Migration(format!(
                "Checkpoint {} ({}) is not eligible for rollback",
                checkpoint.id, checkpoint.phase
            ))
            .into());
        }

        for instruction in &checkpoint.rollback_instructions {
            self.hooks
                .apply_rollback_instruction(job_id, &checkpoint, instruction)
                .await
                .with_context(|| format!("Rollback instruction failed: {}", instruction))?;
        }

        let removed = self.checkpoints.truncate_after(job_id, &checkpoint.id);
        tracing::info!(
            job_id,
            checkpoint_id = %checkpoint.id,
            phase = %checkpoint.phase,
            removed,
            "Rolled back to checkpoint"
        );
        Ok(checkpoint)
    }
}

impl fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("strategies", &self.strategy_ids())
            .finish()
    }
}
