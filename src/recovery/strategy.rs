// ABOUTME: Recovery strategy descriptors, backoff policies and the built-in strategy set
// ABOUTME: Strategies are sorted by numeric priority once, when they are registered

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::{RecoveryAction, RecoveryEngine};
use crate::checkpoint::Checkpoint;
use crate::error::ErrorCode;
use crate::models::{ErrorRecord, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Linear,
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(kind: BackoffKind, base: Duration, max: Duration) -> Self {
        Self { kind, base, max }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.kind {
            BackoffKind::Fixed => self.base,
            BackoffKind::Linear => self.base.saturating_mul(attempt),
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base.saturating_mul(factor)
            }
        };
        delay.min(self.max)
    }
}

/// What a strategy was asked to handle.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryRequest<'a> {
    pub job_id: &'a str,
    pub phase: Phase,
    pub error: &'a ErrorRecord,
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub success: bool,
    pub action: RecoveryAction,
    pub message: String,
    /// Set when the strategy restored a checkpoint.
    pub restored: Option<Checkpoint>,
}

impl StrategyOutcome {
    pub fn succeeded(action: RecoveryAction, message: impl Into<String>) -> Self {
        Self {
            success: true,
            action,
            message: message.into(),
            restored: None,
        }
    }

    pub fn failed(action: RecoveryAction, message: impl Into<String>) -> Self {
        Self {
            success: false,
            action,
            message: message.into(),
            restored: None,
        }
    }
}

#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    async fn execute(
        &self,
        engine: &RecoveryEngine,
        request: &RecoveryRequest<'_>,
    ) -> anyhow::Result<StrategyOutcome>;
}

pub struct RecoveryStrategy {
    pub id: String,
    pub name: String,
    /// Lower runs first.
    pub priority: u32,
    pub error_codes: HashSet<ErrorCode>,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub executor: Arc<dyn StrategyExecutor>,
}

impl RecoveryStrategy {
    pub fn handles(&self, code: ErrorCode) -> bool {
        self.error_codes.contains(&code)
    }

    /// A strategy always gets its first attempt, even with zero retries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl std::fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<RecoveryStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for strategy in builtin_strategies() {
            registry.register(strategy);
        }
        registry
    }

    /// Add a strategy, replacing any with the same id, and keep priority order.
    pub fn register(&mut self, strategy: RecoveryStrategy) {
        self.strategies.retain(|s| s.id != strategy.id);
        self.strategies.push(Arc::new(strategy));
        self.strategies.sort_by_key(|s| s.priority);
    }

    /// Strategies handling `code`, highest priority first.
    pub fn applicable(&self, code: ErrorCode) -> Vec<Arc<RecoveryStrategy>> {
        self.strategies
            .iter()
            .filter(|s| s.handles(code))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<RecoveryStrategy>> {
        self.strategies.iter().find(|s| s.id == id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.id.as_str()).collect()
    }
}

fn strategy(
    id: &str,
    name: &str,
    priority: u32,
    codes: &[ErrorCode],
    max_retries: u32,
    backoff: BackoffPolicy,
    executor: Arc<dyn StrategyExecutor>,
) -> RecoveryStrategy {
    RecoveryStrategy {
        id: id.to_string(),
        name: name.to_string(),
        priority,
        error_codes: codes.iter().copied().collect(),
        max_retries,
        backoff,
        executor,
    }
}

pub fn builtin_strategies() -> Vec<RecoveryStrategy> {
    use BackoffKind::*;
    use ErrorCode::*;

    let secs = Duration::from_secs;
    vec![
        strategy(
            "connection-retry",
            "Connection retry",
            10,
            &[ConnectionTimeout, ConnectionRefused, NetworkError],
            5,
            BackoffPolicy::new(Exponential, secs(1), secs(30)),
            Arc::new(ConnectionRetry),
        ),
        strategy(
            "resource-cleanup",
            "Resource cleanup",
            20,
            &[ResourceConflict, ResourceLocked, ResourceExists],
            3,
            BackoffPolicy::new(Linear, secs(2), secs(10)),
            Arc::new(ResourceCleanup),
        ),
        strategy(
            "data-integrity-repair",
            "Data integrity repair",
            30,
            &[DataCorruption, ConstraintViolation, ForeignKeyError],
            2,
            BackoffPolicy::new(Linear, secs(5), secs(15)),
            Arc::new(DataIntegrityRepair),
        ),
        strategy(
            "permission-escalation",
            "Permission escalation",
            40,
            &[PermissionDenied, InsufficientPrivileges, AuthFailed],
            1,
            BackoffPolicy::new(Fixed, Duration::ZERO, Duration::ZERO),
            Arc::new(PermissionEscalation),
        ),
        strategy(
            "graceful-degradation",
            "Graceful degradation",
            50,
            &[OptionalComponentError, FeatureNotSupported],
            0,
            BackoffPolicy::new(Fixed, Duration::ZERO, Duration::ZERO),
            Arc::new(GracefulDegradation),
        ),
        strategy(
            "partial-rollback",
            "Partial rollback",
            60,
            &[CriticalError, SystemError, UnexpectedError],
            2,
            BackoffPolicy::new(Fixed, secs(1), secs(1)),
            Arc::new(PartialRollback),
        ),
    ]
}

struct ConnectionRetry;

#[async_trait]
impl StrategyExecutor for ConnectionRetry {
    async fn execute(
        &self,
        _engine: &RecoveryEngine,
        request: &RecoveryRequest<'_>,
    ) -> anyhow::Result<StrategyOutcome> {
        Ok(StrategyOutcome::succeeded(
            RecoveryAction::Retry,
            format!("Retrying after {}", request.error.code),
        ))
    }
}

struct ResourceCleanup;

#[async_trait]
impl StrategyExecutor for ResourceCleanup {
    async fn execute(
        &self,
        engine: &RecoveryEngine,
        request: &RecoveryRequest<'_>,
    ) -> anyhow::Result<StrategyOutcome> {
        engine
            .hooks()
            .cleanup_resources(request.job_id, request.phase, request.error)
            .await?;
        Ok(StrategyOutcome::succeeded(
            RecoveryAction::Retry,
            "Resources cleaned up",
        ))
    }
}

struct PermissionEscalation;

#[async_trait]
impl StrategyExecutor for PermissionEscalation {
    async fn execute(
        &self,
        _engine: &RecoveryEngine,
        request: &RecoveryRequest<'_>,
    ) -> anyhow::Result<StrategyOutcome> {
        Ok(StrategyOutcome::failed(
            RecoveryAction::ManualIntervention,
            format!(
                "{} requires an operator to grant access: {}",
                request.error.code, request.error.message
            ),
        ))
    }
}

struct DataIntegrityRepair;

#[async_trait]
impl StrategyExecutor for DataIntegrityRepair {
    async fn execute(
        &self,
        engine: &RecoveryEngine,
        request: &RecoveryRequest<'_>,
    ) -> anyhow::Result<StrategyOutcome> {
        let repaired = engine
            .hooks()
            .repair_data(request.job_id, request.phase, request.error)
            .await?;
        Ok(if repaired {
            StrategyOutcome::succeeded(RecoveryAction::Retry, "Data repaired")
        } else {
            StrategyOutcome::failed(RecoveryAction::Retry, "Data repair did not succeed")
        })
    }
}

struct PartialRollback;

#[async_trait]
impl StrategyExecutor for PartialRollback {
    async fn execute(
        &self,
        engine: &RecoveryEngine,
        request: &RecoveryRequest<'_>,
    ) -> anyhow::Result<StrategyOutcome> {
        let Some(checkpoint) = engine.checkpoints().latest(request.job_id) else {
            return Ok(StrategyOutcome::failed(
                RecoveryAction::ManualIntervention,
                "No checkpoint to roll back to",
            ));
        };

        match engine
            .rollback_to_checkpoint(request.job_id, &checkpoint.id)
            .await
        {
            Ok(restored) => {
                let mut outcome = StrategyOutcome::succeeded(
                    RecoveryAction::Retry,
                    format!("Rolled back to checkpoint before {}", restored.phase),
                );
                outcome.restored = Some(restored);
                Ok(outcome)
            }
            Err(e) => Ok(StrategyOutcome::failed(
                RecoveryAction::ManualIntervention,
                format!("Rollback failed: {:#}", e),
            )),
        }
    }
}

struct GracefulDegradation;

#[async_trait]
impl StrategyExecutor for GracefulDegradation {
    async fn execute(
        &self,
        _engine: &RecoveryEngine,
        request: &RecoveryRequest<'_>,
    ) -> anyhow::Result<StrategyOutcome> {
        Ok(StrategyOutcome::succeeded(
            RecoveryAction::Skip,
            format!("Skipping {} after {}", request.phase, request.error.code),
        ))
    }
}
