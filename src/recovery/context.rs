// ABOUTME: Transient per-job state for one failure episode
// ABOUTME: Tracks the attempt counter, strategies tried and the faults seen

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::RecoveryAction;
use crate::models::ErrorRecord;

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub strategy_id: String,
    pub attempt: u32,
    pub success: bool,
    pub action: RecoveryAction,
    pub duration: Duration,
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryContext {
    pub attempt: u32,
    pub attempts: Vec<RecoveryAttempt>,
    pub errors: Vec<ErrorRecord>,
}

impl RecoveryContext {
    pub fn new() -> Self {
        Self::default()
    }
}
