// ABOUTME: Per-job checkpoint store holding progress snapshots taken before each phase
// ABOUTME: Keeps the most recent checkpoints per job and supports rollback lookup and truncation

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{Phase, Progress};

pub const DEFAULT_CHECKPOINT_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub job_id: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    /// Deep copy of the job's progress at capture time.
    pub progress: Progress,
    /// Phase-specific state, opaque to the store.
    pub state: serde_json::Value,
    pub rollback_eligible: bool,
    /// Replayed in order when rolling back to this checkpoint.
    pub rollback_instructions: Vec<String>,
}

pub struct CheckpointStore {
    limit: usize,
    checkpoints: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl CheckpointStore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            checkpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Record a checkpoint, evicting the oldest ones beyond the limit.
    pub fn create(
        &self,
        job_id: &str,
        phase: Phase,
        progress: &Progress,
        state: serde_json::Value,
        rollback_instructions: Vec<String>,
    ) -> Checkpoint {
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            phase,
            created_at: Utc::now(),
            progress: progress.clone(),
            state,
            rollback_eligible: phase.is_rollback_safe(),
            rollback_instructions,
        };

        let mut all = self.checkpoints.lock();
        let list = all.entry(job_id.to_string()).or_default();
        list.push(checkpoint.clone());
        if list.len() > self.limit {
            let excess = list.len() - self.limit;
            list.drain(..excess);
        }

        tracing::debug!(
            job_id,
            phase = %phase,
            checkpoint_id = %checkpoint.id,
            "Checkpoint created"
        );
        checkpoint
    }

    /// Oldest first.
    pub fn list(&self, job_id: &str) -> Vec<Checkpoint> {
        self.checkpoints
            .lock()
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, job_id: &str, checkpoint_id: &str) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .get(job_id)
            .and_then(|list| list.iter().find(|c| c.id == checkpoint_id).cloned())
    }

    pub fn latest(&self, job_id: &str) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .get(job_id)
            .and_then(|list| list.last().cloned())
    }

    pub fn latest_for_phase(&self, job_id: &str, phase: Phase) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .get(job_id)
            .and_then(|list| list.iter().rev().find(|c| c.phase == phase).cloned())
    }

    /// Replace the undo steps of a checkpoint once its phase knows what it will write.
    pub fn set_rollback_instructions(
        &self,
        job_id: &str,
        checkpoint_id: &str,
        instructions: Vec<String>,
    ) -> bool {
        let mut all = self.checkpoints.lock();
        match all
            .get_mut(job_id)
            .and_then(|list| list.iter_mut().find(|c| c.id == checkpoint_id))
        {
            Some(checkpoint) => {
                checkpoint.rollback_instructions = instructions;
                true
            }
            None => false,
        }
    }

    /// Drop every checkpoint recorded after `checkpoint_id`. Returns how many were dropped.
    pub fn truncate_after(&self, job_id: &str, checkpoint_id: &str) -> usize {
        let mut all = self.checkpoints.lock();
        let Some(list) = all.get_mut(job_id) else {
            return 0;
        };
        match list.iter().position(|c| c.id == checkpoint_id) {
            Some(index) => {
                let removed = list.len() - index - 1;
                list.truncate(index + 1);
                removed
            }
            None => 0,
        }
    }

    pub fn clear(&self, job_id: &str) {
        self.checkpoints.lock().remove(job_id);
    }
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(store: &CheckpointStore, job: &str, phase: Phase) -> Checkpoint {
        store.create(job, phase, &Progress::new(), serde_json::Value::Null, vec![])
    }

    #[test]
    fn test_eleventh_checkpoint_evicts_oldest() {
        let store = CheckpointStore::default();
        let first = create(&store, "job-1", Phase::Preparation);
        for _ in 0..10 {
            create(&store, "job-1", Phase::DataMigration);
        }

        let list = store.list("job-1");
        assert_eq!(list.len(), 10);
        assert!(list.iter().all(|c| c.id != first.id));
        assert!(store.get("job-1", &first.id).is_none());
    }

    #[test]
    fn test_jobs_are_isolated() {
        let store = CheckpointStore::new(2);
        create(&store, "a", Phase::Preparation);
        create(&store, "a", Phase::SchemaMigration);
        create(&store, "a", Phase::DataMigration);
        create(&store, "b", Phase::Preparation);
        assert_eq!(store.list("a").len(), 2);
        assert_eq!(store.list("b").len(), 1);
    }

    #[test]
    fn test_truncate_after() {
        let store = CheckpointStore::default();
        let first = create(&store, "job", Phase::Preparation);
        let second = create(&store, "job", Phase::SchemaMigration);
        create(&store, "job", Phase::DataMigration);

        assert_eq!(store.truncate_after("job", &second.id), 1);
        assert_eq!(store.latest("job").unwrap().id, second.id);
        assert_eq!(store.truncate_after("job", &second.id), 0);
        assert_eq!(store.truncate_after("job", &first.id), 1);
        assert_eq!(store.list("job").len(), 1);
    }

    #[test]
    fn test_rollback_instructions_can_be_filled_in_later() {
        let store = CheckpointStore::default();
        let checkpoint = create(&store, "job", Phase::SchemaMigration);
        assert!(checkpoint.rollback_instructions.is_empty());

        let drops = vec!["DROP TABLE IF EXISTS \"public\".\"users\" CASCADE".to_string()];
        assert!(store.set_rollback_instructions("job", &checkpoint.id, drops.clone()));
        assert_eq!(
            store.get("job", &checkpoint.id).unwrap().rollback_instructions,
            drops
        );
        assert!(!store.set_rollback_instructions("other", &checkpoint.id, Vec::new()));
    }

    #[test]
    fn test_rollback_eligibility_follows_phase() {
        let store = CheckpointStore::default();
        assert!(create(&store, "job", Phase::StorageMigration).rollback_eligible);
        assert!(!create(&store, "job", Phase::Validation).rollback_eligible);
        assert_eq!(
            store.latest_for_phase("job", Phase::StorageMigration).unwrap().phase,
            Phase::StorageMigration
        );
    }
}
