// ABOUTME: Long-term home for jobs evicted from the orchestrator's active set
// ABOUTME: The default store keeps them in memory; deployments plug in a database

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::models::Job;

#[async_trait]
pub trait JobHistory: Send + Sync {
    async fn record(&self, job: &Job) -> anyhow::Result<()>;

    async fn get(&self, job_id: &str) -> anyhow::Result<Option<Job>>;

    async fn list(&self) -> anyhow::Result<Vec<Job>>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobHistory {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobHistory for InMemoryJobHistory {
    async fn record(&self, job: &Job) -> anyhow::Result<()> {
        self.jobs.write().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        Ok(self.jobs.read().get(job_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MigrationOptions;

    #[tokio::test]
    async fn test_record_and_get() {
        let history = InMemoryJobHistory::new();
        let job = Job::new(MigrationOptions::new("src", "Copy of src", "acme"), "alice");
        history.record(&job).await.unwrap();

        assert_eq!(history.get(&job.id).await.unwrap().unwrap().id, job.id);
        assert!(history.get("missing").await.unwrap().is_none());
        assert_eq!(history.list().await.unwrap().len(), 1);
    }
}
