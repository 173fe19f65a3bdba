// ABOUTME: Library root for the project migrator
// ABOUTME: Phased clone orchestration with checkpoints, recovery strategies and error monitoring

pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod monitoring;
pub mod orchestrator;
pub mod recovery;
pub mod remote;
pub mod replication;
pub mod schema;

pub use error::{ErrorCode, MigratorError, Severity};
pub use models::{CloneType, Job, JobStatus, MigrationOptions, Phase};
pub use orchestrator::{Collaborators, MigrationEvent, MigrationOrchestrator};
