// ABOUTME: Domain model for clone jobs: job lifecycle, progress, options and phases
// ABOUTME: Re-exports the types shared by the orchestrator, recovery engine and monitor

mod job;
mod options;
mod phase;

pub use job::{
    ErrorRecord, Job, JobStatus, MigrationCounters, PhaseProgress, PhaseStatus, Progress,
};
pub use options::{CloneType, DataFilter, MigrationOptions};
pub use phase::Phase;
