// ABOUTME: The ten fixed phases of the clone pipeline
// ABOUTME: Each phase owns a fixed band of the overall completion percentage

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preparation,
    SchemaMigration,
    DataMigration,
    StorageMigration,
    ConfigurationMigration,
    EdgeFunctionsMigration,
    SecurityMigration,
    RealtimeSetup,
    Validation,
    Cutover,
}

impl Phase {
    /// Pipeline order.
    pub const ALL: [Phase; 10] = [
        Phase::Preparation,
        Phase::SchemaMigration,
        Phase::DataMigration,
        Phase::StorageMigration,
        Phase::ConfigurationMigration,
        Phase::EdgeFunctionsMigration,
        Phase::SecurityMigration,
        Phase::RealtimeSetup,
        Phase::Validation,
        Phase::Cutover,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preparation => "preparation",
            Phase::SchemaMigration => "schema_migration",
            Phase::DataMigration => "data_migration",
            Phase::StorageMigration => "storage_migration",
            Phase::ConfigurationMigration => "configuration_migration",
            Phase::EdgeFunctionsMigration => "edge_functions_migration",
            Phase::SecurityMigration => "security_migration",
            Phase::RealtimeSetup => "realtime_setup",
            Phase::Validation => "validation",
            Phase::Cutover => "cutover",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Phase::Preparation => "Preparing target project",
            Phase::SchemaMigration => "Migrating schema",
            Phase::DataMigration => "Migrating data",
            Phase::StorageMigration => "Migrating storage",
            Phase::ConfigurationMigration => "Migrating configuration",
            Phase::EdgeFunctionsMigration => "Migrating edge functions",
            Phase::SecurityMigration => "Migrating security policies",
            Phase::RealtimeSetup => "Setting up realtime",
            Phase::Validation => "Validating clone",
            Phase::Cutover => "Cutover",
        }
    }

    /// Start and end of this phase's share of the overall percentage.
    pub fn band(&self) -> (f64, f64) {
        match self {
            Phase::Preparation => (0.0, 10.0),
            Phase::SchemaMigration => (10.0, 30.0),
            Phase::DataMigration => (30.0, 60.0),
            Phase::StorageMigration => (60.0, 70.0),
            Phase::ConfigurationMigration => (70.0, 75.0),
            Phase::EdgeFunctionsMigration => (75.0, 80.0),
            Phase::SecurityMigration => (80.0, 85.0),
            Phase::RealtimeSetup => (85.0, 90.0),
            Phase::Validation => (90.0, 95.0),
            Phase::Cutover => (95.0, 100.0),
        }
    }

    /// Map a within-phase percentage onto the overall scale.
    pub fn overall_at(&self, phase_percentage: f64) -> f64 {
        let (start, end) = self.band();
        start + (end - start) * phase_percentage.clamp(0.0, 100.0) / 100.0
    }

    /// Validation and cutover cannot be undone by replaying a checkpoint.
    pub fn is_rollback_safe(&self) -> bool {
        !matches!(self, Phase::Validation | Phase::Cutover)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
