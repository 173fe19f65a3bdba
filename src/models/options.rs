// ABOUTME: Clone job configuration and its validation rules
// ABOUTME: Invalid options are rejected before a job is registered

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::phase::Phase;
use crate::error::MigratorError;

pub const MIN_PARALLEL_THREADS: u32 = 1;
pub const MAX_PARALLEL_THREADS: u32 = 20;
pub const MIN_BATCH_SIZE: u32 = 100;
pub const MAX_BATCH_SIZE: u32 = 10_000;

const PARALLELISM_PENALTY_SLOPE: f64 = 0.15;
const MIN_PARALLELISM_FACTOR: f64 = 0.5;

const FORBIDDEN_FILTER_KEYWORDS: &[&str] = &[
    "drop", "delete", "insert", "update", "alter", "create", "truncate", "grant", "revoke",
    "copy", "execute",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneType {
    FullClone,
    SchemaOnly,
    DataSubset,
}

impl CloneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloneType::FullClone => "full_clone",
            CloneType::SchemaOnly => "schema_only",
            CloneType::DataSubset => "data_subset",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "full_clone" => Some(CloneType::FullClone),
            "schema_only" => Some(CloneType::SchemaOnly),
            "data_subset" => Some(CloneType::DataSubset),
            _ => None,
        }
    }

    fn base_minutes(&self) -> f64 {
        match self {
            CloneType::FullClone => 30.0,
            CloneType::SchemaOnly => 5.0,
            CloneType::DataSubset => 15.0,
        }
    }
}

impl fmt::Display for CloneType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFilter {
    pub table: String,
    pub where_clause: String,
}

/// Everything a caller chooses about a clone. Immutable once the job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationOptions {
    pub source_project_ref: String,
    pub target_project_name: String,
    pub organization_id: String,
    #[serde(default = "default_clone_type")]
    pub clone_type: CloneType,
    #[serde(default = "default_region")]
    pub target_region: String,
    #[serde(default = "default_tier")]
    pub target_tier: String,
    #[serde(default = "default_parallel_threads")]
    pub parallel_threads: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default = "default_true")]
    pub include_storage: bool,
    #[serde(default = "default_true")]
    pub include_edge_functions: bool,
    #[serde(default = "default_true")]
    pub include_auth_config: bool,
    #[serde(default)]
    pub include_user_data: bool,
    #[serde(default)]
    pub data_filters: Vec<DataFilter>,
    #[serde(default)]
    pub excluded_tables: Vec<String>,
    /// Password for the source database; never serialized back out.
    #[serde(default, skip_serializing)]
    pub source_db_password: Option<String>,
}

fn default_clone_type() -> CloneType {
    CloneType::FullClone
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_tier() -> String {
    "free".to_string()
}

fn default_parallel_threads() -> u32 {
    4
}

fn default_batch_size() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

impl MigrationOptions {
    pub fn new(
        source_project_ref: impl Into<String>,
        target_project_name: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            source_project_ref: source_project_ref.into(),
            target_project_name: target_project_name.into(),
            organization_id: organization_id.into(),
            clone_type: default_clone_type(),
            target_region: default_region(),
            target_tier: default_tier(),
            parallel_threads: default_parallel_threads(),
            batch_size: default_batch_size(),
            compression: true,
            include_storage: true,
            include_edge_functions: true,
            include_auth_config: true,
            include_user_data: false,
            data_filters: Vec::new(),
            excluded_tables: Vec::new(),
            source_db_password: None,
        }
    }

    /// Validate every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`MigratorError::Validation`] listing each failed check.
    pub fn validate(&self) -> Result<(), MigratorError> {
        let mut errors = Vec::new();

        if !is_valid_project_ref(&self.source_project_ref) {
            errors.push(format!(
                "Invalid source project reference '{}': expected 1-40 lowercase letters or digits",
                self.source_project_ref
            ));
        }

        if !is_valid_project_name(&self.target_project_name) {
            errors.push(format!(
                "Invalid project name '{}': 3-64 characters, letters, digits, spaces, '-' or '_', starting with a letter or digit",
                self.target_project_name
            ));
        }

        if !is_valid_organization_id(&self.organization_id) {
            errors.push(format!(
                "Invalid organization id '{}': 1-64 lowercase letters, digits or '-'",
                self.organization_id
            ));
        }

        if !(MIN_PARALLEL_THREADS..=MAX_PARALLEL_THREADS).contains(&self.parallel_threads) {
            errors.push(format!(
                "parallel_threads must be between {} and {}, got {}",
                MIN_PARALLEL_THREADS, MAX_PARALLEL_THREADS, self.parallel_threads
            ));
        }

        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            errors.push(format!(
                "batch_size must be between {} and {}, got {}",
                MIN_BATCH_SIZE, MAX_BATCH_SIZE, self.batch_size
            ));
        }

        if self.target_region.trim().is_empty() {
            errors.push("target_region must not be empty".to_string());
        }

        for filter in &self.data_filters {
            if !is_valid_table_name(&filter.table) {
                errors.push(format!("Invalid filter table name '{}'", filter.table));
            }
            if let Err(reason) = check_where_clause(&filter.where_clause) {
                errors.push(format!(
                    "Invalid WHERE clause for table '{}': {}",
                    filter.table, reason
                ));
            }
        }

        for table in &self.excluded_tables {
            if !is_valid_table_name(table) {
                errors.push(format!("Invalid excluded table name '{}'", table));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MigratorError::Validation(errors.join("; ")))
        }
    }

    /// Rough duration estimate from scope and parallelism.
    ///
    /// Extra threads help with diminishing returns and never cut the estimate
    /// below half.
    pub fn estimated_duration(&self) -> Duration {
        let mut minutes = self.clone_type.base_minutes();
        if self.include_storage {
            minutes += 10.0;
        }
        if self.include_edge_functions {
            minutes += 5.0;
        }
        if self.include_auth_config {
            minutes += 2.0;
        }

        let extra_threads = f64::from(self.parallel_threads.max(1) - 1);
        let factor =
            (1.0 / (1.0 + PARALLELISM_PENALTY_SLOPE * extra_threads)).max(MIN_PARALLELISM_FACTOR);

        Duration::from_secs((minutes * factor * 60.0).round() as u64)
    }

    /// Whether configuration turns `phase` off entirely.
    pub fn phase_enabled(&self, phase: Phase) -> bool {
        match phase {
            Phase::DataMigration => self.clone_type != CloneType::SchemaOnly,
            Phase::StorageMigration => self.include_storage,
            Phase::EdgeFunctionsMigration => self.include_edge_functions,
            _ => true,
        }
    }

    pub fn filter_for(&self, table: &str) -> Option<&str> {
        self.data_filters
            .iter()
            .find(|f| f.table == table)
            .map(|f| f.where_clause.as_str())
    }

    pub fn is_excluded(&self, table: &str) -> bool {
        self.excluded_tables.iter().any(|t| t == table)
    }
}

fn is_valid_project_ref(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 40
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn is_valid_project_name(value: &str) -> bool {
    let len = value.chars().count();
    (3..=64).contains(&len)
        && value
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_'))
}

fn is_valid_organization_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// `table` or `schema.table`, each part a plain SQL identifier.
pub(crate) fn is_valid_table_name(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
            _ => return false,
        }
        part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    })
}

fn check_where_clause(clause: &str) -> Result<(), String> {
    let trimmed = clause.trim();
    if trimmed.is_empty() {
        return Err("clause is empty".to_string());
    }
    if trimmed.contains(';') {
        return Err("statement separators are not allowed".to_string());
    }
    if trimmed.contains("--") || trimmed.contains("/*") {
        return Err("comments are not allowed".to_string());
    }

    let mut depth: i32 = 0;
    let mut in_quote = false;
    for c in trimmed.chars() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced parentheses".to_string());
                }
            }
            _ => {}
        }
    }
    if in_quote {
        return Err("unterminated string literal".to_string());
    }
    if depth != 0 {
        return Err("unbalanced parentheses".to_string());
    }

    let lower = trimmed.to_lowercase();
    for word in lower.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
        if FORBIDDEN_FILTER_KEYWORDS.contains(&word) {
            return Err(format!("keyword '{}' is not allowed", word));
        }
    }

    Ok(())
}
