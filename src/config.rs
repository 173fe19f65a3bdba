// ABOUTME: Runtime settings loaded from an optional TOML file with environment overrides
// ABOUTME: Covers the API client, orchestrator limits, recovery and monitoring thresholds

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_API_URL: &str = "MIGRATOR_API_URL";
pub const ENV_ACCESS_TOKEN: &str = "MIGRATOR_ACCESS_TOKEN";
pub const ENV_MAX_CONCURRENT_JOBS: &str = "MIGRATOR_MAX_CONCURRENT_JOBS";
pub const ENV_LOG_LEVEL: &str = "MIGRATOR_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    /// `text` or `json`
    pub log_format: String,
    pub api: ApiSettings,
    pub orchestrator: OrchestratorSettings,
    pub recovery: RecoverySettings,
    pub monitoring: MonitoringSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            api: ApiSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            recovery: RecoverySettings::default(),
            monitoring: MonitoringSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    /// `{ref}` is replaced with the project reference.
    pub project_url_template: String,
    pub request_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.supabase.com".to_string(),
            access_token: None,
            project_url_template: "https://{ref}.supabase.co".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Pending plus running jobs allowed per organization.
    pub max_concurrent_jobs_per_org: usize,
    /// Jobs the whole process is sized for; feeds the resource probe.
    pub global_capacity: usize,
    pub phase_retry_ceiling: u32,
    pub project_ready_attempts: u32,
    pub project_ready_interval_secs: u64,
    pub event_channel_capacity: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs_per_org: 5,
            global_capacity: 50,
            phase_retry_ceiling: 3,
            project_ready_attempts: 30,
            project_ready_interval_secs: 10,
            event_channel_capacity: 256,
        }
    }
}

impl OrchestratorSettings {
    pub fn project_ready_interval(&self) -> Duration {
        Duration::from_secs(self.project_ready_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub checkpoint_limit: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            checkpoint_limit: crate::checkpoint::DEFAULT_CHECKPOINT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub fault_log_capacity: usize,
    pub pattern_threshold: u32,
    /// Patterns not seen for this long are forgotten.
    pub pattern_ttl_secs: u64,
    pub critical_burst_count: usize,
    pub critical_burst_window_secs: u64,
    pub alert_retention_days: i64,
    pub health_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Faults per hour before the error-rate probe warns.
    pub error_rate_warning_per_hour: f64,
    pub error_rate_critical_per_hour: f64,
    pub alert_channel_capacity: usize,
    /// Project whose storage is listed by the storage probe.
    pub reference_project_ref: Option<String>,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            fault_log_capacity: 1000,
            pattern_threshold: 5,
            pattern_ttl_secs: 24 * 60 * 60,
            critical_burst_count: 3,
            critical_burst_window_secs: 600,
            alert_retention_days: 30,
            health_interval_secs: 60,
            probe_timeout_secs: 10,
            error_rate_warning_per_hour: 10.0,
            error_rate_critical_per_hour: 50.0,
            alert_channel_capacity: 256,
            reference_project_ref: None,
        }
    }
}

impl MonitoringSettings {
    pub fn critical_burst_window(&self) -> Duration {
        Duration::from_secs(self.critical_burst_window_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Settings {
    /// Load settings from `path` when given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply overrides from `lookup`, usually the process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api.base_url = url;
        }
        if let Some(token) = lookup(ENV_ACCESS_TOKEN) {
            self.api.access_token = Some(token);
        }
        if let Some(limit) = lookup(ENV_MAX_CONCURRENT_JOBS) {
            self.orchestrator.max_concurrent_jobs_per_org = limit.trim().parse().with_context(|| {
                format!("{} must be a positive integer, got '{}'", ENV_MAX_CONCURRENT_JOBS, limit)
            })?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}
