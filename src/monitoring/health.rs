// ABOUTME: Periodic health probes for the migrator's dependencies
// ABOUTME: Connectivity, API availability, storage access, resource usage and error rate

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::metrics::FaultLog;
use crate::remote::ProjectManagementClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub id: String,
    pub name: String,
    pub status: HealthStatus,
    pub last_checked: DateTime<Utc>,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

/// What one probe run observed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub status: HealthStatus,
    pub response_time: Option<Duration>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn healthy(response_time: Option<Duration>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time,
            error: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Warning,
            response_time: None,
            error: Some(message.into()),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Critical,
            response_time: None,
            error: Some(message.into()),
        }
    }

    fn timed(mut self, elapsed: Duration) -> Self {
        self.response_time = Some(elapsed);
        self
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    async fn check(&self) -> ProbeResult;
}

/// Current and maximum number of jobs the process is running.
pub trait LoadGauge: Send + Sync {
    fn in_flight(&self) -> usize;

    fn capacity(&self) -> usize;
}

/// Opens a TCP connection to the API host.
pub struct ConnectivityProbe {
    address: String,
    timeout: Duration,
}

impl ConnectivityProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    /// `host:port` for an http(s) URL.
    pub fn for_url(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;

        let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid API URL '{}'", url))?;
        let host = parsed
            .host_str()
            .with_context(|| format!("API URL '{}' has no host", url))?;
        let port = parsed
            .port_or_known_default()
            .with_context(|| format!("API URL '{}' has no port", url))?;
        Ok(Self::new(format!("{}:{}", host, port), timeout))
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl HealthProbe for ConnectivityProbe {
    fn id(&self) -> &'static str {
        "connectivity"
    }

    fn name(&self) -> &'static str {
        "Network connectivity"
    }

    async fn check(&self) -> ProbeResult {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.address)).await
        {
            Ok(Ok(_)) => ProbeResult::healthy(Some(started.elapsed())),
            Ok(Err(e)) => ProbeResult::critical(format!("Cannot reach {}: {}", self.address, e)),
            Err(_) => ProbeResult::critical(format!(
                "Connecting to {} timed out after {}s",
                self.address,
                self.timeout.as_secs()
            )),
        }
    }
}

/// Authenticated round trip to the management API.
pub struct ApiAvailabilityProbe {
    client: Arc<dyn ProjectManagementClient>,
    slow_threshold: Duration,
}

impl ApiAvailabilityProbe {
    pub fn new(client: Arc<dyn ProjectManagementClient>, slow_threshold: Duration) -> Self {
        Self {
            client,
            slow_threshold,
        }
    }
}

#[async_trait]
impl HealthProbe for ApiAvailabilityProbe {
    fn id(&self) -> &'static str {
        "api_availability"
    }

    fn name(&self) -> &'static str {
        "Management API"
    }

    async fn check(&self) -> ProbeResult {
        let started = Instant::now();
        let result = self.client.ping().await;
        let elapsed = started.elapsed();
        match result {
            Ok(()) if elapsed > self.slow_threshold => ProbeResult::warning(format!(
                "API responded in {}ms",
                elapsed.as_millis()
            ))
            .timed(elapsed),
            Ok(()) => ProbeResult::healthy(Some(elapsed)),
            Err(e) => ProbeResult::critical(e.to_string()).timed(elapsed),
        }
    }
}

/// Lists buckets of a reference project.
pub struct StorageAccessProbe {
    client: Arc<dyn ProjectManagementClient>,
    project_ref: Option<String>,
}

impl StorageAccessProbe {
    pub fn new(client: Arc<dyn ProjectManagementClient>, project_ref: Option<String>) -> Self {
        Self {
            client,
            project_ref,
        }
    }
}

#[async_trait]
impl HealthProbe for StorageAccessProbe {
    fn id(&self) -> &'static str {
        "storage_access"
    }

    fn name(&self) -> &'static str {
        "Storage access"
    }

    async fn check(&self) -> ProbeResult {
        let Some(project_ref) = &self.project_ref else {
            return ProbeResult::healthy(None);
        };
        let started = Instant::now();
        match self.client.list_buckets(project_ref).await {
            Ok(_) => ProbeResult::healthy(Some(started.elapsed())),
            Err(e) => ProbeResult::warning(format!("Storage listing failed: {}", e))
                .timed(started.elapsed()),
        }
    }
}

/// Share of the job capacity in use: warning at 80%, critical at 95%.
pub struct ResourceUsageProbe {
    gauge: Arc<dyn LoadGauge>,
}

impl ResourceUsageProbe {
    pub fn new(gauge: Arc<dyn LoadGauge>) -> Self {
        Self { gauge }
    }
}

#[async_trait]
impl HealthProbe for ResourceUsageProbe {
    fn id(&self) -> &'static str {
        "resource_usage"
    }

    fn name(&self) -> &'static str {
        "Resource usage"
    }

    async fn check(&self) -> ProbeResult {
        let active = self.gauge.in_flight();
        let capacity = self.gauge.capacity().max(1);
        let usage = active as f64 / capacity as f64;
        let message = format!("{} of {} job slots in use", active, capacity);
        if usage >= 0.95 {
            ProbeResult::critical(message)
        } else if usage >= 0.8 {
            ProbeResult::warning(message)
        } else {
            ProbeResult::healthy(None)
        }
    }
}

/// Fault rate over the last hour, read from the monitor's own log.
pub struct ErrorRateProbe {
    log: Arc<FaultLog>,
    warning_per_hour: f64,
    critical_per_hour: f64,
}

impl ErrorRateProbe {
    pub fn new(log: Arc<FaultLog>, warning_per_hour: f64, critical_per_hour: f64) -> Self {
        Self {
            log,
            warning_per_hour,
            critical_per_hour,
        }
    }
}

#[async_trait]
impl HealthProbe for ErrorRateProbe {
    fn id(&self) -> &'static str {
        "error_rate"
    }

    fn name(&self) -> &'static str {
        "Error rate"
    }

    async fn check(&self) -> ProbeResult {
        let rate = self.log.since(Utc::now() - ChronoDuration::hours(1)).len() as f64;
        let message = format!("{} faults in the last hour", rate);
        if rate >= self.critical_per_hour {
            ProbeResult::critical(message)
        } else if rate >= self.warning_per_hour {
            ProbeResult::warning(message)
        } else {
            ProbeResult::healthy(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, Severity};
    use crate::models::{ErrorRecord, Phase};
    use crate::monitoring::metrics::FaultEntry;

    struct FixedGauge(usize, usize);

    impl LoadGauge for FixedGauge {
        fn in_flight(&self) -> usize {
            self.0
        }

        fn capacity(&self) -> usize {
            self.1
        }
    }

    #[tokio::test]
    async fn test_resource_usage_levels() {
        let check = |active| async move {
            ResourceUsageProbe::new(Arc::new(FixedGauge(active, 50)))
                .check()
                .await
                .status
        };
        assert_eq!(check(10).await, HealthStatus::Healthy);
        assert_eq!(check(40).await, HealthStatus::Warning);
        assert_eq!(check(48).await, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_error_rate_levels() {
        let log = Arc::new(FaultLog::new(100));
        let probe = ErrorRateProbe::new(log.clone(), 2.0, 4.0);
        assert_eq!(probe.check().await.status, HealthStatus::Healthy);

        for _ in 0..4 {
            log.push(FaultEntry {
                job_id: None,
                record: ErrorRecord::new(
                    Phase::DataMigration,
                    ErrorCode::NetworkError,
                    Severity::High,
                    "reset",
                    None,
                    true,
                ),
            });
        }
        let result = probe.check().await;
        assert_eq!(result.status, HealthStatus::Critical);
        assert!(result.error.unwrap().contains("4 faults"));
    }

    #[test]
    fn test_connectivity_address_from_url() {
        let probe =
            ConnectivityProbe::for_url("https://api.example.com/v1", Duration::from_secs(1)).unwrap();
        assert_eq!(probe.address(), "api.example.com:443");
        assert!(ConnectivityProbe::for_url("not a url", Duration::from_secs(1)).is_err());
    }
}
