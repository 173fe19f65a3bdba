// ABOUTME: Error monitor ingesting faults, deriving metrics and patterns, and raising alerts
// ABOUTME: Also runs the periodic health probes; never mutates job state

pub mod alerts;
pub mod health;
pub mod metrics;

pub use alerts::{Alert, AlertBook, AlertKind};
pub use health::{
    ApiAvailabilityProbe, ConnectivityProbe, ErrorRateProbe, HealthCheck, HealthProbe,
    HealthStatus, LoadGauge, ProbeResult, ResourceUsageProbe, StorageAccessProbe,
};
pub use metrics::{ErrorMetrics, ErrorPattern, FaultEntry, FaultLog, PatternTracker};

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::audit::{AuditAction, AuditEntry, AuditSink};
use crate::config::MonitoringSettings;
use crate::error::{MigratorError, Severity};
use crate::models::ErrorRecord;
use crate::orchestrator::MigrationEvent;

pub struct ErrorMonitor {
    settings: MonitoringSettings,
    log: Arc<FaultLog>,
    patterns: Mutex<PatternTracker>,
    /// Jobs whose critical-fault burst already alerted.
    burst_active: Mutex<HashSet<Option<String>>>,
    alerts: Mutex<AlertBook>,
    alert_tx: broadcast::Sender<Alert>,
    probes: RwLock<Vec<Arc<dyn HealthProbe>>>,
    health: Mutex<BTreeMap<String, HealthCheck>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl ErrorMonitor {
    /// Monitor with only the built-in error-rate probe registered.
    pub fn new(settings: MonitoringSettings) -> Self {
        let log = Arc::new(FaultLog::new(settings.fault_log_capacity));
        let (alert_tx, _) = broadcast::channel(settings.alert_channel_capacity.max(1));
        let error_rate: Arc<dyn HealthProbe> = Arc::new(ErrorRateProbe::new(
            log.clone(),
            settings.error_rate_warning_per_hour,
            settings.error_rate_critical_per_hour,
        ));

        Self {
            patterns: Mutex::new(PatternTracker::new(settings.pattern_threshold)),
            settings,
            log,
            burst_active: Mutex::new(HashSet::new()),
            alerts: Mutex::new(AlertBook::new()),
            alert_tx,
            probes: RwLock::new(vec![error_rate]),
            health: Mutex::new(BTreeMap::new()),
            audit: None,
        }
    }

    /// Record alert acknowledgements and resolutions to `sink`.
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn add_probe(&self, probe: Arc<dyn HealthProbe>) {
        let mut probes = self.probes.write();
        probes.retain(|p| p.id() != probe.id());
        probes.push(probe);
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alert_tx.subscribe()
    }

    /// Ingest one fault. Returns the alerts it raised.
    pub fn record_fault(&self, job_id: Option<&str>, record: &ErrorRecord) -> Vec<Alert> {
        self.log.push(FaultEntry {
            job_id: job_id.map(str::to_string),
            record: record.clone(),
        });

        let mut raised = Vec::new();

        if let Some(pattern) = self.patterns.lock().observe(record) {
            raised.push(
                Alert::new(
                    AlertKind::PatternDetected,
                    pattern.max_severity,
                    format!("Recurring {} in {}", pattern.code, pattern.phase),
                    format!(
                        "{} occurred {} times in {} since {}",
                        pattern.code,
                        pattern.frequency,
                        pattern.phase,
                        pattern.first_seen.to_rfc3339()
                    ),
                )
                .for_job(job_id)
                .for_error(&record.id),
            );
        }

        if record.severity == Severity::Critical {
            raised.push(
                Alert::new(
                    AlertKind::CriticalError,
                    Severity::Critical,
                    format!("Critical fault in {}", record.phase),
                    format!("{}: {}", record.code, record.message),
                )
                .for_job(job_id)
                .for_error(&record.id),
            );
        }

        if let Some(alert) = self.check_critical_burst(job_id, record) {
            raised.push(alert);
        }

        for alert in &raised {
            self.raise(alert.clone());
        }
        raised
    }

    /// Settle the recovery outcome of a fault ingested earlier.
    pub fn record_recovery(&self, record: &ErrorRecord) {
        if !self.log.update(record) {
            tracing::debug!(error_id = %record.id, "Recovered fault no longer in the log");
        }
    }

    fn check_critical_burst(&self, job_id: Option<&str>, record: &ErrorRecord) -> Option<Alert> {
        let window = ChronoDuration::from_std(self.settings.critical_burst_window())
            .unwrap_or_else(|_| ChronoDuration::minutes(10));
        let count = self.log.critical_count(job_id, Utc::now() - window);
        let key = job_id.map(str::to_string);
        let mut active = self.burst_active.lock();

        if count < self.settings.critical_burst_count {
            active.remove(&key);
            return None;
        }
        if !active.insert(key) {
            return None;
        }

        Some(
            Alert::new(
                AlertKind::ThresholdExceeded,
                Severity::Critical,
                "Critical fault threshold exceeded",
                format!(
                    "{} critical faults within {} minutes",
                    count,
                    self.settings.critical_burst_window_secs / 60
                ),
            )
            .for_job(job_id)
            .for_error(&record.id),
        )
    }

    fn raise(&self, alert: Alert) {
        tracing::warn!(
            alert_id = %alert.id,
            kind = %alert.kind,
            severity = %alert.severity,
            job_id = alert.job_id.as_deref().unwrap_or(""),
            "{}",
            alert.title
        );
        let _ = self.alert_tx.send(alert.clone());
        self.alerts.lock().push(alert);
    }

    pub fn metrics(&self, window: Duration) -> ErrorMetrics {
        let span = ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let entries = self.log.since(Utc::now() - span);
        ErrorMetrics::compute(&entries, window)
    }

    pub fn recent_faults(&self, limit: usize) -> Vec<FaultEntry> {
        self.log.recent(limit)
    }

    pub fn patterns(&self) -> Vec<ErrorPattern> {
        self.patterns.lock().patterns()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().all().to_vec()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unresolved()
    }

    pub async fn acknowledge(&self, alert_id: &str, actor: &str) -> Result<Alert, MigratorError> {
        let alert = self.alerts.lock().acknowledge(alert_id, actor)?;
        tracing::info!(alert_id, actor, "Alert acknowledged");
        self.audit(AuditEntry::new(AuditAction::AlertAcknowledged, actor).resource(alert_id))
            .await;
        Ok(alert)
    }

    pub async fn resolve(
        &self,
        alert_id: &str,
        actor: &str,
        note: Option<String>,
    ) -> Result<Alert, MigratorError> {
        let alert = self.alerts.lock().resolve(alert_id, actor, note)?;
        tracing::info!(alert_id, actor, "Alert resolved");
        let mut entry = AuditEntry::new(AuditAction::AlertResolved, actor).resource(alert_id);
        if let Some(note) = &alert.resolution_note {
            entry = entry.details(serde_json::json!({ "note": note }));
        }
        self.audit(entry).await;
        Ok(alert)
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Some(sink) = &self.audit {
            if let Err(e) = sink.record(&entry).await {
                tracing::warn!(error = %e, "Failed to write audit entry");
            }
        }
    }

    /// Drop resolved alerts past retention and patterns gone stale.
    pub fn purge(&self) -> usize {
        let now = Utc::now();
        let alerts = self
            .alerts
            .lock()
            .purge_resolved(self.settings.alert_retention_days, now);
        let patterns = self
            .patterns
            .lock()
            .purge_stale(Duration::from_secs(self.settings.pattern_ttl_secs), now);
        if alerts + patterns > 0 {
            tracing::debug!(alerts, patterns, "Purged monitoring state");
        }
        alerts + patterns
    }

    pub fn health(&self) -> Vec<HealthCheck> {
        self.health.lock().values().cloned().collect()
    }

    /// Run every probe once. A probe entering critical raises a system-health alert.
    pub async fn run_health_checks(&self) -> Vec<HealthCheck> {
        let probes: Vec<Arc<dyn HealthProbe>> = self.probes.read().clone();
        let timeout = self.settings.probe_timeout();
        let mut checks = Vec::with_capacity(probes.len());

        for probe in probes {
            let result = match tokio::time::timeout(timeout, probe.check()).await {
                Ok(result) => result,
                Err(_) => ProbeResult::critical(format!(
                    "Probe timed out after {}s",
                    timeout.as_secs()
                )),
            };

            let check = HealthCheck {
                id: probe.id().to_string(),
                name: probe.name().to_string(),
                status: result.status,
                last_checked: Utc::now(),
                response_time_ms: result.response_time.map(|d| d.as_millis() as u64),
                error: result.error,
            };

            let previous = self
                .health
                .lock()
                .insert(check.id.clone(), check.clone())
                .map(|c| c.status);

            tracing::debug!(probe = %check.id, status = %check.status, "Health probe finished");

            if check.status == HealthStatus::Critical && previous != Some(HealthStatus::Critical) {
                self.raise(Alert::new(
                    AlertKind::SystemHealth,
                    Severity::Critical,
                    format!("{} is critical", check.name),
                    check
                        .error
                        .clone()
                        .unwrap_or_else(|| "Probe reported critical".to_string()),
                ));
            }
            checks.push(check);
        }
        checks
    }

    /// Run health checks and purges on the configured interval until the handle is aborted.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.settings.health_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            tracing::info!(interval_secs = interval.as_secs(), "Health monitoring started");

            loop {
                ticker.tick().await;
                let checks = self.run_health_checks().await;
                let unhealthy = checks
                    .iter()
                    .filter(|c| c.status != HealthStatus::Healthy)
                    .count();
                if unhealthy > 0 {
                    tracing::warn!(unhealthy, "Health checks reported problems");
                }
                self.purge();
            }
        })
    }

    /// Ingest faults from an orchestrator event stream until it closes.
    pub fn watch(
        self: Arc<Self>,
        mut events: broadcast::Receiver<MigrationEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MigrationEvent::FaultRecorded { job_id, error }) => {
                        self.record_fault(Some(&job_id), &error);
                    }
                    Ok(MigrationEvent::FaultRecovered { error, .. }) => {
                        self.record_recovery(&error);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Monitor fell behind the event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
