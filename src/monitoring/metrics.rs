// ABOUTME: Bounded fault log, windowed error metrics and recurring-pattern tracking
// ABOUTME: Patterns are keyed by error code and phase and alert once per threshold crossing

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::error::{ErrorCode, Severity};
use crate::models::{ErrorRecord, Phase};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultEntry {
    pub job_id: Option<String>,
    pub record: ErrorRecord,
}

/// Most recent faults across all jobs, oldest first.
#[derive(Debug)]
pub struct FaultLog {
    capacity: usize,
    entries: Mutex<VecDeque<FaultEntry>>,
}

impl FaultLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, entry: FaultEntry) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<FaultEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.record.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<FaultEntry> {
        let entries = self.entries.lock();
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Replace the stored copy of `record` with its settled recovery flags.
    /// Returns false when the fault already aged out of the log.
    pub fn update(&self, record: &ErrorRecord) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.record.id == record.id) {
            Some(entry) => {
                entry.record = record.clone();
                true
            }
            None => false,
        }
    }

    /// Critical faults for `job_id` at or after `cutoff`.
    pub fn critical_count(&self, job_id: Option<&str>, cutoff: DateTime<Utc>) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| {
                e.job_id.as_deref() == job_id
                    && e.record.severity == Severity::Critical
                    && e.record.timestamp >= cutoff
            })
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorMetrics {
    pub window_secs: u64,
    pub total: usize,
    pub by_phase: BTreeMap<Phase, usize>,
    pub by_code: BTreeMap<ErrorCode, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub rate_per_hour: f64,
    pub mean_time_to_recovery_secs: Option<f64>,
    /// Share of faults with a recovery attempt that recovered.
    pub recovery_success_rate: Option<f64>,
}

impl ErrorMetrics {
    pub fn compute(entries: &[FaultEntry], window: Duration) -> Self {
        let mut by_phase = BTreeMap::new();
        let mut by_code = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        let mut attempted = 0usize;
        let mut succeeded = 0usize;
        let mut recovery_secs = Vec::new();

        for entry in entries {
            let record = &entry.record;
            *by_phase.entry(record.phase).or_insert(0) += 1;
            *by_code.entry(record.code).or_insert(0) += 1;
            *by_severity.entry(record.severity).or_insert(0) += 1;

            if record.recovery_attempted {
                attempted += 1;
                if record.recovery_succeeded {
                    succeeded += 1;
                }
                if let Some(recovered_at) = record.recovered_at {
                    let elapsed = (recovered_at - record.timestamp).num_milliseconds().max(0);
                    recovery_secs.push(elapsed as f64 / 1000.0);
                }
            }
        }

        let hours = (window.as_secs_f64() / 3600.0).max(f64::EPSILON);
        Self {
            window_secs: window.as_secs(),
            total: entries.len(),
            by_phase,
            by_code,
            by_severity,
            rate_per_hour: entries.len() as f64 / hours,
            mean_time_to_recovery_secs: (!recovery_secs.is_empty())
                .then(|| recovery_secs.iter().sum::<f64>() / recovery_secs.len() as f64),
            recovery_success_rate: (attempted > 0).then(|| succeeded as f64 / attempted as f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPattern {
    pub code: ErrorCode,
    pub phase: Phase,
    pub frequency: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub max_severity: Severity,
    pub alerted: bool,
}

#[derive(Debug)]
pub struct PatternTracker {
    threshold: u32,
    patterns: HashMap<(ErrorCode, Phase), ErrorPattern>,
}

impl PatternTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            patterns: HashMap::new(),
        }
    }

    /// Count one occurrence. Returns the pattern when this occurrence crosses the
    /// alert threshold for the first time.
    pub fn observe(&mut self, record: &ErrorRecord) -> Option<ErrorPattern> {
        let pattern = self
            .patterns
            .entry((record.code, record.phase))
            .or_insert_with(|| ErrorPattern {
                code: record.code,
                phase: record.phase,
                frequency: 0,
                first_seen: record.timestamp,
                last_seen: record.timestamp,
                max_severity: record.severity,
                alerted: false,
            });

        pattern.frequency += 1;
        pattern.last_seen = pattern.last_seen.max(record.timestamp);
        pattern.max_severity = pattern.max_severity.max(record.severity);

        if !pattern.alerted
            && pattern.frequency >= self.threshold
            && pattern.max_severity >= Severity::High
        {
            pattern.alerted = true;
            return Some(pattern.clone());
        }
        None
    }

    pub fn patterns(&self) -> Vec<ErrorPattern> {
        let mut patterns: Vec<_> = self.patterns.values().cloned().collect();
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        patterns
    }

    /// Forget patterns not seen within `ttl`, so a later recurrence can alert again.
    pub fn purge_stale(&mut self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let before = self.patterns.len();
        self.patterns
            .retain(|_, p| now.signed_duration_since(p.last_seen) < ttl);
        before - self.patterns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: ErrorCode, phase: Phase, severity: Severity) -> ErrorRecord {
        ErrorRecord::new(phase, code, severity, "fault", None, true)
    }

    #[test]
    fn test_fault_log_is_bounded() {
        let log = FaultLog::new(3);
        for _ in 0..5 {
            log.push(FaultEntry {
                job_id: None,
                record: record(ErrorCode::NetworkError, Phase::Preparation, Severity::High),
            });
        }
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_metrics_histograms_and_recovery() {
        let mut recovered = record(ErrorCode::ConnectionTimeout, Phase::DataMigration, Severity::High);
        recovered.recovered_at = Some(recovered.timestamp + ChronoDuration::seconds(4));
        recovered.recovery_attempted = true;
        recovered.recovery_succeeded = true;

        let mut failed = record(ErrorCode::PermissionDenied, Phase::DataMigration, Severity::Medium);
        failed.recovery_attempted = true;

        let untouched = record(ErrorCode::ConnectionTimeout, Phase::Cutover, Severity::Critical);

        let entries: Vec<FaultEntry> = [recovered, failed, untouched]
            .into_iter()
            .map(|record| FaultEntry { job_id: None, record })
            .collect();
        let metrics = ErrorMetrics::compute(&entries, Duration::from_secs(1800));

        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.by_phase[&Phase::DataMigration], 2);
        assert_eq!(metrics.by_code[&ErrorCode::ConnectionTimeout], 2);
        assert_eq!(metrics.by_severity[&Severity::Critical], 1);
        assert_eq!(metrics.rate_per_hour, 6.0);
        assert_eq!(metrics.mean_time_to_recovery_secs, Some(4.0));
        assert_eq!(metrics.recovery_success_rate, Some(0.5));
    }

    #[test]
    fn test_fault_log_update_settles_recovery() {
        let log = FaultLog::new(10);
        let mut fault = record(ErrorCode::SystemError, Phase::DataMigration, Severity::High);
        fault.mark_recovery_attempted();
        log.push(FaultEntry {
            job_id: Some("job".into()),
            record: fault.clone(),
        });

        let before = ErrorMetrics::compute(&log.recent(10), Duration::from_secs(3600));
        assert_eq!(before.recovery_success_rate, Some(0.0));
        assert!(before.mean_time_to_recovery_secs.is_none());

        fault.mark_recovered(fault.timestamp + ChronoDuration::seconds(30));
        assert!(log.update(&fault));
        let after = ErrorMetrics::compute(&log.recent(10), Duration::from_secs(3600));
        assert_eq!(after.recovery_success_rate, Some(1.0));
        assert_eq!(after.mean_time_to_recovery_secs, Some(30.0));

        let unknown = record(ErrorCode::SystemError, Phase::DataMigration, Severity::High);
        assert!(!log.update(&unknown));
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = ErrorMetrics::compute(&[], Duration::from_secs(3600));
        assert_eq!(metrics.total, 0);
        assert!(metrics.recovery_success_rate.is_none());
        assert!(metrics.mean_time_to_recovery_secs.is_none());
    }

    #[test]
    fn test_pattern_alerts_once_at_threshold() {
        let mut tracker = PatternTracker::new(5);
        let fault = record(ErrorCode::ResourceLocked, Phase::StorageMigration, Severity::High);
        let crossings: Vec<_> = (0..6).map(|_| tracker.observe(&fault)).collect();

        assert!(crossings[..4].iter().all(Option::is_none));
        assert_eq!(crossings[4].as_ref().unwrap().frequency, 5);
        assert!(crossings[5].is_none());
    }

    #[test]
    fn test_low_severity_pattern_never_alerts() {
        let mut tracker = PatternTracker::new(5);
        let fault = record(
            ErrorCode::FeatureNotSupported,
            Phase::EdgeFunctionsMigration,
            Severity::Low,
        );
        assert!((0..10).all(|_| tracker.observe(&fault).is_none()));
        assert_eq!(tracker.patterns()[0].frequency, 10);
    }

    #[test]
    fn test_stale_patterns_are_purged() {
        let mut tracker = PatternTracker::new(5);
        tracker.observe(&record(ErrorCode::NetworkError, Phase::Preparation, Severity::High));
        let later = Utc::now() + ChronoDuration::hours(25);
        assert_eq!(tracker.purge_stale(Duration::from_secs(24 * 3600), later), 1);
        assert!(tracker.patterns().is_empty());
    }
}
