//! Predictive health monitoring and remediation.
//!
//! Every transported call feeds a latency/outcome sample into rolling,
//! time-pruned windows. A periodic check (plus one run at startup) evaluates
//! five independent heuristics over those windows, maps the number of raised
//! flags to a risk level, and at critical risk fires idempotent remediation:
//! drain the retry queue, ask the memory collaborator to trim, and alert.
//!
//! The one event-driven exception is the consecutive-failure detector, which
//! raises a critical alert the moment the threshold is crossed instead of
//! waiting for the next scheduled cycle. Monitoring never throws into the
//! request path; it only observes, alerts, and remediates best effort.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bon::Builder;
use tokio::time::Instant;

use super::internal_event::RiskEvaluated;
use super::queue::unix_millis;
use super::retries::RetryCoordinator;
use super::{MemoryCollaborator, NotificationSink};

/// Severity attached to alerts and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

/// One recorded condition, newest kept first in the log.
#[derive(Debug, Clone)]
pub struct Alert {
    pub id: u64,
    pub level: AlertLevel,
    pub message: String,
    pub at_ms: u64,
    pub data: serde_json::Value,
    pub acknowledged: bool,
}

/// Capped newest-first alert list. Critical alerts are also pushed to the
/// notification sink; everything else stays silent telemetry.
pub struct AlertLog {
    alerts: Mutex<VecDeque<Alert>>,
    next_id: AtomicU64,
    max_alerts: usize,
    sink: Arc<dyn NotificationSink>,
}

impl AlertLog {
    pub fn new(max_alerts: usize, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
            max_alerts,
            sink,
        }
    }

    pub fn raise(&self, level: AlertLevel, message: String, data: serde_json::Value) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        match level {
            AlertLevel::Critical => {
                error!(target: "adaptive_traffic::monitor", alert_id = id, message = %message, "critical alert")
            }
            AlertLevel::Warning => {
                warn!(target: "adaptive_traffic::monitor", alert_id = id, message = %message, "alert")
            }
            AlertLevel::Info => {
                info!(target: "adaptive_traffic::monitor", alert_id = id, message = %message, "alert")
            }
        }
        if level == AlertLevel::Critical {
            self.sink.notify(&message, level);
        }

        let mut alerts = self.alerts.lock().expect("alert log");
        alerts.push_front(Alert {
            id,
            level,
            message,
            at_ms: unix_millis(),
            data,
            acknowledged: false,
        });
        alerts.truncate(self.max_alerts);
        id
    }

    /// Newest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().expect("alert log").iter().cloned().collect()
    }

    pub fn acknowledge(&self, id: u64) -> bool {
        let mut alerts = self.alerts.lock().expect("alert log");
        match alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn unacknowledged(&self) -> usize {
        self.alerts
            .lock()
            .expect("alert log")
            .iter()
            .filter(|a| !a.acknowledged)
            .count()
    }
}

/// Tuning for the monitor. Thresholds are the hand-tuned production values;
/// see the settings docs on the limiter for the general caveat.
#[derive(Clone, Copy, Debug, Builder)]
pub struct MonitorSettings {
    /// Period of the scheduled check cycle.
    #[builder(default = default_check_interval())]
    pub check_interval: Duration,

    /// Width of every rolling signal window.
    #[builder(default = default_prediction_window())]
    pub prediction_window: Duration,

    /// Raw error count in the window that raises the error-rate flag.
    #[builder(default = default_error_threshold())]
    pub error_threshold: usize,

    /// Mean latency over the trailing samples that raises the latency flag.
    #[builder(default = default_latency_threshold_ms())]
    pub latency_threshold_ms: f64,

    /// Trailing sample count the latency mean is taken over; also the
    /// minimum number of windowed samples before the trend check runs.
    #[builder(default = default_trend_sample_count())]
    pub trend_sample_count: usize,

    /// Fraction of consecutive sample pairs that must be rising. Guards the
    /// latency flag against single spikes.
    #[builder(default = default_trend_increase_ratio())]
    pub trend_increase_ratio: f64,

    /// Memory collaborator usage ratio that raises the memory flag.
    #[builder(default = default_memory_threshold())]
    pub memory_threshold: f64,

    /// Offline transitions in the window above which the network flag
    /// raises.
    #[builder(default = default_max_offline_flips())]
    pub max_offline_flips: usize,

    /// Consecutive failed calls that fire the immediate critical alert.
    #[builder(default = default_consecutive_errors_threshold())]
    pub consecutive_errors_threshold: u32,

    /// Alert log capacity; oldest evicted on overflow.
    #[builder(default = default_max_alerts())]
    pub max_alerts: usize,
}

const fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}
const fn default_prediction_window() -> Duration {
    Duration::from_secs(300)
}
const fn default_error_threshold() -> usize {
    10
}
const fn default_latency_threshold_ms() -> f64 {
    2000.0
}
const fn default_trend_sample_count() -> usize {
    5
}
const fn default_trend_increase_ratio() -> f64 {
    0.7
}
const fn default_memory_threshold() -> f64 {
    0.85
}
const fn default_max_offline_flips() -> usize {
    3
}
const fn default_consecutive_errors_threshold() -> u32 {
    5
}
const fn default_max_alerts() -> usize {
    50
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            prediction_window: default_prediction_window(),
            error_threshold: default_error_threshold(),
            latency_threshold_ms: default_latency_threshold_ms(),
            trend_sample_count: default_trend_sample_count(),
            trend_increase_ratio: default_trend_increase_ratio(),
            memory_threshold: default_memory_threshold(),
            max_offline_flips: default_max_offline_flips(),
            consecutive_errors_threshold: default_consecutive_errors_threshold(),
            max_alerts: default_max_alerts(),
        }
    }
}

/// One observed call.
#[derive(Debug, Clone)]
pub struct MetricsSample {
    pub at: Instant,
    pub latency_ms: f64,
    pub is_error: bool,
    pub endpoint: String,
}

/// Aggregate risk, keyed by how many heuristics flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    const fn from_flag_count(flags: usize) -> Self {
        match flags {
            0 => RiskLevel::Low,
            1 => RiskLevel::Medium,
            2 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Outcome of one check cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub error_flag: bool,
    pub latency_flag: bool,
    pub memory_flag: bool,
    pub network_flag: bool,
    pub consecutive_flag: bool,
}

impl RiskAssessment {
    pub const fn flag_count(&self) -> usize {
        self.error_flag as usize
            + self.latency_flag as usize
            + self.memory_flag as usize
            + self.network_flag as usize
            + self.consecutive_flag as usize
    }
}

#[derive(Default)]
struct SignalWindows {
    latencies: VecDeque<MetricsSample>,
    errors: VecDeque<MetricsSample>,
    offline_flips: VecDeque<Instant>,
}

impl SignalWindows {
    fn prune(&mut self, now: Instant, window: Duration) {
        prune_samples(&mut self.latencies, now, window);
        prune_samples(&mut self.errors, now, window);
        while let Some(front) = self.offline_flips.front() {
            if now.duration_since(*front) > window {
                self.offline_flips.pop_front();
            } else {
                break;
            }
        }
    }
}

fn prune_samples(samples: &mut VecDeque<MetricsSample>, now: Instant, window: Duration) {
    while let Some(front) = samples.front() {
        if now.duration_since(front.at) > window {
            samples.pop_front();
        } else {
            break;
        }
    }
}

/// Aggregates health signals and steers remediation.
pub struct PredictiveMonitor {
    settings: MonitorSettings,
    windows: Mutex<SignalWindows>,
    consecutive_errors: AtomicU32,
    memory: Option<Arc<dyn MemoryCollaborator>>,
    coordinator: Arc<RetryCoordinator>,
    alerts: Arc<AlertLog>,
}

impl PredictiveMonitor {
    pub fn new(
        settings: MonitorSettings,
        coordinator: Arc<RetryCoordinator>,
        alerts: Arc<AlertLog>,
        memory: Option<Arc<dyn MemoryCollaborator>>,
    ) -> Self {
        Self {
            settings,
            windows: Mutex::new(SignalWindows::default()),
            consecutive_errors: AtomicU32::new(0),
            memory,
            coordinator,
            alerts,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn alert_log(&self) -> &Arc<AlertLog> {
        &self.alerts
    }

    /// Feeds one completed call into the rolling windows. Crossing the
    /// consecutive-failure threshold alerts immediately, without waiting for
    /// the next scheduled cycle.
    pub fn record_sample(&self, latency_ms: f64, is_error: bool, endpoint: &str) {
        let now = Instant::now();
        let sample = MetricsSample {
            at: now,
            latency_ms,
            is_error,
            endpoint: endpoint.to_string(),
        };
        {
            let mut windows = self.windows.lock().expect("monitor windows");
            windows.latencies.push_back(sample.clone());
            if is_error {
                windows.errors.push_back(sample);
            }
            windows.prune(now, self.settings.prediction_window);
        }

        if is_error {
            let streak = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
            if streak == self.settings.consecutive_errors_threshold {
                self.alerts.raise(
                    AlertLevel::Critical,
                    format!("{streak} consecutive request failures"),
                    serde_json::json!({ "endpoint": endpoint, "streak": streak }),
                );
            }
        } else {
            self.consecutive_errors.store(0, Ordering::Release);
        }
    }

    /// Feeds a connectivity transition. Only offline flips count toward the
    /// instability heuristic.
    pub fn record_connectivity(&self, online: bool) {
        if online {
            return;
        }
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("monitor windows");
        windows.offline_flips.push_back(now);
        windows.prune(now, self.settings.prediction_window);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    /// Latency flag: enough samples, trailing mean above the threshold, and
    /// most consecutive pairs rising. A lone spike fails the pair test.
    fn latency_trend_flag(&self, latencies: &VecDeque<MetricsSample>) -> bool {
        let min_samples = self.settings.trend_sample_count.max(2);
        if latencies.len() < min_samples {
            return false;
        }
        let take = self.settings.trend_sample_count.min(latencies.len());
        let sum: f64 = latencies.iter().rev().take(take).map(|s| s.latency_ms).sum();
        let mean = sum / take as f64;
        if mean <= self.settings.latency_threshold_ms {
            return false;
        }

        let mut increases = 0usize;
        let mut pairs = 0usize;
        for pair in latencies.iter().zip(latencies.iter().skip(1)) {
            pairs += 1;
            if pair.1.latency_ms > pair.0.latency_ms {
                increases += 1;
            }
        }
        pairs > 0 && increases as f64 / pairs as f64 >= self.settings.trend_increase_ratio
    }

    /// One full check cycle: evaluate all five heuristics, record the risk
    /// level, and remediate when critical. Safe to call repeatedly; every
    /// remediation action is idempotent.
    pub fn run_checks(&self) -> RiskAssessment {
        let now = Instant::now();
        let (error_flag, latency_flag, network_flag) = {
            let mut windows = self.windows.lock().expect("monitor windows");
            windows.prune(now, self.settings.prediction_window);
            (
                windows.errors.len() >= self.settings.error_threshold,
                self.latency_trend_flag(&windows.latencies),
                windows.offline_flips.len() > self.settings.max_offline_flips,
            )
        };
        let memory_flag = self
            .memory
            .as_ref()
            .map(|m| m.usage_ratio() >= self.settings.memory_threshold)
            .unwrap_or(false);
        let consecutive_flag =
            self.consecutive_errors() >= self.settings.consecutive_errors_threshold;

        let assessment = RiskAssessment {
            level: RiskLevel::from_flag_count(
                error_flag as usize
                    + latency_flag as usize
                    + memory_flag as usize
                    + network_flag as usize
                    + consecutive_flag as usize,
            ),
            error_flag,
            latency_flag,
            memory_flag,
            network_flag,
            consecutive_flag,
        };
        RiskEvaluated {
            level: assessment.level as u8,
            flags: assessment.flag_count(),
        }
        .emit();

        if assessment.level == RiskLevel::Critical {
            self.remediate(&assessment);
        }
        assessment
    }

    fn remediate(&self, assessment: &RiskAssessment) {
        self.alerts.raise(
            AlertLevel::Critical,
            "system risk level critical".to_string(),
            serde_json::json!({
                "error_flag": assessment.error_flag,
                "latency_flag": assessment.latency_flag,
                "memory_flag": assessment.memory_flag,
                "network_flag": assessment.network_flag,
                "consecutive_flag": assessment.consecutive_flag,
            }),
        );

        if assessment.memory_flag {
            if let Some(memory) = &self.memory {
                info!(target: "adaptive_traffic::monitor", "remediation: requesting memory trim");
                memory.request_trim();
            }
        }
        if assessment.network_flag {
            info!(target: "adaptive_traffic::monitor", "remediation: draining retry queue");
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                let _ = coordinator.drain().await;
            });
        }
        if assessment.error_flag {
            // The client cannot restart itself; elevated errors are worth
            // surfacing but force no action.
            self.alerts.raise(
                AlertLevel::Info,
                "elevated backend error rate observed".to_string(),
                serde_json::Value::Null,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::LogSink;
    use crate::resilience::queue::{MemoryQueueStore, QueueStore};
    use crate::resilience::retries::RetrySettings;
    use crate::resilience::transport::{RequestParts, Transport, TransportResponse};
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicBool;

    struct OkTransport;

    impl Transport for OkTransport {
        fn send(
            &self,
            _request: RequestParts,
        ) -> BoxFuture<'static, Result<TransportResponse, crate::resilience::error::TransportError>>
        {
            Box::pin(async { Ok(TransportResponse { status: 200, body: bytes::Bytes::new() }) })
        }
    }

    struct FakeMemory {
        ratio: f64,
        trimmed: AtomicBool,
    }

    impl MemoryCollaborator for FakeMemory {
        fn usage_ratio(&self) -> f64 {
            self.ratio
        }

        fn request_trim(&self) {
            self.trimmed.store(true, Ordering::Release);
        }
    }

    struct Fixture {
        monitor: PredictiveMonitor,
        store: Arc<MemoryQueueStore>,
        memory: Arc<FakeMemory>,
    }

    fn fixture(settings: MonitorSettings, memory_ratio: f64) -> Fixture {
        let sink = Arc::new(LogSink::default());
        let alerts = Arc::new(AlertLog::new(settings.max_alerts, sink));
        let store = Arc::new(MemoryQueueStore::new());
        let coordinator = Arc::new(RetryCoordinator::new(
            Arc::clone(&store) as Arc<dyn QueueStore>,
            Arc::new(OkTransport),
            RetrySettings::default(),
            Arc::clone(&alerts),
        ));
        let memory = Arc::new(FakeMemory { ratio: memory_ratio, trimmed: AtomicBool::new(false) });
        let monitor = PredictiveMonitor::new(
            settings,
            coordinator,
            alerts,
            Some(Arc::clone(&memory) as Arc<dyn MemoryCollaborator>),
        );
        Fixture { monitor, store, memory }
    }

    #[tokio::test(start_paused = true)]
    async fn alert_log_caps_and_evicts_oldest_first() {
        let sink = Arc::new(LogSink::default());
        let log = AlertLog::new(3, sink);
        for i in 0..5 {
            log.raise(AlertLevel::Info, format!("alert {i}"), serde_json::Value::Null);
        }
        let alerts = log.alerts();
        assert_eq!(alerts.len(), 3);
        // Newest first; alerts 0 and 1 were evicted.
        assert_eq!(alerts[0].message, "alert 4");
        assert_eq!(alerts[2].message, "alert 2");

        assert!(log.acknowledge(alerts[0].id));
        assert!(!log.acknowledge(9999));
        assert_eq!(log.unacknowledged(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_alert_immediately() {
        let settings = MonitorSettings::builder().consecutive_errors_threshold(3).build();
        let f = fixture(settings, 0.1);

        f.monitor.record_sample(100.0, true, "/deals");
        f.monitor.record_sample(100.0, true, "/deals");
        assert!(f.monitor.alert_log().alerts().is_empty());

        f.monitor.record_sample(100.0, true, "/deals");
        let alerts = f.monitor.alert_log().alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);

        // A success resets the streak; three more errors alert again.
        f.monitor.record_sample(100.0, false, "/deals");
        assert_eq!(f.monitor.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_flag_requires_a_sustained_rising_trend() {
        let settings = MonitorSettings::builder().latency_threshold_ms(500.0).build();
        let f = fixture(settings, 0.1);

        // Rising and above threshold: flags.
        for latency in [600.0, 700.0, 800.0, 900.0, 1000.0] {
            f.monitor.record_sample(latency, false, "/a");
        }
        assert!(f.monitor.run_checks().latency_flag);

        // One spike in an otherwise flat series: pair test rejects it.
        let f = fixture(MonitorSettings::builder().latency_threshold_ms(500.0).build(), 0.1);
        for latency in [100.0, 100.0, 100.0, 100.0, 3000.0] {
            f.monitor.record_sample(latency, false, "/a");
        }
        assert!(!f.monitor.run_checks().latency_flag);

        // Rising but cheap: mean below threshold.
        let f = fixture(MonitorSettings::builder().latency_threshold_ms(500.0).build(), 0.1);
        for latency in [10.0, 20.0, 30.0, 40.0, 50.0] {
            f.monitor.record_sample(latency, false, "/a");
        }
        assert!(!f.monitor.run_checks().latency_flag);
    }

    #[tokio::test(start_paused = true)]
    async fn risk_level_tracks_flag_count() {
        let settings = MonitorSettings::builder()
            .error_threshold(2)
            .consecutive_errors_threshold(100)
            .build();
        let f = fixture(settings, 0.1);
        assert_eq!(f.monitor.run_checks().level, RiskLevel::Low);

        f.monitor.record_sample(10.0, true, "/a");
        f.monitor.record_sample(10.0, true, "/a");
        let assessment = f.monitor.run_checks();
        assert!(assessment.error_flag);
        assert_eq!(assessment.level, RiskLevel::Medium);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_risk_runs_idempotent_remediation() {
        let settings = MonitorSettings::builder()
            .error_threshold(2)
            .consecutive_errors_threshold(2)
            .max_offline_flips(1)
            .build();
        let f = fixture(settings, 0.95);

        // Seed a queued request so the drain has observable work.
        f.store.add(RequestParts::get("https://x.test/q"), 0).await.unwrap();

        f.monitor.record_sample(10.0, true, "/a");
        f.monitor.record_sample(10.0, true, "/a");
        f.monitor.record_connectivity(false);
        f.monitor.record_connectivity(false);

        let assessment = f.monitor.run_checks();
        assert_eq!(assessment.level, RiskLevel::Critical);
        assert!(assessment.memory_flag && assessment.network_flag);

        // Let the spawned drain run to completion under paused time.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(f.memory.trimmed.load(Ordering::Acquire));
        assert_eq!(f.store.len().await.unwrap(), 0);

        // Running the cycle again re-fires remediation without harm.
        let again = f.monitor.run_checks();
        assert_eq!(again.level, RiskLevel::Critical);
    }
}
