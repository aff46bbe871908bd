//! Engine wiring: one explicit object graph, no globals.
//!
//! Every component is constructed once at application start and passed by
//! reference into the transport layer and UI. Ambient platform facilities
//! (durable storage, connectivity, key-value storage, notifications, memory
//! pressure) are all behind small traits with in-memory defaults, which is
//! what keeps the whole stack testable under virtual time.

pub mod connectivity;
pub mod error;
pub mod identity;
pub mod interceptor;
mod internal_event;
pub mod monitor;
pub mod queue;
pub mod rate_limiter;
pub mod retries;
pub mod service;
pub mod transport;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bon::{Builder, bon};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use connectivity::Connectivity;
use identity::{IdentityResolver, KeyValueStore, MemoryKeyValueStore, SessionIdentity};
use interceptor::{CallOptions, RequestInterceptor};
use monitor::{AlertLevel, AlertLog, MonitorSettings, PredictiveMonitor};
use queue::{MemoryQueueStore, QueueStore};
use rate_limiter::{AdaptiveRateLimiter, RateLimitSettings};
use retries::{RetryCoordinator, RetrySettings};
use service::ResilienceService;
use transport::Transport;

pub use monitor::Alert;
pub use retries::DrainReport;

/// Where user-facing notifications go. Hosts typically bridge this to their
/// toast/banner system.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, level: AlertLevel);
}

/// Fallback sink: renders notifications as log lines. A host without a UI
/// still gets a visible, self-contained record of every banner.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, message: &str, level: AlertLevel) {
        match level {
            AlertLevel::Critical => {
                error!(target: "adaptive_traffic::banner", "{message}")
            }
            AlertLevel::Warning => warn!(target: "adaptive_traffic::banner", "{message}"),
            AlertLevel::Info => info!(target: "adaptive_traffic::banner", "{message}"),
        }
    }
}

/// Optional memory collaborator. `usage_ratio` is polled by the monitor;
/// `request_trim` is the remediation signal asking the host to drop caches.
pub trait MemoryCollaborator: Send + Sync {
    fn usage_ratio(&self) -> f64;
    fn request_trim(&self);
}

/// Top-level tuning, one section per component.
#[derive(Clone, Copy, Debug, Builder)]
pub struct EngineSettings {
    #[builder(default)]
    pub rate_limit: RateLimitSettings,
    #[builder(default)]
    pub retry: RetrySettings,
    #[builder(default)]
    pub monitor: MonitorSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitSettings::default(),
            retry: RetrySettings::default(),
            monitor: MonitorSettings::default(),
        }
    }
}

/// A cancelable background task. The only long-lived work in the engine
/// lives in these handles; queued requests, by contrast, are never
/// cancelable once durably persisted.
pub struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawns `tick` on a fixed period. The first tick fires immediately,
    /// which is how the monitor gets its startup check.
    pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        Self { name, handle }
    }

    /// Wraps an already spawned watcher so it participates in engine
    /// shutdown.
    pub fn watching(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }

    pub fn stop(&self) {
        debug!(target: "adaptive_traffic::engine", task = self.name, "stopping scheduled task");
        self.handle.abort();
    }
}

/// The assembled resilience engine.
pub struct ResilienceEngine {
    settings: EngineSettings,
    limiter: Arc<AdaptiveRateLimiter>,
    coordinator: Arc<RetryCoordinator>,
    monitor: Arc<PredictiveMonitor>,
    interceptor: Arc<RequestInterceptor>,
    connectivity: Connectivity,
    alerts: Arc<AlertLog>,
    sink: Arc<dyn NotificationSink>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

#[bon]
impl ResilienceEngine {
    /// Wires the component graph. Only the transport is mandatory;
    /// everything else defaults to the in-memory implementations.
    #[builder]
    pub fn new(
        transport: Arc<dyn Transport>,
        #[builder(default)] settings: EngineSettings,
        store: Option<Arc<dyn QueueStore>>,
        sink: Option<Arc<dyn NotificationSink>>,
        key_value: Option<Arc<dyn KeyValueStore>>,
        identity: Option<Arc<dyn IdentityResolver>>,
        memory: Option<Arc<dyn MemoryCollaborator>>,
        connectivity: Option<Connectivity>,
    ) -> Self {
        let sink = sink.unwrap_or_else(|| Arc::new(LogSink));
        let store = store.unwrap_or_else(|| Arc::new(MemoryQueueStore::new()));
        let identity = identity.unwrap_or_else(|| {
            let key_value =
                key_value.unwrap_or_else(|| Arc::new(MemoryKeyValueStore::default()));
            Arc::new(SessionIdentity::new(key_value))
        });
        let connectivity = connectivity.unwrap_or_default();

        let alerts = Arc::new(AlertLog::new(settings.monitor.max_alerts, Arc::clone(&sink)));
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            settings.rate_limit,
            Arc::clone(&sink),
        ));
        let coordinator = Arc::new(RetryCoordinator::new(
            store,
            Arc::clone(&transport),
            settings.retry,
            Arc::clone(&alerts),
        ));
        let monitor = Arc::new(PredictiveMonitor::new(
            settings.monitor,
            Arc::clone(&coordinator),
            Arc::clone(&alerts),
            memory,
        ));
        let interceptor = Arc::new(RequestInterceptor::new(
            Arc::clone(&limiter),
            Arc::clone(&coordinator),
            Arc::clone(&monitor),
            connectivity.clone(),
            transport,
            identity,
        ));

        Self {
            settings,
            limiter,
            coordinator,
            monitor,
            interceptor,
            connectivity,
            alerts,
            sink,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl ResilienceEngine {
    /// Starts the periodic loops, the connectivity watcher, and the startup
    /// drain. Idempotent; must be called within a Tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("engine tasks");
        if !tasks.is_empty() {
            return;
        }
        info!(target: "adaptive_traffic::engine", "starting resilience engine");

        let limiter = Arc::clone(&self.limiter);
        tasks.push(ScheduledTask::spawn_periodic(
            "limit-adjustment",
            self.settings.rate_limit.adjust_interval,
            move || {
                let limiter = Arc::clone(&limiter);
                async move { limiter.run_adjustment_cycle() }
            },
        ));

        let monitor = Arc::clone(&self.monitor);
        tasks.push(ScheduledTask::spawn_periodic(
            "health-check",
            self.settings.monitor.check_interval,
            move || {
                let monitor = Arc::clone(&monitor);
                async move {
                    let _ = monitor.run_checks();
                }
            },
        ));

        tasks.push(ScheduledTask::watching(
            "connectivity-watch",
            tokio::spawn(Self::watch_connectivity(
                self.connectivity.clone(),
                Arc::clone(&self.monitor),
                Arc::clone(&self.coordinator),
                Arc::clone(&self.sink),
            )),
        ));

        // Anything a previous run left behind goes out as soon as we are up.
        let coordinator = Arc::clone(&self.coordinator);
        tasks.push(ScheduledTask::watching(
            "startup-drain",
            tokio::spawn(async move {
                let _ = coordinator.drain().await;
            }),
        ));
    }

    async fn watch_connectivity(
        connectivity: Connectivity,
        monitor: Arc<PredictiveMonitor>,
        coordinator: Arc<RetryCoordinator>,
        sink: Arc<dyn NotificationSink>,
    ) {
        let mut rx = connectivity.subscribe();
        rx.mark_unchanged();
        loop {
            if rx.changed().await.is_err() {
                break;
            }
            let online = *rx.borrow_and_update();
            monitor.record_connectivity(online);
            if online {
                info!(target: "adaptive_traffic::engine", "connectivity restored");
                sink.notify("Back online, delivering queued requests", AlertLevel::Info);
                let report = coordinator.drain().await;
                if !report.skipped {
                    debug!(
                        target: "adaptive_traffic::engine",
                        delivered = report.delivered,
                        retried = report.retried,
                        evicted = report.evicted,
                        "restore drain finished"
                    );
                }
            } else {
                warn!(target: "adaptive_traffic::engine", "connectivity lost");
                sink.notify(
                    "Connection lost, requests will be queued and retried",
                    AlertLevel::Warning,
                );
            }
        }
    }

    /// Stops all periodic work. Safe to call more than once.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().expect("engine tasks");
        for task in tasks.drain(..) {
            task.stop();
        }
        info!(target: "adaptive_traffic::engine", "resilience engine stopped");
    }

    pub fn interceptor(&self) -> &Arc<RequestInterceptor> {
        &self.interceptor
    }

    pub fn limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    pub fn coordinator(&self) -> &Arc<RetryCoordinator> {
        &self.coordinator
    }

    pub fn monitor(&self) -> &Arc<PredictiveMonitor> {
        &self.monitor
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn alerts(&self) -> &Arc<AlertLog> {
        &self.alerts
    }

    /// The interceptor packaged as a `tower::Service`.
    pub fn tower_service(&self, options: CallOptions) -> ResilienceService {
        ResilienceService::new(Arc::clone(&self.interceptor), options)
    }
}
