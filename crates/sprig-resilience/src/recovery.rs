use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sprig_device::DeviceRegistry;
use sprig_domain::{DeviceFault, DeviceId, Event, FaultSource, LifecycleState, Severity};
use tracing::{debug, info, warn};

use crate::error::ResilienceError;
use crate::monitor::ErrorMonitor;

/// Where the orchestrator raises alert events (the launcher points this at
/// the event bus).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise_alert(&self, alert: Event);
}

/// Reloads a component's persisted baseline onto its property bag. The
/// persistence service implements this for the reinitialize strategy.
#[async_trait]
pub trait ComponentRefresher: Send + Sync {
    async fn reload(&self, device_id: &DeviceId) -> Result<(), ResilienceError>;
}

/// One way of getting a faulted device healthy again.
///
/// Strategies are tried in ascending `priority` order; the first to return
/// `true` wins. Each strategy keeps its own per-device attempt budget on
/// top of the orchestrator's global predicate.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> u32;

    fn can_recover(&self, fault: &DeviceFault) -> bool;

    async fn attempt(&self, fault: &DeviceFault) -> Result<bool, ResilienceError>;
}

// ── Per-strategy budget ──────────────────────────────────────────────────────

/// Per-device attempt counting with exponential backoff, shared by the
/// built-in strategies.
struct StrategyBudget {
    max_attempts: u32,
    base_backoff: Duration,
    attempts: Mutex<HashMap<DeviceId, (u32, Instant)>>,
}

impl StrategyBudget {
    fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Whether another attempt is allowed for this device right now.
    fn admit(&self, device_id: &DeviceId) -> bool {
        let attempts = self.attempts.lock().expect("budget lock poisoned");
        match attempts.get(device_id) {
            None => true,
            Some((count, last)) => {
                if *count >= self.max_attempts {
                    return false;
                }
                let backoff = self.base_backoff * 2u32.saturating_pow(count.saturating_sub(1));
                last.elapsed() > backoff
            }
        }
    }

    fn record(&self, device_id: &DeviceId) {
        let mut attempts = self.attempts.lock().expect("budget lock poisoned");
        let entry = attempts.entry(*device_id).or_insert((0, Instant::now()));
        entry.0 += 1;
        entry.1 = Instant::now();
    }

    fn clear(&self, device_id: &DeviceId) {
        self.attempts
            .lock()
            .expect("budget lock poisoned")
            .remove(device_id);
    }
}

const DEFAULT_STRATEGY_ATTEMPTS: u32 = 3;

// ── Built-in strategies ──────────────────────────────────────────────────────

/// Transient communication faults heal by waiting: back off, then report
/// recovered so the caller retries its operation.
pub struct CommunicationBackoffStrategy {
    budget: StrategyBudget,
    wait: Duration,
}

impl CommunicationBackoffStrategy {
    pub fn new(wait: Duration) -> Self {
        Self {
            budget: StrategyBudget::new(DEFAULT_STRATEGY_ATTEMPTS, wait),
            wait,
        }
    }
}

impl Default for CommunicationBackoffStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl RecoveryStrategy for CommunicationBackoffStrategy {
    fn name(&self) -> &'static str {
        "communication-backoff"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn can_recover(&self, fault: &DeviceFault) -> bool {
        fault.source == FaultSource::Communication && fault.transient
    }

    async fn attempt(&self, fault: &DeviceFault) -> Result<bool, ResilienceError> {
        if !self.budget.admit(&fault.device_id) {
            return Ok(false);
        }
        self.budget.record(&fault.device_id);
        debug!(device_id = %fault.device_id, wait = ?self.wait, "communication backoff");
        tokio::time::sleep(self.wait).await;
        self.budget.clear(&fault.device_id);
        Ok(true)
    }
}

/// Stop-then-start of a running device, or a plain start of a ready one.
pub struct DeviceRestartStrategy {
    registry: Arc<DeviceRegistry>,
    budget: StrategyBudget,
}

impl DeviceRestartStrategy {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            budget: StrategyBudget::new(DEFAULT_STRATEGY_ATTEMPTS, Duration::from_secs(1)),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for DeviceRestartStrategy {
    fn name(&self) -> &'static str {
        "device-restart"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn can_recover(&self, fault: &DeviceFault) -> bool {
        matches!(fault.source, FaultSource::Device | FaultSource::Service)
    }

    async fn attempt(&self, fault: &DeviceFault) -> Result<bool, ResilienceError> {
        if !self.budget.admit(&fault.device_id) {
            return Ok(false);
        }
        let Some(device) = self.registry.get(&fault.device_id) else {
            return Ok(false);
        };
        self.budget.record(&fault.device_id);

        let restart = async {
            match device.state() {
                LifecycleState::Running => {
                    device.stop().await?;
                    device.start().await
                }
                LifecycleState::Ready => device.start().await,
                other => {
                    debug!(device_id = %fault.device_id, state = %other, "restart not applicable");
                    return Err(sprig_device::DeviceError::NotReady {
                        device: device.name().to_string(),
                        state: other,
                    });
                }
            }
        };
        match restart.await {
            Ok(()) => {
                info!(device_id = %fault.device_id, "device restarted");
                self.budget.clear(&fault.device_id);
                Ok(true)
            }
            Err(e) => {
                warn!(device_id = %fault.device_id, error = %e, "device restart failed");
                Ok(false)
            }
        }
    }
}

/// Full reinitialize: stop, reload the persisted baseline through the
/// persistence service, then initialize when the device is not already
/// usable. The heavyweight last resort among the built-ins.
pub struct ReinitializeStrategy {
    registry: Arc<DeviceRegistry>,
    refresher: Arc<dyn ComponentRefresher>,
    budget: StrategyBudget,
}

impl ReinitializeStrategy {
    pub fn new(registry: Arc<DeviceRegistry>, refresher: Arc<dyn ComponentRefresher>) -> Self {
        Self {
            registry,
            refresher,
            budget: StrategyBudget::new(DEFAULT_STRATEGY_ATTEMPTS, Duration::from_secs(5)),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for ReinitializeStrategy {
    fn name(&self) -> &'static str {
        "reinitialize"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn can_recover(&self, fault: &DeviceFault) -> bool {
        fault.recoverable
    }

    async fn attempt(&self, fault: &DeviceFault) -> Result<bool, ResilienceError> {
        if !self.budget.admit(&fault.device_id) {
            return Ok(false);
        }
        let Some(device) = self.registry.get(&fault.device_id) else {
            return Ok(false);
        };
        self.budget.record(&fault.device_id);

        if device.state() == LifecycleState::Running {
            if let Err(e) = device.stop().await {
                warn!(device_id = %fault.device_id, error = %e, "stop before reinitialize failed");
            }
        }

        if let Err(e) = self.refresher.reload(&fault.device_id).await {
            warn!(device_id = %fault.device_id, error = %e, "baseline reload failed");
            return Ok(false);
        }

        match device.state() {
            LifecycleState::Created | LifecycleState::Error => match device.initialize().await {
                Ok(()) => {
                    info!(device_id = %fault.device_id, "device reinitialized");
                    self.budget.clear(&fault.device_id);
                    Ok(true)
                }
                Err(e) => {
                    warn!(device_id = %fault.device_id, error = %e, "reinitialize failed");
                    Ok(false)
                }
            },
            _ => {
                info!(device_id = %fault.device_id, "baseline reloaded");
                self.budget.clear(&fault.device_id);
                Ok(true)
            }
        }
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

/// Runs the applicable strategies for a fault in priority order, with a
/// per-device in-flight guard and the monitor's global attempt accounting.
///
/// When a device exhausts its recovery budget a critical alert event is
/// raised through the configured [`AlertSink`].
pub struct RecoveryOrchestrator {
    monitor: Arc<ErrorMonitor>,
    strategies: Mutex<Vec<Arc<dyn RecoveryStrategy>>>,
    in_flight: Arc<Mutex<HashSet<DeviceId>>>,
    alert_sink: Mutex<Option<Arc<dyn AlertSink>>>,
    sweep_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RecoveryOrchestrator {
    pub fn new(monitor: Arc<ErrorMonitor>) -> Self {
        Self {
            monitor,
            strategies: Mutex::new(Vec::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            alert_sink: Mutex::new(None),
            sweep_task: Mutex::new(None),
        }
    }

    pub fn register_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies
            .lock()
            .expect("strategy lock poisoned")
            .push(strategy);
    }

    pub fn set_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        *self.alert_sink.lock().expect("alert sink lock poisoned") = Some(sink);
    }

    /// Try to recover from `fault`. `false` when the fault is not currently
    /// attemptable, a recovery for the device is already in flight, or every
    /// applicable strategy declined or failed.
    pub async fn attempt(&self, fault: &DeviceFault) -> Result<bool, ResilienceError> {
        // Prefer the monitor's record: it carries up-to-date attempt counts.
        let record = self
            .monitor
            .get(&fault.device_id, &fault.code)
            .await
            .unwrap_or_else(|| fault.clone());

        let max_attempts = self.monitor.config().max_recovery_attempts;
        if !record.can_attempt_recovery(max_attempts, Utc::now()) {
            debug!(
                device_id = %record.device_id,
                code = record.code,
                attempts = record.recovery_attempts,
                "fault not currently attemptable"
            );
            return Ok(false);
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, record.device_id) else {
            debug!(device_id = %record.device_id, "recovery already in flight");
            return Ok(false);
        };

        let mut applicable: Vec<Arc<dyn RecoveryStrategy>> = self
            .strategies
            .lock()
            .expect("strategy lock poisoned")
            .iter()
            .filter(|s| s.can_recover(&record))
            .cloned()
            .collect();
        applicable.sort_by_key(|s| s.priority());

        for strategy in &applicable {
            info!(
                device_id = %record.device_id,
                code = record.code,
                strategy = strategy.name(),
                "attempting recovery"
            );
            match strategy.attempt(&record).await {
                Ok(true) => {
                    self.monitor
                        .register_recovery_attempt(&record.device_id, &record.code, true)
                        .await;
                    info!(
                        device_id = %record.device_id,
                        strategy = strategy.name(),
                        "recovery succeeded"
                    );
                    return Ok(true);
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!(
                        device_id = %record.device_id,
                        strategy = strategy.name(),
                        error = %e,
                        "recovery strategy errored"
                    );
                }
            }
        }

        self.monitor
            .register_recovery_attempt(&record.device_id, &record.code, false)
            .await;
        self.alert_if_exhausted(&record).await;
        Ok(false)
    }

    /// Periodically walk the monitor's active faults and attempt recovery
    /// for each. The per-fault predicate and in-flight guard keep the sweep
    /// from hammering anything.
    pub fn spawn_sweep_loop(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else { break };
                for fault in orchestrator.monitor.active_errors(None).await {
                    if let Err(e) = orchestrator.attempt(&fault).await {
                        warn!(
                            device_id = %fault.device_id,
                            code = fault.code,
                            error = %e,
                            "recovery sweep attempt errored"
                        );
                    }
                }
            }
        });
        let mut slot = self.sweep_task.lock().expect("sweep task lock poisoned");
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    pub fn shutdown(&self) {
        if let Some(task) = self
            .sweep_task
            .lock()
            .expect("sweep task lock poisoned")
            .take()
        {
            task.abort();
        }
    }

    /// Raise a critical alert once the fault can no longer be attempted.
    async fn alert_if_exhausted(&self, record: &DeviceFault) {
        let Some(updated) = self.monitor.get(&record.device_id, &record.code).await else {
            return;
        };
        let max_attempts = self.monitor.config().max_recovery_attempts;
        if updated.recovery_attempts < max_attempts {
            return;
        }
        let sink = self
            .alert_sink
            .lock()
            .expect("alert sink lock poisoned")
            .clone();
        if let Some(sink) = sink {
            let alert = Event::alert(
                record.device_id,
                Severity::Critical,
                format!(
                    "recovery exhausted after {} attempts for '{}'",
                    updated.recovery_attempts, record.code
                ),
                Some(json!({
                    "code": record.code,
                    "correlationId": record.correlation_id.to_string(),
                })),
            );
            sink.raise_alert(alert).await;
        }
    }
}

/// Removes the device from the in-flight set on drop.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<DeviceId>>>,
    device_id: DeviceId,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<DeviceId>>>, device_id: DeviceId) -> Option<Self> {
        let mut guard = set.lock().expect("in-flight lock poisoned");
        if !guard.insert(device_id) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            device_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&self.device_id);
    }
}
