use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sprig_domain::{DeviceFault, DeviceId, FaultSource, Severity};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::monitor::ErrorMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub max_failures: u32,
    /// Time the circuit stays open before a probe call may pass.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close again.
    pub half_open_max_attempts: u32,
    /// Cadence of the registered health probe while open.
    pub health_check_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            reset_timeout: Duration::from_secs(60),
            half_open_max_attempts: 2,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Notification emitted on every state transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub breaker: String,
    pub old_state: CircuitState,
    pub new_state: CircuitState,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub reason: String,
}

/// The fail-fast rejection returned while the circuit is open.
#[derive(Debug, Error)]
#[error("circuit '{breaker}' is open")]
pub struct CircuitOpen {
    pub breaker: String,
}

/// Optional liveness probe, run on a timer only while the circuit is open.
/// A passing probe forces the transition to half-open.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_state_change: Instant,
    last_failure_time: Option<DateTime<Utc>>,
}

type StateListener = Box<dyn Fn(StateChange) + Send + Sync>;

/// Closed/open/half-open circuit breaker protecting one outbound operation.
///
/// Calls never block on an open circuit: they either pass through (closed,
/// or open with the reset timeout elapsed, or half-open under the probe
/// budget) or fail fast with [`CircuitOpen`]. Rejections are reported to the
/// error monitor as `recovery.circuit_open` faults.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    listeners: RwLock<Vec<StateListener>>,
    monitor: Option<Arc<ErrorMonitor>>,
    health_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        monitor: Option<Arc<ErrorMonitor>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_state_change: Instant::now(),
                last_failure_time: None,
            }),
            listeners: RwLock::new(Vec::new()),
            monitor,
            health_task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn last_failure_time(&self) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .last_failure_time
    }

    /// Register a state-change listener.
    pub fn on_state_change(&self, listener: impl Fn(StateChange) + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(Box::new(listener));
    }

    /// Run `op` under the breaker.
    ///
    /// The outer result is the breaker's gate; the inner one is the
    /// operation's own outcome, which is recorded as success or failure.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<Result<T, E>, CircuitOpen>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if let Err(open) = self.try_acquire() {
            self.report_rejection().await;
            return Err(open);
        }

        let result = op().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => {
                debug!(breaker = self.name, error = %e, "protected operation failed");
                self.record_failure();
            }
        }
        Ok(result)
    }

    /// Force the circuit open.
    pub fn trip(&self, reason: &str) {
        let change = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            self.transition_locked(&mut inner, CircuitState::Open, reason)
        };
        self.notify(change);
    }

    /// Force the circuit closed and clear the counters.
    pub fn reset(&self) {
        let change = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            self.transition_locked(&mut inner, CircuitState::Closed, "manual reset")
        };
        self.notify(change);
    }

    /// Register a health probe and start its timer task. The probe only
    /// fires while the circuit is open; a passing check forces half-open.
    pub fn set_health_probe(self: &Arc<Self>, probe: Arc<dyn HealthProbe>) {
        let weak: Weak<CircuitBreaker> = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(breaker) = weak.upgrade() else { break };
                if breaker.state() != CircuitState::Open {
                    continue;
                }
                if probe.check().await {
                    info!(breaker = breaker.name, "health probe passed; moving to half-open");
                    let change = {
                        let mut inner =
                            breaker.inner.lock().expect("breaker lock poisoned");
                        breaker.transition_locked(
                            &mut inner,
                            CircuitState::HalfOpen,
                            "health probe passed",
                        )
                    };
                    breaker.notify(change);
                }
            }
        });
        let mut slot = self.health_task.lock().expect("health task lock poisoned");
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    // ── FSM internals ────────────────────────────────────────────────────────

    fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let change = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            match inner.state {
                CircuitState::Closed => None,
                CircuitState::Open => {
                    if inner.last_state_change.elapsed() > self.config.reset_timeout {
                        Some(self.transition_locked(
                            &mut inner,
                            CircuitState::HalfOpen,
                            "reset timeout elapsed",
                        ))
                    } else {
                        return Err(CircuitOpen {
                            breaker: self.name.clone(),
                        });
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.successes >= self.config.half_open_max_attempts {
                        return Err(CircuitOpen {
                            breaker: self.name.clone(),
                        });
                    }
                    None
                }
            }
        };
        self.notify(change.flatten());
        Ok(())
    }

    fn record_success(&self) {
        let change = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            match inner.state {
                CircuitState::Closed => {
                    inner.failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= self.config.half_open_max_attempts {
                        Some(self.transition_locked(
                            &mut inner,
                            CircuitState::Closed,
                            "half-open probes succeeded",
                        ))
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.notify(change.flatten());
    }

    fn record_failure(&self) {
        let change = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            inner.last_failure_time = Some(Utc::now());
            match inner.state {
                CircuitState::Closed => {
                    inner.failures += 1;
                    if inner.failures >= self.config.max_failures {
                        Some(self.transition_locked(
                            &mut inner,
                            CircuitState::Open,
                            "failure threshold reached",
                        ))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => Some(self.transition_locked(
                    &mut inner,
                    CircuitState::Open,
                    "half-open probe failed",
                )),
                CircuitState::Open => None,
            }
        };
        self.notify(change.flatten());
    }

    /// Apply a transition and reset the counters the target state requires.
    fn transition_locked(
        &self,
        inner: &mut Inner,
        new_state: CircuitState,
        reason: &str,
    ) -> Option<StateChange> {
        if inner.state == new_state {
            return None;
        }
        let old_state = inner.state;
        inner.state = new_state;
        inner.last_state_change = Instant::now();
        match new_state {
            CircuitState::Closed => {
                inner.failures = 0;
                inner.successes = 0;
            }
            CircuitState::HalfOpen => {
                inner.successes = 0;
            }
            CircuitState::Open => {}
        }
        warn!(
            breaker = self.name,
            old_state = %old_state,
            new_state = %new_state,
            reason,
            "circuit state change"
        );
        Some(StateChange {
            breaker: self.name.clone(),
            old_state,
            new_state,
            last_failure_time: inner.last_failure_time,
            reason: reason.to_string(),
        })
    }

    fn notify(&self, change: Option<StateChange>) {
        if let Some(change) = change {
            for listener in self.listeners.read().expect("listener lock poisoned").iter() {
                listener(change.clone());
            }
        }
    }

    async fn report_rejection(&self) {
        if let Some(monitor) = &self.monitor {
            let fault = DeviceFault::new(
                DeviceId::SYSTEM,
                "recovery.circuit_open",
                format!("circuit '{}' rejected a call while open", self.name),
                Severity::Warning,
                FaultSource::Recovery,
            )
            .transient();
            monitor.report(fault).await;
        }
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> BreakerConfig {
        BreakerConfig {
            max_failures: 3,
            reset_timeout: Duration::from_millis(100),
            half_open_max_attempts: 2,
            health_check_interval: Duration::from_millis(20),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<Result<(), String>, CircuitOpen> {
        breaker.execute(|| async { Err::<(), _>("boom".to_string()) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<Result<(), String>, CircuitOpen> {
        breaker.execute(|| async { Ok::<_, String>(()) }).await
    }

    #[tokio::test]
    async fn opens_after_max_failures() {
        let breaker = CircuitBreaker::new("store", config(), None);
        for _ in 0..3 {
            assert!(fail(&breaker).await.is_ok());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        // The very next call fails fast without running the operation.
        let ran = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_resets_closed_failure_count() {
        let breaker = CircuitBreaker::new("store", config(), None);
        fail(&breaker).await.unwrap();
        fail(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap().unwrap();
        fail(&breaker).await.unwrap();
        fail(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_timeout_permits_half_open_probe() {
        let breaker = CircuitBreaker::new("store", config(), None);
        for _ in 0..3 {
            fail(&breaker).await.unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        succeed(&breaker).await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("store", config(), None);
        for _ in 0..3 {
            fail(&breaker).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        fail(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn manual_trip_and_reset() {
        let breaker = CircuitBreaker::new("store", config(), None);
        breaker.trip("maintenance");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(succeed(&breaker).await.is_err());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn listeners_see_transitions() {
        let breaker = CircuitBreaker::new("store", config(), None);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        breaker.on_state_change(move |c| sink.lock().unwrap().push(c));

        for _ in 0..3 {
            fail(&breaker).await.unwrap();
        }
        let seen = changes.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].old_state, CircuitState::Closed);
        assert_eq!(seen[0].new_state, CircuitState::Open);
        assert!(seen[0].last_failure_time.is_some());
        assert_eq!(seen[0].reason, "failure threshold reached");
    }

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn check(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn health_probe_forces_half_open() {
        let breaker = Arc::new(CircuitBreaker::new("store", config(), None));
        breaker.set_health_probe(Arc::new(AlwaysHealthy));
        breaker.trip("test");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn rejection_reports_to_monitor() {
        let monitor = Arc::new(ErrorMonitor::default());
        let breaker = CircuitBreaker::new("store", config(), Some(monitor.clone()));
        breaker.trip("test");
        let _ = succeed(&breaker).await;

        let faults = monitor.active_errors(Some(&DeviceId::SYSTEM)).await;
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].code, "recovery.circuit_open");
        assert_eq!(faults[0].source, FaultSource::Recovery);
    }
}
