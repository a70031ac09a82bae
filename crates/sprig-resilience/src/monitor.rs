use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sprig_domain::{CorrelationId, DeviceFault, DeviceId, Severity};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Reports for the same `(device, code)` inside this window fold into
    /// one active fault.
    pub dedup_window: Duration,
    /// Global recovery attempt budget per fault.
    pub max_recovery_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(300),
            max_recovery_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveFault {
    fault: DeviceFault,
    occurrences: u32,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    active: HashMap<(DeviceId, String), ActiveFault>,
    acknowledged: HashSet<CorrelationId>,
}

/// Records, classifies and deduplicates faults, and keeps the recovery
/// attempt accounting the orchestrator drives.
///
/// Alert acknowledgement also lives here, keyed by correlation id; alert
/// events themselves stay immutable.
#[derive(Debug, Default)]
pub struct ErrorMonitor {
    config: MonitorConfig,
    inner: RwLock<Inner>,
}

impl ErrorMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Record a fault. A repeat of an active `(device, code)` inside the
    /// dedup window folds into the existing record; outside the window the
    /// record starts over.
    pub async fn report(&self, fault: DeviceFault) {
        match fault.severity {
            Severity::Critical | Severity::Error => error!(
                device_id = %fault.device_id,
                code = fault.code,
                source = %fault.source,
                "{}", fault.message
            ),
            Severity::Warning => warn!(
                device_id = %fault.device_id,
                code = fault.code,
                "{}", fault.message
            ),
            Severity::Info => info!(
                device_id = %fault.device_id,
                code = fault.code,
                "{}", fault.message
            ),
        }

        let now = Utc::now();
        let key = (fault.device_id, fault.code.clone());
        let mut inner = self.inner.write().await;
        match inner.active.get_mut(&key) {
            Some(existing)
                if (now - existing.last_seen).to_std().unwrap_or_default()
                    <= self.config.dedup_window =>
            {
                existing.occurrences += 1;
                existing.last_seen = now;
                existing.fault.message = fault.message;
                existing.fault.timestamp = fault.timestamp;
                // Fresh context wins key-wise; recovery accounting and the
                // original correlation id are kept.
                existing.fault.context.extend(fault.context);
                if fault.exception.is_some() {
                    existing.fault.exception = fault.exception;
                }
                debug!(
                    device_id = %key.0,
                    code = key.1,
                    occurrences = existing.occurrences,
                    "fault deduplicated"
                );
            }
            _ => {
                inner.active.insert(
                    key,
                    ActiveFault {
                        fault,
                        occurrences: 1,
                        last_seen: now,
                    },
                );
            }
        }
    }

    /// Account for a recovery attempt. Success resolves the fault.
    pub async fn register_recovery_attempt(
        &self,
        device_id: &DeviceId,
        code: &str,
        success: bool,
    ) {
        let key = (*device_id, code.to_string());
        let mut inner = self.inner.write().await;
        if success {
            if inner.active.remove(&key).is_some() {
                info!(device_id = %device_id, code, "fault resolved by recovery");
            }
            return;
        }
        if let Some(active) = inner.active.get_mut(&key) {
            active.fault.recovery_attempts += 1;
            active.fault.last_recovery_at = Some(Utc::now());
            debug!(
                device_id = %device_id,
                code,
                attempts = active.fault.recovery_attempts,
                "recovery attempt registered"
            );
        }
    }

    /// Active faults, optionally narrowed to one device.
    pub async fn active_errors(&self, device_id: Option<&DeviceId>) -> Vec<DeviceFault> {
        let inner = self.inner.read().await;
        inner
            .active
            .values()
            .filter(|a| device_id.map_or(true, |id| a.fault.device_id == *id))
            .map(|a| a.fault.clone())
            .collect()
    }

    /// Current record for one `(device, code)`, including its up-to-date
    /// recovery accounting.
    pub async fn get(&self, device_id: &DeviceId, code: &str) -> Option<DeviceFault> {
        let inner = self.inner.read().await;
        inner
            .active
            .get(&(*device_id, code.to_string()))
            .map(|a| a.fault.clone())
    }

    pub async fn occurrences(&self, device_id: &DeviceId, code: &str) -> u32 {
        let inner = self.inner.read().await;
        inner
            .active
            .get(&(*device_id, code.to_string()))
            .map(|a| a.occurrences)
            .unwrap_or(0)
    }

    // ── Alert acknowledgement ────────────────────────────────────────────────

    pub async fn acknowledge(&self, correlation_id: CorrelationId) {
        self.inner.write().await.acknowledged.insert(correlation_id);
    }

    pub async fn is_acknowledged(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.read().await.acknowledged.contains(correlation_id)
    }
}
