use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Severity;
use crate::ids::{CorrelationId, DeviceId};

/// Upper bound on the exponential recovery backoff.
pub const MAX_RECOVERY_BACKOFF: Duration = Duration::from_secs(600);

/// Codes that no recovery strategy may attempt, regardless of the record's
/// `recoverable` flag.
const UNRECOVERABLE_CODES: &[&str] = &["system.out_of_memory", "system.stack_overflow"];

/// Subsystem a fault originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FaultSource {
    Device,
    Service,
    Communication,
    EventSystem,
    Storage,
    Recovery,
    Security,
    #[default]
    Unknown,
}

impl std::fmt::Display for FaultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FaultSource::Device => "device",
            FaultSource::Service => "service",
            FaultSource::Communication => "communication",
            FaultSource::EventSystem => "event_system",
            FaultSource::Storage => "storage",
            FaultSource::Recovery => "recovery",
            FaultSource::Security => "security",
            FaultSource::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A recorded error against a component.
///
/// The error monitor deduplicates these on `(device_id, code)` and the
/// recovery orchestrator drives its attempt accounting through
/// `recovery_attempts` / `last_recovery_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFault {
    pub device_id: DeviceId,
    /// Dotted code; the prefix before the first `.` is the category
    /// (e.g. `communication.timeout` → `communication`).
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub source: FaultSource,
    pub transient: bool,
    pub recoverable: bool,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Rendered exception chain, when the fault wraps one.
    pub exception: Option<String>,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub recovery_attempts: u32,
    pub last_recovery_at: Option<DateTime<Utc>>,
}

impl DeviceFault {
    pub fn new(
        device_id: DeviceId,
        code: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        source: FaultSource,
    ) -> Self {
        Self {
            device_id,
            code: code.into(),
            message: message.into(),
            severity,
            source,
            transient: false,
            recoverable: true,
            context: HashMap::new(),
            exception: None,
            correlation_id: CorrelationId::new(),
            timestamp: Utc::now(),
            recovery_attempts: 0,
            last_recovery_at: None,
        }
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn unrecoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_exception(mut self, rendered: impl Into<String>) -> Self {
        self.exception = Some(rendered.into());
        self
    }

    /// Category derived from the code prefix before the first `.`.
    pub fn category(&self) -> &str {
        self.code.split('.').next().unwrap_or(&self.code)
    }

    /// Exponential backoff before the next recovery attempt:
    /// `min(600s, 2^min(attempts, 9))` seconds.
    pub fn backoff(&self) -> Duration {
        let exp = self.recovery_attempts.min(9);
        MAX_RECOVERY_BACKOFF.min(Duration::from_secs(1u64 << exp))
    }

    /// Whether the code is on the never-recover list.
    pub fn code_is_unrecoverable(&self) -> bool {
        UNRECOVERABLE_CODES.contains(&self.code.as_str())
    }

    /// The global attemptability predicate: recoverable, under the attempt
    /// budget, and past the backoff window since the last attempt.
    pub fn can_attempt_recovery(&self, max_attempts: u32, now: DateTime<Utc>) -> bool {
        if !self.recoverable || self.code_is_unrecoverable() {
            return false;
        }
        if self.recovery_attempts >= max_attempts {
            return false;
        }
        match self.last_recovery_at {
            None => true,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or_default();
                elapsed > self.backoff()
            }
        }
    }
}
