use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sprig_domain::{DeviceId, LifecycleState};

/// Short stable fingerprint of a rendered exception chain, so repeated
/// failures with identical traces deduplicate cheaply in the monitor.
pub fn exception_fingerprint(rendered: &str) -> String {
    let digest = Sha256::digest(rendered.as_bytes());
    // 8 bytes of hex is plenty for dedup keys.
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Builds the rich context map attached to reported faults: component
/// identity and state, caller site, elapsed time, exception shape.
#[derive(Debug, Default)]
pub struct FaultContextBuilder {
    context: HashMap<String, Value>,
}

impl FaultContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn component(
        mut self,
        id: DeviceId,
        name: &str,
        state: LifecycleState,
    ) -> Self {
        self.context.insert("componentId".into(), json!(id.to_string()));
        self.context.insert("componentName".into(), json!(name));
        self.context
            .insert("componentState".into(), json!(state.to_string()));
        self
    }

    pub fn call_site(mut self, site: &str) -> Self {
        self.context.insert("callSite".into(), json!(site));
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.context
            .insert("elapsedMs".into(), json!(elapsed.as_millis() as u64));
        self
    }

    /// Record the exception's type name, inner type name when present, and
    /// a trace fingerprint.
    pub fn exception(mut self, error: &(dyn std::error::Error + 'static)) -> Self {
        let type_name = std::any::type_name_of_val(error);
        self.context.insert("exceptionType".into(), json!(type_name));
        if let Some(inner) = error.source() {
            self.context
                .insert("innerType".into(), json!(std::any::type_name_of_val(inner)));
        }
        let rendered = format!("{:#}", DisplayChain(error));
        self.context
            .insert("traceHash".into(), json!(exception_fingerprint(&rendered)));
        self
    }

    pub fn build(self) -> HashMap<String, Value> {
        self.context
    }
}

/// Renders an error with its full source chain.
struct DisplayChain<'a>(&'a (dyn std::error::Error + 'static));

impl std::fmt::Display for DisplayChain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {}", err)?;
            source = err.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = exception_fingerprint("io error: connection refused");
        let b = exception_fingerprint("io error: connection refused");
        let c = exception_fingerprint("io error: timed out");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn builder_collects_component_fields() {
        let id = DeviceId::new();
        let ctx = FaultContextBuilder::new()
            .component(id, "pump-1", LifecycleState::Running)
            .call_site("persist.flush")
            .elapsed(Duration::from_millis(12))
            .build();

        assert_eq!(ctx["componentId"], json!(id.to_string()));
        assert_eq!(ctx["componentName"], json!("pump-1"));
        assert_eq!(ctx["componentState"], json!("running"));
        assert_eq!(ctx["callSite"], json!("persist.flush"));
        assert_eq!(ctx["elapsedMs"], json!(12));
    }

    #[test]
    fn exception_fields_capture_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let ctx = FaultContextBuilder::new().exception(&io).build();
        assert!(ctx.contains_key("exceptionType"));
        assert!(ctx.contains_key("traceHash"));
    }
}
