use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sprig_domain::{DeviceId, Event, EventKind, SubscriptionId};
use thiserror::Error;

/// A handler's failure. `CircuitOpen` lets handlers that guard their work
/// with a breaker surface the rejection distinctly in the publish result.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("circuit '{0}' is open")]
    CircuitOpen(String),
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError::Failed(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError::Failed(s.to_string())
    }
}

/// A subscribed event consumer.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// What a subscription wants to receive.
///
/// Empty `event_kinds` or `source_ids` mean "any". With
/// `include_connected_sources`, events from components topology-connected
/// to a subscribed source (with a passing condition) match as well.
#[derive(Clone, Default)]
pub struct SubscriptionOptions {
    pub event_kinds: HashSet<EventKind>,
    pub source_ids: HashSet<DeviceId>,
    pub filter: Option<EventFilter>,
    pub include_connected_sources: bool,
    /// Invoked inline on the publish path, completing before publish
    /// returns, in registration order.
    pub synchronous: bool,
}

impl SubscriptionOptions {
    pub fn for_kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            event_kinds: kinds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn for_sources(mut self, sources: impl IntoIterator<Item = DeviceId>) -> Self {
        self.source_ids = sources.into_iter().collect();
        self
    }

    pub fn with_filter(mut self, filter: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn connected(mut self) -> Self {
        self.include_connected_sources = true;
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }
}

/// A registered subscription. `seq` fixes registration order for inline
/// dispatch.
pub struct Subscription {
    pub id: SubscriptionId,
    pub handler: Arc<dyn EventHandler>,
    pub options: SubscriptionOptions,
    pub(crate) seq: u64,
}

/// The matching predicate.
///
/// An event matches iff its kind is selected, its source clause holds
/// (any-source, direct source, routed target, or connected source), and the
/// filter passes. `connected_targets` holds the targets of enabled, passing
/// connections leaving the event's source, already resolved by the bus.
pub(crate) fn matches(
    options: &SubscriptionOptions,
    event: &Event,
    connected_targets: &HashSet<DeviceId>,
) -> bool {
    if !options.event_kinds.is_empty() && !options.event_kinds.contains(&event.kind()) {
        return false;
    }

    let source_ok = options.source_ids.is_empty()
        || options.source_ids.contains(&event.source_id)
        || event
            .routing
            .target_ids
            .iter()
            .any(|t| options.source_ids.contains(t))
        || (options.include_connected_sources
            && connected_targets
                .iter()
                .any(|t| options.source_ids.contains(t)));
    if !source_ok {
        return false;
    }

    options.filter.as_ref().map_or(true, |f| f(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprig_domain::{LifecycleState, Routing, Severity};

    fn lifecycle_event(source: DeviceId) -> Event {
        Event::lifecycle(source, LifecycleState::Ready, None)
    }

    #[test]
    fn empty_options_match_anything() {
        let options = SubscriptionOptions::default();
        let event = lifecycle_event(DeviceId::new());
        assert!(matches(&options, &event, &HashSet::new()));
    }

    #[test]
    fn kind_filter_applies() {
        let options = SubscriptionOptions::for_kinds([EventKind::Alert]);
        let event = lifecycle_event(DeviceId::new());
        assert!(!matches(&options, &event, &HashSet::new()));

        let alert = Event::alert(DeviceId::new(), Severity::Info, "x", None);
        assert!(matches(&options, &alert, &HashSet::new()));
    }

    #[test]
    fn source_filter_applies() {
        let wanted = DeviceId::new();
        let options = SubscriptionOptions::default().for_sources([wanted]);

        assert!(matches(&options, &lifecycle_event(wanted), &HashSet::new()));
        assert!(!matches(
            &options,
            &lifecycle_event(DeviceId::new()),
            &HashSet::new()
        ));
    }

    #[test]
    fn routing_target_intersection_matches() {
        let subscriber = DeviceId::new();
        let options = SubscriptionOptions::default().for_sources([subscriber]);

        let event = lifecycle_event(DeviceId::new())
            .with_routing(Routing::targeted([subscriber]));
        assert!(matches(&options, &event, &HashSet::new()));
    }

    #[test]
    fn connected_sources_require_opt_in() {
        let subscriber = DeviceId::new();
        let source = DeviceId::new();
        let connected: HashSet<DeviceId> = [subscriber].into();

        let plain = SubscriptionOptions::default().for_sources([subscriber]);
        assert!(!matches(&plain, &lifecycle_event(source), &connected));

        let opted = SubscriptionOptions::default()
            .for_sources([subscriber])
            .connected();
        assert!(matches(&opted, &lifecycle_event(source), &connected));
    }

    #[test]
    fn filter_is_the_final_gate() {
        let options = SubscriptionOptions::default().with_filter(|e| {
            matches!(e.payload, sprig_domain::EventPayload::Lifecycle { new_state, .. }
                if new_state == LifecycleState::Running)
        });

        let ready = lifecycle_event(DeviceId::new());
        assert!(!matches(&options, &ready, &HashSet::new()));

        let running = Event::lifecycle(DeviceId::new(), LifecycleState::Running, None);
        assert!(matches(&options, &running, &HashSet::new()));
    }
}
