use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as SyncRwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sprig_domain::{DeviceFault, DeviceId, Event, FaultSource, Severity, SubscriptionId};
use sprig_resilience::{AlertSink, ErrorMonitor};
use sprig_store::{EventStore, FailedEvent};
use sprig_topology::TopologyService;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchOutcome, DispatchPool};
use crate::error::BusError;
use crate::retry::{ExponentialBackoffRetry, RetryDecision, RetryPolicy};
use crate::subscription::{self, EventHandler, HandlerError, Subscription, SubscriptionOptions};
use crate::transform::{EventTransformer, IdentityTransformer};

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Worker count of the asynchronous dispatch pool. With 1, async
    /// handlers observe publish order.
    pub dispatch_concurrency: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dispatch_concurrency: 4,
        }
    }
}

/// One handler's failure inside a [`PublishResult`].
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub subscription_id: SubscriptionId,
    pub outcome: DispatchOutcome,
}

/// What one publish did.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub event_id: uuid::Uuid,
    /// Subscriptions the event matched.
    pub handler_count: usize,
    pub success_count: usize,
    /// Set when `routing.timeout` elapsed before every async handler
    /// completed.
    pub timed_out: bool,
    pub errors: Vec<DispatchFailure>,
}

impl PublishResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// The event bus: filtered subscription, topology-aware fan-out, priority
/// dispatch, dead-letter and retry.
pub struct EventBus {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    sub_seq: AtomicU64,
    topology: RwLock<Option<Arc<TopologyService>>>,
    event_store: Arc<dyn EventStore>,
    monitor: Option<Arc<ErrorMonitor>>,
    transformer: SyncRwLock<Arc<dyn EventTransformer>>,
    retry_policy: SyncRwLock<Arc<dyn RetryPolicy>>,
    pool: DispatchPool,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(
        event_store: Arc<dyn EventStore>,
        monitor: Option<Arc<ErrorMonitor>>,
        config: BusConfig,
    ) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            sub_seq: AtomicU64::new(0),
            topology: RwLock::new(None),
            event_store,
            monitor,
            transformer: SyncRwLock::new(Arc::new(IdentityTransformer)),
            retry_policy: SyncRwLock::new(Arc::new(ExponentialBackoffRetry::default())),
            pool: DispatchPool::new(config.dispatch_concurrency),
            retry_task: Mutex::new(None),
        }
    }

    /// Wire the topology service used for `include_connected_sources`
    /// fan-out.
    pub async fn set_topology(&self, topology: Arc<TopologyService>) {
        *self.topology.write().await = Some(topology);
    }

    pub fn set_transformer(&self, transformer: Arc<dyn EventTransformer>) {
        *self.transformer.write().expect("transformer lock poisoned") = transformer;
    }

    pub fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        *self.retry_policy.write().expect("retry policy lock poisoned") = policy;
    }

    pub async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let subscription = Arc::new(Subscription {
            id,
            handler,
            options,
            seq: self.sub_seq.fetch_add(1, Ordering::SeqCst),
        });
        self.subscriptions.write().await.push(subscription);
        debug!(subscription_id = %id, "subscribed");
        id
    }

    /// `false` when the id was not subscribed.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Publish an event: transform, persist when requested, select matching
    /// subscriptions, dispatch, and dead-letter on handler failure.
    pub async fn publish(&self, event: Event) -> Result<PublishResult, BusError> {
        self.publish_inner(event, None).await
    }

    async fn publish_inner(
        &self,
        event: Event,
        prior: Option<&FailedEvent>,
    ) -> Result<PublishResult, BusError> {
        // 1. Transform; the envelope keeps its identity across a rewrite.
        let original_id = event.event_id;
        let transformer = self
            .transformer
            .read()
            .expect("transformer lock poisoned")
            .clone();
        let mut event = transformer.transform(event).await;
        event.event_id = original_id;

        // 2. Persist-if-requested, ahead of dispatch.
        if event.routing.persist {
            self.event_store.persist(event.clone()).await?;
        }

        // 3. Select subscribers, in registration order.
        let mut subs: Vec<Arc<Subscription>> = {
            let guard = self.subscriptions.read().await;
            guard.clone()
        };
        subs.sort_by_key(|s| s.seq);

        let wants_topology = subs
            .iter()
            .any(|s| s.options.include_connected_sources && !s.options.source_ids.is_empty());
        let connected_targets: HashSet<DeviceId> = if wants_topology {
            match self.topology.read().await.as_ref() {
                Some(topology) => topology
                    .connections_from(&event.source_id)
                    .await
                    .into_iter()
                    .map(|c| c.target_id)
                    .collect(),
                None => HashSet::new(),
            }
        } else {
            HashSet::new()
        };

        let matched: Vec<Arc<Subscription>> = subs
            .into_iter()
            .filter(|s| subscription::matches(&s.options, &event, &connected_targets))
            .collect();

        let mut result = PublishResult {
            event_id: original_id,
            handler_count: matched.len(),
            success_count: 0,
            timed_out: false,
            errors: Vec::new(),
        };

        // 4. Dispatch: async handlers enter the pool first, synchronous ones
        // run inline in registration order, then the pool results are
        // collected under the routing timeout.
        let mut pending = Vec::new();
        for sub in matched.iter().filter(|s| !s.options.synchronous) {
            let rx = self
                .pool
                .submit(event.clone(), sub.handler.clone(), event.routing.priority);
            pending.push((sub.id, rx));
        }

        for sub in matched.iter().filter(|s| s.options.synchronous) {
            let outcome = match sub.handler.handle(&event).await {
                Ok(()) => DispatchOutcome::Ok,
                Err(HandlerError::CircuitOpen(_)) => DispatchOutcome::CircuitOpen,
                Err(HandlerError::Failed(message)) => DispatchOutcome::HandlerFailed(message),
            };
            tally(&mut result, sub.id, outcome);
        }

        let deadline = event
            .routing
            .timeout
            .map(|t| tokio::time::Instant::now() + t);
        for (sub_id, rx) in pending {
            let outcome = match deadline {
                None => rx
                    .await
                    .unwrap_or_else(|_| DispatchOutcome::HandlerFailed("dispatch dropped".into())),
                Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => DispatchOutcome::HandlerFailed("dispatch dropped".into()),
                    Err(_) => {
                        result.timed_out = true;
                        DispatchOutcome::Timeout
                    }
                },
            };
            tally(&mut result, sub_id, outcome);
        }

        // 5. Handler failures dead-letter the event and reach the monitor;
        // they never fail the publish itself.
        if result.has_errors() {
            self.report_dispatch_failures(&event, &result).await;

            let summary = result
                .errors
                .iter()
                .map(|f| match &f.outcome {
                    DispatchOutcome::HandlerFailed(m) => m.clone(),
                    DispatchOutcome::CircuitOpen => "circuit open".to_string(),
                    other => format!("{:?}", other),
                })
                .collect::<Vec<_>>()
                .join("; ");

            let failed = match prior {
                Some(p) => FailedEvent {
                    event: event.clone(),
                    attempts: p.attempts + 1,
                    last_error: Some(summary),
                    first_failed_at: p.first_failed_at,
                },
                None => FailedEvent::new(event.clone(), summary),
            };
            if let Err(e) = self.event_store.persist_failed(failed).await {
                warn!(event_id = %original_id, error = %e, "dead-letter persist failed");
            }
        }

        debug!(
            event_id = %original_id,
            kind = ?event.kind(),
            handlers = result.handler_count,
            succeeded = result.success_count,
            failed = result.errors.len(),
            timed_out = result.timed_out,
            "published"
        );
        Ok(result)
    }

    /// One sweep of the dead-letter queue: take a failed event and retry,
    /// requeue or abandon it per the retry policy. `false` when the queue
    /// was empty.
    pub async fn process_failed_events(&self) -> Result<bool, BusError> {
        let Some(failed) = self.event_store.retrieve_failed().await? else {
            return Ok(false);
        };
        let policy = self
            .retry_policy
            .read()
            .expect("retry policy lock poisoned")
            .clone();

        match policy.decide(&failed).await {
            RetryDecision::Abandon => {
                warn!(
                    event_id = %failed.event.event_id,
                    attempts = failed.attempts,
                    "abandoning dead-lettered event"
                );
            }
            RetryDecision::Requeue => {
                self.event_store.persist_failed(failed).await?;
            }
            RetryDecision::Retry => {
                info!(
                    event_id = %failed.event.event_id,
                    attempt = failed.attempts + 1,
                    "republishing dead-lettered event"
                );
                self.publish_inner(failed.event.clone(), Some(&failed)).await?;
            }
        }
        Ok(true)
    }

    /// Start the background failed-event loop.
    pub fn spawn_retry_loop(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(bus) = weak.upgrade() else { break };
                if let Err(e) = bus.process_failed_events().await {
                    warn!(error = %e, "failed-event sweep errored");
                }
            }
        });
        let mut slot = self.retry_task.lock().expect("retry task lock poisoned");
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Stop the retry loop and the dispatch pool.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .retry_task
            .lock()
            .expect("retry task lock poisoned")
            .take()
        {
            task.abort();
        }
        self.pool.shutdown();
    }

    async fn report_dispatch_failures(&self, event: &Event, result: &PublishResult) {
        let Some(monitor) = &self.monitor else { return };
        let fault = DeviceFault::new(
            event.device_id,
            "event.dispatch_failed",
            format!(
                "{} of {} handlers failed for {:?} event",
                result.errors.len(),
                result.handler_count,
                event.kind()
            ),
            Severity::Error,
            FaultSource::EventSystem,
        )
        .transient()
        .with_context("eventId", json!(event.event_id.to_string()))
        .with_context(
            "subscriptionIds",
            json!(result
                .errors
                .iter()
                .map(|f| f.subscription_id.to_string())
                .collect::<Vec<_>>()),
        )
        .with_context("callSite", json!("bus.publish"));
        monitor.report(fault).await;
    }
}

#[async_trait]
impl AlertSink for EventBus {
    async fn raise_alert(&self, alert: Event) {
        if let Err(e) = self.publish(alert).await {
            warn!(error = %e, "alert publish failed");
        }
    }
}

fn tally(result: &mut PublishResult, subscription_id: SubscriptionId, outcome: DispatchOutcome) {
    if outcome.is_ok() {
        result.success_count += 1;
    } else if outcome.is_failure() {
        result.errors.push(DispatchFailure {
            subscription_id,
            outcome,
        });
    }
    // Timeout only flips `timed_out`, which the caller already did.
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprig_domain::{EventKind, LifecycleState, Routing};
    use sprig_store::MemoryEventStore;
    use tokio::sync::Mutex as AsyncMutex;

    struct Recording {
        events: AsyncMutex<Vec<Event>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EventHandler for Recording {
        async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    struct FailingOnce {
        failures_left: AsyncMutex<u32>,
    }

    #[async_trait]
    impl EventHandler for FailingOnce {
        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            let mut left = self.failures_left.lock().await;
            if *left > 0 {
                *left -= 1;
                return Err("first attempt fails".into());
            }
            Ok(())
        }
    }

    fn bus() -> (Arc<EventBus>, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new());
        (
            Arc::new(EventBus::new(store.clone(), None, BusConfig::default())),
            store,
        )
    }

    fn event(source: DeviceId) -> Event {
        Event::lifecycle(source, LifecycleState::Ready, None)
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscription_exactly_once() {
        let (bus, _) = bus();
        let handler = Recording::new();
        bus.subscribe(
            handler.clone(),
            SubscriptionOptions::for_kinds([EventKind::Lifecycle]),
        )
        .await;

        let result = bus.publish(event(DeviceId::new())).await.unwrap();
        assert_eq!(result.handler_count, 1);
        assert_eq!(result.success_count, 1);
        assert!(!result.has_errors());
        assert_eq!(handler.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn non_matching_kind_is_skipped() {
        let (bus, _) = bus();
        let handler = Recording::new();
        bus.subscribe(
            handler.clone(),
            SubscriptionOptions::for_kinds([EventKind::Alert]),
        )
        .await;

        let result = bus.publish(event(DeviceId::new())).await.unwrap();
        assert_eq!(result.handler_count, 0);
        assert!(handler.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (bus, _) = bus();
        let handler = Recording::new();
        let id = bus
            .subscribe(handler.clone(), SubscriptionOptions::default())
            .await;

        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);

        let result = bus.publish(event(DeviceId::new())).await.unwrap();
        assert_eq!(result.handler_count, 0);
    }

    #[tokio::test]
    async fn persist_requested_events_are_journaled() {
        let (bus, store) = bus();
        let ev = event(DeviceId::new()).with_routing(Routing::default().persisted());
        bus.publish(ev.clone()).await.unwrap();

        let journal = store.journaled().await;
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].event_id, ev.event_id);
    }

    #[tokio::test]
    async fn handler_failure_dead_letters_and_keeps_others_running() {
        let (bus, store) = bus();
        let good = Recording::new();
        bus.subscribe(
            Arc::new(FailingOnce {
                failures_left: AsyncMutex::new(1),
            }),
            SubscriptionOptions::default(),
        )
        .await;
        bus.subscribe(good.clone(), SubscriptionOptions::default())
            .await;

        let result = bus.publish(event(DeviceId::new())).await.unwrap();
        assert_eq!(result.handler_count, 2);
        assert_eq!(result.success_count, 1);
        assert!(result.has_errors());
        assert_eq!(good.events.lock().await.len(), 1);
        assert_eq!(store.failed_len().await, 1);
    }

    #[tokio::test]
    async fn transformer_preserves_event_id() {
        struct Renaming;

        #[async_trait]
        impl EventTransformer for Renaming {
            async fn transform(&self, mut event: Event) -> Event {
                event.event_id = uuid::Uuid::new_v4();
                event.payload = sprig_domain::EventPayload::System {
                    message: "rewritten".into(),
                };
                event
            }
        }

        let (bus, _) = bus();
        bus.set_transformer(Arc::new(Renaming));
        let handler = Recording::new();
        bus.subscribe(handler.clone(), SubscriptionOptions::default())
            .await;

        let ev = event(DeviceId::new());
        let original = ev.event_id;
        let result = bus.publish(ev).await.unwrap();

        assert_eq!(result.event_id, original);
        let seen = handler.events.lock().await;
        assert_eq!(seen[0].event_id, original);
        assert_eq!(seen[0].kind(), EventKind::System);
    }

    #[tokio::test]
    async fn synchronous_handlers_observe_publish_order() {
        let (bus, _) = bus();
        let handler = Recording::new();
        bus.subscribe(
            handler.clone(),
            SubscriptionOptions::default().synchronous(),
        )
        .await;

        let source = DeviceId::new();
        for state in [
            LifecycleState::Initializing,
            LifecycleState::Ready,
            LifecycleState::Running,
        ] {
            bus.publish(Event::lifecycle(source, state, None))
                .await
                .unwrap();
        }

        let seen = handler.events.lock().await;
        let states: Vec<_> = seen
            .iter()
            .map(|e| match &e.payload {
                sprig_domain::EventPayload::Lifecycle { new_state, .. } => *new_state,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            states,
            vec![
                LifecycleState::Initializing,
                LifecycleState::Ready,
                LifecycleState::Running
            ]
        );
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        struct Slow;

        #[async_trait]
        impl EventHandler for Slow {
            async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            }
        }

        let (bus, _) = bus();
        bus.subscribe(Arc::new(Slow), SubscriptionOptions::default())
            .await;

        let ev = event(DeviceId::new())
            .with_routing(Routing::default().with_timeout(Duration::from_millis(20)));
        let result = bus.publish(ev).await.unwrap();
        assert!(result.timed_out);
        assert_eq!(result.success_count, 0);
        // A timeout alone is not a handler failure.
        assert!(!result.has_errors());
    }

    #[tokio::test]
    async fn routed_target_reaches_target_subscription() {
        let (bus, _) = bus();
        let target = DeviceId::new();
        let handler = Recording::new();
        bus.subscribe(
            handler.clone(),
            SubscriptionOptions::default().for_sources([target]),
        )
        .await;

        let ev = event(DeviceId::new()).with_routing(Routing::targeted([target]));
        let result = bus.publish(ev).await.unwrap();
        assert_eq!(result.success_count, 1);
    }

    #[tokio::test]
    async fn failed_event_is_retried_by_sweep() {
        let (bus, store) = bus();
        bus.set_retry_policy(Arc::new(ExponentialBackoffRetry {
            max_attempts: 5,
            base: Duration::from_millis(0),
        }));
        let handler = Arc::new(FailingOnce {
            failures_left: AsyncMutex::new(1),
        });
        bus.subscribe(handler, SubscriptionOptions::default()).await;

        let result = bus.publish(event(DeviceId::new())).await.unwrap();
        assert!(result.has_errors());
        assert_eq!(store.failed_len().await, 1);

        // The sweep republishes; the handler now succeeds.
        assert!(bus.process_failed_events().await.unwrap());
        assert_eq!(store.failed_len().await, 0);

        // Nothing left to sweep.
        assert!(!bus.process_failed_events().await.unwrap());
    }
}
