use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sprig_domain::Event;
use tokio::sync::Mutex;

use crate::error::StoreError;

/// A dead-lettered event: one whose handler failed and which awaits retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEvent {
    pub event: Event,
    /// Number of dispatch attempts so far, including the original publish.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub first_failed_at: DateTime<Utc>,
}

impl FailedEvent {
    pub fn new(event: Event, error: impl Into<String>) -> Self {
        Self {
            event,
            attempts: 1,
            last_error: Some(error.into()),
            first_failed_at: Utc::now(),
        }
    }
}

/// Durable event sink used by the bus for persist-requested events and for
/// the dead-letter retry loop. Deduplication on `event_id` is not required.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Journal an event whose routing requested persistence.
    async fn persist(&self, event: Event) -> Result<(), StoreError>;

    /// Dead-letter an event whose dispatch failed.
    async fn persist_failed(&self, failed: FailedEvent) -> Result<(), StoreError>;

    /// Pop the next failed event: highest routing priority first, FIFO
    /// within a priority. `None` when the dead-letter queue is empty.
    async fn retrieve_failed(&self) -> Result<Option<FailedEvent>, StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    journal: Vec<Event>,
    failed: Vec<FailedEvent>,
}

/// In-memory [`EventStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events journaled via `persist`. Test and diagnostics accessor.
    pub async fn journaled(&self) -> Vec<Event> {
        self.inner.lock().await.journal.clone()
    }

    pub async fn failed_len(&self) -> usize {
        self.inner.lock().await.failed.len()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn persist(&self, event: Event) -> Result<(), StoreError> {
        self.inner.lock().await.journal.push(event);
        Ok(())
    }

    async fn persist_failed(&self, failed: FailedEvent) -> Result<(), StoreError> {
        self.inner.lock().await.failed.push(failed);
        Ok(())
    }

    async fn retrieve_failed(&self) -> Result<Option<FailedEvent>, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.failed.is_empty() {
            return Ok(None);
        }
        // Highest priority wins; position breaks ties FIFO.
        let best = inner
            .failed
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                a.event
                    .routing
                    .priority
                    .cmp(&b.event.routing.priority)
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i);
        Ok(best.map(|i| inner.failed.remove(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprig_domain::{DeviceId, LifecycleState, Priority, Routing};

    fn event(priority: Priority) -> Event {
        Event::lifecycle(DeviceId::new(), LifecycleState::Ready, None)
            .with_routing(Routing::default().with_priority(priority))
    }

    #[tokio::test]
    async fn fifo_within_priority() {
        let store = MemoryEventStore::new();
        let first = event(Priority::Normal);
        let second = event(Priority::Normal);
        store
            .persist_failed(FailedEvent::new(first.clone(), "boom"))
            .await
            .unwrap();
        store
            .persist_failed(FailedEvent::new(second.clone(), "boom"))
            .await
            .unwrap();

        let got = store.retrieve_failed().await.unwrap().unwrap();
        assert_eq!(got.event.event_id, first.event_id);
    }

    #[tokio::test]
    async fn priority_jumps_the_queue() {
        let store = MemoryEventStore::new();
        let normal = event(Priority::Normal);
        let critical = event(Priority::Critical);
        store
            .persist_failed(FailedEvent::new(normal.clone(), "boom"))
            .await
            .unwrap();
        store
            .persist_failed(FailedEvent::new(critical.clone(), "boom"))
            .await
            .unwrap();

        let got = store.retrieve_failed().await.unwrap().unwrap();
        assert_eq!(got.event.event_id, critical.event_id);
        let got = store.retrieve_failed().await.unwrap().unwrap();
        assert_eq!(got.event.event_id, normal.event_id);
        assert!(store.retrieve_failed().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn journal_is_separate_from_dead_letter() {
        let store = MemoryEventStore::new();
        store.persist(event(Priority::Normal)).await.unwrap();
        assert_eq!(store.journaled().await.len(), 1);
        assert!(store.retrieve_failed().await.unwrap().is_none());
    }
}
