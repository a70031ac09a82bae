use async_trait::async_trait;
use sprig_domain::Event;

/// Collaborator contract rewriting events on the publish path. The bus
/// always preserves the original `event_id` across a transform.
#[async_trait]
pub trait EventTransformer: Send + Sync {
    async fn transform(&self, event: Event) -> Event;
}

/// The default transformer: hands the event back untouched.
pub struct IdentityTransformer;

#[async_trait]
impl EventTransformer for IdentityTransformer {
    async fn transform(&self, event: Event) -> Event {
        event
    }
}
