pub mod bus;
pub mod dispatch;
pub mod error;
pub mod retry;
pub mod subscription;
pub mod transform;

pub use bus::{BusConfig, DispatchFailure, EventBus, PublishResult};
pub use dispatch::{DispatchOutcome, DispatchPool};
pub use error::BusError;
pub use retry::{ExponentialBackoffRetry, RetryDecision, RetryPolicy};
pub use subscription::{EventFilter, EventHandler, HandlerError, Subscription, SubscriptionOptions};
pub use transform::{EventTransformer, IdentityTransformer};
