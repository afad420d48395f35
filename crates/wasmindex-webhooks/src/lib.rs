//! wasmindex-webhooks — subscription matching, enqueue, and delivery.
//!
//! The ingestion driver calls [`WebhookDispatcher::enqueue`] during each
//! flush; the process hosting the pipeline drains the queue with
//! [`WebhookDeliverer::drain`].

pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod soketi;
pub mod subscription;

pub use delivery::{DrainStats, WebhookDeliverer};
pub use dispatcher::WebhookDispatcher;
pub use error::WebhookError;
pub use retry::{RetryConfig, RetryPolicy};
pub use soketi::SoketiClient;
pub use subscription::{
    subscriptions_from_config, ConfigSubscription, PreviousValue, Subscription,
};
