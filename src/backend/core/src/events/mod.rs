//! Event subscriptions and correlation.

pub mod correlation;
pub mod subscription;

pub use correlation::{
    DeliverEventAsyncCommand, DeliverEventCommand, EventCorrelator, EventDelivery, SubscribeCommand,
};
pub use subscription::{EventSubscription, EventType, SubscriptionId};
