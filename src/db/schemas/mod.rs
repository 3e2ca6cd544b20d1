//! MongoDB document schemas
//!
//! Subscription records (one per user) and the status-transition audit trail.

mod metadata;
mod status_event;
mod subscription;

pub use metadata::Metadata;
pub use status_event::{StatusEventDoc, STATUS_EVENT_COLLECTION};
pub use subscription::{SubscriptionDoc, SUBSCRIPTION_COLLECTION};
