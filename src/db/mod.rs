//! Database layer for Turnstile
//!
//! MongoDB storage for subscription records and their audit trail.

pub mod mongo;
pub mod schemas;

pub use mongo::{is_duplicate_key, MongoClient, MongoCollection};
pub use schemas::{Metadata, StatusEventDoc, SubscriptionDoc};
