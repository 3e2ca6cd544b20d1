//! Turnstile - subscription entitlement resolution
//!
//! Two halves that share one wire contract:
//!
//! ## Server
//!
//! - **Verify**: entitlement, trial and purchase-history facts for a user,
//!   derived from stored dates against server time
//! - **Trial**: one free trial per user and per device, started atomically
//! - **Sync**: client-reported status and dates, audited on change
//! - **Purchase verification**: purchase tokens checked with the billing
//!   provider against a product allow-list
//!
//! ## Client
//!
//! - **Resolver**: a single verification result folded through an ordered
//!   decision table
//! - **Coordinator**: debounced, single-flight resolution with purchase and
//!   restore short-circuits, always answering with a usable status

pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod routes;
pub mod server;
pub mod services;
pub mod store;
pub mod types;

pub use config::Args;
pub use server::{run, serve, AppState};
pub use types::{Result, TurnstileError};
