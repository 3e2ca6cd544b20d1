//! Services layer for Turnstile
//!
//! ## Services
//!
//! - **Verification**: entitlement, trial, sync and purchase logic over a
//!   [`SubscriptionStore`](crate::store::SubscriptionStore)
//! - **BillingProvider**: purchase-token checks against the billing provider

pub mod billing_provider;
pub mod verification;

pub use billing_provider::{
    HttpPurchaseValidator, ProviderResponse, ProviderVerdict, PurchaseValidator,
};
pub use verification::{evaluate, TrialStartOutcome, VerificationConfig, VerificationService};
