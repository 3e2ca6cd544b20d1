//! Client-side resolution
//!
//! - **Resolver**: one verification call folded through an ordered decision
//!   table into `trial`, `subscribed`, `blocked` or `loading`
//! - **Coordinator**: debounce, single in-flight resolution, purchase
//!   short-circuit and restore-then-verify on top of the resolver
//! - **Local store**: the small key/value state both of them persist

pub mod coordinator;
pub mod error;
pub mod local_store;
pub mod resolver;
pub mod restore;
pub mod verifier;

pub use coordinator::{CoordinatorConfig, ResolveOptions, SubscriptionCoordinator, UiStatus};
pub use error::{ClientError, LocalStoreError, RestoreError, VerifyCallError};
pub use local_store::{InMemoryStateStore, JsonFileStateStore, LocalStateStore, StoreKey};
pub use resolver::{
    decide, ResolverConfig, Rule, RuleContext, SsotResolver, SsotStatus, VerificationAttempt,
    DECISION_TABLE,
};
pub use restore::{has_active_purchase, PurchaseRecord, RestoreAdapter};
pub use verifier::{HttpVerificationClient, TrialStartReply, VerificationClient};
