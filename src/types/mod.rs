//! Shared types: errors, product catalog, and the JSON wire contract

pub mod error;
pub mod products;
pub mod verification;

pub use error::{Result, TurnstileError};
pub use products::{ProductCatalog, DEFAULT_VALID_PRODUCTS};
pub use verification::{
    DeviceTrialInfo, PurchaseVerificationRequest, PurchaseVerificationResponse, SyncRequest,
    SyncResponse, TrialConflictResponse, TrialStartRequest, TrialStartResponse,
    TrialStatusResponse, VerificationResult, VerifyRequest, VerifyResponse, VerifySource,
};
