//! Single-source-of-truth resolver
//!
//! Maps one verification attempt onto `trial | subscribed | blocked | loading`.
//! The mapping is an ordered table of named rules; the first rule that returns
//! a status wins. `loading` means "cannot prove a denial yet" and must win
//! over `blocked` whenever the evidence is incomplete.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{ClientError, VerifyCallError};
use super::local_store::{LocalStateStore, StoreKey};
use super::verifier::VerificationClient;
use crate::types::{ProductCatalog, VerificationResult, VerifySource};

// =============================================================================
// Types
// =============================================================================

/// Canonical entitlement status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SsotStatus {
    Trial,
    Subscribed,
    Blocked,
    Loading,
}

impl fmt::Display for SsotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trial => "trial",
            Self::Subscribed => "subscribed",
            Self::Blocked => "blocked",
            Self::Loading => "loading",
        })
    }
}

/// Everything the resolver can know about one verification
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationAttempt {
    /// No user identity stored
    MissingIdentity,
    /// Identity present but no auth token
    MissingToken,
    /// Network failure, non-2xx, or undecodable response
    Failed(VerifyCallError),
    Completed(VerificationResult),
}

/// Inputs besides the attempt itself
pub struct RuleContext<'a> {
    pub catalog: &'a ProductCatalog,
    /// Fallback clock when the result carries no server time
    pub now: DateTime<Utc>,
}

pub struct Rule {
    pub name: &'static str,
    pub check: fn(&VerificationAttempt, &RuleContext<'_>) -> Option<SsotStatus>,
}

// =============================================================================
// Decision table
// =============================================================================

fn completed(attempt: &VerificationAttempt) -> Option<&VerificationResult> {
    match attempt {
        VerificationAttempt::Completed(result) => Some(result),
        _ => None,
    }
}

fn missing_identity(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    matches!(a, VerificationAttempt::MissingIdentity).then_some(SsotStatus::Blocked)
}

fn missing_token(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    matches!(a, VerificationAttempt::MissingToken).then_some(SsotStatus::Loading)
}

fn call_failed(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    matches!(a, VerificationAttempt::Failed(_)).then_some(SsotStatus::Loading)
}

fn server_sync_failed(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    completed(a)
        .filter(|r| !r.server_sync_succeeded)
        .map(|_| SsotStatus::Loading)
}

fn unsuccessful(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    completed(a).filter(|r| !r.success).map(|_| SsotStatus::Loading)
}

fn cache_sourced(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    completed(a)
        .filter(|r| r.source == VerifySource::Cache)
        .map(|_| SsotStatus::Loading)
}

fn pending_purchase(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    completed(a).filter(|r| r.is_pending).map(|_| SsotStatus::Loading)
}

fn unrecognized_product(a: &VerificationAttempt, ctx: &RuleContext<'_>) -> Option<SsotStatus> {
    let product = completed(a)?.product_id.as_deref()?;
    if product.is_empty() || ctx.catalog.is_valid(product) {
        return None;
    }
    if ctx.catalog.is_legacy(product) {
        debug!(product_id = %product, "Legacy product id; waiting for catalog sync");
    }
    Some(SsotStatus::Loading)
}

fn device_trial_block(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    completed(a)
        .filter(|r| r.device_based_trial_block)
        .map(|_| SsotStatus::Blocked)
}

fn entitlement(a: &VerificationAttempt, ctx: &RuleContext<'_>) -> Option<SsotStatus> {
    let result = completed(a).filter(|r| r.entitlement_active)?;

    let expires = result
        .expires_date
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc));
    let reference = result.server_time.unwrap_or(ctx.now);

    Some(match expires {
        Some(expires) if expires > reference => SsotStatus::Subscribed,
        // active flag without a usable future date is not trusted
        _ => SsotStatus::Blocked,
    })
}

fn trial_active(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    completed(a).filter(|r| r.trial_active).map(|_| SsotStatus::Trial)
}

fn new_user(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    completed(a)
        .filter(|r| !r.has_used_trial && !r.has_purchase_history)
        .map(|_| SsotStatus::Trial)
}

fn lapsed_purchase(a: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    let result = completed(a).filter(|r| r.has_purchase_history && !r.entitlement_active)?;
    match (result.restore_attempted, result.restore_succeeded) {
        (false, _) => Some(SsotStatus::Blocked),
        (true, false) => Some(SsotStatus::Loading),
        (true, true) => None,
    }
}

fn deny(_: &VerificationAttempt, _: &RuleContext<'_>) -> Option<SsotStatus> {
    Some(SsotStatus::Blocked)
}

/// Trust hierarchy, first match wins. Order is load-bearing.
pub const DECISION_TABLE: &[Rule] = &[
    Rule { name: "missing_identity", check: missing_identity },
    Rule { name: "missing_token", check: missing_token },
    Rule { name: "call_failed", check: call_failed },
    Rule { name: "server_sync_failed", check: server_sync_failed },
    Rule { name: "unsuccessful", check: unsuccessful },
    Rule { name: "cache_sourced", check: cache_sourced },
    Rule { name: "pending_purchase", check: pending_purchase },
    Rule { name: "unrecognized_product", check: unrecognized_product },
    Rule { name: "device_trial_block", check: device_trial_block },
    Rule { name: "entitlement", check: entitlement },
    Rule { name: "trial_active", check: trial_active },
    Rule { name: "new_user", check: new_user },
    Rule { name: "lapsed_purchase", check: lapsed_purchase },
    Rule { name: "deny", check: deny },
];

/// Apply the decision table. Returns the status and the rule that fired.
pub fn decide(attempt: &VerificationAttempt, ctx: &RuleContext<'_>) -> (SsotStatus, &'static str) {
    DECISION_TABLE
        .iter()
        .find_map(|rule| (rule.check)(attempt, ctx).map(|status| (status, rule.name)))
        .unwrap_or((SsotStatus::Loading, "none"))
}

// =============================================================================
// Resolver
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    pub catalog: ProductCatalog,
}

pub struct SsotResolver {
    client: Arc<dyn VerificationClient>,
    store: Arc<dyn LocalStateStore>,
    config: ResolverConfig,
}

impl SsotResolver {
    pub fn new(
        client: Arc<dyn VerificationClient>,
        store: Arc<dyn LocalStateStore>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    pub fn catalog(&self) -> &ProductCatalog {
        &self.config.catalog
    }

    /// Gather identity, call the server, and overlay local restore flags
    pub async fn attempt(&self) -> Result<VerificationAttempt, ClientError> {
        let user_id = match self.store.get(StoreKey::UserId).await? {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Ok(VerificationAttempt::MissingIdentity),
        };
        let token = match self.store.get(StoreKey::AuthToken).await? {
            Some(token) if !token.trim().is_empty() => token,
            _ => return Ok(VerificationAttempt::MissingToken),
        };

        let mut result = match self.client.verify(&user_id, &token).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Verification call failed");
                return Ok(VerificationAttempt::Failed(e));
            }
        };

        // The server cannot see device restores
        result.restore_attempted |= self.store.get_flag(StoreKey::RestoreAttempted).await?;
        result.restore_succeeded |= self.store.get_flag(StoreKey::RestoreSucceeded).await?;

        Ok(VerificationAttempt::Completed(result))
    }

    /// Resolve the canonical status, persisting trial bookkeeping on a
    /// decisive answer
    pub async fn resolve(&self) -> Result<SsotStatus, ClientError> {
        let attempt = self.attempt().await?;
        let ctx = RuleContext {
            catalog: &self.config.catalog,
            now: Utc::now(),
        };
        let (status, rule) = decide(&attempt, &ctx);
        debug!(rule, status = %status, "SSOT decision");

        if status != SsotStatus::Loading {
            if let VerificationAttempt::Completed(result) = &attempt {
                self.persist_trial_info(result).await;
            }
        }

        Ok(status)
    }

    async fn persist_trial_info(&self, result: &VerificationResult) {
        let trial_start = match result.trial_started_at {
            Some(at) => self.store.set(StoreKey::TrialStartDate, &at.to_rfc3339()).await,
            None => self.store.remove(StoreKey::TrialStartDate).await,
        };
        let days = self
            .store
            .set(StoreKey::DaysRemaining, &result.days_remaining.to_string())
            .await;

        if let Err(e) = trial_start.and(days) {
            warn!(error = %e, "Failed to persist trial info");
        }
    }
}
