//! Subscription verification service
//!
//! Computes entitlement and trial state from the stored record and server
//! time. A client-asserted status label is never an input to entitlement.
//!
//! ## Operations
//!
//! - `verify`: full [`VerificationResult`] for a user
//! - `start_trial`: set-once trial start, refused on device reuse
//! - `trial_status`: trial eligibility for a user/device pair
//! - `sync`: audit-only status snapshot pushed by the client
//! - `verify_purchase`: billing-provider token check; only an active verdict writes

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::services::billing_provider::{ProviderVerdict, PurchaseValidator};
use crate::store::{
    DateWrite, RecordStatus, RecordUpdate, StatusEvent, SubscriptionRecord, SubscriptionStore,
    TrialStart,
};
use crate::types::{
    DeviceTrialInfo, ProductCatalog, PurchaseVerificationRequest, PurchaseVerificationResponse,
    Result, SyncRequest, SyncResponse, TrialStatusResponse, TurnstileError, VerificationResult,
    VerifySource,
};

const SECONDS_PER_DAY: i64 = 86_400;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub trial_days: i64,
    pub catalog: ProductCatalog,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            trial_days: 7,
            catalog: ProductCatalog::default(),
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of a trial-start request
#[derive(Debug, Clone, PartialEq)]
pub enum TrialStartOutcome {
    Started { trial_started_at: DateTime<Utc> },
    /// This user already consumed a trial
    AlreadyUsed { trial_started_at: DateTime<Utc> },
    /// Another identity already consumed a trial on this device
    DeviceTrialUsed { trial_started_at: DateTime<Utc> },
}

// ============================================================================
// Evaluation
// ============================================================================

/// Derive the verification result for a record at `now`.
///
/// `device_trial` is the trial start of another identity on the same device.
pub fn evaluate(
    record: Option<&SubscriptionRecord>,
    device_trial: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    trial_days: i64,
) -> VerificationResult {
    let mut result = VerificationResult {
        server_time: Some(now),
        source: VerifySource::Server,
        ..Default::default()
    };

    if let Some(record) = record {
        let entitled = !record.force_expired
            && record.subscription_expires_at.is_some_and(|expires| expires > now);

        let trial_end = record
            .trial_started_at
            .map(|started| started + Duration::days(trial_days));
        let trial_active = !entitled
            && !record.force_expired
            && record.status == RecordStatus::Trial
            && trial_end.is_some_and(|end| now < end);

        result.entitlement_active = entitled;
        result.expires_date = record.subscription_expires_at.map(|d| d.to_rfc3339());
        result.product_id = record.product_id.clone();
        result.is_pending = record.status == RecordStatus::Pending && !entitled;
        result.has_used_trial = record.trial_started_at.is_some();
        result.trial_started_at = record.trial_started_at;
        result.trial_active = trial_active;
        result.days_remaining = match trial_end {
            Some(end) if trial_active => days_ceil(end - now),
            _ => 0,
        };
        result.has_purchase_history = record.subscription_started_at.is_some();
    }

    // Only ever denies a second trial; never carries the other account's entitlement
    if let Some(other_start) = device_trial {
        if !result.entitlement_active && !result.has_used_trial && !result.has_purchase_history {
            result.device_based_trial_block = true;
            result.device_trial_started_at = Some(other_start);
        }
    }

    result
}

fn days_ceil(remaining: Duration) -> i64 {
    let secs = remaining.num_seconds().max(0);
    (secs + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

fn require_identity(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TurnstileError::BadRequest(format!("{} is required", field)));
    }
    Ok(())
}

// ============================================================================
// Service
// ============================================================================

pub struct VerificationService {
    store: Arc<dyn SubscriptionStore>,
    validator: Option<Arc<dyn PurchaseValidator>>,
    config: VerificationConfig,
}

impl VerificationService {
    pub fn new(store: Arc<dyn SubscriptionStore>, config: VerificationConfig) -> Self {
        Self {
            store,
            validator: None,
            config,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn PurchaseValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    pub fn has_validator(&self) -> bool {
        self.validator.is_some()
    }

    /// Verify a user's entitlement.
    ///
    /// A failed record lookup aborts the request. A failed device lookup only
    /// marks the result `serverSyncSucceeded=false`, which clients treat as
    /// "ask again".
    pub async fn verify(&self, user_id: &str, device_id: Option<&str>) -> Result<VerificationResult> {
        require_identity(user_id, "userId")?;
        let now = Utc::now();

        let record = self.store.get(user_id).await?;
        let device = device_id
            .map(str::to_string)
            .or_else(|| record.as_ref().and_then(|r| r.device_id.clone()));

        let mut sync_ok = true;
        let device_trial = match device.as_deref() {
            Some(device) => match self.store.find_device_trial(device, user_id).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Device trial lookup failed");
                    sync_ok = false;
                    None
                }
            },
            None => None,
        };

        let mut result = evaluate(record.as_ref(), device_trial, now, self.config.trial_days);
        result.server_sync_succeeded = sync_ok;

        if let Some(product) = result.product_id.as_deref() {
            if self.config.catalog.is_legacy(product) {
                info!(user_id = %user_id, product_id = %product, "Record carries legacy product id");
            }
        }

        debug!(
            user_id = %user_id,
            entitled = result.entitlement_active,
            trial_active = result.trial_active,
            device_block = result.device_based_trial_block,
            "Verified subscription"
        );
        Ok(result)
    }

    /// Start a trial. Never overwrites an existing trial start.
    pub async fn start_trial(&self, user_id: &str, device_id: &str) -> Result<TrialStartOutcome> {
        require_identity(user_id, "userId")?;
        require_identity(device_id, "deviceId")?;
        let now = Utc::now();

        let record = self.store.get(user_id).await?;
        if let Some(started) = record.as_ref().and_then(|r| r.trial_started_at) {
            return Ok(TrialStartOutcome::AlreadyUsed {
                trial_started_at: started,
            });
        }

        if let Some(other) = self.store.find_device_trial(device_id, user_id).await? {
            info!(user_id = %user_id, device_id = %device_id, "Trial refused: device already used a trial");
            return Ok(TrialStartOutcome::DeviceTrialUsed {
                trial_started_at: other,
            });
        }

        // A paying user who starts a trial keeps the active label
        let status = match record.as_ref().map(|r| r.status) {
            Some(RecordStatus::Active) => RecordStatus::Active,
            _ => RecordStatus::Trial,
        };

        match self.store.try_start_trial(user_id, device_id, now, status).await? {
            TrialStart::Started(at) => {
                info!(user_id = %user_id, device_id = %device_id, "Trial started");
                let from = record.map(|r| r.status);
                if from != Some(status) {
                    self.store
                        .record_event(StatusEvent {
                            user_id: user_id.to_string(),
                            device_id: Some(device_id.to_string()),
                            from,
                            to: status,
                            at,
                        })
                        .await?;
                }
                Ok(TrialStartOutcome::Started {
                    trial_started_at: at,
                })
            }
            TrialStart::AlreadyUsed(at) => Ok(TrialStartOutcome::AlreadyUsed {
                trial_started_at: at,
            }),
        }
    }

    pub async fn trial_status(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<TrialStatusResponse> {
        require_identity(user_id, "userId")?;
        let record = self.store.get(user_id).await?;
        let trial_started_at = record.as_ref().and_then(|r| r.trial_started_at);

        let device = device_id
            .map(str::to_string)
            .or_else(|| record.as_ref().and_then(|r| r.device_id.clone()));
        let device_trial = match device.as_deref() {
            Some(device) => self.store.find_device_trial(device, user_id).await?,
            None => None,
        };

        Ok(TrialStatusResponse {
            has_used_trial: trial_started_at.is_some(),
            trial_started_at,
            device_based_trial_available: trial_started_at.is_none() && device_trial.is_none(),
            device_trial_info: device_trial.map(|at| DeviceTrialInfo {
                trial_started_at: at,
            }),
        })
    }

    /// Store a client snapshot. The status label is audit data; an event is
    /// written iff it differs from the stored one.
    pub async fn sync(&self, user_id: &str, request: SyncRequest) -> Result<SyncResponse> {
        require_identity(user_id, "userId")?;
        require_identity(&request.device_id, "deviceId")?;
        let status: RecordStatus = request.status.parse()?;
        let now = Utc::now();

        // Only the fields a sync owns. A trial start racing this sync keeps
        // its date because trial_started_at is fill-only.
        let before = self
            .store
            .update(
                user_id,
                RecordUpdate {
                    device_id: Some(request.device_id.clone()),
                    status: Some(status),
                    trial_started_at: request.trial_start_date,
                    subscription_started_at: request.subscription_start_date.map(DateWrite::Set),
                    subscription_expires_at: request.subscription_expiry_date,
                    ..Default::default()
                },
                true,
            )
            .await?;
        let previous = before.map(|r| r.status);

        let status_changed = previous != Some(status);
        if status_changed {
            info!(
                user_id = %user_id,
                from = previous.map(|s| s.as_str()).unwrap_or("none"),
                to = %status,
                "Subscription status transition"
            );
            self.store
                .record_event(StatusEvent {
                    user_id: user_id.to_string(),
                    device_id: Some(request.device_id),
                    from: previous,
                    to: status,
                    at: now,
                })
                .await?;
        }

        Ok(SyncResponse {
            success: true,
            status_changed,
        })
    }

    /// Check a purchase token with the billing provider. Only an active
    /// verdict mutates the record.
    pub async fn verify_purchase(
        &self,
        request: PurchaseVerificationRequest,
    ) -> Result<PurchaseVerificationResponse> {
        require_identity(&request.user_id, "userId")?;
        require_identity(&request.purchase_token, "purchaseToken")?;

        let validator = self.validator.as_ref().ok_or_else(|| {
            TurnstileError::NotConfigured("no billing provider configured".into())
        })?;

        if !self.config.catalog.is_valid(&request.product_id) {
            if self.config.catalog.is_legacy(&request.product_id) {
                warn!(product_id = %request.product_id, "Purchase verification for legacy product");
            }
            return Err(TurnstileError::BadRequest(format!(
                "Unknown product: {}",
                request.product_id
            )));
        }

        let verdict = validator
            .validate(&request.product_id, &request.purchase_token)
            .await?;
        info!(
            user_id = %request.user_id,
            product_id = %request.product_id,
            verdict = verdict.label(),
            "Purchase verification"
        );

        let mut response = PurchaseVerificationResponse {
            success: true,
            entitlement_active: false,
            is_pending: false,
            expires_date: None,
            product_id: Some(request.product_id.clone()),
        };

        match verdict {
            ProviderVerdict::Active {
                started_at,
                expires_at,
            } => {
                let now = Utc::now();
                let before = self
                    .store
                    .update(
                        &request.user_id,
                        RecordUpdate {
                            status: Some(RecordStatus::Active),
                            product_id: Some(request.product_id.clone()),
                            subscription_started_at: Some(DateWrite::Fill(
                                started_at.unwrap_or(now),
                            )),
                            subscription_expires_at: Some(expires_at),
                            ..Default::default()
                        },
                        true,
                    )
                    .await?;
                let previous = before.as_ref().map(|r| r.status);
                let device_id = before.and_then(|r| r.device_id);

                if previous != Some(RecordStatus::Active) {
                    self.store
                        .record_event(StatusEvent {
                            user_id: request.user_id.clone(),
                            device_id,
                            from: previous,
                            to: RecordStatus::Active,
                            at: now,
                        })
                        .await?;
                }

                response.entitlement_active = true;
                response.expires_date = Some(expires_at);
            }
            ProviderVerdict::Pending => response.is_pending = true,
            ProviderVerdict::Expired | ProviderVerdict::Invalid => {}
            ProviderVerdict::Ambiguous(reason) => {
                warn!(user_id = %request.user_id, reason = %reason, "Ambiguous provider verdict; record untouched");
                response.success = false;
            }
        }

        Ok(response)
    }

    /// Hard delete a record. Test/ops only.
    pub async fn reset(&self, user_id: &str) -> Result<bool> {
        require_identity(user_id, "userId")?;
        let deleted = self.store.delete(user_id).await?;
        info!(user_id = %user_id, deleted, "Subscription record reset");
        Ok(deleted)
    }

    /// Toggle the force-expired override. Test/ops only.
    pub async fn set_force_expired(&self, user_id: &str, force_expired: bool) -> Result<()> {
        require_identity(user_id, "userId")?;
        let update = RecordUpdate {
            force_expired: Some(force_expired),
            ..Default::default()
        };
        if self.store.update(user_id, update, false).await?.is_none() {
            return Err(TurnstileError::NotFound(format!(
                "No subscription for {}",
                user_id
            )));
        }
        info!(user_id = %user_id, force_expired, "Force-expired override set");
        Ok(())
    }

    pub async fn list_events(&self, user_id: &str) -> Result<Vec<StatusEvent>> {
        self.store.list_events(user_id).await
    }
}

// ============================================================================
// Tests
// ============================================================================
