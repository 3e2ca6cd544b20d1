//! Wire types shared by the verification server and the client engine
//!
//! All bodies are camelCase JSON. Timestamps are RFC 3339 strings; the
//! verification result keeps `expiresDate` as a string because the client
//! must treat an unparseable date as untrusted rather than fail to decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a verification result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerifySource {
    #[default]
    Server,
    Cache,
}

/// Result of a remote verification, computed from the stored record and
/// server time only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub success: bool,
    pub server_sync_succeeded: bool,
    pub entitlement_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub is_pending: bool,
    #[serde(default)]
    pub has_used_trial: bool,
    #[serde(default)]
    pub trial_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub days_remaining: i64,
    #[serde(default)]
    pub has_purchase_history: bool,
    #[serde(default)]
    pub restore_attempted: bool,
    #[serde(default)]
    pub restore_succeeded: bool,
    #[serde(default)]
    pub device_based_trial_block: bool,
    /// Trial start of the other identity on this device, when blocked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_trial_started_at: Option<DateTime<Utc>>,
    /// Required on the wire: a result that does not say where it came from
    /// must not pass for a server answer
    pub source: VerifySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<DateTime<Utc>>,
}

impl Default for VerificationResult {
    fn default() -> Self {
        Self {
            success: true,
            server_sync_succeeded: true,
            entitlement_active: false,
            expires_date: None,
            product_id: None,
            is_pending: false,
            has_used_trial: false,
            trial_active: false,
            trial_started_at: None,
            days_remaining: 0,
            has_purchase_history: false,
            restore_attempted: false,
            restore_succeeded: false,
            device_based_trial_block: false,
            device_trial_started_at: None,
            source: VerifySource::Server,
            server_time: None,
        }
    }
}

/// `POST /verify` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// `POST /verify` response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /trial-start` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialStartRequest {
    pub user_id: String,
    pub device_id: String,
}

/// 201 body of `POST /trial-start`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialStartResponse {
    pub trial_started_at: DateTime<Utc>,
    pub server_time: DateTime<Utc>,
}

/// 409 body of `POST /trial-start`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialConflictResponse {
    pub error: String,
    pub code: String,
    pub trial_started_at: DateTime<Utc>,
    pub server_time: DateTime<Utc>,
}

/// Trial information about another identity on the same device.
/// Deliberately carries no identity of the other account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTrialInfo {
    pub trial_started_at: DateTime<Utc>,
}

/// `GET /trial-status/{userId}` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialStatusResponse {
    pub has_used_trial: bool,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub device_based_trial_available: bool,
    pub device_trial_info: Option<DeviceTrialInfo>,
}

/// `POST /sync` body: a trusted local snapshot pushed after a device billing event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: String,
    pub status: String,
    #[serde(default)]
    pub trial_start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscription_start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscription_expiry_date: Option<DateTime<Utc>>,
}

/// `POST /sync` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    #[serde(default)]
    pub status_changed: bool,
}

/// `POST /verify-purchase` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseVerificationRequest {
    pub user_id: String,
    pub product_id: String,
    pub purchase_token: String,
}

/// `POST /verify-purchase` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseVerificationResponse {
    pub success: bool,
    pub entitlement_active: bool,
    pub is_pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
}
