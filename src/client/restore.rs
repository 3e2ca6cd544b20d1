//! Device billing restore capability

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::RestoreError;
use crate::types::ProductCatalog;

/// A purchase reported by the device billing layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRecord {
    pub product_id: String,
    pub purchase_token: String,
    #[serde(default)]
    pub purchased_at: Option<DateTime<Utc>>,
    /// Absent for billing layers that only report currently-owned purchases
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_pending: bool,
}

/// Queries the device for existing purchases
#[async_trait]
pub trait RestoreAdapter: Send + Sync {
    async fn restore_purchases(&self) -> Result<Vec<PurchaseRecord>, RestoreError>;
}

/// Whether any restored purchase proves a current entitlement
pub fn has_active_purchase(
    records: &[PurchaseRecord],
    now: DateTime<Utc>,
    catalog: &ProductCatalog,
) -> bool {
    records.iter().any(|r| {
        !r.is_pending
            && catalog.is_valid(&r.product_id)
            && r.expires_at.map_or(true, |expires| expires > now)
    })
}
