//! Subscription record storage
//!
//! The verification service talks to storage only through
//! [`SubscriptionStore`]. Two implementations exist: MongoDB for deployments
//! and an in-memory map for dev mode and tests.

mod memory;
mod mongo;

pub use memory::InMemorySubscriptionStore;
pub use mongo::MongoSubscriptionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Result, TurnstileError};

// =============================================================================
// Records
// =============================================================================

/// Stored status label.
///
/// Audit metadata only: entitlement and trial activity are always derived from
/// the stored dates, with the single exception that an active trial also
/// requires the label to read `trial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    New,
    Trial,
    Active,
    Pending,
    Expired,
    Cancelled,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Trial => "trial",
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(Self::New),
            "trial" => Ok(Self::Trial),
            "active" | "subscribed" => Ok(Self::Active),
            "pending" => Ok(Self::Pending),
            "expired" => Ok(Self::Expired),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(TurnstileError::BadRequest(format!(
                "Unknown subscription status: {}",
                other
            ))),
        }
    }
}

/// One subscription record per user identity
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub device_id: Option<String>,
    pub status: RecordStatus,
    pub product_id: Option<String>,
    /// Set at most once per user
    pub trial_started_at: Option<DateTime<Utc>>,
    pub subscription_started_at: Option<DateTime<Utc>>,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub force_expired: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SubscriptionRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

/// How an update writes a date field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DateWrite {
    /// Overwrite whatever is stored
    Set(DateTime<Utc>),
    /// Write only when the stored value is absent
    Fill(DateTime<Utc>),
}

/// Field-level change to one record. `None` leaves the stored field alone.
///
/// Writers only name the fields they own, so concurrent writers never undo
/// each other. `trial_started_at` can only be filled when absent; nothing
/// overwrites or clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub device_id: Option<String>,
    pub status: Option<RecordStatus>,
    pub product_id: Option<String>,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub subscription_started_at: Option<DateWrite>,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub force_expired: Option<bool>,
}

impl RecordUpdate {
    pub fn apply_to(&self, record: &mut SubscriptionRecord, now: DateTime<Utc>) {
        if let Some(device_id) = &self.device_id {
            record.device_id = Some(device_id.clone());
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(product_id) = &self.product_id {
            record.product_id = Some(product_id.clone());
        }
        if record.trial_started_at.is_none() {
            record.trial_started_at = self.trial_started_at;
        }
        match self.subscription_started_at {
            Some(DateWrite::Set(at)) => record.subscription_started_at = Some(at),
            Some(DateWrite::Fill(at)) => {
                record.subscription_started_at.get_or_insert(at);
            }
            None => {}
        }
        if let Some(expires_at) = self.subscription_expires_at {
            record.subscription_expires_at = Some(expires_at);
        }
        if let Some(force_expired) = self.force_expired {
            record.force_expired = force_expired;
        }
        record.updated_at = Some(now);
    }
}

/// Audit entry written when a sync changes the stored status label
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub user_id: String,
    pub device_id: Option<String>,
    pub from: Option<RecordStatus>,
    pub to: RecordStatus,
    pub at: DateTime<Utc>,
}

/// Outcome of an atomic trial start
#[derive(Debug, Clone, PartialEq)]
pub enum TrialStart {
    /// Trial recorded at the given time
    Started(DateTime<Utc>),
    /// The user already had a trial; carries the original start
    AlreadyUsed(DateTime<Utc>),
}

// =============================================================================
// Store trait
// =============================================================================

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionRecord>>;

    /// Earliest trial started on `device_id` by any identity other than
    /// `excluding_user`
    async fn find_device_trial(
        &self,
        device_id: &str,
        excluding_user: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Record a trial start unless one exists. Must never overwrite an
    /// existing `trial_started_at`, even under concurrent calls.
    async fn try_start_trial(
        &self,
        user_id: &str,
        device_id: &str,
        at: DateTime<Utc>,
        status: RecordStatus,
    ) -> Result<TrialStart>;

    /// Apply `update` atomically and return the record as it was before.
    ///
    /// `None` means there was no record: with `create` one is created from
    /// the update, otherwise nothing is written.
    async fn update(
        &self,
        user_id: &str,
        update: RecordUpdate,
        create: bool,
    ) -> Result<Option<SubscriptionRecord>>;

    async fn record_event(&self, event: StatusEvent) -> Result<()>;

    /// Audit events for a user, oldest first
    async fn list_events(&self, user_id: &str) -> Result<Vec<StatusEvent>>;

    /// Hard delete. Returns whether a record existed.
    async fn delete(&self, user_id: &str) -> Result<bool>;

    /// Short name for health output
    fn kind(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!("trial".parse::<RecordStatus>().unwrap(), RecordStatus::Trial);
        assert_eq!(" Active ".parse::<RecordStatus>().unwrap(), RecordStatus::Active);
        assert_eq!("canceled".parse::<RecordStatus>().unwrap(), RecordStatus::Cancelled);
        assert!("gold".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn test_update_never_replaces_trial_start() {
        let now = Utc::now();
        let original = now - chrono::Duration::days(2);
        let mut record = SubscriptionRecord::new("alice");
        record.trial_started_at = Some(original);
        record.subscription_started_at = Some(original);

        RecordUpdate {
            status: Some(RecordStatus::Expired),
            trial_started_at: Some(now),
            subscription_started_at: Some(DateWrite::Fill(now)),
            ..Default::default()
        }
        .apply_to(&mut record, now);

        assert_eq!(record.status, RecordStatus::Expired);
        assert_eq!(record.trial_started_at, Some(original));
        assert_eq!(record.subscription_started_at, Some(original));
        assert_eq!(record.updated_at, Some(now));

        RecordUpdate {
            subscription_started_at: Some(DateWrite::Set(now)),
            ..Default::default()
        }
        .apply_to(&mut record, now);
        assert_eq!(record.subscription_started_at, Some(now));
        assert_eq!(record.status, RecordStatus::Expired);
    }

    #[test]
    fn test_empty_update_fills_trial_on_fresh_record() {
        let now = Utc::now();
        let mut record = SubscriptionRecord::new("alice");
        RecordUpdate {
            trial_started_at: Some(now),
            ..Default::default()
        }
        .apply_to(&mut record, now);
        assert_eq!(record.trial_started_at, Some(now));
        assert!(!record.force_expired);
    }

    #[test]
    fn test_status_serde_matches_display() {
        for status in [
            RecordStatus::New,
            RecordStatus::Trial,
            RecordStatus::Active,
            RecordStatus::Pending,
            RecordStatus::Expired,
            RecordStatus::Cancelled,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }
}
