//! Subscription record document

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::store::{DateWrite, RecordStatus, RecordUpdate, SubscriptionRecord};

/// Collection name for subscription records
pub const SUBSCRIPTION_COLLECTION: &str = "subscriptions";

/// Subscription record stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SubscriptionDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Unique per document
    pub user_id: String,

    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default)]
    pub status: RecordStatus,

    #[serde(default)]
    pub product_id: Option<String>,

    #[serde(default)]
    pub trial_started_at: Option<DateTime>,

    #[serde(default)]
    pub subscription_started_at: Option<DateTime>,

    #[serde(default)]
    pub subscription_expires_at: Option<DateTime>,

    #[serde(default)]
    pub force_expired: bool,
}

impl From<SubscriptionDoc> for SubscriptionRecord {
    fn from(doc: SubscriptionDoc) -> Self {
        Self {
            user_id: doc.user_id,
            device_id: doc.device_id,
            status: doc.status,
            product_id: doc.product_id,
            trial_started_at: doc.trial_started_at.map(DateTime::to_chrono),
            subscription_started_at: doc.subscription_started_at.map(DateTime::to_chrono),
            subscription_expires_at: doc.subscription_expires_at.map(DateTime::to_chrono),
            force_expired: doc.force_expired,
            updated_at: doc.metadata.updated_at.map(DateTime::to_chrono),
        }
    }
}

impl SubscriptionDoc {
    /// Update document for the fields `update` overwrites.
    ///
    /// Set-once dates never appear here; see [`SubscriptionDoc::fill_fields`].
    pub fn update_document(update: &RecordUpdate) -> Document {
        let now = DateTime::now();
        let mut set = doc! {
            "metadata.is_deleted": false,
            "metadata.updated_at": now,
        };
        let mut on_insert = doc! { "metadata.created_at": now };

        if let Some(device_id) = &update.device_id {
            set.insert("device_id", device_id.as_str());
        }
        if let Some(status) = update.status {
            set.insert("status", status.as_str());
        }
        if let Some(product_id) = &update.product_id {
            set.insert("product_id", product_id.as_str());
        }
        if let Some(DateWrite::Set(at)) = update.subscription_started_at {
            set.insert("subscription_started_at", DateTime::from_chrono(at));
        }
        if let Some(expires_at) = update.subscription_expires_at {
            set.insert("subscription_expires_at", DateTime::from_chrono(expires_at));
        }
        match update.force_expired {
            Some(force_expired) => {
                set.insert("force_expired", force_expired);
            }
            None => {
                on_insert.insert("force_expired", false);
            }
        }

        doc! { "$set": set, "$setOnInsert": on_insert }
    }

    /// Dates written only where the stored field is null, each as its own
    /// guarded update
    pub fn fill_fields(update: &RecordUpdate) -> Vec<(&'static str, DateTime)> {
        let mut fields = Vec::new();
        if let Some(at) = update.trial_started_at {
            fields.push(("trial_started_at", DateTime::from_chrono(at)));
        }
        if let Some(DateWrite::Fill(at)) = update.subscription_started_at {
            fields.push(("subscription_started_at", DateTime::from_chrono(at)));
        }
        fields
    }
}

impl IntoIndexes for SubscriptionDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // One record per user; trial-start relies on this for atomicity
            (
                doc! { "user_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("user_id_unique".to_string())
                        .build(),
                ),
            ),
            // Device abuse lookup
            (
                doc! { "device_id": 1, "trial_started_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("device_trial_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for SubscriptionDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
