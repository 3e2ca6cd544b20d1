//! MongoDB-backed subscription store

use async_trait::async_trait;
use bson::{doc, Bson, DateTime, Document};
use chrono::Utc;
use tracing::debug;

use super::{
    RecordStatus, RecordUpdate, StatusEvent, SubscriptionRecord, SubscriptionStore, TrialStart,
};
use crate::db::schemas::{
    StatusEventDoc, SubscriptionDoc, STATUS_EVENT_COLLECTION, SUBSCRIPTION_COLLECTION,
};
use crate::db::{is_duplicate_key, MongoClient, MongoCollection};
use crate::types::{Result, TurnstileError};

#[derive(Clone)]
pub struct MongoSubscriptionStore {
    subscriptions: MongoCollection<SubscriptionDoc>,
    events: MongoCollection<StatusEventDoc>,
}

impl MongoSubscriptionStore {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            subscriptions: client.collection(SUBSCRIPTION_COLLECTION).await?,
            events: client.collection(STATUS_EVENT_COLLECTION).await?,
        })
    }
}

#[async_trait]
impl SubscriptionStore for MongoSubscriptionStore {
    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionRecord>> {
        Ok(self
            .subscriptions
            .find_one(doc! { "user_id": user_id })
            .await?
            .map(SubscriptionRecord::from))
    }

    async fn find_device_trial(
        &self,
        device_id: &str,
        excluding_user: &str,
    ) -> Result<Option<chrono::DateTime<Utc>>> {
        let docs = self
            .subscriptions
            .find_many(
                doc! {
                    "device_id": device_id,
                    "user_id": { "$ne": excluding_user },
                    "trial_started_at": { "$ne": null },
                },
                doc! { "trial_started_at": 1 },
            )
            .await?;

        Ok(docs
            .into_iter()
            .filter_map(|d| d.trial_started_at)
            .map(DateTime::to_chrono)
            .min())
    }

    async fn try_start_trial(
        &self,
        user_id: &str,
        device_id: &str,
        at: chrono::DateTime<Utc>,
        status: RecordStatus,
    ) -> Result<TrialStart> {
        let now = DateTime::now();
        // Matches only a record without a trial (or no record at all). If the
        // user exists with a trial, the upsert's insert collides on the
        // unique user_id index.
        let filter = doc! { "user_id": user_id, "trial_started_at": null };
        let update = doc! {
            "$set": {
                "device_id": device_id,
                "status": status.as_str(),
                "trial_started_at": DateTime::from_chrono(at),
                "metadata.is_deleted": false,
                "metadata.updated_at": now,
            },
            "$setOnInsert": {
                "metadata.created_at": now,
                "force_expired": false,
            },
        };

        match self.subscriptions.update_one(filter, update, true).await {
            Ok(_) => Ok(TrialStart::Started(at)),
            Err(e) if is_duplicate_key(&e) => {
                debug!(user_id = %user_id, "Trial start collided with existing trial");
                let existing = self
                    .get(user_id)
                    .await?
                    .and_then(|r| r.trial_started_at)
                    .ok_or_else(|| {
                        TurnstileError::Database(format!(
                            "Trial start conflict without a stored trial for {}",
                            user_id
                        ))
                    })?;
                Ok(TrialStart::AlreadyUsed(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        user_id: &str,
        update: RecordUpdate,
        create: bool,
    ) -> Result<Option<SubscriptionRecord>> {
        let before = self
            .subscriptions
            .find_one_and_update(
                doc! { "user_id": user_id },
                SubscriptionDoc::update_document(&update),
                create,
            )
            .await?;

        if before.is_none() && !create {
            return Ok(None);
        }

        // Set-once dates: each write matches only while the field is null, so
        // a trial started by another request is never replaced
        for (field, at) in SubscriptionDoc::fill_fields(&update) {
            let mut filter = doc! { "user_id": user_id };
            filter.insert(field, Bson::Null);
            let mut set = Document::new();
            set.insert(field, at);
            self.subscriptions
                .update_one(filter, doc! { "$set": set }, false)
                .await?;
        }

        Ok(before.map(SubscriptionRecord::from))
    }

    async fn record_event(&self, event: StatusEvent) -> Result<()> {
        self.events.insert_one(StatusEventDoc::from(event)).await
    }

    async fn list_events(&self, user_id: &str) -> Result<Vec<StatusEvent>> {
        Ok(self
            .events
            .find_many(doc! { "user_id": user_id }, doc! { "at": 1 })
            .await?
            .into_iter()
            .map(StatusEvent::from)
            .collect())
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        Ok(self.subscriptions.delete_one(doc! { "user_id": user_id }).await? > 0)
    }

    fn kind(&self) -> &'static str {
        "mongodb"
    }
}
