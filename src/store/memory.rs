//! In-memory subscription store for dev mode and tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    RecordStatus, RecordUpdate, StatusEvent, SubscriptionRecord, SubscriptionStore, TrialStart,
};
use crate::types::Result;

#[derive(Default)]
pub struct InMemorySubscriptionStore {
    records: DashMap<String, SubscriptionRecord>,
    events: DashMap<String, Vec<StatusEvent>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionRecord>> {
        Ok(self.records.get(user_id).map(|r| r.value().clone()))
    }

    async fn find_device_trial(
        &self,
        device_id: &str,
        excluding_user: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.user_id != excluding_user)
            .filter(|r| r.device_id.as_deref() == Some(device_id))
            .filter_map(|r| r.trial_started_at)
            .min())
    }

    async fn try_start_trial(
        &self,
        user_id: &str,
        device_id: &str,
        at: DateTime<Utc>,
        status: RecordStatus,
    ) -> Result<TrialStart> {
        // entry() holds the shard lock, so check-and-set is atomic per user
        match self.records.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if let Some(existing) = record.trial_started_at {
                    return Ok(TrialStart::AlreadyUsed(existing));
                }
                record.trial_started_at = Some(at);
                record.device_id = Some(device_id.to_string());
                record.status = status;
                record.updated_at = Some(at);
                Ok(TrialStart::Started(at))
            }
            Entry::Vacant(entry) => {
                entry.insert(SubscriptionRecord {
                    user_id: user_id.to_string(),
                    device_id: Some(device_id.to_string()),
                    status,
                    trial_started_at: Some(at),
                    updated_at: Some(at),
                    ..Default::default()
                });
                Ok(TrialStart::Started(at))
            }
        }
    }

    async fn update(
        &self,
        user_id: &str,
        update: RecordUpdate,
        create: bool,
    ) -> Result<Option<SubscriptionRecord>> {
        let now = Utc::now();
        match self.records.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let before = entry.get().clone();
                update.apply_to(entry.get_mut(), now);
                Ok(Some(before))
            }
            Entry::Vacant(entry) => {
                if create {
                    let mut record = SubscriptionRecord::new(user_id);
                    update.apply_to(&mut record, now);
                    entry.insert(record);
                }
                Ok(None)
            }
        }
    }

    async fn record_event(&self, event: StatusEvent) -> Result<()> {
        self.events
            .entry(event.user_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn list_events(&self, user_id: &str) -> Result<Vec<StatusEvent>> {
        Ok(self
            .events
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        Ok(self.records.remove(user_id).is_some())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_trial_start_is_set_once() {
        let store = InMemorySubscriptionStore::new();
        let first = Utc::now();
        let later = first + Duration::hours(1);

        let started = store
            .try_start_trial("alice", "dev-1", first, RecordStatus::Trial)
            .await
            .unwrap();
        assert_eq!(started, TrialStart::Started(first));

        let again = store
            .try_start_trial("alice", "dev-1", later, RecordStatus::Trial)
            .await
            .unwrap();
        assert_eq!(again, TrialStart::AlreadyUsed(first));

        let record = store.get("alice").await.unwrap().unwrap();
        assert_eq!(record.trial_started_at, Some(first));
    }

    #[tokio::test]
    async fn test_concurrent_trial_starts_record_one() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let at = Utc::now() + Duration::seconds(i);
                store
                    .try_start_trial("alice", "dev-1", at, RecordStatus::Trial)
                    .await
                    .unwrap()
            }));
        }

        let mut started = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), TrialStart::Started(_)) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_find_device_trial_excludes_self() {
        let store = InMemorySubscriptionStore::new();
        let at = Utc::now();
        store
            .try_start_trial("alice", "shared", at, RecordStatus::Trial)
            .await
            .unwrap();

        assert_eq!(store.find_device_trial("shared", "alice").await.unwrap(), None);
        assert_eq!(
            store.find_device_trial("shared", "bob").await.unwrap(),
            Some(at)
        );
        assert_eq!(store.find_device_trial("other", "bob").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_keeps_concurrent_trial_start() {
        let store = InMemorySubscriptionStore::new();
        let at = Utc::now();
        store
            .try_start_trial("alice", "dev-1", at, RecordStatus::Trial)
            .await
            .unwrap();

        let before = store
            .update(
                "alice",
                RecordUpdate {
                    status: Some(RecordStatus::Expired),
                    trial_started_at: Some(at + Duration::days(1)),
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.status, RecordStatus::Trial);

        let record = store.get("alice").await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Expired);
        assert_eq!(record.trial_started_at, Some(at));
        assert_eq!(record.device_id.as_deref(), Some("dev-1"));

        let again = store
            .try_start_trial("alice", "dev-1", Utc::now(), RecordStatus::Trial)
            .await
            .unwrap();
        assert_eq!(again, TrialStart::AlreadyUsed(at));
    }

    #[tokio::test]
    async fn test_update_without_create_leaves_missing_record() {
        let store = InMemorySubscriptionStore::new();
        let update = RecordUpdate {
            force_expired: Some(true),
            ..Default::default()
        };
        assert_eq!(store.update("ghost", update.clone(), false).await.unwrap(), None);
        assert!(store.is_empty());

        assert_eq!(store.update("ghost", update, true).await.unwrap(), None);
        assert!(store.get("ghost").await.unwrap().unwrap().force_expired);
    }

    #[tokio::test]
    async fn test_events_and_delete() {
        let store = InMemorySubscriptionStore::new();
        store
            .update("alice", RecordUpdate::default(), true)
            .await
            .unwrap();
        store
            .record_event(StatusEvent {
                user_id: "alice".into(),
                device_id: None,
                from: Some(RecordStatus::Trial),
                to: RecordStatus::Active,
                at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(store.list_events("alice").await.unwrap().len(), 1);
        assert!(store.list_events("bob").await.unwrap().is_empty());

        assert!(store.delete("alice").await.unwrap());
        assert!(!store.delete("alice").await.unwrap());
        assert!(store.is_empty());
    }
}
