//! Status-transition audit events

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::store::{RecordStatus, StatusEvent};

/// Collection name for audit events
pub const STATUS_EVENT_COLLECTION: &str = "subscription_events";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StatusEventDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub user_id: String,

    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default)]
    pub from: Option<RecordStatus>,

    pub to: RecordStatus,

    pub at: DateTime,
}

// bson::DateTime has no Default
impl Default for StatusEventDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            user_id: String::new(),
            device_id: None,
            from: None,
            to: RecordStatus::default(),
            at: DateTime::now(),
        }
    }
}

impl From<StatusEvent> for StatusEventDoc {
    fn from(event: StatusEvent) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            user_id: event.user_id,
            device_id: event.device_id,
            from: event.from,
            to: event.to,
            at: DateTime::from_chrono(event.at),
        }
    }
}

impl From<StatusEventDoc> for StatusEvent {
    fn from(doc: StatusEventDoc) -> Self {
        Self {
            user_id: doc.user_id,
            device_id: doc.device_id,
            from: doc.from,
            to: doc.to,
            at: doc.at.to_chrono(),
        }
    }
}

impl IntoIndexes for StatusEventDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "user_id": 1, "at": 1 },
            Some(
                IndexOptions::builder()
                    .name("user_events_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for StatusEventDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
