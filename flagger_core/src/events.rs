//! Wire types for the ingestion endpoint: exposures, user events, and the
//! batch envelope that carries them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attributes::{escape_attributes, Attributes};
use crate::entity::Entity;

/// Name and version of the SDK build reporting data, stamped into every
/// ingestion batch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SdkInfo {
    pub name: String,
    pub version: String,
}

/// A record that a specific decision was made for a specific entity at a
/// specific time. Created once per flag-function call unless the decision
/// reason is in the do-not-ingest set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub codename: String,
    #[serde(rename = "hashkey", default, skip_serializing_if = "String::is_empty")]
    pub hashkey: String,
    pub variation: String,
    pub entity: Option<Entity>,
    #[serde(rename = "methodCalled")]
    pub method_called: String,
    pub timestamp: DateTime<Utc>,
}

/// A user-generated event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(rename = "eventProperties", default)]
    pub event_properties: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Entity>,
}

impl Event {
    /// Normalize the event: property keys are lowercased and the entity is
    /// escaped. Idempotent; does not mutate `self`.
    pub fn escape(&self) -> Event {
        Event {
            name: self.name.clone(),
            event_properties: escape_attributes(&self.event_properties),
            entity: self.entity.as_ref().map(Entity::escape),
        }
    }
}

/// The ingestion wire envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub id: String,
    pub entities: Vec<Entity>,
    pub exposures: Vec<Exposure>,
    pub events: Vec<Event>,
    #[serde(rename = "sdkInfo")]
    pub sdk_info: SdkInfo,
    #[serde(rename = "detectedFlags")]
    pub detected_flags: Vec<String>,
}
