use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metrics::LoadStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub id: Uuid,
    pub host_id: String,
    pub alias: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliasRequest {
    pub alias: String,
}

/// Binds an external identifier (e.g. a proxy-node group) to a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub host_id: String,
    pub tag_type: String,
    pub tag_id: i64,
    pub created_at: DateTime<Utc>,
}

/// `(type, id)` pair as sent by clients, both for tag edits and batch lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagRef {
    #[serde(rename = "type")]
    pub tag_type: String,
    pub id: i64,
}

impl TagRef {
    pub fn new(tag_type: impl Into<String>, id: i64) -> Self {
        Self {
            tag_type: tag_type.into(),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagLoadStatus {
    #[serde(rename = "type")]
    pub tag_type: String,
    pub id: i64,
    pub load_status: LoadStatus,
}
