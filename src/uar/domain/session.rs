use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::uar::domain::runs::OwnerType;

/// Persisted session owning the state shared by its runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_state: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        session_id: impl Into<String>,
        owner_type: OwnerType,
        owner_id: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            owner_type,
            owner_id: owner_id.into(),
            user_id,
            session_state: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
