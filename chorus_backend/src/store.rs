//! Storage contracts for persona definitions and the per-persona message log.
//!
//! Both traits are synchronous: the SQLite implementation answers from a
//! pooled connection and callers use them directly from async code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persona::{PersonaDefinition, PersonaPatch};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("persona '{0}' already exists")]
    DuplicateId(String),
    #[error("persona '{0}' not found")]
    NotFound(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub(crate) fn as_db_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub(crate) fn from_db(raw: &str) -> Option<Self> {
        match raw {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// One stored message, unique per (persona id, event id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub persona_id: String,
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub direction: Direction,
    /// Fallback apologies and other replies the persona did not author.
    #[serde(default)]
    pub system_generated: bool,
}

pub trait PersonaStore: Send + Sync {
    /// Atomic create-if-absent; `DuplicateId` when the id is taken.
    fn create(&self, definition: &PersonaDefinition) -> StoreResult<()>;
    fn read(&self, persona_id: &str) -> StoreResult<PersonaDefinition>;
    fn update(&self, persona_id: &str, patch: &PersonaPatch) -> StoreResult<PersonaDefinition>;
    /// Removes the definition together with its message log and cursor.
    fn delete(&self, persona_id: &str) -> StoreResult<()>;
    fn list(&self) -> StoreResult<Vec<PersonaDefinition>>;

    fn exists(&self, persona_id: &str) -> StoreResult<bool> {
        match self.read(persona_id) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// True when `user_id` belongs to a persona of this fleet.
    fn is_persona_identity(&self, user_id: &str) -> StoreResult<bool>;

    fn load_cursor(&self, persona_id: &str) -> StoreResult<Option<String>>;
    fn save_cursor(&self, persona_id: &str, cursor: &str) -> StoreResult<()>;
}

pub trait MessageLog: Send + Sync {
    /// Idempotent on (persona id, event id). Returns whether a row was inserted.
    fn append(&self, record: &MessageRecord) -> StoreResult<bool>;
    fn contains(&self, persona_id: &str, event_id: &str) -> StoreResult<bool>;
    /// All records of `persona_id` in `room_id`, ascending by timestamp.
    fn query(&self, persona_id: &str, room_id: &str) -> StoreResult<Vec<MessageRecord>>;
    fn recent_outbound_count(
        &self,
        persona_id: &str,
        room_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<usize>;
}
