//! Real-time messaging backend contract.
//!
//! The fleet only talks to the chat network through [`MessagingBackend`];
//! [`matrix::MatrixBackend`] is the production adapter.

pub mod matrix;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Timeouts, dropped connections, 5xx and 429 answers.
    #[error("transient messaging error: {0}")]
    Transient(String),
    /// Credentials or access token permanently rejected.
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Auth(_))
    }
}

/// A logged-in session on the messaging backend.
#[derive(Clone)]
pub struct Connection {
    pub identity: String,
    pub(crate) access_token: String,
}

impl Connection {
    pub fn new(identity: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            access_token: access_token.into(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageKind {
    Text {
        body: String,
        /// Identities explicitly mentioned by the sender's client.
        mentions: BTreeSet<String>,
    },
    /// Images, files, notices, reactions and other non-text content.
    Other { msgtype: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
}

impl MessageEvent {
    pub fn text_body(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Text { body, .. } => Some(body),
            MessageKind::Other { .. } => None,
        }
    }

    pub fn mentions(&self, identity: &str) -> bool {
        match &self.kind {
            MessageKind::Text { mentions, .. } => mentions.contains(identity),
            MessageKind::Other { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InboundEvent {
    Message(MessageEvent),
    Invite { room_id: String, inviter: String },
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveBatch {
    pub events: Vec<InboundEvent>,
    pub next_cursor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub members: BTreeSet<String>,
}

impl RoomSnapshot {
    pub fn participant_count(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageData {
    Url(String),
    Bytes { data: Vec<u8>, mime: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingContent {
    Text(String),
    Image { caption: String, image: ImageData },
}

impl OutgoingContent {
    /// Text stored in the message log for this content.
    pub fn log_body(&self) -> String {
        match self {
            OutgoingContent::Text(body) => body.clone(),
            OutgoingContent::Image { caption, .. } => format!("[image] {}", caption),
        }
    }
}

#[async_trait]
pub trait MessagingBackend: Send + Sync {
    /// Full identity for a persona id (e.g. `scout` -> `@scout:example.org`).
    fn identity_for(&self, persona_id: &str) -> String;

    async fn create_account(
        &self,
        persona_id: &str,
        display_name: &str,
        secret: &str,
    ) -> Result<String, BackendError>;
    async fn delete_account(&self, identity: &str) -> Result<(), BackendError>;

    async fn login(&self, identity: &str, secret: &str) -> Result<Connection, BackendError>;

    /// One bounded long-poll. `cursor` of `None` means "from now".
    async fn receive(
        &self,
        conn: &Connection,
        cursor: Option<&str>,
        timeout: Duration,
    ) -> Result<ReceiveBatch, BackendError>;

    /// Returns the delivery (event) id assigned by the backend.
    async fn send(
        &self,
        conn: &Connection,
        room_id: &str,
        content: &OutgoingContent,
    ) -> Result<String, BackendError>;

    async fn room_members(&self, conn: &Connection, room_id: &str)
        -> Result<RoomSnapshot, BackendError>;
    async fn joined_rooms(&self, conn: &Connection) -> Result<Vec<String>, BackendError>;
    async fn join_room(&self, conn: &Connection, room_id: &str) -> Result<(), BackendError>;
    async fn invite_to_room(
        &self,
        conn: &Connection,
        room_id: &str,
        identity: &str,
    ) -> Result<(), BackendError>;
    async fn leave_room(&self, conn: &Connection, room_id: &str) -> Result<(), BackendError>;
}
