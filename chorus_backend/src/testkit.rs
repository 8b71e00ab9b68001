//! In-process fakes for the messaging and generation backends.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::database::FleetDatabase;
use crate::llm_client::{ChatMessage, GenerationBackend, GenerationError, GenerationParams};
use crate::messaging::{
    BackendError, Connection, ImageData, InboundEvent, MessageEvent, MessageKind,
    MessagingBackend, OutgoingContent, ReceiveBatch, RoomSnapshot,
};
use crate::persona::PersonaDefinition;

pub const SERVER: &str = "test.local";

pub fn identity(localpart: &str) -> String {
    format!("@{}:{}", localpart, SERVER)
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

pub fn text_event(
    event_id: &str,
    room_id: &str,
    sender: &str,
    body: &str,
    mentions: &[&str],
    secs: i64,
) -> MessageEvent {
    MessageEvent {
        event_id: event_id.to_string(),
        room_id: room_id.to_string(),
        sender: sender.to_string(),
        timestamp: at(secs),
        kind: MessageKind::Text {
            body: body.to_string(),
            mentions: mentions.iter().map(|m| m.to_string()).collect(),
        },
    }
}

pub fn definition(id: &str) -> PersonaDefinition {
    PersonaDefinition {
        id: id.to_string(),
        user_id: identity(id),
        display_name: id.to_string(),
        instructions: format!("You are {}.", id),
        traits: Default::default(),
        creator: "tester".to_string(),
        created_at: at(0),
        updated_at: at(0),
        secret: "secret".to_string(),
    }
}

pub fn temp_db() -> (TempDir, Arc<FleetDatabase>) {
    let dir = TempDir::new().expect("tempdir");
    let db = FleetDatabase::new(dir.path().join("fleet.db")).expect("open db");
    (dir, Arc::new(db))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub sender: String,
    pub room_id: String,
    pub content: OutgoingContent,
}

#[derive(Default)]
pub struct FakeMessaging {
    accounts: Mutex<HashMap<String, String>>,
    rooms: Mutex<HashMap<String, BTreeSet<String>>>,
    queues: Mutex<HashMap<String, VecDeque<Result<ReceiveBatch, BackendError>>>>,
    receive_calls: Mutex<HashMap<String, Vec<Option<String>>>>,
    sent: Mutex<Vec<SentMessage>>,
    failing_logins: Mutex<HashSet<String>>,
    failing_deletes: Mutex<HashSet<String>>,
    fail_sends: AtomicBool,
    counter: AtomicU64,
}

impl FakeMessaging {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_room(&self, room_id: &str, members: &[&str]) {
        self.rooms.lock().expect("rooms").insert(
            room_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn has_account(&self, identity: &str) -> bool {
        self.accounts.lock().expect("accounts").contains_key(identity)
    }

    pub fn members(&self, room_id: &str) -> BTreeSet<String> {
        self.rooms
            .lock()
            .expect("rooms")
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn push_batch(&self, identity: &str, next_cursor: &str, events: Vec<InboundEvent>) {
        self.push_result(
            identity,
            Ok(ReceiveBatch {
                events,
                next_cursor: next_cursor.to_string(),
            }),
        );
    }

    pub fn push_result(&self, identity: &str, result: Result<ReceiveBatch, BackendError>) {
        self.queues
            .lock()
            .expect("queues")
            .entry(identity.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn receive_calls(&self, identity: &str) -> Vec<Option<String>> {
        self.receive_calls
            .lock()
            .expect("calls")
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("sent").clone()
    }

    pub fn fail_login_for(&self, identity: &str) {
        self.failing_logins
            .lock()
            .expect("logins")
            .insert(identity.to_string());
    }

    pub fn fail_delete_for(&self, identity: &str) {
        self.failing_deletes
            .lock()
            .expect("deletes")
            .insert(identity.to_string());
    }

    pub fn set_send_failure(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessagingBackend for FakeMessaging {
    fn identity_for(&self, persona_id: &str) -> String {
        identity(persona_id)
    }

    async fn create_account(
        &self,
        persona_id: &str,
        _display_name: &str,
        secret: &str,
    ) -> Result<String, BackendError> {
        let user_id = identity(persona_id);
        let mut accounts = self.accounts.lock().expect("accounts");
        if accounts.contains_key(&user_id) {
            return Err(BackendError::Rejected {
                status: 409,
                message: "exists".to_string(),
            });
        }
        accounts.insert(user_id.clone(), secret.to_string());
        Ok(user_id)
    }

    async fn delete_account(&self, identity: &str) -> Result<(), BackendError> {
        if self.failing_deletes.lock().expect("deletes").contains(identity) {
            return Err(BackendError::Transient("admin api down".to_string()));
        }
        match self.accounts.lock().expect("accounts").remove(identity) {
            Some(_) => Ok(()),
            None => Err(BackendError::Rejected {
                status: 404,
                message: "no such user".to_string(),
            }),
        }
    }

    async fn login(&self, identity: &str, secret: &str) -> Result<Connection, BackendError> {
        if self.failing_logins.lock().expect("logins").contains(identity) {
            return Err(BackendError::Auth("login refused".to_string()));
        }
        match self.accounts.lock().expect("accounts").get(identity) {
            Some(stored) if stored == secret => {
                Ok(Connection::new(identity, format!("token-{}", identity)))
            }
            _ => Err(BackendError::Auth("bad credentials".to_string())),
        }
    }

    async fn receive(
        &self,
        conn: &Connection,
        cursor: Option<&str>,
        timeout: Duration,
    ) -> Result<ReceiveBatch, BackendError> {
        self.receive_calls
            .lock()
            .expect("calls")
            .entry(conn.identity.clone())
            .or_default()
            .push(cursor.map(str::to_string));

        let next = self
            .queues
            .lock()
            .expect("queues")
            .get_mut(&conn.identity)
            .and_then(|q| q.pop_front());
        match next {
            Some(result) => result,
            None => {
                tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
                Ok(ReceiveBatch {
                    events: Vec::new(),
                    next_cursor: cursor.unwrap_or("c0").to_string(),
                })
            }
        }
    }

    async fn send(
        &self,
        conn: &Connection,
        room_id: &str,
        content: &OutgoingContent,
    ) -> Result<String, BackendError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BackendError::Transient("send failed".to_string()));
        }
        self.sent.lock().expect("sent").push(SentMessage {
            sender: conn.identity.clone(),
            room_id: room_id.to_string(),
            content: content.clone(),
        });
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("$sent{}", n))
    }

    async fn room_members(
        &self,
        _conn: &Connection,
        room_id: &str,
    ) -> Result<RoomSnapshot, BackendError> {
        match self.rooms.lock().expect("rooms").get(room_id) {
            Some(members) => Ok(RoomSnapshot {
                room_id: room_id.to_string(),
                members: members.clone(),
            }),
            None => Err(BackendError::Rejected {
                status: 404,
                message: "unknown room".to_string(),
            }),
        }
    }

    async fn joined_rooms(&self, conn: &Connection) -> Result<Vec<String>, BackendError> {
        let mut rooms: Vec<String> = self
            .rooms
            .lock()
            .expect("rooms")
            .iter()
            .filter(|(_, members)| members.contains(&conn.identity))
            .map(|(room, _)| room.clone())
            .collect();
        rooms.sort();
        Ok(rooms)
    }

    async fn join_room(&self, conn: &Connection, room_id: &str) -> Result<(), BackendError> {
        self.rooms
            .lock()
            .expect("rooms")
            .entry(room_id.to_string())
            .or_default()
            .insert(conn.identity.clone());
        Ok(())
    }

    async fn invite_to_room(
        &self,
        _conn: &Connection,
        room_id: &str,
        _identity: &str,
    ) -> Result<(), BackendError> {
        if self.rooms.lock().expect("rooms").contains_key(room_id) {
            Ok(())
        } else {
            Err(BackendError::Rejected {
                status: 404,
                message: "unknown room".to_string(),
            })
        }
    }

    async fn leave_room(&self, conn: &Connection, room_id: &str) -> Result<(), BackendError> {
        if let Some(members) = self.rooms.lock().expect("rooms").get_mut(room_id) {
            members.remove(&conn.identity);
        }
        Ok(())
    }
}

pub struct FakeGeneration {
    replies: Mutex<VecDeque<Result<String, GenerationError>>>,
    default_reply: String,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
    image_prompts: Mutex<Vec<String>>,
    image_error: Mutex<Option<GenerationError>>,
    delay: Mutex<Duration>,
}

impl FakeGeneration {
    pub fn new() -> Arc<Self> {
        Self::with_default("hello from the fake")
    }

    pub fn with_default(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
            image_prompts: Mutex::new(Vec::new()),
            image_error: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn push_reply(&self, reply: Result<String, GenerationError>) {
        self.replies.lock().expect("replies").push_back(reply);
    }

    /// Make every `complete` call take `delay` after recording its prompt.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("delay") = delay;
    }

    pub fn fail_images(&self, error: GenerationError) {
        *self.image_error.lock().expect("image error") = Some(error);
    }

    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().expect("prompts").clone()
    }

    pub fn image_prompts(&self) -> Vec<String> {
        self.image_prompts.lock().expect("image prompts").clone()
    }
}

#[async_trait]
impl GenerationBackend for FakeGeneration {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        self.prompts.lock().expect("prompts").push(messages.to_vec());
        let delay = *self.delay.lock().expect("delay");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .expect("replies")
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_reply.clone()))
    }

    async fn generate_image(&self, prompt: &str, _size: &str) -> Result<ImageData, GenerationError> {
        self.image_prompts
            .lock()
            .expect("image prompts")
            .push(prompt.to_string());
        match self.image_error.lock().expect("image error").clone() {
            Some(error) => Err(error),
            None => Ok(ImageData::Url(format!("https://img.test/{}.png", prompt.len()))),
        }
    }
}
