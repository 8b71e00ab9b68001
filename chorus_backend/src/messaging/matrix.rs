//! Matrix adapter over the client-server API, with account lifecycle through
//! the Synapse admin API.
//!
//! Plain `reqwest` + serde: the fleet needs long-poll `/sync`, sends and a
//! handful of room calls, not a full SDK with its own state store.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    BackendError, Connection, ImageData, InboundEvent, MessageEvent, MessageKind,
    MessagingBackend, OutgoingContent, ReceiveBatch, RoomSnapshot,
};

const CLIENT_API: [&str; 3] = ["_matrix", "client", "v3"];
const DEVICE_NAME: &str = "chorus";
/// Matrix's recommended per-message character limit.
const MAX_MESSAGE_LENGTH: usize = 4096;
/// Slack on top of the long-poll timeout before reqwest gives up.
const REQUEST_GRACE: Duration = Duration::from_secs(15);

const SYNC_FILTER: &str = r#"{"room":{"timeline":{"limit":50},"state":{"lazy_load_members":true},"ephemeral":{"not_types":["*"]},"account_data":{"not_types":["*"]}},"presence":{"not_types":["*"]},"account_data":{"not_types":["*"]}}"#;

// ─── Matrix wire types ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MatrixErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    content_uri: String,
}

#[derive(Deserialize)]
struct JoinedMembersResponse {
    #[serde(default)]
    joined: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct JoinedRoomsResponse {
    #[serde(default)]
    joined_rooms: Vec<String>,
}

#[derive(Deserialize)]
pub(crate) struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Deserialize, Default)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, InvitedRoom>,
}

#[derive(Deserialize, Default)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Deserialize, Default)]
struct Timeline {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Deserialize, Default)]
struct InvitedRoom {
    #[serde(default)]
    invite_state: Timeline,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    event_id: Option<String>,
    sender: String,
    #[serde(default)]
    origin_server_ts: Option<i64>,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    content: Value,
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

pub struct MatrixBackend {
    homeserver: Url,
    server_name: String,
    admin_token: Option<String>,
    client: reqwest::Client,
    txn_counter: AtomicU64,
}

impl MatrixBackend {
    pub fn new(
        homeserver_url: &str,
        server_name: impl Into<String>,
        admin_token: Option<String>,
        client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let homeserver = Url::parse(homeserver_url)
            .map_err(|e| anyhow::anyhow!("invalid homeserver url '{}': {}", homeserver_url, e))?;
        Ok(Self {
            homeserver,
            server_name: server_name.into(),
            admin_token,
            client,
            txn_counter: AtomicU64::new(0),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Rejected {
                status: 0,
                message: "homeserver url cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn client_url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut all: Vec<&str> = CLIENT_API.to_vec();
        all.extend_from_slice(segments);
        self.url(&all)
    }

    fn admin_token(&self) -> Result<&str, BackendError> {
        self.admin_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| BackendError::Auth("no Synapse admin token configured".to_string()))
    }

    fn next_txn_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("chorus-{}-{}", Utc::now().timestamp_millis(), n)
    }

    async fn call<T>(
        &self,
        method: Method,
        url: Url,
        token: Option<&str>,
        body: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<T, BackendError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut req = self.client.request(method, url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let response = req.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &text));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Transient(format!("malformed response: {}", e)))
    }

    async fn upload(
        &self,
        conn: &Connection,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<String, BackendError> {
        let mut url = self.url(&["_matrix", "media", "v3", "upload"])?;
        url.query_pairs_mut().append_pair("filename", "image");

        let response = self
            .client
            .post(url)
            .bearer_auth(&conn.access_token)
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(data)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &text));
        }
        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("malformed upload response: {}", e)))?;
        Ok(uploaded.content_uri)
    }

    async fn fetch_image(&self, url: &str) -> Result<(Vec<u8>, String), BackendError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(map_status_error(status, ""));
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        Ok((bytes.to_vec(), mime))
    }
}

#[async_trait]
impl MessagingBackend for MatrixBackend {
    fn identity_for(&self, persona_id: &str) -> String {
        format!("@{}:{}", persona_id, self.server_name)
    }

    async fn create_account(
        &self,
        persona_id: &str,
        display_name: &str,
        secret: &str,
    ) -> Result<String, BackendError> {
        let admin = self.admin_token()?;
        let user_id = self.identity_for(persona_id);
        let url = self.url(&["_synapse", "admin", "v2", "users", &user_id])?;

        // The admin PUT also modifies existing users, so refuse to take one over.
        match self
            .call::<Value>(Method::GET, url.clone(), Some(admin), None, None)
            .await
        {
            Ok(_) => {
                return Err(BackendError::Rejected {
                    status: StatusCode::CONFLICT.as_u16(),
                    message: format!("account {} already exists", user_id),
                })
            }
            Err(BackendError::Rejected { status: 404, .. }) => {}
            Err(e) => return Err(e),
        }

        self.call::<Value>(
            Method::PUT,
            url,
            Some(admin),
            Some(json!({
                "password": secret,
                "displayname": display_name,
                "admin": false,
            })),
            None,
        )
        .await?;

        tracing::info!("Matrix account created: {}", user_id);
        Ok(user_id)
    }

    async fn delete_account(&self, identity: &str) -> Result<(), BackendError> {
        let admin = self.admin_token()?;
        let url = self.url(&["_synapse", "admin", "v1", "deactivate", identity])?;
        self.call::<Value>(
            Method::POST,
            url,
            Some(admin),
            Some(json!({ "erase": true })),
            None,
        )
        .await?;
        tracing::info!("Matrix account deactivated: {}", identity);
        Ok(())
    }

    async fn login(&self, identity: &str, secret: &str) -> Result<Connection, BackendError> {
        let url = self.client_url(&["login"])?;
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": identity },
            "password": secret,
            "initial_device_display_name": DEVICE_NAME,
        });

        let login: LoginResponse = self
            .call(Method::POST, url, None, Some(body), None)
            .await
            .map_err(|e| match e {
                BackendError::Rejected { status: 403, message } => BackendError::Auth(message),
                other => other,
            })?;

        Ok(Connection::new(identity, login.access_token))
    }

    async fn receive(
        &self,
        conn: &Connection,
        cursor: Option<&str>,
        timeout: Duration,
    ) -> Result<ReceiveBatch, BackendError> {
        let mut url = self.client_url(&["sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("filter", SYNC_FILTER);
            match cursor {
                Some(since) => {
                    query.append_pair("since", since);
                    query.append_pair("timeout", &timeout.as_millis().to_string());
                }
                // Without a cursor the server returns immediately with the
                // current position, which is all the caller needs.
                None => {
                    query.append_pair("timeout", "0");
                }
            }
        }

        let sync: SyncResponse = self
            .call(
                Method::GET,
                url,
                Some(&conn.access_token),
                None,
                Some(timeout + REQUEST_GRACE),
            )
            .await?;

        Ok(sync_to_batch(sync, &conn.identity))
    }

    async fn send(
        &self,
        conn: &Connection,
        room_id: &str,
        content: &OutgoingContent,
    ) -> Result<String, BackendError> {
        let body = match content {
            OutgoingContent::Text(text) => json!({
                "msgtype": "m.text",
                "body": truncate_message(text),
            }),
            OutgoingContent::Image { caption, image } => {
                let (data, mime) = match image {
                    ImageData::Bytes { data, mime } => (data.clone(), mime.clone()),
                    ImageData::Url(url) => self.fetch_image(url).await?,
                };
                let size = data.len();
                let mxc = self.upload(conn, data, &mime).await?;
                json!({
                    "msgtype": "m.image",
                    "body": caption,
                    "url": mxc,
                    "info": { "mimetype": mime, "size": size },
                })
            }
        };

        let txn_id = self.next_txn_id();
        let url = self.client_url(&["rooms", room_id, "send", "m.room.message", &txn_id])?;
        let sent: SendResponse = self
            .call(Method::PUT, url, Some(&conn.access_token), Some(body), None)
            .await?;
        Ok(sent.event_id)
    }

    async fn room_members(
        &self,
        conn: &Connection,
        room_id: &str,
    ) -> Result<RoomSnapshot, BackendError> {
        let url = self.client_url(&["rooms", room_id, "joined_members"])?;
        let members: JoinedMembersResponse = self
            .call(Method::GET, url, Some(&conn.access_token), None, None)
            .await?;
        Ok(RoomSnapshot {
            room_id: room_id.to_string(),
            members: members.joined.into_keys().collect(),
        })
    }

    async fn joined_rooms(&self, conn: &Connection) -> Result<Vec<String>, BackendError> {
        let url = self.client_url(&["joined_rooms"])?;
        let rooms: JoinedRoomsResponse = self
            .call(Method::GET, url, Some(&conn.access_token), None, None)
            .await?;
        Ok(rooms.joined_rooms)
    }

    async fn join_room(&self, conn: &Connection, room_id: &str) -> Result<(), BackendError> {
        let url = self.client_url(&["join", room_id])?;
        self.call::<Value>(Method::POST, url, Some(&conn.access_token), Some(json!({})), None)
            .await?;
        Ok(())
    }

    async fn invite_to_room(
        &self,
        conn: &Connection,
        room_id: &str,
        identity: &str,
    ) -> Result<(), BackendError> {
        let url = self.client_url(&["rooms", room_id, "invite"])?;
        self.call::<Value>(
            Method::POST,
            url,
            Some(&conn.access_token),
            Some(json!({ "user_id": identity })),
            None,
        )
        .await?;
        Ok(())
    }

    async fn leave_room(&self, conn: &Connection, room_id: &str) -> Result<(), BackendError> {
        let url = self.client_url(&["rooms", room_id, "leave"])?;
        self.call::<Value>(Method::POST, url, Some(&conn.access_token), Some(json!({})), None)
            .await?;
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn map_transport_error(e: reqwest::Error) -> BackendError {
    BackendError::Transient(e.to_string())
}

fn map_status_error(status: StatusCode, body: &str) -> BackendError {
    let parsed: Option<MatrixErrorBody> = serde_json::from_str(body).ok();
    let message = match &parsed {
        Some(err) if !err.errcode.is_empty() => format!("{}: {}", err.errcode, err.error),
        _ => body.chars().take(300).collect(),
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return BackendError::Transient(format!("HTTP {}: {}", status, message));
    }

    let errcode = parsed.map(|p| p.errcode).unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || errcode == "M_UNKNOWN_TOKEN" || errcode == "M_USER_DEACTIVATED" {
        return BackendError::Auth(message);
    }

    BackendError::Rejected {
        status: status.as_u16(),
        message,
    }
}

fn truncate_message(text: &str) -> String {
    if text.len() <= MAX_MESSAGE_LENGTH {
        return text.to_string();
    }
    let mut end = MAX_MESSAGE_LENGTH;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn pill_regex() -> Option<&'static Regex> {
    static PILL: OnceLock<Option<Regex>> = OnceLock::new();
    PILL.get_or_init(|| Regex::new(r#"https://matrix\.to/#/((?:@|%40)[^"'<>?/\s]+)"#).ok())
        .as_ref()
}

/// Explicit mentions only: `m.mentions.user_ids` plus `matrix.to` pills in
/// the HTML body. Plain-text occurrences of a name never count.
pub(crate) fn extract_mentions(content: &Value) -> BTreeSet<String> {
    let mut mentions: BTreeSet<String> = content
        .get("m.mentions")
        .and_then(|m| m.get("user_ids"))
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let html = content.get("formatted_body").and_then(Value::as_str);
    if let (Some(html), Some(pill)) = (html, pill_regex()) {
        for caps in pill.captures_iter(html) {
            let raw = &caps[1];
            mentions.insert(raw.replace("%40", "@").replace("%3A", ":").replace("%3a", ":"));
        }
    }

    mentions
}

fn convert_message(room_id: &str, raw: RawEvent) -> Option<MessageEvent> {
    if raw.event_type != "m.room.message" {
        return None;
    }
    let event_id = raw.event_id?;
    let timestamp = raw
        .origin_server_ts
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let msgtype = raw
        .content
        .get("msgtype")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let kind = match (msgtype.as_str(), raw.content.get("body").and_then(Value::as_str)) {
        ("m.text", Some(body)) => MessageKind::Text {
            body: body.to_string(),
            mentions: extract_mentions(&raw.content),
        },
        _ => MessageKind::Other { msgtype },
    };

    Some(MessageEvent {
        event_id,
        room_id: room_id.to_string(),
        sender: raw.sender,
        timestamp,
        kind,
    })
}

pub(crate) fn sync_to_batch(sync: SyncResponse, own_identity: &str) -> ReceiveBatch {
    let mut events = Vec::new();

    // HashMap order is arbitrary; sort rooms so batches are reproducible.
    let mut joined: Vec<_> = sync.rooms.join.into_iter().collect();
    joined.sort_by(|a, b| a.0.cmp(&b.0));
    for (room_id, room) in joined {
        for raw in room.timeline.events {
            if let Some(message) = convert_message(&room_id, raw) {
                events.push(InboundEvent::Message(message));
            }
        }
    }

    let mut invited: Vec<_> = sync.rooms.invite.into_iter().collect();
    invited.sort_by(|a, b| a.0.cmp(&b.0));
    for (room_id, room) in invited {
        let inviter = room
            .invite_state
            .events
            .iter()
            .find(|e| {
                e.event_type == "m.room.member" && e.state_key.as_deref() == Some(own_identity)
            })
            .map(|e| e.sender.clone())
            .unwrap_or_default();
        events.push(InboundEvent::Invite { room_id, inviter });
    }

    ReceiveBatch {
        events,
        next_cursor: sync.next_batch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MatrixBackend {
        MatrixBackend::new(
            "https://matrix.example.org/",
            "example.org",
            None,
            reqwest::Client::new(),
        )
        .expect("backend")
    }

    #[test]
    fn identity_uses_server_name() {
        assert_eq!(backend().identity_for("scout"), "@scout:example.org");
    }

    #[test]
    fn room_ids_are_percent_encoded_in_paths() {
        let url = backend()
            .client_url(&["rooms", "!abc:example.org", "leave"])
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!abc:example.org/leave"
        );
        let url = backend()
            .client_url(&["rooms", "!a/b?c", "leave"])
            .expect("url");
        assert!(url.as_str().contains("!a%2Fb%3Fc"));
    }

    #[test]
    fn mentions_come_from_structured_fields_only() {
        let content = json!({
            "msgtype": "m.text",
            "body": "scout: status? also @sage",
            "format": "org.matrix.custom.html",
            "formatted_body": "<a href=\"https://matrix.to/#/%40scout%3Aexample.org\">scout</a>: status?",
            "m.mentions": { "user_ids": ["@lead:example.org"] }
        });
        let mentions = extract_mentions(&content);
        assert!(mentions.contains("@scout:example.org"));
        assert!(mentions.contains("@lead:example.org"));
        assert!(!mentions.iter().any(|m| m.contains("sage")));
    }

    #[test]
    fn sync_response_becomes_ordered_batch() {
        let raw = json!({
            "next_batch": "s72595_4483_1934",
            "rooms": {
                "join": {
                    "!room:example.org": {
                        "timeline": { "events": [
                            {
                                "type": "m.room.message",
                                "event_id": "$1",
                                "sender": "@alice:example.org",
                                "origin_server_ts": 1700000000000i64,
                                "content": { "msgtype": "m.text", "body": "hi" }
                            },
                            {
                                "type": "m.room.message",
                                "event_id": "$2",
                                "sender": "@alice:example.org",
                                "origin_server_ts": 1700000001000i64,
                                "content": { "msgtype": "m.image", "body": "cat.png" }
                            },
                            {
                                "type": "m.room.member",
                                "event_id": "$3",
                                "sender": "@bob:example.org",
                                "state_key": "@bob:example.org",
                                "content": { "membership": "join" }
                            }
                        ]}
                    }
                },
                "invite": {
                    "!new:example.org": {
                        "invite_state": { "events": [
                            {
                                "type": "m.room.member",
                                "sender": "@alice:example.org",
                                "state_key": "@scout:example.org",
                                "content": { "membership": "invite" }
                            }
                        ]}
                    }
                }
            }
        });
        let sync: SyncResponse = serde_json::from_value(raw).expect("parse sync");
        let batch = sync_to_batch(sync, "@scout:example.org");

        assert_eq!(batch.next_cursor, "s72595_4483_1934");
        assert_eq!(batch.events.len(), 3);
        match &batch.events[0] {
            InboundEvent::Message(m) => {
                assert_eq!(m.event_id, "$1");
                assert_eq!(m.text_body(), Some("hi"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &batch.events[1] {
            InboundEvent::Message(m) => assert!(m.text_body().is_none()),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            batch.events[2],
            InboundEvent::Invite {
                room_id: "!new:example.org".to_string(),
                inviter: "@alice:example.org".to_string(),
            }
        );
    }

    #[test]
    fn status_codes_map_to_error_classes() {
        assert!(map_status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(map_status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(map_status_error(
            StatusCode::UNAUTHORIZED,
            r#"{"errcode":"M_UNKNOWN_TOKEN","error":"Invalid access token"}"#
        )
        .is_fatal());
        assert!(matches!(
            map_status_error(StatusCode::NOT_FOUND, r#"{"errcode":"M_NOT_FOUND","error":"nope"}"#),
            BackendError::Rejected { status: 404, .. }
        ));
    }

    #[test]
    fn long_messages_are_truncated_on_char_boundary() {
        let text = "é".repeat(MAX_MESSAGE_LENGTH);
        let truncated = truncate_message(&text);
        assert!(truncated.len() <= MAX_MESSAGE_LENGTH);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
