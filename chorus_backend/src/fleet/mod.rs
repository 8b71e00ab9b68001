//! Persona fleet: lifecycle of personas and their sessions.
//!
//! [`FleetManager`] is the only writer of persona membership and of the
//! session registry. Other threads reach it through [`handle::FleetHandle`].

pub mod handle;
pub mod registry;
pub mod supervisor;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flume::Sender;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::FleetConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::llm_client::{ChatMessage, GenerationBackend, GenerationError, GenerationParams};
use crate::messaging::{BackendError, Connection, MessagingBackend};
use crate::persona::{
    extract_json, generate_secret, generation_prompt, sanitize_persona_id, GeneratedPersona,
    PersonaDefinition, PersonaDescriptor, PersonaFields,
};
use crate::store::{MessageLog, PersonaStore, StoreError};

use handle::{FleetCommand, FleetReply};
use registry::{Session, SessionRegistry};
use supervisor::{SessionActivity, Supervisor, SupervisorSettings, SupervisorState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStep {
    CreateAccount,
    WriteDefinition,
    Login,
    StartSession,
    StopSession,
    LeaveRooms,
    DeleteAccount,
    DeleteDefinition,
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleStep::CreateAccount => "create account",
            LifecycleStep::WriteDefinition => "write definition",
            LifecycleStep::Login => "login",
            LifecycleStep::StartSession => "start session",
            LifecycleStep::StopSession => "stop session",
            LifecycleStep::LeaveRooms => "leave rooms",
            LifecycleStep::DeleteAccount => "delete account",
            LifecycleStep::DeleteDefinition => "delete definition",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum FleetError {
    #[error("invalid persona descriptor: {reason}")]
    InvalidDescriptor { reason: String },
    #[error("persona '{persona_id}' already exists")]
    DuplicateId { persona_id: String },
    #[error("persona '{persona_id}' not found")]
    NotFound { persona_id: String },
    #[error("{persona_id}: {failed} failed after {completed:?}: {reason}")]
    PartialFailure {
        persona_id: String,
        completed: Vec<LifecycleStep>,
        failed: LifecycleStep,
        reason: String,
    },
    #[error("messaging backend: {message}")]
    Backend { message: String },
    #[error("generation backend: {message}")]
    Generation { message: String },
    #[error("storage: {message}")]
    Storage { message: String },
    #[error("fleet unavailable: {message}")]
    Unavailable { message: String },
}

impl From<StoreError> for FleetError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateId(persona_id) => FleetError::DuplicateId { persona_id },
            StoreError::NotFound(persona_id) => FleetError::NotFound { persona_id },
            other => FleetError::Storage {
                message: other.to_string(),
            },
        }
    }
}

impl From<BackendError> for FleetError {
    fn from(e: BackendError) -> Self {
        FleetError::Backend {
            message: e.to_string(),
        }
    }
}

impl From<GenerationError> for FleetError {
    fn from(e: GenerationError) -> Self {
        FleetError::Generation {
            message: e.to_string(),
        }
    }
}

/// Notifications for the console and the websocket stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    Spawned { persona_id: String, user_id: String },
    Despawned { persona_id: String },
    SessionStarted { persona_id: String },
    SessionStopped { persona_id: String },
    SessionFailed { persona_id: String, reason: String },
    ReplySent {
        persona_id: String,
        room_id: String,
        delivery_id: String,
        fallback: bool,
    },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaSummary {
    pub persona_id: String,
    pub user_id: String,
    pub display_name: String,
}

impl From<&PersonaDefinition> for PersonaSummary {
    fn from(definition: &PersonaDefinition) -> Self {
        Self {
            persona_id: definition.id.clone(),
            user_id: definition.user_id.clone(),
            display_name: definition.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaDetails {
    pub definition: PersonaDefinition,
    /// `None` while the persona is dormant.
    pub session_state: Option<SupervisorState>,
    pub last_activity: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
}

const PERSONA_DESIGNER_PROMPT: &str =
    "You design personas for a group chat. Answer with a single JSON object and nothing else.";

pub struct FleetManager {
    messaging: Arc<dyn MessagingBackend>,
    generation: Arc<dyn GenerationBackend>,
    store: Arc<dyn PersonaStore>,
    dispatcher: Arc<Dispatcher>,
    registry: SessionRegistry,
    settings: SupervisorSettings,
    params: GenerationParams,
    creator: String,
    shutdown: CancellationToken,
    events: Sender<FleetEvent>,
}

impl FleetManager {
    pub fn new(
        messaging: Arc<dyn MessagingBackend>,
        generation: Arc<dyn GenerationBackend>,
        store: Arc<dyn PersonaStore>,
        log: Arc<dyn MessageLog>,
        config: &FleetConfig,
        events: Sender<FleetEvent>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::from_config(
            messaging.clone(),
            generation.clone(),
            store.clone(),
            log,
            config,
        ));
        Self {
            messaging,
            generation,
            store,
            dispatcher,
            registry: SessionRegistry::new(),
            settings: SupervisorSettings::from_config(config),
            params: GenerationParams {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
            creator: config.creator.clone(),
            shutdown: CancellationToken::new(),
            events,
        }
    }

    /// Cancelled once the fleet starts shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_running(&self) -> Result<(), FleetError> {
        if self.shutdown.is_cancelled() {
            return Err(FleetError::Unavailable {
                message: "fleet is shutting down".to_string(),
            });
        }
        Ok(())
    }

    pub async fn execute(&self, command: FleetCommand) -> Result<FleetReply, FleetError> {
        match command {
            FleetCommand::Spawn { descriptor } => self.spawn(descriptor).await.map(FleetReply::Spawned),
            FleetCommand::Despawn { persona_id } => {
                self.despawn(&persona_id).await?;
                Ok(FleetReply::Despawned { persona_id })
            }
            FleetCommand::List => Ok(FleetReply::Personas {
                persona_ids: self.list().await,
            }),
            FleetCommand::Describe { persona_id } => {
                self.describe(&persona_id).await.map(FleetReply::Persona)
            }
            FleetCommand::Send {
                persona_id,
                room_id,
                text,
            } => {
                let delivery_id = self.send(&persona_id, &room_id, &text).await?;
                Ok(FleetReply::Sent { delivery_id })
            }
            FleetCommand::Join {
                persona_id,
                room_id,
            } => {
                self.join(&persona_id, &room_id).await?;
                Ok(FleetReply::Joined { room_id })
            }
            FleetCommand::Invite {
                persona_id,
                room_id,
                user_id,
            } => {
                let user_id = self.invite(&persona_id, &room_id, &user_id).await?;
                Ok(FleetReply::Invited { room_id, user_id })
            }
        }
    }

    pub async fn spawn(&self, descriptor: PersonaDescriptor) -> Result<PersonaSummary, FleetError> {
        self.ensure_running()?;
        let fields = self.resolve_descriptor(descriptor).await?;
        let persona_id = sanitize_persona_id(&fields.id);

        let lock = self.registry.lifecycle_lock(&persona_id).await;
        let _guard = lock.lock().await;

        if self.store.exists(&persona_id)? || self.registry.contains(&persona_id).await {
            return Err(FleetError::DuplicateId { persona_id });
        }

        let display_name = fields
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&persona_id)
            .to_string();
        let secret = generate_secret();

        let user_id = self
            .messaging
            .create_account(&persona_id, &display_name, &secret)
            .await?;
        let mut completed = vec![LifecycleStep::CreateAccount];

        let now = Utc::now();
        let definition = PersonaDefinition {
            id: persona_id.clone(),
            user_id: user_id.clone(),
            display_name,
            instructions: fields.instructions.unwrap_or_default(),
            traits: fields.traits,
            creator: self.creator.clone(),
            created_at: now,
            updated_at: now,
            secret,
        };

        if let Err(e) = self.store.create(&definition) {
            return Err(partial(&persona_id, completed, LifecycleStep::WriteDefinition, e));
        }
        completed.push(LifecycleStep::WriteDefinition);

        let connection = match self.messaging.login(&user_id, &definition.secret).await {
            Ok(connection) => connection,
            Err(e) => return Err(partial(&persona_id, completed, LifecycleStep::Login, e)),
        };

        if let Err(e) = self.start_session(&persona_id, connection).await {
            return Err(partial(&persona_id, completed, LifecycleStep::StartSession, e));
        }

        tracing::info!("Spawned persona {} ({})", persona_id, user_id);
        self.emit(FleetEvent::Spawned {
            persona_id: persona_id.clone(),
            user_id,
        });
        Ok(PersonaSummary::from(&definition))
    }

    async fn resolve_descriptor(
        &self,
        descriptor: PersonaDescriptor,
    ) -> Result<PersonaFields, FleetError> {
        match descriptor {
            PersonaDescriptor::Direct(fields) => Ok(fields),
            PersonaDescriptor::Generated { prompt } => {
                if prompt.trim().is_empty() {
                    return Err(FleetError::InvalidDescriptor {
                        reason: "empty generation prompt".to_string(),
                    });
                }
                let messages = [
                    ChatMessage::system(PERSONA_DESIGNER_PROMPT),
                    ChatMessage::user(generation_prompt(&prompt)),
                ];
                let response = self.generation.complete(&messages, &self.params).await?;
                let generated: GeneratedPersona =
                    extract_json(&response).map_err(|e| FleetError::InvalidDescriptor {
                        reason: format!("generated persona is not valid JSON: {}", e),
                    })?;
                if generated.name.trim().is_empty() || generated.instructions.trim().is_empty() {
                    return Err(FleetError::InvalidDescriptor {
                        reason: "generated persona lacks a name or instructions".to_string(),
                    });
                }
                Ok(generated.into_fields())
            }
        }
    }

    /// Start a supervisor for `persona_id`, replacing any existing session.
    async fn start_session(&self, persona_id: &str, connection: Connection) -> Result<(), FleetError> {
        self.ensure_running()?;

        if let Some(old) = self.registry.remove(persona_id).await {
            tracing::warn!("Replacing existing session for {}", persona_id);
            old.stop().await;
        }

        let cancel = self.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(SupervisorState::Starting);
        let activity = Arc::new(SessionActivity::default());
        let supervisor = Supervisor {
            persona_id: persona_id.to_string(),
            connection: connection.clone(),
            messaging: self.messaging.clone(),
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            settings: self.settings.clone(),
            cancel: cancel.clone(),
            state: state_tx,
            activity: activity.clone(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        self.registry
            .insert(Session {
                persona_id: persona_id.to_string(),
                connection,
                cancel,
                state: state_rx,
                activity,
                task,
            })
            .await;

        self.emit(FleetEvent::SessionStarted {
            persona_id: persona_id.to_string(),
        });
        Ok(())
    }

    pub async fn despawn(&self, persona_id: &str) -> Result<(), FleetError> {
        let lock = self.registry.lifecycle_lock(persona_id).await;
        let _guard = lock.lock().await;

        let definition = self.store.read(persona_id)?;
        let mut completed = Vec::new();

        // The supervisor must be gone before anything is deleted, or a batch
        // still in flight would write history for a persona that no longer exists.
        let live_connection = match self.registry.remove(persona_id).await {
            Some(session) => {
                let connection = session.connection.clone();
                session.stop().await;
                Some(connection)
            }
            None => None,
        };
        completed.push(LifecycleStep::StopSession);

        if let Err(e) = self.leave_all_rooms(&definition, live_connection).await {
            return Err(partial(persona_id, completed, LifecycleStep::LeaveRooms, e));
        }
        completed.push(LifecycleStep::LeaveRooms);

        match self.messaging.delete_account(&definition.user_id).await {
            Ok(()) => {}
            Err(BackendError::Rejected { status: 404, .. }) => {
                tracing::warn!("Account {} was already gone", definition.user_id);
            }
            Err(e) => return Err(partial(persona_id, completed, LifecycleStep::DeleteAccount, e)),
        }
        completed.push(LifecycleStep::DeleteAccount);

        if let Err(e) = self.store.delete(persona_id) {
            return Err(partial(persona_id, completed, LifecycleStep::DeleteDefinition, e));
        }

        tracing::info!("Despawned persona {}", persona_id);
        self.emit(FleetEvent::Despawned {
            persona_id: persona_id.to_string(),
        });
        Ok(())
    }

    async fn leave_all_rooms(
        &self,
        definition: &PersonaDefinition,
        live: Option<Connection>,
    ) -> Result<(), BackendError> {
        let connection = match live {
            Some(connection) => connection,
            None => match self
                .messaging
                .login(&definition.user_id, &definition.secret)
                .await
            {
                Ok(connection) => connection,
                // Account already deactivated: nothing left to leave.
                Err(BackendError::Auth(reason)) => {
                    tracing::warn!(
                        "Cannot log in as {} to leave rooms ({}); skipping",
                        definition.user_id,
                        reason
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };

        for room_id in self.messaging.joined_rooms(&connection).await? {
            self.messaging.leave_room(&connection, &room_id).await?;
            tracing::debug!("{} left {}", definition.id, room_id);
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<String> {
        self.registry.active_ids().await
    }

    pub async fn describe(&self, persona_id: &str) -> Result<PersonaDetails, FleetError> {
        let definition = self.store.read(persona_id)?;
        let snapshot = self.registry.snapshot(persona_id).await;
        Ok(PersonaDetails {
            definition,
            session_state: snapshot.as_ref().map(|s| s.state),
            last_activity: snapshot.as_ref().and_then(|s| s.last_activity),
            cursor: snapshot.and_then(|s| s.cursor),
        })
    }

    async fn live_connection(&self, persona_id: &str) -> Result<Connection, FleetError> {
        if let Some(connection) = self.registry.connection(persona_id).await {
            return Ok(connection);
        }
        if self.store.exists(persona_id)? {
            Err(FleetError::Unavailable {
                message: format!("persona '{}' has no active session", persona_id),
            })
        } else {
            Err(FleetError::NotFound {
                persona_id: persona_id.to_string(),
            })
        }
    }

    /// Send `text` to `room_id` as the persona; returns the delivery id.
    pub async fn send(&self, persona_id: &str, room_id: &str, text: &str) -> Result<String, FleetError> {
        let connection = self.live_connection(persona_id).await?;
        match self
            .dispatcher
            .send_manual(persona_id, &connection, room_id, text)
            .await
        {
            DispatchOutcome::Replied { delivery_id, .. } => Ok(delivery_id),
            DispatchOutcome::SendFailed(message) => Err(FleetError::Backend { message }),
            DispatchOutcome::Skipped(reason) => Err(FleetError::Backend {
                message: format!("send skipped: {:?}", reason),
            }),
        }
    }

    pub async fn join(&self, persona_id: &str, room_id: &str) -> Result<(), FleetError> {
        let connection = self.live_connection(persona_id).await?;
        self.messaging.join_room(&connection, room_id).await?;
        tracing::info!("{} joined {}", persona_id, room_id);
        Ok(())
    }

    /// Invite `user` (a full identity or a persona id) into `room_id`.
    pub async fn invite(&self, persona_id: &str, room_id: &str, user: &str) -> Result<String, FleetError> {
        let connection = self.live_connection(persona_id).await?;
        let user_id = if user.starts_with('@') {
            user.to_string()
        } else {
            self.messaging.identity_for(user)
        };
        self.messaging
            .invite_to_room(&connection, room_id, &user_id)
            .await?;
        tracing::info!("{} invited {} to {}", persona_id, user_id, room_id);
        Ok(user_id)
    }

    /// Log in every stored persona without a session. Failures are logged
    /// and skipped; returns the ids that were restored.
    pub async fn restore_all(&self) -> Result<Vec<String>, FleetError> {
        let mut restored = Vec::new();
        for definition in self.store.list()? {
            let lock = self.registry.lifecycle_lock(&definition.id).await;
            let _guard = lock.lock().await;
            if self.registry.contains(&definition.id).await {
                continue;
            }

            let connection = match self
                .messaging
                .login(&definition.user_id, &definition.secret)
                .await
            {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!("Could not restore {}: {}", definition.id, e);
                    self.emit(FleetEvent::Error {
                        message: format!("restore {}: {}", definition.id, e),
                    });
                    continue;
                }
            };
            if let Err(e) = self.start_session(&definition.id, connection).await {
                tracing::warn!("Could not start session for {}: {}", definition.id, e);
                continue;
            }
            restored.push(definition.id);
        }
        tracing::info!("Restored {} persona session(s)", restored.len());
        Ok(restored)
    }

    /// Signal every session to stop and wait for all supervisors to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sessions = self.registry.drain().await;
        let count = sessions.len();
        for session in sessions {
            session.stop().await;
        }
        tracing::info!("Fleet shut down ({} session(s) stopped)", count);
    }
}

fn partial(
    persona_id: &str,
    completed: Vec<LifecycleStep>,
    failed: LifecycleStep,
    reason: impl fmt::Display,
) -> FleetError {
    tracing::error!(
        "{}: {} failed after {:?}: {}",
        persona_id,
        failed,
        completed,
        reason
    );
    FleetError::PartialFailure {
        persona_id: persona_id.to_string(),
        completed,
        failed,
        reason: reason.to_string(),
    }
}
