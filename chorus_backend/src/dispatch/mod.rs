//! Per-event dispatch: validate, de-duplicate, record, decide, reply, record.

pub mod context;
pub mod eligibility;

use std::sync::Arc;

use chrono::Utc;

use crate::config::FleetConfig;
use crate::llm_client::{ChatMessage, GenerationBackend, GenerationError, GenerationParams};
use crate::messaging::{Connection, MessageEvent, MessagingBackend, OutgoingContent};
use crate::store::{Direction, MessageLog, MessageRecord, PersonaStore, StoreError};

use context::{load_context, ContextOptions};
use eligibility::{Eligibility, EligibilityInput, EligibilityPolicy, PolicyChain};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub primary_persona: Option<String>,
    pub command_prefix: char,
    pub max_history: usize,
    pub fallback_instructions: String,
    pub params: GenerationParams,
    pub image_size: String,
}

impl DispatchConfig {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            primary_persona: config.primary_persona.clone(),
            command_prefix: config.command_prefix,
            max_history: config.max_history,
            fallback_instructions: config.fallback_instructions.clone(),
            params: GenerationParams {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
            image_size: config.image_size.clone(),
        }
    }

    fn is_primary(&self, persona_id: &str) -> bool {
        self.primary_persona.as_deref() == Some(persona_id)
    }

    fn image_prompt<'a>(&self, body: &'a str) -> Option<&'a str> {
        let trigger = format!("{}image ", self.command_prefix);
        body.trim_start()
            .strip_prefix(trigger.as_str())
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotText,
    SelfEcho,
    Duplicate,
    NotAddressed,
    InvalidRoom,
    Throttled,
    MembershipUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Skipped(SkipReason),
    Replied {
        room_id: String,
        delivery_id: String,
        /// True when the reply is a categorized apology, not generated text.
        fallback: bool,
    },
    SendFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] StoreError),
}

pub fn fallback_reply(error: &GenerationError) -> &'static str {
    match error {
        GenerationError::Connectivity(_) => {
            "Sorry, I can't reach my thoughts right now. Try me again in a moment."
        }
        GenerationError::RateLimit(_) => {
            "I'm getting a lot of requests right now. Give me a minute and ask again."
        }
        GenerationError::Other(_) => "Sorry, something went wrong while I was thinking about that.",
    }
}

pub struct Dispatcher {
    messaging: Arc<dyn MessagingBackend>,
    generation: Arc<dyn GenerationBackend>,
    store: Arc<dyn PersonaStore>,
    log: Arc<dyn MessageLog>,
    policy: Arc<dyn EligibilityPolicy>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        messaging: Arc<dyn MessagingBackend>,
        generation: Arc<dyn GenerationBackend>,
        store: Arc<dyn PersonaStore>,
        log: Arc<dyn MessageLog>,
        policy: Arc<dyn EligibilityPolicy>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            messaging,
            generation,
            store,
            log,
            policy,
            config,
        }
    }

    /// Dispatcher with the participant rule and, if enabled, the loop guard.
    pub fn from_config(
        messaging: Arc<dyn MessagingBackend>,
        generation: Arc<dyn GenerationBackend>,
        store: Arc<dyn PersonaStore>,
        log: Arc<dyn MessageLog>,
        config: &FleetConfig,
    ) -> Self {
        let policy = Arc::new(PolicyChain::standard(
            store.clone(),
            log.clone(),
            &config.loop_guard,
        ));
        Self::new(
            messaging,
            generation,
            store,
            log,
            policy,
            DispatchConfig::from_config(config),
        )
    }

    pub async fn dispatch(
        &self,
        persona_id: &str,
        conn: &Connection,
        event: &MessageEvent,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(body) = event.text_body() else {
            return Ok(DispatchOutcome::Skipped(SkipReason::NotText));
        };
        if event.sender == conn.identity {
            return Ok(DispatchOutcome::Skipped(SkipReason::SelfEcho));
        }

        if self.log.contains(persona_id, &event.event_id)? {
            tracing::debug!("{}: already handled {}", persona_id, event.event_id);
            return Ok(DispatchOutcome::Skipped(SkipReason::Duplicate));
        }

        let inserted = self.log.append(&MessageRecord {
            persona_id: persona_id.to_string(),
            event_id: event.event_id.clone(),
            room_id: event.room_id.clone(),
            sender: event.sender.clone(),
            timestamp: event.timestamp,
            body: body.to_string(),
            direction: Direction::Inbound,
            system_generated: false,
        })?;
        if !inserted {
            return Ok(DispatchOutcome::Skipped(SkipReason::Duplicate));
        }

        let room = match self.messaging.room_members(conn, &event.room_id).await {
            Ok(room) => room,
            Err(e) => {
                tracing::warn!(
                    "{}: cannot read members of {}: {}",
                    persona_id,
                    event.room_id,
                    e
                );
                return Ok(DispatchOutcome::Skipped(SkipReason::MembershipUnavailable));
            }
        };

        let verdict = self.policy.evaluate(&EligibilityInput {
            persona_id,
            identity: &conn.identity,
            room: &room,
            event,
        });
        match verdict {
            Eligibility::Eligible => {}
            Eligibility::NotAddressed => {
                return Ok(DispatchOutcome::Skipped(SkipReason::NotAddressed))
            }
            Eligibility::Throttled => return Ok(DispatchOutcome::Skipped(SkipReason::Throttled)),
            Eligibility::InvalidRoom { participants } => {
                tracing::error!(
                    "{}: room {} reports {} participant(s) but delivered a message from {}",
                    persona_id,
                    event.room_id,
                    participants,
                    event.sender
                );
                return Ok(DispatchOutcome::Skipped(SkipReason::InvalidRoom));
            }
        }

        let (content, fallback) = match self.config.image_prompt(body) {
            Some(prompt) => self.image_reply(persona_id, prompt).await,
            None => self.text_reply(persona_id, event, body).await?,
        };

        Ok(self.deliver(persona_id, conn, &event.room_id, content, fallback).await)
    }

    /// Operator-driven message sent as the persona.
    pub async fn send_manual(
        &self,
        persona_id: &str,
        conn: &Connection,
        room_id: &str,
        text: &str,
    ) -> DispatchOutcome {
        self.deliver(
            persona_id,
            conn,
            room_id,
            OutgoingContent::Text(text.to_string()),
            false,
        )
        .await
    }

    async fn text_reply(
        &self,
        persona_id: &str,
        event: &MessageEvent,
        body: &str,
    ) -> Result<(OutgoingContent, bool), DispatchError> {
        let options = ContextOptions {
            max_history: self.config.max_history,
            is_primary: self.config.is_primary(persona_id),
            command_prefix: self.config.command_prefix,
            fallback_instructions: &self.config.fallback_instructions,
            exclude_event_id: Some(&event.event_id),
        };
        let mut messages = load_context(
            self.store.as_ref(),
            self.log.as_ref(),
            persona_id,
            &event.room_id,
            &options,
        )?;
        messages.push(ChatMessage::user(body));

        match self.generation.complete(&messages, &self.config.params).await {
            Ok(reply) => Ok((OutgoingContent::Text(reply), false)),
            Err(e) => {
                tracing::warn!("{}: generation failed: {}", persona_id, e);
                Ok((OutgoingContent::Text(fallback_reply(&e).to_string()), true))
            }
        }
    }

    async fn image_reply(&self, persona_id: &str, prompt: &str) -> (OutgoingContent, bool) {
        match self
            .generation
            .generate_image(prompt, &self.config.image_size)
            .await
        {
            Ok(image) => (
                OutgoingContent::Image {
                    caption: prompt.to_string(),
                    image,
                },
                false,
            ),
            Err(e) => {
                tracing::warn!("{}: image generation failed: {}", persona_id, e);
                (OutgoingContent::Text(fallback_reply(&e).to_string()), true)
            }
        }
    }

    async fn deliver(
        &self,
        persona_id: &str,
        conn: &Connection,
        room_id: &str,
        content: OutgoingContent,
        fallback: bool,
    ) -> DispatchOutcome {
        let delivery_id = match self.messaging.send(conn, room_id, &content).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("{}: send to {} failed: {}", persona_id, room_id, e);
                return DispatchOutcome::SendFailed(e.to_string());
            }
        };

        let record = MessageRecord {
            persona_id: persona_id.to_string(),
            event_id: delivery_id.clone(),
            room_id: room_id.to_string(),
            sender: conn.identity.clone(),
            timestamp: Utc::now(),
            body: content.log_body(),
            direction: Direction::Outbound,
            system_generated: fallback,
        };
        // The message is already out; a failed write only costs history.
        if let Err(e) = self.log.append(&record) {
            tracing::error!("{}: failed to record outbound {}: {}", persona_id, delivery_id, e);
        }

        tracing::info!("{} replied in {} ({})", persona_id, room_id, delivery_id);
        DispatchOutcome::Replied {
            room_id: room_id.to_string(),
            delivery_id,
            fallback,
        }
    }
}
