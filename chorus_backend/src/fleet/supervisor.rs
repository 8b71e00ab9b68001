//! One long-lived receive loop per persona.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flume::Sender;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::FleetEvent;
use crate::config::FleetConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::messaging::{Connection, InboundEvent, MessagingBackend, ReceiveBatch};
use crate::store::PersonaStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Listening,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Cancelled,
    AuthRejected(String),
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub receive_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub auto_join_invites: bool,
}

impl SupervisorSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            receive_timeout: config.receive_timeout(),
            backoff_initial: Duration::from_millis(config.backoff_initial_ms.max(1)),
            backoff_max: Duration::from_millis(config.backoff_max_ms.max(config.backoff_initial_ms)),
            auto_join_invites: config.auto_join_invites,
        }
    }
}

/// Observable bits of a running session, shared with the registry.
#[derive(Debug, Default)]
pub struct SessionActivity {
    last_activity_ms: AtomicI64,
    cursor: Mutex<Option<String>>,
}

impl SessionActivity {
    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        match self.last_activity_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::<Utc>::from_timestamp_millis(ms),
        }
    }

    pub fn cursor(&self) -> Option<String> {
        self.cursor.lock().ok().and_then(|c| c.clone())
    }

    fn set_cursor(&self, cursor: &str) {
        if let Ok(mut slot) = self.cursor.lock() {
            *slot = Some(cursor.to_string());
        }
    }
}

pub struct Supervisor {
    pub(crate) persona_id: String,
    pub(crate) connection: Connection,
    pub(crate) messaging: Arc<dyn MessagingBackend>,
    pub(crate) store: Arc<dyn PersonaStore>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) settings: SupervisorSettings,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: watch::Sender<SupervisorState>,
    pub(crate) activity: Arc<SessionActivity>,
    pub(crate) events: Sender<FleetEvent>,
}

impl Supervisor {
    pub async fn run(self) -> SupervisorExit {
        self.state.send_replace(SupervisorState::Starting);
        let exit = self.receive_loop().await;
        self.state.send_replace(SupervisorState::Stopped);

        match &exit {
            SupervisorExit::Cancelled => {
                tracing::info!("Session for {} stopped", self.persona_id);
                let _ = self.events.send(FleetEvent::SessionStopped {
                    persona_id: self.persona_id.clone(),
                });
            }
            SupervisorExit::AuthRejected(reason) => {
                tracing::error!("Session for {} rejected by backend: {}", self.persona_id, reason);
                let _ = self.events.send(FleetEvent::SessionFailed {
                    persona_id: self.persona_id.clone(),
                    reason: reason.clone(),
                });
            }
        }
        exit
    }

    async fn receive_loop(&self) -> SupervisorExit {
        let mut cursor = match self.store.load_cursor(&self.persona_id) {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!("{}: could not load cursor, starting fresh: {}", self.persona_id, e);
                None
            }
        };
        let mut backoff = self.settings.backoff_initial;

        loop {
            if self.cancel.is_cancelled() {
                return SupervisorExit::Cancelled;
            }
            self.state.send_replace(SupervisorState::Listening);

            let result = self
                .messaging
                .receive(
                    &self.connection,
                    cursor.as_deref(),
                    self.settings.receive_timeout,
                )
                .await;

            match result {
                Ok(batch) => {
                    backoff = self.settings.backoff_initial;
                    self.activity.touch();
                    let next = batch.next_cursor.clone();
                    if cursor.is_none() {
                        tracing::info!(
                            "{}: primed cursor, skipping {} backlog event(s)",
                            self.persona_id,
                            batch.events.len()
                        );
                    } else if !self.handle_batch(batch).await {
                        // Unfinished batch: keep the old cursor so a restart re-reads
                        // it; events already handled are skipped as duplicates.
                        return SupervisorExit::Cancelled;
                    }
                    self.advance_cursor(&next);
                    cursor = Some(next);
                }
                Err(e) if e.is_fatal() => return SupervisorExit::AuthRejected(e.to_string()),
                Err(e) => {
                    self.state.send_replace(SupervisorState::Backoff);
                    tracing::warn!(
                        "{}: receive failed, retrying in {:?}: {}",
                        self.persona_id,
                        backoff,
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return SupervisorExit::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.settings.backoff_max);
                }
            }
        }
    }

    /// Returns false when cancellation cut the batch short.
    async fn handle_batch(&self, batch: ReceiveBatch) -> bool {
        for event in batch.events {
            if self.cancel.is_cancelled() {
                tracing::debug!("{}: cancelled mid-batch", self.persona_id);
                return false;
            }
            match event {
                InboundEvent::Message(message) => {
                    match self
                        .dispatcher
                        .dispatch(&self.persona_id, &self.connection, &message)
                        .await
                    {
                        Ok(DispatchOutcome::Replied {
                            room_id,
                            delivery_id,
                            fallback,
                        }) => {
                            let _ = self.events.send(FleetEvent::ReplySent {
                                persona_id: self.persona_id.clone(),
                                room_id,
                                delivery_id,
                                fallback,
                            });
                        }
                        Ok(DispatchOutcome::Skipped(reason)) => {
                            tracing::debug!(
                                "{}: skipped {} ({:?})",
                                self.persona_id,
                                message.event_id,
                                reason
                            );
                        }
                        Ok(DispatchOutcome::SendFailed(_)) => {}
                        Err(e) => {
                            tracing::error!(
                                "{}: dispatch of {} failed: {}",
                                self.persona_id,
                                message.event_id,
                                e
                            );
                        }
                    }
                }
                InboundEvent::Invite { room_id, inviter } => {
                    if !self.settings.auto_join_invites {
                        tracing::info!(
                            "{}: ignoring invite to {} from {}",
                            self.persona_id,
                            room_id,
                            inviter
                        );
                        continue;
                    }
                    match self.messaging.join_room(&self.connection, &room_id).await {
                        Ok(()) => tracing::info!(
                            "{}: joined {} (invited by {})",
                            self.persona_id,
                            room_id,
                            inviter
                        ),
                        Err(e) => tracing::warn!(
                            "{}: failed to join {}: {}",
                            self.persona_id,
                            room_id,
                            e
                        ),
                    }
                }
            }
        }
        true
    }

    fn advance_cursor(&self, cursor: &str) {
        self.activity.set_cursor(cursor);
        if let Err(e) = self.store.save_cursor(&self.persona_id, cursor) {
            tracing::warn!("{}: failed to persist cursor: {}", self.persona_id, e);
        }
    }
}
