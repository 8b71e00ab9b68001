//! Command bridge into the fleet from other threads and tasks.
//!
//! Every command travels over a flume channel together with its own reply
//! channel, so the console thread can block on the answer while HTTP handlers
//! await it.

use std::sync::Arc;

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use super::{FleetError, FleetManager, PersonaDetails, PersonaSummary};
use crate::persona::PersonaDescriptor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum FleetCommand {
    Spawn {
        descriptor: PersonaDescriptor,
    },
    Despawn {
        persona_id: String,
    },
    List,
    Describe {
        persona_id: String,
    },
    Send {
        persona_id: String,
        room_id: String,
        text: String,
    },
    Join {
        persona_id: String,
        room_id: String,
    },
    Invite {
        persona_id: String,
        room_id: String,
        user_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FleetReply {
    Spawned(PersonaSummary),
    Despawned { persona_id: String },
    Personas { persona_ids: Vec<String> },
    Persona(PersonaDetails),
    Sent { delivery_id: String },
    Joined { room_id: String },
    Invited { room_id: String, user_id: String },
}

pub type FleetResult = Result<FleetReply, FleetError>;

pub struct FleetRequest {
    pub command: FleetCommand,
    pub reply: Sender<FleetResult>,
}

#[derive(Clone)]
pub struct FleetHandle {
    tx: Sender<FleetRequest>,
}

fn unavailable() -> FleetError {
    FleetError::Unavailable {
        message: "fleet runtime is not running".to_string(),
    }
}

impl FleetHandle {
    pub fn channel() -> (Self, Receiver<FleetRequest>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    /// Submit a command and block the calling thread until it completes.
    /// Must not be called from inside the fleet's tokio runtime.
    pub fn call_blocking(&self, command: FleetCommand) -> FleetResult {
        let (reply, answer) = flume::bounded(1);
        self.tx
            .send(FleetRequest { command, reply })
            .map_err(|_| unavailable())?;
        answer.recv().map_err(|_| unavailable())?
    }

    pub async fn call(&self, command: FleetCommand) -> FleetResult {
        let (reply, answer) = flume::bounded(1);
        self.tx
            .send_async(FleetRequest { command, reply })
            .await
            .map_err(|_| unavailable())?;
        answer.recv_async().await.map_err(|_| unavailable())?
    }
}

/// Run commands until every [`FleetHandle`] has been dropped or the fleet's
/// shutdown token fires. Each command is its own task, so a slow despawn does
/// not hold up `list`.
pub async fn serve_commands(manager: Arc<FleetManager>, requests: Receiver<FleetRequest>) {
    let shutdown = manager.shutdown_token();
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Fleet shutting down, command loop exits");
                return;
            }
            request = requests.recv_async() => match request {
                Ok(request) => request,
                Err(_) => break,
            },
        };
        let manager = manager.clone();
        tokio::spawn(async move {
            let result = manager.execute(request.command).await;
            if let Err(e) = &result {
                tracing::warn!("Fleet command failed: {}", e);
            }
            let _ = request.reply.send(result);
        });
    }
    tracing::debug!("Fleet command channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::testkit::{temp_db, FakeGeneration, FakeMessaging};

    #[test]
    fn blocking_calls_cross_into_the_runtime_thread() {
        let (_dir, db) = temp_db();
        let (events_tx, _events_rx) = flume::unbounded();
        let manager = Arc::new(FleetManager::new(
            FakeMessaging::new(),
            FakeGeneration::new(),
            db.clone(),
            db,
            &FleetConfig::default(),
            events_tx,
        ));
        let (handle, requests) = FleetHandle::channel();

        let worker_manager = manager.clone();
        let worker = std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().expect("runtime");
            rt.block_on(async move {
                serve_commands(worker_manager.clone(), requests).await;
                worker_manager.shutdown().await;
            });
        });

        let reply = handle
            .call_blocking(FleetCommand::Spawn {
                descriptor: PersonaDescriptor::direct("scout"),
            })
            .expect("spawn");
        match reply {
            FleetReply::Spawned(summary) => assert_eq!(summary.persona_id, "scout"),
            other => panic!("unexpected reply {:?}", other),
        }

        assert_eq!(
            handle.call_blocking(FleetCommand::List).expect("list"),
            FleetReply::Personas {
                persona_ids: vec!["scout".to_string()]
            }
        );
        assert!(matches!(
            handle.call_blocking(FleetCommand::Describe {
                persona_id: "nobody".to_string()
            }),
            Err(FleetError::NotFound { .. })
        ));

        drop(handle);
        worker.join().expect("worker thread");
    }

    #[tokio::test]
    async fn command_loop_exits_on_shutdown_while_handles_live() {
        let (_dir, db) = temp_db();
        let (events_tx, _events_rx) = flume::unbounded();
        let manager = Arc::new(FleetManager::new(
            FakeMessaging::new(),
            FakeGeneration::new(),
            db.clone(),
            db,
            &FleetConfig::default(),
            events_tx,
        ));
        let (handle, requests) = FleetHandle::channel();
        let serving = tokio::spawn(serve_commands(manager.clone(), requests));

        manager.shutdown().await;
        tokio::time::timeout(std::time::Duration::from_secs(5), serving)
            .await
            .expect("command loop still running")
            .expect("join");

        assert!(matches!(
            handle.call(FleetCommand::List).await,
            Err(FleetError::Unavailable { .. })
        ));
    }

    #[test]
    fn calls_fail_cleanly_without_a_runtime() {
        let (handle, requests) = FleetHandle::channel();
        drop(requests);
        assert!(matches!(
            handle.call_blocking(FleetCommand::List),
            Err(FleetError::Unavailable { .. })
        ));
    }

    #[test]
    fn commands_use_tagged_json() {
        let command: FleetCommand = serde_json::from_str(
            r#"{"command":"send","persona_id":"scout","room_id":"!r","text":"hi"}"#,
        )
        .expect("parse");
        assert!(matches!(command, FleetCommand::Send { .. }));

        let reply = serde_json::to_value(FleetReply::Sent {
            delivery_id: "$1".to_string(),
        })
        .expect("serialize");
        assert_eq!(reply["result"], "sent");
    }
}
