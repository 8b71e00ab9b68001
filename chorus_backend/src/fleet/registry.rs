use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::supervisor::{SessionActivity, SupervisorExit, SupervisorState};
use crate::messaging::Connection;

/// A live persona session. At most one per persona id.
pub struct Session {
    pub persona_id: String,
    pub connection: Connection,
    pub cancel: CancellationToken,
    pub state: watch::Receiver<SupervisorState>,
    pub activity: Arc<SessionActivity>,
    pub task: JoinHandle<SupervisorExit>,
}

impl Session {
    pub fn current_state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Cancel the supervisor and wait for its loop to exit.
    pub async fn stop(self) -> Option<SupervisorExit> {
        self.cancel.cancel();
        match self.task.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                tracing::error!("Supervisor task for {} panicked: {}", self.persona_id, e);
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SupervisorState,
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
    pub cursor: Option<String>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    lifecycle_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock serializing spawn/despawn for one persona id.
    pub async fn lifecycle_lock(&self, persona_id: &str) -> Arc<Mutex<()>> {
        self.lifecycle_locks
            .lock()
            .await
            .entry(persona_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn insert(&self, session: Session) -> Option<Session> {
        self.sessions
            .write()
            .await
            .insert(session.persona_id.clone(), session)
    }

    pub async fn remove(&self, persona_id: &str) -> Option<Session> {
        self.sessions.write().await.remove(persona_id)
    }

    pub async fn contains(&self, persona_id: &str) -> bool {
        self.sessions.read().await.contains_key(persona_id)
    }

    /// Ids whose supervisor has not stopped, sorted.
    pub async fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.current_state() != SupervisorState::Stopped)
            .map(|s| s.persona_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn connection(&self, persona_id: &str) -> Option<Connection> {
        self.sessions
            .read()
            .await
            .get(persona_id)
            .filter(|s| s.current_state() != SupervisorState::Stopped)
            .map(|s| s.connection.clone())
    }

    pub async fn snapshot(&self, persona_id: &str) -> Option<SessionSnapshot> {
        self.sessions
            .read()
            .await
            .get(persona_id)
            .map(|s| SessionSnapshot {
                state: s.current_state(),
                last_activity: s.activity.last_activity(),
                cursor: s.activity.cursor(),
            })
    }

    pub async fn drain(&self) -> Vec<Session> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_session(id: &str, state: SupervisorState) -> Session {
        let cancel = CancellationToken::new();
        let (_tx, rx) = watch::channel(state);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            SupervisorExit::Cancelled
        });
        Session {
            persona_id: id.to_string(),
            connection: Connection::new(format!("@{}:test.local", id), "token"),
            cancel,
            state: rx,
            activity: Arc::new(SessionActivity::default()),
            task,
        }
    }

    #[tokio::test]
    async fn active_ids_are_sorted_and_skip_stopped() {
        let registry = SessionRegistry::new();
        registry.insert(idle_session("zeta", SupervisorState::Listening)).await;
        registry.insert(idle_session("alpha", SupervisorState::Backoff)).await;
        registry.insert(idle_session("dead", SupervisorState::Stopped)).await;

        assert_eq!(registry.active_ids().await, vec!["alpha", "zeta"]);
        assert!(registry.connection("dead").await.is_none());
        assert!(registry.contains("dead").await);

        for session in registry.drain().await {
            assert_eq!(session.stop().await, Some(SupervisorExit::Cancelled));
        }
        assert!(registry.active_ids().await.is_empty());
    }

    #[tokio::test]
    async fn lifecycle_lock_is_shared_per_id() {
        let registry = SessionRegistry::new();
        let a = registry.lifecycle_lock("scout").await;
        let b = registry.lifecycle_lock("scout").await;
        let other = registry.lifecycle_lock("sage").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));

        let _held = a.lock().await;
        assert!(b.try_lock().is_err());
        assert!(other.try_lock().is_ok());
    }
}
