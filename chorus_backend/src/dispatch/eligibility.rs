//! Reply eligibility policies.
//!
//! The dispatcher asks a single [`EligibilityPolicy`]; policies compose with
//! [`PolicyChain`], where the first non-eligible verdict wins.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use crate::config::LoopGuardConfig;
use crate::messaging::{MessageEvent, RoomSnapshot};
use crate::store::{MessageLog, PersonaStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// Group room and the persona was not mentioned.
    NotAddressed,
    /// Fewer than two participants: the persona cannot be in a room alone
    /// and still receive someone else's message.
    InvalidRoom { participants: usize },
    /// Vetoed by the loop guard.
    Throttled,
}

pub struct EligibilityInput<'a> {
    pub persona_id: &'a str,
    pub identity: &'a str,
    pub room: &'a RoomSnapshot,
    pub event: &'a MessageEvent,
}

pub trait EligibilityPolicy: Send + Sync {
    fn evaluate(&self, input: &EligibilityInput<'_>) -> Eligibility;
}

/// Direct messages are always answered; group rooms only on explicit mention.
pub fn participant_rule(participants: usize, mentioned: bool) -> Eligibility {
    match participants {
        0 | 1 => Eligibility::InvalidRoom { participants },
        2 => Eligibility::Eligible,
        _ if mentioned => Eligibility::Eligible,
        _ => Eligibility::NotAddressed,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectOrMention;

impl EligibilityPolicy for DirectOrMention {
    fn evaluate(&self, input: &EligibilityInput<'_>) -> Eligibility {
        participant_rule(
            input.room.participant_count(),
            input.event.mentions(input.identity),
        )
    }
}

/// Stops two personas from replying to each other forever: once a persona has
/// sent `max_replies` messages to a room inside the window it stops answering
/// other personas there. Humans are never throttled.
pub struct LoopGuard {
    store: Arc<dyn PersonaStore>,
    log: Arc<dyn MessageLog>,
    window: ChronoDuration,
    max_replies: usize,
}

impl LoopGuard {
    pub fn new(
        store: Arc<dyn PersonaStore>,
        log: Arc<dyn MessageLog>,
        config: &LoopGuardConfig,
    ) -> Self {
        Self {
            store,
            log,
            window: ChronoDuration::seconds(config.window_secs as i64),
            max_replies: config.max_replies,
        }
    }
}

impl EligibilityPolicy for LoopGuard {
    fn evaluate(&self, input: &EligibilityInput<'_>) -> Eligibility {
        match self.store.is_persona_identity(&input.event.sender) {
            Ok(true) => {}
            Ok(false) => return Eligibility::Eligible,
            Err(e) => {
                tracing::warn!("Loop guard sender lookup failed for {}: {}", input.persona_id, e);
                return Eligibility::Eligible;
            }
        }

        let since = Utc::now() - self.window;
        match self
            .log
            .recent_outbound_count(input.persona_id, &input.room.room_id, since)
        {
            Ok(count) if count >= self.max_replies => {
                tracing::info!(
                    "Loop guard: {} already sent {} replies to {} in the last {}s",
                    input.persona_id,
                    count,
                    input.room.room_id,
                    self.window.num_seconds()
                );
                Eligibility::Throttled
            }
            Ok(_) => Eligibility::Eligible,
            Err(e) => {
                tracing::warn!("Loop guard lookup failed for {}: {}", input.persona_id, e);
                Eligibility::Eligible
            }
        }
    }
}

pub struct PolicyChain {
    policies: Vec<Box<dyn EligibilityPolicy>>,
}

impl PolicyChain {
    pub fn new(policies: Vec<Box<dyn EligibilityPolicy>>) -> Self {
        Self { policies }
    }

    /// Participant rule, followed by the loop guard when enabled.
    pub fn standard(
        store: Arc<dyn PersonaStore>,
        log: Arc<dyn MessageLog>,
        loop_guard: &LoopGuardConfig,
    ) -> Self {
        let mut policies: Vec<Box<dyn EligibilityPolicy>> = vec![Box::new(DirectOrMention)];
        if loop_guard.enabled {
            policies.push(Box::new(LoopGuard::new(store, log, loop_guard)));
        }
        Self::new(policies)
    }
}

impl EligibilityPolicy for PolicyChain {
    fn evaluate(&self, input: &EligibilityInput<'_>) -> Eligibility {
        for policy in &self.policies {
            let verdict = policy.evaluate(input);
            if verdict != Eligibility::Eligible {
                return verdict;
            }
        }
        Eligibility::Eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Direction, MessageRecord};
    use crate::testkit::{definition, identity, temp_db, text_event};

    fn snapshot(members: &[&str]) -> RoomSnapshot {
        RoomSnapshot {
            room_id: "!room:test.local".to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn direct_rooms_are_always_eligible() {
        assert_eq!(participant_rule(2, false), Eligibility::Eligible);
        assert_eq!(participant_rule(2, true), Eligibility::Eligible);
    }

    #[test]
    fn group_rooms_require_a_mention() {
        assert_eq!(participant_rule(3, false), Eligibility::NotAddressed);
        assert_eq!(participant_rule(4, true), Eligibility::Eligible);
        assert_eq!(participant_rule(40, false), Eligibility::NotAddressed);
    }

    #[test]
    fn rooms_below_two_participants_are_invalid() {
        assert_eq!(
            participant_rule(1, true),
            Eligibility::InvalidRoom { participants: 1 }
        );
        assert_eq!(
            participant_rule(0, false),
            Eligibility::InvalidRoom { participants: 0 }
        );
    }

    #[test]
    fn mention_is_read_from_structured_set() {
        let scout = identity("scout");
        let room = snapshot(&[scout.as_str(), "@alice:test.local", "@bob:test.local"]);
        let plain = text_event("$1", &room.room_id, "@alice:test.local", "scout, you there?", &[], 0);
        let pinged = text_event("$2", &room.room_id, "@alice:test.local", "you there?", &[scout.as_str()], 0);

        let input = |event| EligibilityInput {
            persona_id: "scout",
            identity: &scout,
            room: &room,
            event,
        };
        assert_eq!(DirectOrMention.evaluate(&input(&plain)), Eligibility::NotAddressed);
        assert_eq!(DirectOrMention.evaluate(&input(&pinged)), Eligibility::Eligible);
    }

    #[test]
    fn loop_guard_throttles_after_max_replies() {
        let (_dir, db) = temp_db();
        db.create(&definition("echo")).expect("create");
        let scout = identity("scout");
        let room = snapshot(&[scout.as_str(), "@echo:test.local"]);
        let config = LoopGuardConfig {
            enabled: true,
            window_secs: 300,
            max_replies: 2,
        };
        let chain = PolicyChain::standard(db.clone(), db.clone(), &config);
        let event = text_event("$in", &room.room_id, "@echo:test.local", "again", &[], 0);
        let input = EligibilityInput {
            persona_id: "scout",
            identity: &scout,
            room: &room,
            event: &event,
        };

        assert_eq!(chain.evaluate(&input), Eligibility::Eligible);
        for n in 0..2 {
            db.append(&MessageRecord {
                persona_id: "scout".to_string(),
                event_id: format!("$out{}", n),
                room_id: room.room_id.clone(),
                sender: scout.clone(),
                timestamp: Utc::now(),
                body: "reply".to_string(),
                direction: Direction::Outbound,
                system_generated: false,
            })
            .expect("append");
        }
        assert_eq!(chain.evaluate(&input), Eligibility::Throttled);

        // A human in the same room is still answered.
        let human = text_event("$h", &room.room_id, "@alice:test.local", "hello", &[], 0);
        let from_human = EligibilityInput {
            event: &human,
            ..input
        };
        assert_eq!(chain.evaluate(&from_human), Eligibility::Eligible);

        let disabled = PolicyChain::standard(
            db.clone(),
            db,
            &LoopGuardConfig {
                enabled: false,
                ..config
            },
        );
        assert_eq!(disabled.evaluate(&input), Eligibility::Eligible);
    }
}
