//! Turns a persona's room history into the bounded prompt sent for generation.

use crate::llm_client::ChatMessage;
use crate::persona::PersonaDefinition;
use crate::store::{MessageLog, MessageRecord, PersonaStore, StoreResult};

#[derive(Debug, Clone)]
pub struct ContextOptions<'a> {
    pub max_history: usize,
    /// The primary persona keeps command traffic and system replies in view.
    pub is_primary: bool,
    pub command_prefix: char,
    pub fallback_instructions: &'a str,
    /// Left out of the window so the caller can append it as the final turn.
    pub exclude_event_id: Option<&'a str>,
}

/// Build the context window from a snapshot of records. Pure: the same
/// definition, records and options always give the same messages.
pub fn build_context(
    definition: &PersonaDefinition,
    records: &[MessageRecord],
    options: &ContextOptions<'_>,
) -> Vec<ChatMessage> {
    let instructions = if definition.instructions.trim().is_empty() {
        options.fallback_instructions
    } else {
        definition.instructions.as_str()
    };

    let mut window: Vec<&MessageRecord> = records
        .iter()
        .filter(|r| Some(r.event_id.as_str()) != options.exclude_event_id)
        .filter(|r| {
            options.is_primary
                || !(r.system_generated || r.body.trim_start().starts_with(options.command_prefix))
        })
        .collect();
    window.sort_by_key(|r| r.timestamp);

    let skip = window.len().saturating_sub(options.max_history);

    let mut messages = Vec::with_capacity(window.len() - skip + 1);
    messages.push(ChatMessage::system(instructions));
    messages.extend(window.into_iter().skip(skip).map(|r| {
        if r.sender == definition.user_id {
            ChatMessage::assistant(r.body.clone())
        } else {
            ChatMessage::user(r.body.clone())
        }
    }));
    messages
}

/// Read the definition and room history, then [`build_context`].
pub fn load_context(
    store: &dyn PersonaStore,
    log: &dyn MessageLog,
    persona_id: &str,
    room_id: &str,
    options: &ContextOptions<'_>,
) -> StoreResult<Vec<ChatMessage>> {
    let definition = store.read(persona_id)?;
    let records = log.query(persona_id, room_id)?;
    Ok(build_context(&definition, &records, options))
}
