//! Persona definitions and the descriptors they are spawned from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const RANDOM_ID_PREFIX: &str = "persona-";
const MAX_ID_LEN: usize = 64;

/// Durable description of one persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaDefinition {
    /// Storage key and messaging account localpart.
    pub id: String,
    /// Full messaging identity (e.g. `@scout:example.org`).
    pub user_id: String,
    pub display_name: String,
    pub instructions: String,
    #[serde(default)]
    pub traits: BTreeMap<String, serde_json::Value>,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Account password on the messaging backend.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub secret: String,
}

/// Fields that `PersonaStore::update` may change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaPatch {
    pub display_name: Option<String>,
    pub instructions: Option<String>,
    pub traits: Option<BTreeMap<String, serde_json::Value>>,
}

/// What the operator asked for when spawning a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersonaDescriptor {
    Direct(PersonaFields),
    /// Ask the generation backend to invent a persona matching `prompt`.
    Generated { prompt: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaFields {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub traits: BTreeMap<String, serde_json::Value>,
}

impl PersonaDescriptor {
    pub fn direct(id: impl Into<String>) -> Self {
        PersonaDescriptor::Direct(PersonaFields {
            id: id.into(),
            ..PersonaFields::default()
        })
    }
}

/// Shape the generation backend must answer with for `PersonaDescriptor::Generated`.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedPersona {
    #[serde(alias = "username", alias = "handle")]
    pub id: Option<String>,
    #[serde(alias = "display_name")]
    pub name: String,
    #[serde(alias = "system_prompt", alias = "prompt")]
    pub instructions: String,
    #[serde(default)]
    pub traits: BTreeMap<String, serde_json::Value>,
}

impl GeneratedPersona {
    pub fn into_fields(self) -> PersonaFields {
        let id = self.id.unwrap_or_else(|| self.name.clone());
        PersonaFields {
            id,
            display_name: Some(self.name),
            instructions: Some(self.instructions),
            traits: self.traits,
        }
    }
}

pub fn generation_prompt(request: &str) -> String {
    format!(
        "Invent a chat persona for this request: {}\n\n\
         Respond with JSON only:\n\
         {{\n  \
           \"id\": \"short lowercase handle\",\n  \
           \"name\": \"display name\",\n  \
           \"instructions\": \"system prompt written in the second person\",\n  \
           \"traits\": {{ \"trait name\": \"value\" }}\n\
         }}",
        request.trim()
    )
}

/// Lower-cases `raw` and keeps only characters legal in a Matrix localpart.
/// Falls back to a random id when nothing survives.
pub fn sanitize_persona_id(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('@')
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .filter(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | '=' | '-'))
        .take(MAX_ID_LEN)
        .collect();

    let cleaned = cleaned.trim_matches(|c| c == '-' || c == '.').to_string();
    if cleaned.is_empty() {
        random_persona_id()
    } else {
        cleaned
    }
}

pub fn random_persona_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", RANDOM_ID_PREFIX, &hex[..8])
}

pub fn generate_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Pull a JSON value out of an LLM answer that may wrap it in prose,
/// `<think>` blocks or a fenced code block.
pub fn extract_json<T>(response: &str) -> Result<T, serde_json::Error>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response) {
        return Ok(parsed);
    }

    let cleaned = match response.rfind("</think>") {
        Some(end) => &response[end + "</think>".len()..],
        None => response,
    };

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        match after_start.find("```") {
            Some(end) => after_start[..end].trim(),
            None => cleaned,
        }
    } else if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if start < end {
            &cleaned[start..=end]
        } else {
            cleaned
        }
    } else {
        cleaned
    };

    serde_json::from_str::<T>(json_content.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_to_lowercase_localpart() {
        assert_eq!(sanitize_persona_id("Scout"), "scout");
        assert_eq!(sanitize_persona_id("@Night Owl!"), "night-owl");
        assert_eq!(sanitize_persona_id("ana.b_=x-1"), "ana.b_=x-1");
        assert_eq!(sanitize_persona_id("Zoë"), "zo");
    }

    #[test]
    fn empty_after_sanitization_gets_random_id() {
        let id = sanitize_persona_id("!!!");
        assert!(id.starts_with(RANDOM_ID_PREFIX));
        assert_eq!(id.len(), RANDOM_ID_PREFIX.len() + 8);
        assert_ne!(sanitize_persona_id(""), sanitize_persona_id(""));
    }

    #[test]
    fn long_ids_are_truncated() {
        let raw = "a".repeat(200);
        assert_eq!(sanitize_persona_id(&raw).len(), MAX_ID_LEN);
    }

    #[test]
    fn extracts_generated_persona_from_fenced_answer() {
        let answer = "<think>hmm</think>Sure!\n```json\n{\"name\": \"Captain Vale\", \"system_prompt\": \"You are a retired sea captain.\", \"traits\": {\"mood\": \"gruff\"}}\n```";
        let parsed: GeneratedPersona = extract_json(answer).expect("parse");
        let fields = parsed.into_fields();
        assert_eq!(fields.id, "Captain Vale");
        assert_eq!(fields.display_name.as_deref(), Some("Captain Vale"));
        assert_eq!(
            fields.instructions.as_deref(),
            Some("You are a retired sea captain.")
        );
        assert_eq!(fields.traits["mood"], serde_json::json!("gruff"));
    }

    #[test]
    fn rejects_answer_without_instructions() {
        let parsed = extract_json::<GeneratedPersona>("{\"name\": \"x\"}");
        assert!(parsed.is_err());
    }

    #[test]
    fn secret_is_not_serialized() {
        let now = Utc::now();
        let def = PersonaDefinition {
            id: "scout".into(),
            user_id: "@scout:localhost".into(),
            display_name: "Scout".into(),
            instructions: "Be brief.".into(),
            traits: BTreeMap::new(),
            creator: "operator".into(),
            created_at: now,
            updated_at: now,
            secret: "hunter2".into(),
        };
        let json = serde_json::to_string(&def).expect("serialize");
        assert!(!json.contains("hunter2"));
    }
}
