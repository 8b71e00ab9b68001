use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Ping-pong throttle applied after the DM/mention rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopGuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_loop_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_loop_max_replies")]
    pub max_replies: usize,
}

fn default_true() -> bool {
    true
}

fn default_loop_window_secs() -> u64 {
    60
}

fn default_loop_max_replies() -> usize {
    6
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_loop_window_secs(),
            max_replies: default_loop_max_replies(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    // Matrix homeserver (client-server API + Synapse admin API)
    #[serde(default = "default_homeserver_url")]
    pub homeserver_url: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub admin_token: Option<String>,

    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_image_size")]
    pub image_size: String,

    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Dispatch
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default)]
    pub primary_persona: Option<String>,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: char,
    #[serde(default = "default_fallback_instructions")]
    pub fallback_instructions: String,
    #[serde(default)]
    pub loop_guard: LoopGuardConfig,

    // Session supervision
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_true")]
    pub auto_join_invites: bool,

    // Spawning
    #[serde(default = "default_creator")]
    pub creator: String,
}

fn default_homeserver_url() -> String {
    "http://localhost:8008".to_string()
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    800
}

fn default_image_model() -> String {
    "dall-e-3".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_database_path() -> String {
    "chorus_fleet.db".to_string()
}

fn default_max_history() -> usize {
    20
}

fn default_command_prefix() -> char {
    '!'
}

fn default_fallback_instructions() -> String {
    "You are a friendly participant in a group chat. \
     Keep replies short, stay in character and answer the latest message."
        .to_string()
}

fn default_receive_timeout_secs() -> u64 {
    30
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_creator() -> String {
    "operator".to_string()
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            homeserver_url: default_homeserver_url(),
            server_name: default_server_name(),
            admin_token: None,
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            image_model: default_image_model(),
            image_size: default_image_size(),
            database_path: default_database_path(),
            max_history: default_max_history(),
            primary_persona: None,
            command_prefix: default_command_prefix(),
            fallback_instructions: default_fallback_instructions(),
            loop_guard: LoopGuardConfig::default(),
            receive_timeout_secs: default_receive_timeout_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            auto_join_invites: true,
            creator: default_creator(),
        }
    }
}

impl FleetConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `CHORUS_CONFIG` if set, otherwise chorus_config.toml next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("CHORUS_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join("chorus_config.toml"),
        }
    }

    /// Load config from the config file, falling back to defaults + env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<FleetConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("MATRIX_HOMESERVER_URL") {
            config.homeserver_url = url;
        }

        if let Ok(name) = env::var("MATRIX_SERVER_NAME") {
            config.server_name = name;
        }

        if let Ok(token) = env::var("MATRIX_ADMIN_TOKEN") {
            if !token.trim().is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(path) = env::var("CHORUS_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(id) = env::var("CHORUS_PRIMARY_PERSONA") {
            if !id.trim().is_empty() {
                config.primary_persona = Some(id.trim().to_string());
            }
        }

        if let Ok(value) = env::var("CHORUS_MAX_HISTORY") {
            if let Ok(max) = value.parse() {
                config.max_history = max;
            }
        }

        if let Ok(value) = env::var("CHORUS_RECEIVE_TIMEOUT_SECS") {
            if let Ok(secs) = value.parse() {
                config.receive_timeout_secs = secs;
            }
        }

        if let Ok(enabled) = env::var("CHORUS_LOOP_GUARD") {
            config.loop_guard.enabled = parse_flag(&enabled);
        }

        if let Ok(enabled) = env::var("CHORUS_AUTO_JOIN") {
            config.auto_join_invites = parse_flag(&enabled);
        }

        config
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}

fn parse_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}
