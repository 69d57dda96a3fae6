use serde::{Deserialize, Serialize};

use crate::core::constants::DEFAULT_INPUT_TEMPLATE;
use crate::core::message::{next_id, ChatMessage};

/// Per-session generation parameters, owned by the session's mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Size of the short-term history window.
    #[serde(default = "default_history_message_count")]
    pub history_message_count: usize,
    /// Estimated-token threshold above which compaction fires.
    #[serde(default = "default_compress_threshold")]
    pub compress_message_length_threshold: usize,
    /// Model used for background summarization; falls back to `model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress_model: Option<String>,
    #[serde(default = "default_true")]
    pub send_memory: bool,
    #[serde(default = "default_true")]
    pub enable_inject_system_prompts: bool,
    #[serde(default = "default_template")]
    pub template: String,
}

fn default_temperature() -> f32 {
    0.5
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_history_message_count() -> usize {
    4
}

fn default_compress_threshold() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_template() -> String {
    DEFAULT_INPUT_TEMPLATE.to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            provider_name: "openai".to_string(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            history_message_count: default_history_message_count(),
            compress_message_length_threshold: default_compress_threshold(),
            compress_model: None,
            send_memory: true,
            enable_inject_system_prompts: true,
            template: default_template(),
        }
    }
}

/// A reusable named configuration bundle applied to a session: persona
/// metadata, pinned context messages, and a model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    /// Pinned example messages prepended to every request for the session.
    /// Invisible to "clear history".
    #[serde(default)]
    pub context: Vec<ChatMessage>,
    pub model_config: ModelConfig,
    /// When set, the mask tracks the process-wide default model config
    /// instead of carrying its own overrides.
    #[serde(default = "default_true")]
    pub sync_global_config: bool,
    #[serde(default)]
    pub hide_context: bool,
}

impl Default for Mask {
    fn default() -> Self {
        Self {
            id: next_id(),
            name: String::new(),
            avatar: String::new(),
            context: Vec::new(),
            model_config: ModelConfig::default(),
            sync_global_config: true,
            hide_context: false,
        }
    }
}

impl Mask {
    /// Merge global defaults under this mask's overrides, used when a new
    /// session is seeded from a mask that syncs with the global config.
    pub fn merged_with_global(&self, global: &ModelConfig) -> ModelConfig {
        if self.sync_global_config {
            global.clone()
        } else {
            self.model_config.clone()
        }
    }
}
