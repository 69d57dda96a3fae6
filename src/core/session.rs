use serde::{Deserialize, Serialize};

use crate::core::constants::DEFAULT_TOPIC;
use crate::core::mask::Mask;
use crate::core::message::{next_id, ChatMessage};

/// Rolling counters over a session's whole history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStat {
    #[serde(default)]
    pub token_count: usize,
    #[serde(default)]
    pub word_count: usize,
    #[serde(default)]
    pub char_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub topic: String,
    /// Model-generated compaction of older turns, sent in place of the full
    /// history when memory is enabled.
    #[serde(default)]
    pub memory_prompt: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stat: SessionStat,
    /// Unix millis of the last mutation.
    #[serde(default)]
    pub last_update: i64,
    /// Number of messages already folded into `memory_prompt`.
    #[serde(default)]
    pub last_summarize_index: usize,
    /// Legacy boundary index; superseded by per-message `be_clear` flags but
    /// still honored as a fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_context_index: Option<usize>,
    pub mask: Mask,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Default for Session {
    fn default() -> Self {
        Self {
            id: next_id(),
            topic: DEFAULT_TOPIC.to_string(),
            memory_prompt: String::new(),
            messages: Vec::new(),
            stat: SessionStat::default(),
            last_update: now_millis(),
            last_summarize_index: 0,
            clear_context_index: None,
            mask: Mask::default(),
        }
    }
}

impl Session {
    pub fn new(mask: Mask) -> Self {
        Self {
            mask,
            ..Default::default()
        }
    }

    pub fn touch(&mut self) {
        self.last_update = now_millis();
    }

    /// Clamp index fields back into range. Called from the store's mutation
    /// choke point after every update.
    pub fn clamp_indices(&mut self) {
        let len = self.messages.len();
        if self.last_summarize_index > len {
            self.last_summarize_index = len;
        }
        if let Some(index) = self.clear_context_index {
            if index > len {
                self.clear_context_index = Some(len);
            }
        }
    }

    /// The boundary before which history is excluded from requests: the most
    /// recent `be_clear` flag wins, otherwise the stored legacy index.
    pub fn clear_boundary(&self) -> usize {
        self.messages
            .iter()
            .rposition(|msg| msg.be_clear)
            .map(|index| index + 1)
            .unwrap_or_else(|| self.clear_context_index.unwrap_or(0))
    }

    /// Duplicate this session with fresh session and message identifiers.
    /// Content, ordering, topic, and mask carry over unchanged.
    pub fn duplicate(&self) -> Session {
        let mut copy = self.clone();
        copy.id = next_id();
        copy.last_update = now_millis();
        for message in &mut copy.messages {
            message.id = next_id();
        }
        copy
    }
}
