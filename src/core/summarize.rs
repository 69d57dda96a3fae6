//! Background summarization
//!
//! Two independent, guarded triggers run after a response finishes: topic
//! generation for untitled conversations and compaction of
//! not-yet-summarized history into the session's memory prompt. Both go
//! through a non-streamed completion against the compress model.

use regex::Regex;
use tracing::{debug, warn};

use crate::api::WireMessage;
use crate::core::chat_stream::{complete, ProviderEndpoint};
use crate::core::constants::{
    DEFAULT_TOPIC, SUMMARIZE_MIN_LEN, SUMMARIZE_PROMPT, TOPIC_PROMPT, TOPIC_WINDOW_TOKENS,
};
use crate::core::estimator::{estimate_messages, TokenEstimator};
use crate::core::mask::ModelConfig;
use crate::core::memory::effective_model_config;
use crate::core::message::ChatMessage;
use crate::core::session::Session;
use crate::core::store::{wire_message, SessionStore};

/// Remove `<think>...</think>` segments from assistant output before it is
/// fed back into a summarization request.
pub fn strip_thinking(text: &str) -> String {
    // Unwrap is safe for a fixed pattern; kept out of the hot path anyway.
    let pattern = Regex::new(r"(?s)<think>.*?</think>").expect("valid thinking pattern");
    pattern.replace_all(text, "").trim_start().to_string()
}

/// A reply wrapped in a fenced block that parses as JSON carrying an
/// `error` field is an error payload smuggled through a 200, not a usable
/// summary.
pub fn is_valid_model_reply(reply: &str) -> bool {
    let trimmed = reply.trim();
    let Some(inner) = trimmed
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    else {
        return true;
    };
    // Skip the info string on the opening fence, if any.
    let body = match inner.split_once('\n') {
        Some((_, rest)) => rest,
        None => inner,
    };
    match serde_json::from_str::<serde_json::Value>(body.trim()) {
        Ok(value) => value.get("error").is_none(),
        Err(_) => true,
    }
}

/// Normalize a generated topic: drop wrapping quotes and trailing
/// punctuation.
pub fn trim_topic(reply: &str) -> String {
    reply
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’'))
        .trim_end_matches(|c: char| matches!(c, '.' | '。' | '!' | '！' | '?' | '？' | ',' | '，'))
        .trim()
        .to_string()
}

/// Title generation fires only for still-untitled sessions that have grown
/// past the minimum size.
pub fn should_generate_title(
    session: &Session,
    auto_generate: bool,
    estimator: &dyn TokenEstimator,
) -> bool {
    auto_generate
        && session.topic == DEFAULT_TOPIC
        && estimate_messages(estimator, &session.messages) > SUMMARIZE_MIN_LEN
}

/// Messages eligible for compaction: everything after the later of the
/// summarize index and the clear boundary, minus errored messages.
pub fn compaction_candidates(session: &Session) -> Vec<ChatMessage> {
    let start = session.last_summarize_index.max(session.clear_boundary());
    session.messages[start.min(session.messages.len())..]
        .iter()
        .filter(|message| !message.is_error)
        .cloned()
        .collect()
}

pub fn needs_compaction(
    session: &Session,
    model_config: &ModelConfig,
    estimator: &dyn TokenEstimator,
) -> bool {
    if !model_config.send_memory {
        return false;
    }
    let candidates = compaction_candidates(session);
    estimate_messages(estimator, &candidates) > model_config.compress_message_length_threshold
}

/// Recent window sent with a title request, bounded by a token budget and
/// with thinking segments stripped from assistant turns.
fn title_window(session: &Session, estimator: &dyn TokenEstimator) -> Vec<WireMessage> {
    let mut window: Vec<WireMessage> = Vec::new();
    let mut token_total = 0usize;
    for message in session.messages.iter().rev() {
        if message.is_error {
            continue;
        }
        let mut text = message.content.as_text();
        if message.role.is_assistant() {
            text = strip_thinking(&text);
        }
        token_total += estimator.estimate(&text);
        window.push(WireMessage::text(message.role.as_str(), text));
        if token_total > TOPIC_WINDOW_TOKENS {
            break;
        }
    }
    window.reverse();
    window
}

impl SessionStore {
    pub(crate) fn adopt_topic(&mut self, session_id: &str, reply: &str) {
        let topic = trim_topic(reply);
        let topic = if topic.is_empty() {
            DEFAULT_TOPIC.to_string()
        } else {
            topic
        };
        self.update_target_session(session_id, |session| session.topic = topic);
    }

    /// Store a compaction reply. The summarize index advances to the
    /// message count captured when the request was dispatched, so messages
    /// appended while the request was in flight stay outside the compacted
    /// range.
    pub(crate) fn adopt_memory_prompt(
        &mut self,
        session_id: &str,
        reply: String,
        index_at_dispatch: usize,
    ) {
        self.update_target_session(session_id, |session| {
            session.memory_prompt = reply;
            session.last_summarize_index = index_at_dispatch;
        });
    }

    /// Run both summarization triggers for a session. Intended to be called
    /// opportunistically after a response finishes; both triggers are
    /// guarded so redundant calls are cheap no-ops.
    pub async fn summarize_session(
        &mut self,
        session_id: &str,
        refresh_title: bool,
        endpoint: &ProviderEndpoint,
    ) {
        let Some(session) = self.session_by_id(session_id) else {
            return;
        };
        let model_config = effective_model_config(session, &self.config);
        let compress_model = model_config
            .compress_model
            .clone()
            .unwrap_or_else(|| model_config.model.clone());

        let wants_title = refresh_title
            || should_generate_title(
                session,
                self.config.enable_auto_generate_title,
                self.estimator.as_ref(),
            );
        let title_request = if wants_title {
            let mut window = title_window(session, self.estimator.as_ref());
            window.push(WireMessage::text("user", TOPIC_PROMPT));
            Some(window)
        } else {
            None
        };

        if let Some(window) = title_request {
            match complete(endpoint, &compress_model, window, None).await {
                Ok(reply) if is_valid_model_reply(&reply) => {
                    self.adopt_topic(session_id, &reply);
                }
                Ok(reply) => {
                    warn!(session = %session_id, %reply, "discarded invalid title reply");
                }
                Err(err) => {
                    warn!(session = %session_id, "title generation failed: {err}");
                }
            }
        }

        let Some(session) = self.session_by_id(session_id) else {
            return;
        };
        if !needs_compaction(session, &model_config, self.estimator.as_ref()) {
            return;
        }

        let mut candidates = compaction_candidates(session);
        if candidates.len() > model_config.history_message_count {
            let skip = candidates.len() - model_config.history_message_count;
            candidates.drain(..skip);
        }

        let mut request: Vec<WireMessage> = Vec::new();
        if !session.memory_prompt.is_empty() {
            request.push(WireMessage::text(
                "system",
                format!(
                    "This is a summary of the chat history as a recap: {}",
                    session.memory_prompt
                ),
            ));
        }
        request.extend(candidates.iter().map(wire_message));
        request.push(WireMessage::text("system", SUMMARIZE_PROMPT));

        let index_at_dispatch = session.messages.len();

        match complete(
            endpoint,
            &compress_model,
            request,
            Some(model_config.max_tokens),
        )
        .await
        {
            Ok(reply) if is_valid_model_reply(&reply) && !reply.trim().is_empty() => {
                self.adopt_memory_prompt(session_id, reply, index_at_dispatch);
            }
            Ok(_) => {
                // Invalid compaction replies are dropped silently.
                debug!(session = %session_id, "discarded invalid memory reply");
            }
            Err(err) => {
                debug!(session = %session_id, "memory compaction failed: {err}");
            }
        }
    }
}
