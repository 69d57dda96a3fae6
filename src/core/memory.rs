//! Request context assembly
//!
//! Produces the exact ordered message list sent to the provider for one
//! turn: synthesized system prompt, long-term memory, the mask's pinned
//! context, then the short-term history window in chronological order. The
//! caller appends the new user message.

use tracing::debug;

use crate::core::config::AppConfig;
use crate::core::constants::DEFAULT_SYSTEM_TEMPLATE;
use crate::core::estimator::TokenEstimator;
use crate::core::mask::ModelConfig;
use crate::core::message::ChatMessage;
use crate::core::session::Session;
use crate::core::template::fill_system_template;

/// Model families that expect a synthesized system prompt.
fn wants_system_prompt(model: &str) -> bool {
    model.starts_with("gpt-") || model.starts_with("chatgpt-")
}

/// Resolve the generation parameters in effect for a session.
pub fn effective_model_config(session: &Session, app: &AppConfig) -> ModelConfig {
    session.mask.merged_with_global(&app.model_config)
}

fn long_term_memory_message(session: &Session) -> ChatMessage {
    ChatMessage::system(format!(
        "This is a summary of the chat history as a recap: {}",
        session.memory_prompt
    ))
}

pub fn build_request_messages(
    session: &Session,
    app: &AppConfig,
    estimator: &dyn TokenEstimator,
) -> Vec<ChatMessage> {
    let model_config = effective_model_config(session, app);
    let messages = &session.messages;
    let total = messages.len();
    let clear_boundary = session.clear_boundary();

    let mut assembled: Vec<ChatMessage> = Vec::new();

    if app.inject_system_prompts
        && model_config.enable_inject_system_prompts
        && wants_system_prompt(&model_config.model)
    {
        assembled.push(ChatMessage::system(fill_system_template(
            DEFAULT_SYSTEM_TEMPLATE,
            &model_config,
        )));
    }

    let send_memory = model_config.send_memory
        && !session.memory_prompt.is_empty()
        && session.last_summarize_index > clear_boundary;
    if send_memory {
        assembled.push(long_term_memory_message(session));
    }

    assembled.extend(session.mask.context.iter().cloned());

    let long_term_start = if send_memory {
        session.last_summarize_index
    } else {
        total
    };
    let short_term_start = total.saturating_sub(model_config.history_message_count);
    let start = clear_boundary.max(long_term_start.min(short_term_start));

    // Walk backward, skipping errored messages. The token total is
    // informational only; inclusion is not truncated by it.
    let mut recent: Vec<ChatMessage> = Vec::new();
    let mut token_total = 0usize;
    for index in (start..total).rev() {
        let message = &messages[index];
        if message.is_error {
            continue;
        }
        token_total += estimator.estimate(&message.content.as_text());
        recent.push(message.clone());
    }
    recent.reverse();
    debug!(
        session = %session.id,
        start,
        included = recent.len(),
        token_total,
        "assembled request context"
    );

    assembled.extend(recent);
    assembled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::estimator::HeuristicEstimator;
    use crate::core::message::{ChatRole, MessageContent};

    fn session_with(texts: &[&str]) -> Session {
        let mut session = Session::default();
        for (i, text) in texts.iter().enumerate() {
            let mut msg = if i % 2 == 0 {
                ChatMessage::user(*text)
            } else {
                ChatMessage::assistant(*text)
            };
            msg.content = MessageContent::Text(text.to_string());
            session.messages.push(msg);
        }
        session
    }

    fn app_without_injection() -> AppConfig {
        AppConfig {
            inject_system_prompts: false,
            ..Default::default()
        }
    }

    fn texts(messages: &[ChatMessage]) -> Vec<String> {
        messages.iter().map(|m| m.content.as_text()).collect()
    }

    #[test]
    fn be_clear_flag_excludes_older_history() {
        let mut session = session_with(&["u1", "a1", "u2", "a2", "u3"]);
        session.messages[2].be_clear = true;
        session.mask.model_config.history_message_count = 10;
        session.mask.sync_global_config = false;

        let out = build_request_messages(
            &session,
            &app_without_injection(),
            &HeuristicEstimator,
        );
        assert_eq!(texts(&out), vec!["a2", "u3"]);
    }

    #[test]
    fn errored_messages_are_skipped() {
        let mut session = session_with(&["u1", "a1", "u2"]);
        session.messages[1].is_error = true;
        session.mask.model_config.history_message_count = 10;
        session.mask.sync_global_config = false;

        let out = build_request_messages(
            &session,
            &app_without_injection(),
            &HeuristicEstimator,
        );
        assert_eq!(texts(&out), vec!["u1", "u2"]);
    }

    #[test]
    fn short_term_window_limits_history() {
        let mut session = session_with(&["u1", "a1", "u2", "a2", "u3"]);
        session.mask.model_config.history_message_count = 2;
        session.mask.sync_global_config = false;

        let out = build_request_messages(
            &session,
            &app_without_injection(),
            &HeuristicEstimator,
        );
        assert_eq!(texts(&out), vec!["a2", "u3"]);
    }

    #[test]
    fn memory_prompt_is_sent_when_newer_than_clear_boundary() {
        let mut session = session_with(&["u1", "a1", "u2", "a2"]);
        session.memory_prompt = "earlier we discussed ownership".to_string();
        session.last_summarize_index = 2;
        session.mask.model_config.history_message_count = 2;
        session.mask.sync_global_config = false;

        let out = build_request_messages(
            &session,
            &app_without_injection(),
            &HeuristicEstimator,
        );
        assert_eq!(out[0].role, ChatRole::System);
        assert!(out[0]
            .content
            .as_text()
            .contains("earlier we discussed ownership"));
        assert_eq!(texts(&out[1..]), vec!["u2", "a2"]);
    }

    #[test]
    fn memory_prompt_behind_clear_boundary_is_dropped() {
        let mut session = session_with(&["u1", "a1", "u2", "a2"]);
        session.memory_prompt = "stale".to_string();
        session.last_summarize_index = 2;
        session.messages[2].be_clear = true;
        session.mask.model_config.history_message_count = 10;
        session.mask.sync_global_config = false;

        let out = build_request_messages(
            &session,
            &app_without_injection(),
            &HeuristicEstimator,
        );
        assert_eq!(texts(&out), vec!["a2"]);
    }

    #[test]
    fn pinned_context_precedes_history() {
        let mut session = session_with(&["u1"]);
        session.mask.context.push(ChatMessage::system("pinned"));
        session.mask.sync_global_config = false;
        session.mask.model_config.history_message_count = 10;

        let out = build_request_messages(
            &session,
            &app_without_injection(),
            &HeuristicEstimator,
        );
        assert_eq!(texts(&out), vec!["pinned", "u1"]);
    }

    #[test]
    fn gpt_family_gets_synthesized_system_prompt() {
        let mut session = session_with(&["u1"]);
        session.mask.sync_global_config = false;
        session.mask.model_config.model = "gpt-4o-mini".to_string();

        let out =
            build_request_messages(&session, &AppConfig::default(), &HeuristicEstimator);
        assert_eq!(out[0].role, ChatRole::System);
        assert!(out[0].content.as_text().contains("gpt-4o-mini"));
    }

    #[test]
    fn non_gpt_family_gets_no_system_prompt() {
        let mut session = session_with(&["u1"]);
        session.mask.sync_global_config = false;
        session.mask.model_config.model = "claude-3-5-sonnet".to_string();

        let out =
            build_request_messages(&session, &AppConfig::default(), &HeuristicEstimator);
        assert_eq!(texts(&out), vec!["u1"]);
    }
}
