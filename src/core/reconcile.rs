//! Streaming response reconciliation
//!
//! Applies stream events in arrival order to the assistant message they
//! belong to. Every delta writes through the store; finish finalizes the
//! message and records statistics; errors are appended in-band and only
//! flag the message when the cause was not a user abort.

use std::time::Instant;

use tracing::debug;

use crate::core::chat_stream::StreamEvent;
use crate::core::controller::RequestKey;
use crate::core::estimator::TokenEstimator;
use crate::core::message::{now_rfc3339, MessageStatistic};
use crate::core::store::SessionStore;

/// What the embedder should do after applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// More events are expected.
    Streaming,
    /// The response completed; summarization may now be worth running.
    Finished,
    /// The response terminated on an error (including user aborts).
    Failed,
    /// The event did not match a live streaming message and was dropped.
    Ignored,
}

fn is_abort(error_text: &str) -> bool {
    error_text.contains("aborted")
}

impl SessionStore {
    /// Apply one stream event to the message identified by `key`.
    ///
    /// Events for messages that are no longer streaming are dropped; that
    /// covers the `End` following an `Error` as well as stragglers arriving
    /// after cancellation.
    pub fn apply_stream_event(&mut self, key: &RequestKey, event: StreamEvent) -> StreamOutcome {
        let streaming = self
            .session_by_id(&key.session_id)
            .and_then(|session| session.messages.iter().find(|m| m.id == key.message_id))
            .map(|message| message.streaming)
            .unwrap_or(false);
        if !streaming {
            return StreamOutcome::Ignored;
        }

        match event {
            StreamEvent::Delta(chunk) => {
                if let Some(timing) = self.timings.get_mut(key) {
                    timing.first_token.get_or_insert_with(Instant::now);
                }
                self.update_target_session(&key.session_id, |session| {
                    if let Some(message) =
                        session.messages.iter_mut().find(|m| m.id == key.message_id)
                    {
                        message.content.push_text(&chunk);
                    }
                });
                StreamOutcome::Streaming
            }
            StreamEvent::End => {
                let statistic = self.finish_statistic(key);
                self.update_target_session(&key.session_id, |session| {
                    if let Some(message) =
                        session.messages.iter_mut().find(|m| m.id == key.message_id)
                    {
                        message.streaming = false;
                        message.date = now_rfc3339();
                        message.statistic = Some(statistic);
                    }
                });
                self.after_stream(key);
                debug!(session = %key.session_id, message = %key.message_id, "stream finished");
                StreamOutcome::Finished
            }
            StreamEvent::Error(text) => {
                let aborted = is_abort(&text);
                self.update_target_session(&key.session_id, |session| {
                    if let Some(message) =
                        session.messages.iter_mut().find(|m| m.id == key.message_id)
                    {
                        message.streaming = false;
                        message.date = now_rfc3339();
                        if !message.content.is_empty() {
                            message.content.push_text("\n\n");
                        }
                        message.content.push_text(&text);
                        if !aborted {
                            message.is_error = true;
                        }
                    }
                });
                self.after_stream(key);
                debug!(session = %key.session_id, message = %key.message_id, aborted, "stream errored");
                StreamOutcome::Failed
            }
        }
    }

    /// Completion statistics for a finishing request: estimated completion
    /// tokens plus first-token and total latencies.
    fn finish_statistic(&mut self, key: &RequestKey) -> MessageStatistic {
        let content_tokens = self
            .session_by_id(&key.session_id)
            .and_then(|session| session.messages.iter().find(|m| m.id == key.message_id))
            .map(|message| self.estimator.estimate(&message.content.as_text()) as u64);
        let timing = self.timings.get(key);
        MessageStatistic {
            completion_tokens: content_tokens,
            first_token_latency_ms: timing.and_then(|t| {
                t.first_token
                    .map(|at| at.duration_since(t.started).as_millis() as u64)
            }),
            total_latency_ms: timing.map(|t| t.started.elapsed().as_millis() as u64),
            reasoning_latency_ms: None,
            searching_latency_ms: None,
        }
    }

    /// Terminal cleanup, run exactly once per request: controller
    /// deregistration, timing teardown, and the session stat refresh.
    fn after_stream(&mut self, key: &RequestKey) {
        self.controller_pool().remove(key);
        self.timings.remove(key);
        let token_count = self
            .session_by_id(&key.session_id)
            .map(|session| {
                session
                    .messages
                    .iter()
                    .map(|m| self.estimator.estimate(&m.content.as_text()))
                    .sum::<usize>()
            })
            .unwrap_or(0);
        self.update_target_session(&key.session_id, |session| {
            session.stat.token_count = token_count;
            session.stat.char_count = session
                .messages
                .iter()
                .map(|m| m.content.as_text().chars().count())
                .sum();
            session.stat.word_count = session
                .messages
                .iter()
                .map(|m| m.content.as_text().split_whitespace().count())
                .sum();
        });
    }

    /// Append an already-finalized assistant reply, bypassing streaming.
    /// Used by tests and by embedders that receive non-streamed responses.
    pub fn apply_complete_reply(&mut self, key: &RequestKey, content: &str) -> StreamOutcome {
        let outcome = self.apply_stream_event(key, StreamEvent::Delta(content.to_string()));
        if outcome != StreamOutcome::Streaming {
            return outcome;
        }
        self.apply_stream_event(key, StreamEvent::End)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chat_stream::{format_api_error, ChatStreamService, ProviderEndpoint};
    use crate::core::config::AppConfig;

    fn endpoint() -> ProviderEndpoint {
        ProviderEndpoint {
            client: reqwest::Client::new(),
            base_url: "http://127.0.0.1:1/v1".to_string(),
            api_key: "test".to_string(),
            provider_name: "openai".to_string(),
        }
    }

    fn store_with_inflight() -> (SessionStore, RequestKey) {
        let mut store = SessionStore::new(AppConfig::default());
        let (service, _rx) = ChatStreamService::new();
        let key = store.on_user_input("Hello", Vec::new(), Vec::new(), &endpoint(), &service);
        (store, key)
    }

    #[tokio::test]
    async fn deltas_accumulate_then_end_finalizes() {
        let (mut store, key) = store_with_inflight();

        assert_eq!(
            store.apply_stream_event(&key, StreamEvent::Delta("Hi ".to_string())),
            StreamOutcome::Streaming
        );
        assert_eq!(
            store.apply_stream_event(&key, StreamEvent::Delta("there".to_string())),
            StreamOutcome::Streaming
        );
        assert_eq!(
            store.apply_stream_event(&key, StreamEvent::End),
            StreamOutcome::Finished
        );

        let assistant = &store.current_session().messages[1];
        assert!(!assistant.streaming);
        assert!(!assistant.is_error);
        assert_eq!(assistant.content.as_text(), "Hi there");
        let stat = assistant.statistic.as_ref().expect("statistic recorded");
        assert!(stat.completion_tokens.is_some());
        assert!(stat.first_token_latency_ms.is_some());
        assert!(stat.total_latency_ms.is_some());
        assert!(!store.controller_pool().contains(&key));
    }

    #[tokio::test]
    async fn error_flags_message_and_deregisters() {
        let (mut store, key) = store_with_inflight();
        let error = format_api_error(r#"{"error":{"message":"model overloaded"}}"#);

        assert_eq!(
            store.apply_stream_event(&key, StreamEvent::Error(error)),
            StreamOutcome::Failed
        );
        // The End the transport sends after an error is dropped.
        assert_eq!(
            store.apply_stream_event(&key, StreamEvent::End),
            StreamOutcome::Ignored
        );

        let session = store.current_session();
        let assistant = &session.messages[1];
        assert!(!assistant.streaming);
        assert!(assistant.is_error);
        assert!(assistant.content.as_text().contains("model overloaded"));
        assert!(!session.messages[0].is_error);
        assert!(!store.controller_pool().contains(&key));
    }

    #[tokio::test]
    async fn abort_is_not_an_error() {
        let (mut store, key) = store_with_inflight();
        store.apply_stream_event(&key, StreamEvent::Delta("partial".to_string()));

        let aborted = format_api_error(r#"{"message":"aborted"}"#);
        assert_eq!(
            store.apply_stream_event(&key, StreamEvent::Error(aborted)),
            StreamOutcome::Failed
        );

        let session = store.current_session();
        let assistant = &session.messages[1];
        assert!(!assistant.is_error);
        assert!(!session.messages[0].is_error);
        assert!(assistant.content.as_text().starts_with("partial"));
        assert!(assistant.content.as_text().contains("aborted"));
    }

    #[tokio::test]
    async fn partial_content_is_kept_on_error() {
        let (mut store, key) = store_with_inflight();
        store.apply_stream_event(&key, StreamEvent::Delta("half an ans".to_string()));
        let error = format_api_error("connection reset");
        store.apply_stream_event(&key, StreamEvent::Error(error));

        let assistant = &store.current_session().messages[1];
        let text = assistant.content.as_text();
        assert!(text.starts_with("half an ans"));
        assert!(text.contains("connection reset"));
    }

    #[tokio::test]
    async fn events_for_unknown_keys_are_ignored() {
        let mut store = SessionStore::new(AppConfig::default());
        let key = RequestKey::new("nope", "nothing");
        assert_eq!(
            store.apply_stream_event(&key, StreamEvent::Delta("x".to_string())),
            StreamOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn finish_updates_session_stat() {
        let (mut store, key) = store_with_inflight();
        store.apply_complete_reply(&key, "four words were here");
        let stat = &store.current_session().stat;
        assert!(stat.token_count > 0);
        assert!(stat.word_count >= 4);
    }
}
