//! The session store
//!
//! Owns every session and is the single writer over them. All mutation
//! flows through [`SessionStore::update_target_session`] (identity lookup,
//! invariant clamping, write-through persistence); external code never
//! touches the session array directly. Index-based operations exist only
//! where the operation is inherently positional (select, move, delete).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::api::{WireContent, WireImageUrl, WireMessage, WirePart};
use crate::core::chat_stream::{
    format_api_error, ChatStreamService, ProviderEndpoint, StreamParams,
};
use crate::core::config::AppConfig;
use crate::core::constants::{DELETE_UNDO_WINDOW_SECS, STALE_STREAM_TIMEOUT_SECS};
use crate::core::controller::{ControllerPool, RequestKey};
use crate::core::estimator::{HeuristicEstimator, TokenEstimator};
use crate::core::mask::Mask;
use crate::core::memory::{build_request_messages, effective_model_config};
use crate::core::message::{ChatMessage, ContentPart, MessageContent};
use crate::core::persistence::{PersistedState, StorePersistence};
use crate::core::session::Session;
use crate::core::template::fill_template;

/// An image attached to a user message: a remote URL or a data URL produced
/// by the embedder's upload transport.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub url: String,
}

impl ImageAttachment {
    /// Build a data-URL attachment from raw bytes, for upload transports
    /// that inline content instead of hosting it.
    pub fn from_bytes(content_type: &str, bytes: &[u8]) -> Self {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self {
            url: format!("data:{content_type};base64,{encoded}"),
        }
    }
}

/// A file attached to a user message. `content` is the extracted text that
/// gets inlined for the model; `url` is the compact reference the UI shows.
#[derive(Debug, Clone)]
pub struct FileAttachment {
    pub name: String,
    pub url: String,
    pub content: String,
    pub content_type: Option<String>,
}

pub(crate) struct StreamTiming {
    pub started: Instant,
    pub first_token: Option<Instant>,
}

struct DeleteUndo {
    sessions: Vec<Session>,
    current_index: usize,
    at: Instant,
}

pub struct SessionStore {
    pub(crate) sessions: Vec<Session>,
    pub(crate) current_index: usize,
    last_input: String,
    pub(crate) config: AppConfig,
    pub(crate) estimator: Arc<dyn TokenEstimator>,
    pool: Arc<ControllerPool>,
    persistence: Option<StorePersistence>,
    pending_undo: Option<DeleteUndo>,
    pub(crate) timings: HashMap<RequestKey, StreamTiming>,
}

impl SessionStore {
    pub fn new(config: AppConfig) -> Self {
        Self::with_estimator(config, Arc::new(HeuristicEstimator))
    }

    pub fn with_estimator(config: AppConfig, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            sessions: vec![Session::default()],
            current_index: 0,
            last_input: String::new(),
            config,
            estimator,
            pool: Arc::new(ControllerPool::new()),
            persistence: None,
            pending_undo: None,
            timings: HashMap::new(),
        }
    }

    /// Load the store from disk, running migrations and the stale-stream
    /// sweep. A snapshot that fails to parse falls back to the default
    /// store rather than aborting startup.
    pub fn with_persistence(
        config: AppConfig,
        estimator: Arc<dyn TokenEstimator>,
        persistence: StorePersistence,
    ) -> Self {
        let state = match persistence.load() {
            Ok(state) => state,
            Err(err) => {
                warn!("failed to load session store, starting fresh: {err}");
                PersistedState::default()
            }
        };
        let mut store = Self::with_estimator(config, estimator);
        if !state.sessions.is_empty() {
            store.sessions = state.sessions;
            store.current_index = state.current_session_index.min(store.sessions.len() - 1);
        }
        store.last_input = state.last_input;
        store.persistence = Some(persistence);
        for session in &mut store.sessions {
            session.clamp_indices();
        }
        store.sweep_stale_streams(store.current_index);
        store
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_session(&self) -> &Session {
        &self.sessions[self.current_index]
    }

    pub fn session_by_id(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    pub fn controller_pool(&self) -> &Arc<ControllerPool> {
        &self.pool
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn last_input(&self) -> &str {
        &self.last_input
    }

    /// Scratch slot for the UI's unsent input text, persisted across runs.
    pub fn set_last_input(&mut self, input: impl Into<String>) {
        self.last_input = input.into();
        self.persist();
    }

    pub(crate) fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            let state = PersistedState {
                sessions: self.sessions.clone(),
                current_session_index: self.current_index,
                last_input: self.last_input.clone(),
            };
            if let Err(err) = persistence.save(&state) {
                warn!("failed to persist session store: {err}");
            }
        }
    }

    /// The sole mutation entry point: locate a session by identity, apply
    /// the mutator, re-establish invariants, persist. Returns false when no
    /// session carries the id (logged, operation is a no-op).
    pub fn update_target_session(
        &mut self,
        session_id: &str,
        updater: impl FnOnce(&mut Session),
    ) -> bool {
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == session_id) else {
            warn!(session = %session_id, "update target not found");
            return false;
        };
        updater(session);
        session.touch();
        session.clamp_indices();
        self.persist();
        true
    }

    pub fn update_current_session(&mut self, updater: impl FnOnce(&mut Session)) {
        let id = self.current_session().id.clone();
        self.update_target_session(&id, updater);
    }

    /// Prepend a fresh session, optionally seeded from a mask, and make it
    /// current.
    pub fn new_session(&mut self, mask: Option<Mask>) -> &Session {
        let mut session = Session::default();
        if let Some(mut mask) = mask {
            mask.model_config = mask.merged_with_global(&self.config.model_config);
            if !mask.name.is_empty() {
                session.topic = mask.name.clone();
            }
            session.mask = mask;
        }
        self.sessions.insert(0, session);
        self.current_index = 0;
        self.persist();
        &self.sessions[0]
    }

    /// Make the session at `index` current and run the stale-stream sweep
    /// over it.
    pub fn select_session(&mut self, index: usize) {
        if self.sessions.is_empty() {
            return;
        }
        self.current_index = index.min(self.sessions.len() - 1);
        self.sweep_stale_streams(self.current_index);
        self.persist();
    }

    /// Reorder sessions. Which session is current follows identity, not
    /// position.
    pub fn move_session(&mut self, from: usize, to: usize) {
        if from >= self.sessions.len() || to >= self.sessions.len() || from == to {
            return;
        }
        let current_id = self.current_session().id.clone();
        let session = self.sessions.remove(from);
        self.sessions.insert(to, session);
        if let Some(index) = self.sessions.iter().position(|s| s.id == current_id) {
            self.current_index = index;
        }
        self.persist();
    }

    /// Remove the session at `index`. Deleting the last remaining session
    /// immediately recreates an empty one. The prior state can be restored
    /// through [`SessionStore::restore_deleted_session`] for a short window.
    pub fn delete_session(&mut self, index: usize) {
        if index >= self.sessions.len() {
            return;
        }
        let undo = DeleteUndo {
            sessions: self.sessions.clone(),
            current_index: self.current_index,
            at: Instant::now(),
        };

        let deleting_last = self.sessions.len() == 1;
        self.sessions.remove(index);

        if deleting_last {
            self.sessions.push(Session::default());
            self.current_index = 0;
        } else {
            let shift = usize::from(index < self.current_index);
            self.current_index = self
                .current_index
                .saturating_sub(shift)
                .min(self.sessions.len() - 1);
        }

        self.pending_undo = Some(undo);
        self.persist();
    }

    /// Restore the exact sessions array and current index from before the
    /// last deletion, if still inside the undo window.
    pub fn restore_deleted_session(&mut self) -> bool {
        let Some(undo) = self.pending_undo.take() else {
            return false;
        };
        if undo.at.elapsed().as_secs() >= DELETE_UNDO_WINDOW_SECS {
            return false;
        }
        self.sessions = undo.sessions;
        self.current_index = undo.current_index;
        self.persist();
        true
    }

    /// Duplicate the current session (topic, mask, deep-copied messages with
    /// fresh ids), insert it at the front, and make it current.
    pub fn fork_session(&mut self) -> &Session {
        let copy = self.current_session().duplicate();
        self.sessions.insert(0, copy);
        self.current_index = 0;
        self.persist();
        &self.sessions[0]
    }

    /// Mark the newest message as the context boundary; history up to and
    /// including it is excluded from future requests.
    pub fn clear_history(&mut self) {
        self.update_current_session(|session| {
            if let Some(last) = session.messages.last_mut() {
                last.be_clear = true;
            }
        });
    }

    /// Drop all messages and memory from a session, keeping its identity
    /// and mask.
    pub fn reset_session(&mut self, session_id: &str) {
        self.update_target_session(session_id, |session| {
            session.messages.clear();
            session.memory_prompt.clear();
            session.last_summarize_index = 0;
            session.clear_context_index = None;
        });
    }

    pub fn delete_message(&mut self, session_id: &str, message_id: &str) {
        self.update_target_session(session_id, |session| {
            session.messages.retain(|m| m.id != message_id);
        });
    }

    /// Cancel one in-flight request. The reconciler resolves the message
    /// when the aborted event arrives.
    pub fn stop_streaming(&self, key: &RequestKey) -> bool {
        self.pool.stop(key)
    }

    /// Cancel every in-flight request.
    pub fn stop_all_streaming(&self) {
        self.pool.stop_all();
    }

    /// Force-resolve streaming messages that exceeded the age threshold in
    /// the given session. Runs on load and whenever a session becomes
    /// current, protecting against requests that died without a callback.
    pub(crate) fn sweep_stale_streams(&mut self, index: usize) {
        let Some(session) = self.sessions.get_mut(index) else {
            return;
        };
        let now = chrono::Utc::now();
        let mut swept = 0usize;
        for message in &mut session.messages {
            if message.streaming && message.age_secs(now) > STALE_STREAM_TIMEOUT_SECS {
                message.streaming = false;
                if message.content.is_empty() {
                    message.is_error = true;
                    message.content = MessageContent::Text(format_api_error(
                        r#"{"error":true,"message":"empty response"}"#,
                    ));
                }
                swept += 1;
            }
        }
        if swept > 0 {
            debug!(session = %session.id, swept, "resolved stale streaming messages");
            self.persist();
        }
    }

    /// Submit user input on the current session.
    ///
    /// Builds a send representation (template-filled text with file contents
    /// inlined, plus image parts) and a separate display representation
    /// (raw text plus compact file/image references), appends the user
    /// message and a streaming assistant placeholder, registers the request
    /// with the controller pool, and dispatches it.
    pub fn on_user_input(
        &mut self,
        text: &str,
        images: Vec<ImageAttachment>,
        files: Vec<FileAttachment>,
        endpoint: &ProviderEndpoint,
        service: &ChatStreamService,
    ) -> RequestKey {
        let session_id = self.current_session().id.clone();
        let model_config = effective_model_config(self.current_session(), &self.config);

        let filled = fill_template(text, &model_config);

        let mut send_text = String::new();
        for file in &files {
            send_text.push_str(&format!("```{}\n{}\n```\n\n", file.name, file.content));
        }
        send_text.push_str(&filled);

        let send_content = if images.is_empty() {
            WireContent::Text(send_text)
        } else {
            let mut parts = vec![WirePart::Text { text: send_text }];
            parts.extend(images.iter().map(|image| WirePart::ImageUrl {
                image_url: WireImageUrl {
                    url: image.url.clone(),
                },
            }));
            WireContent::Parts(parts)
        };

        let display_content = if images.is_empty() && files.is_empty() {
            MessageContent::Text(text.to_string())
        } else {
            let mut parts = vec![ContentPart::Text {
                text: text.to_string(),
            }];
            parts.extend(files.iter().map(|file| ContentPart::FileRef {
                name: file.name.clone(),
                url: file.url.clone(),
                content_type: file.content_type.clone(),
            }));
            parts.extend(images.iter().map(|image| ContentPart::ImageRef {
                url: image.url.clone(),
            }));
            MessageContent::Parts(parts)
        };

        // Assemble context before the new pair lands in history.
        let context = build_request_messages(
            self.current_session(),
            &self.config,
            self.estimator.as_ref(),
        );
        let mut wire_messages: Vec<WireMessage> =
            context.iter().map(wire_message).collect();
        wire_messages.push(WireMessage {
            role: "user".to_string(),
            content: send_content,
        });

        let user_message = ChatMessage::user(display_content);
        let mut assistant_message = ChatMessage::assistant("");
        assistant_message.streaming = true;
        assistant_message.model = Some(model_config.model.clone());
        assistant_message.provider_name = Some(model_config.provider_name.clone());
        let assistant_id = assistant_message.id.clone();

        self.update_target_session(&session_id, |session| {
            session.messages.push(user_message);
            session.messages.push(assistant_message);
        });

        let key = RequestKey::new(session_id, assistant_id);
        let cancel_token = self.pool.register(key.clone());
        self.timings.insert(
            key.clone(),
            StreamTiming {
                started: Instant::now(),
                first_token: None,
            },
        );

        service.spawn_stream(StreamParams {
            endpoint: endpoint.clone(),
            model: model_config.model.clone(),
            messages: wire_messages,
            max_tokens: Some(model_config.max_tokens),
            temperature: Some(model_config.temperature),
            top_p: Some(model_config.top_p),
            cancel_token,
            key: key.clone(),
        });
        debug!(session = %key.session_id, message = %key.message_id, model = %model_config.model, "dispatched user input");
        key
    }
}

/// Convert an engine message to its wire form. File references become text
/// placeholders naming the file; the inlined content travels only in the
/// send representation built at submit time.
pub fn wire_message(message: &ChatMessage) -> WireMessage {
    let content = match &message.content {
        MessageContent::Text(text) => WireContent::Text(text.clone()),
        MessageContent::Parts(parts) => WireContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => WirePart::Text { text: text.clone() },
                    ContentPart::ImageRef { url } => WirePart::ImageUrl {
                        image_url: WireImageUrl { url: url.clone() },
                    },
                    ContentPart::FileRef { name, .. } => WirePart::Text {
                        text: format!("[file: {name}]"),
                    },
                })
                .collect(),
        ),
    };
    WireMessage {
        role: message.role.as_str().to_string(),
        content,
    }
}
