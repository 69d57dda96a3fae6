//! Shared constants used across the engine

/// Placeholder topic for sessions that have not been titled yet.
pub const DEFAULT_TOPIC: &str = "New Conversation";

/// Fallback input template when a mask does not configure one.
pub const DEFAULT_INPUT_TEMPLATE: &str = "{{input}}";

/// System prompt synthesized for model families that expect one.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "\
You are an AI assistant served via {{ServiceProvider}}.
Knowledge cutoff: {{cutoff}}
Current model: {{model}}
Current time: {{time}}
Latex inline: \\(x^2\\)
Latex block: $$e=mc^2$$";

/// Knowledge cutoff used when a model has no entry in the cutoff table.
pub const DEFAULT_KNOWLEDGE_CUTOFF: &str = "2021-09";

/// Instruction appended when asking the model to title a conversation.
pub const TOPIC_PROMPT: &str = "Summarize the conversation in a title of four \
to five words. Reply with the title only, without punctuation, quotation \
marks, or any extra formatting.";

/// Instruction appended when compacting history into a memory prompt.
pub const SUMMARIZE_PROMPT: &str = "Summarize the discussion briefly in 200 \
words or less to use as a prompt for future context.";

/// Minimum estimated token count before auto-titling fires.
pub const SUMMARIZE_MIN_LEN: usize = 50;

/// Token budget for the recent window sent with a title request.
pub const TOPIC_WINDOW_TOKENS: usize = 3000;

/// Streaming messages older than this are force-resolved by the sweep.
pub const STALE_STREAM_TIMEOUT_SECS: i64 = 60;

/// How long a deleted session can be restored.
pub const DELETE_UNDO_WINDOW_SECS: u64 = 5;
