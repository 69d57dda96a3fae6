//! Causerie is a headless session and conversation state engine for chat
//! clients that talk to remote LLM APIs.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns session state: the store and its mutation choke point,
//!   prompt templating, context assembly, streaming reconciliation,
//!   background summarization, and versioned persistence.
//! - [`api`] defines the provider-agnostic wire payloads (chat requests,
//!   streamed deltas, multimodal content parts).
//! - [`utils`] carries small helpers for URL construction and provider
//!   authentication headers.
//!
//! A UI (terminal, web, test harness) drives the engine: it submits user
//! input through [`core::store::SessionStore::on_user_input`], pumps the
//! event receiver returned by [`core::chat_stream::ChatStreamService::new`]
//! into [`core::store::SessionStore::apply_stream_event`], and renders
//! whatever the store holds. Rendering, theming, and input widgets live in
//! the embedding client, not here.

pub mod api;
pub mod core;
pub mod logging;
pub mod utils;
