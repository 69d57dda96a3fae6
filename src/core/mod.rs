pub mod chat_stream;
pub mod config;
pub mod constants;
pub mod controller;
pub mod estimator;
pub mod mask;
pub mod memory;
pub mod message;
pub mod persistence;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod summarize;
pub mod template;
