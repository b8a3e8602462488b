//! Completion API access: SSE parsing, the OpenAI-compatible streaming client,
//! and the background worker that drives one request per send.

pub mod openai;
pub mod sse;
pub mod worker;

pub use openai::{ApiConfig, CompletionError, OpenAIClient};
pub use worker::{CompletionLauncher, CompletionRequest, CompletionWorker, WorkerHandle};
