//! Model access: the completion capability, retry, and an OpenRouter adapter.
//!
//! The summarization engine and the built-in child agent only need one thing
//! from a model: given a system instruction and a conversation, produce text.
//! That is the [`Completion`] trait. Everything else here wraps it:
//!
//! - [`retry`] — transient error detection (429, 5xx, network timeouts) and a
//!   [`RetryingCompletion`](retry::RetryingCompletion) wrapper with
//!   exponential backoff and jitter. Never retries 400/401 errors.
//! - [`openrouter`] — HTTP adapter for the OpenRouter chat completions API.

pub mod openrouter;
pub mod retry;

use crate::Message;
use std::future::Future;
use std::pin::Pin;

pub use openrouter::OpenRouterCompletion;
pub use retry::{RetryConfig, RetryingCompletion};

/// Future returned by [`Completion::complete`].
pub type CompletionFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// Produces a model reply for a system instruction and a conversation.
///
/// Errors are plain strings so adapters can pass HTTP status text through
/// unchanged; [`retry::is_transient_error`] inspects them.
pub trait Completion: Send + Sync {
    fn complete<'a>(
        &'a self,
        system: &'a str,
        conversation: &'a [Message],
    ) -> CompletionFuture<'a>;
}
