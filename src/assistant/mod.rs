//! Cache-fronted conversational path.
//!
//! Prompts are answered by an external completion service. Answers are cached
//! by prompt content for a fixed TTL; failures fall back to a fixed apology and
//! are never cached.

pub mod openai;

use crate::cache::{CacheKey, CacheStore};
use crate::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub use openai::OpenAiCompletion;

pub const FALLBACK_REPLY: &str =
    "I'm having trouble connecting to the AI service. Please check your API key and internet connection.";

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion service unavailable: {0}")]
    Unavailable(String),
    #[error("completion service timed out")]
    Timeout,
    #[error("malformed completion response: {0}")]
    Malformed(String),
}

/// Turns a prompt into a reply. May be slow or fail.
#[async_trait::async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionReply {
    pub text: String,
    pub cache_hit: bool,
}

pub struct Assistant {
    completion: Arc<dyn CompletionService>,
    cache: Arc<dyn CacheStore<String>>,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl Assistant {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        cache: Arc<dyn CacheStore<String>>,
        ttl: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            completion,
            cache,
            ttl,
            metrics,
        }
    }

    /// Answer `prompt`, serving a fresh cached answer when one exists.
    ///
    /// Cache failures count as misses and skipped writes; completion failures
    /// yield [`FALLBACK_REPLY`].
    pub async fn cached_completion(&self, prompt: &str) -> CompletionReply {
        let key = CacheKey::for_text(prompt);

        match self.cache.get(&key) {
            Ok(Some(text)) => {
                Metrics::inc(&self.metrics.cache_hits);
                debug!(key = %key, "Serving cached completion");
                return CompletionReply { text, cache_hit: true };
            }
            Ok(None) => Metrics::inc(&self.metrics.cache_misses),
            Err(e) => {
                warn!(error = %e, "Cache read failed, treating as miss");
                Metrics::inc(&self.metrics.cache_errors);
                Metrics::inc(&self.metrics.cache_misses);
            }
        }

        let text = match self.completion.complete(prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Completion failed, using fallback reply");
                Metrics::inc(&self.metrics.completion_failures);
                return CompletionReply {
                    text: FALLBACK_REPLY.to_string(),
                    cache_hit: false,
                };
            }
        };

        if let Err(e) = self.cache.put(key, text.clone(), self.ttl) {
            warn!(error = %e, "Cache write failed");
            Metrics::inc(&self.metrics.cache_errors);
        }

        CompletionReply { text, cache_hit: false }
    }
}

const SESSION_HELP: &str = "Commands:\n  exit, quit, bye  leave the session\n  help             show this message\n\nExample questions:\n  How do I debug a failed Airflow DAG?\n  Why is my Spark job running out of memory?\n";

/// Line-oriented chat session: one prompt per line until `exit`, `quit`,
/// `bye` or end of input. Returns the number of prompts answered.
pub async fn chat_session<R, W>(assistant: &Assistant, input: R, mut output: W) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output
        .write_all(b"Logwarden pipeline assistant. Type 'exit' to quit, 'help' for help.\n")
        .await?;
    let mut lines = input.lines();
    let mut answered = 0;

    loop {
        output.write_all(b"You: ").await?;
        output.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line.to_ascii_lowercase().as_str() {
            "" => continue,
            "exit" | "quit" | "bye" => break,
            "help" => {
                output.write_all(SESSION_HELP.as_bytes()).await?;
                continue;
            }
            _ => {}
        }

        let reply = assistant.cached_completion(line).await;
        output
            .write_all(format!("Assistant: {}\n", reply.text).as_bytes())
            .await?;
        answered += 1;
    }

    output.write_all(b"Goodbye!\n").await?;
    output.flush().await?;
    Ok(answered)
}
