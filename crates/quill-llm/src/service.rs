use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::chat::Request;
use crate::chat::Response;
use crate::error::LlmError;

/// Per-call context: which logical conversation this call belongs to (the
/// backend uses it to pick or create a session) and a cancellation signal
/// every blocking wait in the backend must honor.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub conversation_id: Option<String>,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            cancel: CancellationToken::new(),
        }
    }
}

/// A synchronous request/response LLM backend. One `complete` call is one
/// model turn; tool calls issued by the model are executed via the tools on
/// the request before the final response is returned.
#[async_trait]
pub trait Service: Send + Sync {
    /// Context window of the underlying model, in tokens.
    fn token_context_window(&self) -> u64;
    /// Largest supported image dimension; zero when images are unsupported.
    fn max_image_dimension(&self) -> u32;
    async fn complete(&self, ctx: &CallContext, req: &Request) -> Result<Response, LlmError>;
}
