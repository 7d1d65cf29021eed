/// Caller-facing error taxonomy for [`crate::Service::complete`].
///
/// `Unauthorized` is a stable sentinel: callers match on the variant to prompt
/// the user to re-authenticate with the upstream provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    #[error("not authenticated with the model provider; sign in and retry")]
    Unauthorized,
    #[error("turn failed: {0}")]
    TurnFailed(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("no user message with text content in request")]
    NoUserInput,
    #[error("call cancelled")]
    Cancelled,
}
