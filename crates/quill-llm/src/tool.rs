use async_trait::async_trait;
use serde_json::Value;

use crate::chat::Content;
use crate::service::CallContext;

/// A capability the model may call during a turn. The backend declares each
/// tool to the model by name/description/schema and routes calls back through
/// [`Tool::run`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema for the tool's arguments.
    fn input_schema(&self) -> Value;
    async fn run(&self, ctx: &CallContext, args: Value) -> ToolOut;
}

/// Result of a tool invocation. A set `error` marks the call failed; the
/// message is surfaced to the model in place of `llm_content`.
#[derive(Debug, Clone, Default)]
pub struct ToolOut {
    pub llm_content: Vec<Content>,
    pub display: Option<Value>,
    pub error: Option<String>,
}

impl ToolOut {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            llm_content: vec![Content::text(text)],
            display: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            llm_content: Vec::new(),
            display: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_error_constructors() {
        let ok = ToolOut::text("result");
        assert_eq!(ok.llm_content, vec![Content::text("result")]);
        assert!(ok.error.is_none());

        let failed = ToolOut::error("no such file");
        assert!(failed.llm_content.is_empty());
        assert_eq!(failed.error.as_deref(), Some("no such file"));
    }
}
