//! LLM service abstraction.
//!
//! Backends (the Codex adapter lives in `quill-codex`) implement [`Service`];
//! callers hand it a [`Request`] with the conversation so far plus the tools
//! the model may call, and get back one final [`Response`].

mod chat;
mod error;
mod service;
mod tool;

pub use chat::Content;
pub use chat::Message;
pub use chat::Request;
pub use chat::Response;
pub use chat::Role;
pub use chat::StopReason;
pub use chat::SystemContent;
pub use chat::Usage;
pub use error::LlmError;
pub use service::CallContext;
pub use service::Service;
pub use tool::Tool;
pub use tool::ToolOut;
