//! Codex adapter: implements [`quill_llm::Service`] by driving the Codex CLI
//! `app-server` subprocess over its newline-delimited JSON-RPC stdio protocol.
//!
//! Quill's tools are registered as Codex "dynamic tools". When the model wants
//! to call one, the server sends an `item/tool/call` request; the adapter runs
//! the tool and answers with its output. When the turn completes, the adapter
//! returns the accumulated text, reasoning, and tool records as one
//! [`quill_llm::Response`].
//!
//! One subprocess is shared by all conversations. Each conversation maps to a
//! server-side thread; notifications are routed to the call driving that
//! thread, responses to the caller that issued the request.

mod config;
mod framing;
mod process;
mod protocol;
mod service;
mod threads;
mod turn;

pub use config::CodexConfig;
pub use service::CodexService;
