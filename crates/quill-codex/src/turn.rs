//! Turn driver: runs one `complete` call against one thread. Subscribes to
//! the thread's routed messages, issues `turn/start`, executes dynamic tool
//! calls the server sends back, accumulates output until `turn/completed`,
//! and synthesizes the final response.

use chrono::DateTime;
use chrono::Utc;
use quill_llm::CallContext;
use quill_llm::Content;
use quill_llm::LlmError;
use quill_llm::Request;
use quill_llm::Response;
use quill_llm::Role;
use quill_llm::StopReason;
use quill_llm::Tool;
use quill_llm::Usage;
use serde_json::json;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::process::response_result;
use crate::process::Process;
use crate::process::Subscription;
use crate::protocol::DynamicToolCallParams;
use crate::protocol::DynamicToolCallResponse;
use crate::protocol::ErrorNotification;
use crate::protocol::ItemCompletedNotification;
use crate::protocol::RpcMessage;
use crate::protocol::RpcRequest;
use crate::protocol::TokenUsageNotification;
use crate::protocol::TurnCompletedNotification;
use crate::protocol::TurnError;

const EXITED_MID_TURN: &str = "codex subprocess exited during turn";

/// One dynamic tool invocation, kept so the final response can carry paired
/// tool-use and tool-result blocks.
struct ToolCallRecord {
    call_id: String,
    tool_name: String,
    input: Value,
    output: String,
    is_error: bool,
    display: Option<Value>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

enum Step {
    Cancelled,
    Exited,
    Response(Result<RpcMessage, oneshot::error::RecvError>),
    Routed(RpcMessage),
}

pub(crate) struct TurnDriver<'a> {
    ctx: &'a CallContext,
    proc: Arc<Process>,
    tools: HashMap<String, Arc<dyn Tool>>,
    agent_texts: Vec<String>,
    thinking: String,
    usage: Usage,
    turn_done: bool,
    turn_error: Option<LlmError>,
    tool_calls: Vec<ToolCallRecord>,
}

impl<'a> TurnDriver<'a> {
    pub fn new(ctx: &'a CallContext, proc: Arc<Process>, req: &Request) -> Self {
        let tools = req
            .tools
            .iter()
            .map(|tool| (tool.name().to_string(), Arc::clone(tool)))
            .collect();
        Self {
            ctx,
            proc,
            tools,
            agent_texts: Vec::new(),
            thinking: String::new(),
            usage: Usage::default(),
            turn_done: false,
            turn_error: None,
            tool_calls: Vec::new(),
        }
    }

    /// Send a request and wait for its response while also processing every
    /// message routed to the thread: the server interleaves notifications and
    /// tool-call requests with the response we are waiting for.
    pub async fn call_draining(
        &mut self,
        sub: &Subscription,
        method: &str,
        params: Value,
    ) -> Result<Value, LlmError> {
        let id = self.proc.next_request_id();
        let (mut resp_rx, _guard) = self.proc.register_pending(id);
        self.proc
            .send(&RpcRequest {
                id,
                method,
                params: Some(params),
            })
            .await?;

        loop {
            let step = {
                let cancel = self.ctx.cancel.clone();
                let proc = Arc::clone(&self.proc);
                tokio::select! {
                    _ = cancel.cancelled() => Step::Cancelled,
                    _ = proc.exited() => Step::Exited,
                    resp = &mut resp_rx => Step::Response(resp),
                    msg = sub.recv() => Step::Routed(msg),
                }
            };
            match step {
                Step::Cancelled => return Err(LlmError::Cancelled),
                Step::Exited => return Err(LlmError::Transport(EXITED_MID_TURN.to_string())),
                Step::Response(Ok(msg)) => return response_result(method, msg),
                Step::Response(Err(_)) => {
                    return Err(LlmError::Transport(EXITED_MID_TURN.to_string()))
                }
                Step::Routed(msg) => self.handle_message(msg).await?,
            }
        }
    }

    /// Keep consuming routed messages until the turn's terminal notification
    /// arrives. The `turn/start` response comes back quickly; the turn itself
    /// may run much longer.
    pub async fn drain_until_done(&mut self, sub: &Subscription) -> Result<(), LlmError> {
        while !self.turn_done {
            let step = {
                let cancel = self.ctx.cancel.clone();
                let proc = Arc::clone(&self.proc);
                tokio::select! {
                    _ = cancel.cancelled() => Step::Cancelled,
                    _ = proc.exited() => Step::Exited,
                    msg = sub.recv() => Step::Routed(msg),
                }
            };
            match step {
                Step::Cancelled => return Err(LlmError::Cancelled),
                Step::Exited => return Err(LlmError::Transport(EXITED_MID_TURN.to_string())),
                Step::Response(_) => unreachable!("no pending response in drain phase"),
                Step::Routed(msg) => self.handle_message(msg).await?,
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: RpcMessage) -> Result<(), LlmError> {
        if msg.is_request() {
            return self.handle_server_request(msg).await;
        }
        let Some(method) = msg.method.as_deref() else {
            return Ok(());
        };
        let params = msg.params.unwrap_or(Value::Null);
        match method {
            "item/completed" => {
                if let Ok(n) = serde_json::from_value::<ItemCompletedNotification>(params) {
                    match n.item.kind.as_str() {
                        "agentMessage" => {
                            if !n.item.text.is_empty() {
                                self.agent_texts.push(n.item.text);
                            }
                        }
                        "reasoning" => {
                            if !n.item.summary.is_empty() {
                                self.thinking.push_str(&n.item.summary.join("\n"));
                            }
                        }
                        _ => {}
                    }
                }
            }
            "turn/completed" => {
                if let Ok(n) = serde_json::from_value::<TurnCompletedNotification>(params) {
                    self.finish_turn(n);
                }
            }
            "error" => {
                if let Ok(n) = serde_json::from_value::<ErrorNotification>(params) {
                    self.record_error(n);
                }
            }
            "thread/tokenUsage/updated" => {
                if let Ok(n) = serde_json::from_value::<TokenUsageNotification>(params) {
                    // `last` is the authoritative usage for this turn.
                    self.usage.input_tokens = n.token_usage.last.input_tokens;
                    self.usage.output_tokens = n.token_usage.last.output_tokens;
                    self.usage.cached_input_tokens = n.token_usage.last.cached_input_tokens;
                }
            }
            // agentMessage/delta and friends: streaming is not relayed.
            other => tracing::trace!(method = other, "ignoring notification"),
        }
        Ok(())
    }

    fn finish_turn(&mut self, n: TurnCompletedNotification) {
        match n.turn.status.as_str() {
            "completed" => {}
            "failed" => {
                self.turn_error = Some(match n.turn.error {
                    Some(err) => classify_turn_error(err),
                    None => LlmError::TurnFailed("turn failed".to_string()),
                });
            }
            other => {
                // Unknown statuses count as completed unless an error rode along.
                tracing::warn!(status = other, "unrecognized turn status");
                if let Some(err) = n.turn.error {
                    self.turn_error = Some(classify_turn_error(err));
                }
            }
        }
        self.turn_done = true;
    }

    fn record_error(&mut self, n: ErrorNotification) {
        if n.error.is_unauthorized() {
            self.turn_error = Some(LlmError::Unauthorized);
        } else if n.will_retry {
            tracing::warn!(message = %n.error.message, "retriable codex error; turn continues");
        } else {
            self.turn_error = Some(LlmError::TurnFailed(n.error.message));
        }
    }

    async fn handle_server_request(&mut self, msg: RpcMessage) -> Result<(), LlmError> {
        let id = msg.id.unwrap_or(Value::Null);
        let method = msg.method.as_deref().unwrap_or_default().to_string();
        let params = msg.params.unwrap_or(Value::Null);
        match method.as_str() {
            "item/tool/call" => self.handle_tool_call(id, params).await,
            // Only caller-supplied tools may execute; the server's built-in
            // command execution and file changes are always refused.
            "item/commandExecution/requestApproval" | "item/fileChange/requestApproval" => {
                self.proc.respond(id, json!({"decision": "reject"})).await
            }
            other => {
                tracing::warn!(method = other, "unhandled server request");
                self.proc
                    .respond_error(id, -1, format!("unhandled method: {other}"))
                    .await
            }
        }
    }

    /// Execute one dynamic tool call. Tool failures are never surfaced as
    /// JSON-RPC errors: the server expects a normal response carrying the
    /// error text in `output` with `success=false`.
    async fn handle_tool_call(&mut self, id: Value, params: Value) -> Result<(), LlmError> {
        let call: DynamicToolCallParams = match serde_json::from_value(params) {
            Ok(call) => call,
            Err(err) => {
                return self
                    .respond_tool(
                        id,
                        format!("failed to parse tool call params: {err}"),
                        false,
                    )
                    .await;
            }
        };

        let Some(tool) = self.tools.get(&call.tool).map(Arc::clone) else {
            let output = format!("unknown tool: {}", call.tool);
            let now = Utc::now();
            self.tool_calls.push(ToolCallRecord {
                call_id: call.call_id,
                tool_name: call.tool,
                input: call.arguments,
                output: output.clone(),
                is_error: true,
                display: None,
                started_at: now,
                ended_at: now,
            });
            return self.respond_tool(id, output, false).await;
        };

        let started_at = Utc::now();
        let out = tool.run(self.ctx, call.arguments.clone()).await;
        let ended_at = Utc::now();

        let (output, is_error) = match out.error {
            Some(message) => (message, true),
            None => {
                let texts: Vec<&str> = out
                    .llm_content
                    .iter()
                    .filter_map(|content| match content {
                        Content::Text { text } if !text.is_empty() => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                (texts.join("\n"), false)
            }
        };

        self.tool_calls.push(ToolCallRecord {
            call_id: call.call_id,
            tool_name: call.tool,
            input: call.arguments,
            output: output.clone(),
            is_error,
            display: out.display,
            started_at,
            ended_at,
        });
        self.respond_tool(id, output, !is_error).await
    }

    async fn respond_tool(&self, id: Value, output: String, success: bool) -> Result<(), LlmError> {
        let response = DynamicToolCallResponse { output, success };
        let result = serde_json::to_value(&response)
            .map_err(|err| LlmError::Protocol(format!("encode tool response: {err}")))?;
        self.proc.respond(id, result).await
    }

    /// Build the final response once the turn has ended cleanly.
    pub fn into_response(
        self,
        model: Option<String>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Response, LlmError> {
        if let Some(err) = self.turn_error {
            return Err(err);
        }

        let mut content = Vec::new();
        if !self.thinking.is_empty() {
            content.push(Content::thinking(self.thinking));
        }

        let mut text = self.agent_texts.join("\n");
        if text.is_empty() && self.tool_calls.is_empty() {
            // Never hand callers an empty response.
            text = "(no response)".to_string();
        }
        if !text.is_empty() {
            content.push(Content::text(text));
        }

        for call in self.tool_calls {
            content.push(Content::ToolUse {
                id: call.call_id.clone(),
                name: call.tool_name,
                input: call.input,
            });
            content.push(Content::ToolResult {
                tool_use_id: call.call_id,
                is_error: call.is_error,
                content: vec![Content::text(call.output)],
                display: call.display,
                started_at: Some(call.started_at),
                ended_at: Some(call.ended_at),
            });
        }

        let mut usage = self.usage;
        usage.model = model.clone();
        usage.started_at = Some(started_at);
        usage.ended_at = Some(ended_at);

        Ok(Response {
            role: Role::Assistant,
            content,
            stop_reason: StopReason::EndTurn,
            usage,
            model,
            started_at: Some(started_at),
            ended_at: Some(ended_at),
        })
    }
}

fn classify_turn_error(err: TurnError) -> LlmError {
    if err.is_unauthorized() {
        LlmError::Unauthorized
    } else {
        LlmError::TurnFailed(err.message)
    }
}

/// Latest user text in the request: walk messages back to front and take the
/// first user message with non-empty text content, joining its fragments.
/// User messages carrying only tool results are skipped.
pub(crate) fn extract_latest_user_text(req: &Request) -> Option<String> {
    for message in req.messages.iter().rev() {
        if message.role != Role::User {
            continue;
        }
        let texts: Vec<&str> = message
            .content
            .iter()
            .filter_map(|content| match content {
                Content::Text { text } if !text.is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if !texts.is_empty() {
            return Some(texts.join("\n"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_llm::Message;

    fn request_with_messages(messages: Vec<Message>) -> Request {
        Request {
            system: Vec::new(),
            tools: Vec::new(),
            messages,
        }
    }

    #[test]
    fn latest_user_text_wins() {
        let req = request_with_messages(vec![
            Message::user("first"),
            Message {
                role: Role::Assistant,
                content: vec![Content::text("reply")],
            },
            Message::user("second"),
        ]);
        assert_eq!(extract_latest_user_text(&req).as_deref(), Some("second"));
    }

    #[test]
    fn tool_result_only_user_message_is_skipped() {
        let req = request_with_messages(vec![
            Message::user("do something"),
            Message {
                role: Role::Assistant,
                content: vec![Content::ToolUse {
                    id: "1".to_string(),
                    name: "bash".to_string(),
                    input: Value::Null,
                }],
            },
            Message {
                role: Role::User,
                content: vec![Content::ToolResult {
                    tool_use_id: "1".to_string(),
                    is_error: false,
                    content: vec![Content::text("output")],
                    display: None,
                    started_at: None,
                    ended_at: None,
                }],
            },
        ]);
        assert_eq!(
            extract_latest_user_text(&req).as_deref(),
            Some("do something")
        );
    }

    #[test]
    fn multiple_text_fragments_join_with_newlines() {
        let req = request_with_messages(vec![Message {
            role: Role::User,
            content: vec![Content::text("part one"), Content::text("part two")],
        }]);
        assert_eq!(
            extract_latest_user_text(&req).as_deref(),
            Some("part one\npart two")
        );
    }

    #[test]
    fn empty_request_has_no_user_text() {
        let req = request_with_messages(Vec::new());
        assert_eq!(extract_latest_user_text(&req), None);
    }
}
