//! Wire types for the app-server's JSON-RPC dialect. Messages are
//! newline-delimited and carry no `jsonrpc` version field. Ids are integers on
//! the way out; incoming ids are compared by canonical string so a decoder
//! that round-trips numbers through floats cannot mis-route a response.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Incoming message: a response, a server-initiated request, or a
/// notification, depending on which fields are present.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl RpcMessage {
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }

    pub fn is_request(&self) -> bool {
        self.id.is_some() && self.method.is_some()
    }

    /// Canonical string form of the id, when present and comparable.
    pub fn id_key(&self) -> Option<String> {
        self.id.as_ref().and_then(id_key)
    }

    /// `params.threadId`, when present.
    pub fn thread_id(&self) -> Option<&str> {
        self.params
            .as_ref()
            .and_then(|params| params.get("threadId"))
            .and_then(|id| id.as_str())
    }
}

/// Canonical string form of a JSON-RPC id. Integer-valued floats collapse to
/// their integer form so `3` and `3.0` compare equal.
pub(crate) fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(i.to_string());
            }
            if let Some(u) = n.as_u64() {
                return Some(u.to_string());
            }
            let f = n.as_f64()?;
            if f.fract() == 0.0 && f.abs() < 9.0e15 {
                Some(format!("{}", f as i64))
            } else {
                Some(f.to_string())
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RpcRequest<'a> {
    pub id: i64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RpcNotification<'a> {
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RpcResponse {
    pub id: Value,
    pub result: Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct RpcErrorResponse {
    pub id: Value,
    pub error: RpcError,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DynamicToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ThreadStartParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dynamic_tools: Vec<DynamicToolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_instructions: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ThreadStartResponse {
    #[serde(default)]
    pub thread: ThreadInfo,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ThreadInfo {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TurnStartParams {
    pub thread_id: String,
    pub input: Vec<UserInput>,
}

#[derive(Debug, Serialize)]
pub(crate) struct UserInput {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

impl UserInput {
    pub fn text(text: String) -> Self {
        Self { kind: "text", text }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ItemCompletedNotification {
    pub item: ThreadItem,
}

/// Completed thread item. Kept flat rather than as a tagged enum so unknown
/// item types decode instead of failing the whole notification.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ThreadItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub summary: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TurnCompletedNotification {
    pub turn: TurnInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TurnInfo {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<TurnError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TurnError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub codex_error_info: Option<Value>,
}

impl TurnError {
    /// `codexErrorInfo` can be the bare string "unauthorized" or an object;
    /// some failures only carry the word in the message.
    pub fn is_unauthorized(&self) -> bool {
        if let Some(Value::String(info)) = &self.codex_error_info {
            if info == "unauthorized" {
                return true;
            }
        }
        self.message.to_lowercase().contains("unauthorized")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorNotification {
    #[serde(default)]
    pub error: TurnError,
    #[serde(default)]
    pub will_retry: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenUsageNotification {
    pub token_usage: TokenUsage,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenUsage {
    #[serde(default)]
    pub last: TokenBreakdown,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenBreakdown {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DynamicToolCallParams {
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct DynamicToolCallResponse {
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountGetResponse {
    #[serde(default)]
    pub requires_openai_auth: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(raw: &str) -> RpcMessage {
        serde_json::from_str(raw).expect("decode message")
    }

    #[test]
    fn classifies_responses_requests_and_notifications() {
        let response = decode(r#"{"id":1,"result":{"ok":true}}"#);
        assert!(response.is_response());
        assert!(!response.is_request());

        let request = decode(r#"{"id":2,"method":"item/tool/call","params":{}}"#);
        assert!(request.is_request());
        assert!(!request.is_response());

        let notification = decode(r#"{"method":"turn/completed","params":{}}"#);
        assert!(!notification.is_response());
        assert!(!notification.is_request());
    }

    #[test]
    fn id_keys_collapse_numeric_forms() {
        assert_eq!(id_key(&json!(3)).as_deref(), Some("3"));
        assert_eq!(id_key(&json!(3.0)).as_deref(), Some("3"));
        assert_eq!(id_key(&json!("3")).as_deref(), Some("3"));
        assert_eq!(id_key(&json!(-7)).as_deref(), Some("-7"));
        assert_eq!(id_key(&json!(null)), None);
    }

    #[test]
    fn thread_id_extraction() {
        let msg = decode(r#"{"method":"item/completed","params":{"threadId":"thr_1"}}"#);
        assert_eq!(msg.thread_id(), Some("thr_1"));

        let no_thread = decode(r#"{"method":"error","params":{}}"#);
        assert_eq!(no_thread.thread_id(), None);
    }

    #[test]
    fn turn_error_unauthorized_detection() {
        let cases = [
            (
                TurnError {
                    message: "auth failed".to_string(),
                    codex_error_info: Some(json!("unauthorized")),
                },
                true,
            ),
            (
                TurnError {
                    message: "Unauthorized request".to_string(),
                    codex_error_info: None,
                },
                true,
            ),
            (
                TurnError {
                    message: "rate limit exceeded".to_string(),
                    codex_error_info: Some(json!("usageLimitExceeded")),
                },
                false,
            ),
            (
                TurnError {
                    message: "something broke".to_string(),
                    codex_error_info: None,
                },
                false,
            ),
        ];
        for (err, want) in cases {
            assert_eq!(err.is_unauthorized(), want, "message: {}", err.message);
        }
    }

    #[test]
    fn decodes_item_completed_payloads() {
        let params = json!({
            "threadId": "thr_1",
            "turnId": "t1",
            "item": {"id": "i1", "type": "agentMessage", "text": "hi"},
        });
        let n: ItemCompletedNotification = serde_json::from_value(params).unwrap();
        assert_eq!(n.item.kind, "agentMessage");
        assert_eq!(n.item.text, "hi");

        let reasoning = json!({
            "threadId": "thr_1",
            "item": {"type": "reasoning", "summary": ["a", "b"]},
        });
        let n: ItemCompletedNotification = serde_json::from_value(reasoning).unwrap();
        assert_eq!(n.item.summary, vec!["a", "b"]);
    }

    #[test]
    fn unknown_item_types_still_decode() {
        let params = json!({
            "threadId": "thr_1",
            "item": {"type": "commandExecution", "command": "ls", "exitCode": 0},
        });
        let n: ItemCompletedNotification = serde_json::from_value(params).unwrap();
        assert_eq!(n.item.kind, "commandExecution");
        assert!(n.item.text.is_empty());
    }

    #[test]
    fn thread_start_params_omit_unset_fields() {
        let params = ThreadStartParams {
            approval_policy: Some("on-request"),
            sandbox: Some("danger-full-access"),
            ..Default::default()
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(
            value,
            json!({"approvalPolicy": "on-request", "sandbox": "danger-full-access"})
        );
    }
}
