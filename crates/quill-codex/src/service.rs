//! Service façade: lazy subprocess startup, the initialization handshake,
//! conversation → thread resolution, and the `complete` entry point.

use async_trait::async_trait;
use chrono::Utc;
use quill_llm::CallContext;
use quill_llm::LlmError;
use quill_llm::Request;
use quill_llm::Response;
use quill_llm::Service;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::CodexConfig;
use crate::process::Process;
use crate::protocol::AccountGetResponse;
use crate::protocol::DynamicToolSpec;
use crate::protocol::ThreadStartParams;
use crate::protocol::ThreadStartResponse;
use crate::protocol::TurnStartParams;
use crate::protocol::UserInput;
use crate::threads::ThreadRegistry;
use crate::threads::DEFAULT_CONVERSATION_ID;
use crate::turn::extract_latest_user_text;
use crate::turn::TurnDriver;

/// Codex-backed [`Service`]. One shared `codex app-server` subprocess serves
/// all conversations; it is started on the first call and restarted lazily on
/// the call after it dies.
pub struct CodexService {
    config: CodexConfig,
    // Guards only subprocess lifecycle and the thread registry. Never held
    // across an RPC: concurrent calls on different conversations proceed in
    // parallel.
    state: AsyncMutex<ServiceState>,
}

struct ServiceState {
    proc: Option<Arc<Process>>,
    threads: ThreadRegistry,
}

impl CodexService {
    pub fn new(config: CodexConfig) -> Self {
        let threads = ThreadRegistry::new(config.thread_capacity);
        Self {
            config,
            state: AsyncMutex::new(ServiceState {
                proc: None,
                threads,
            }),
        }
    }

    /// Start the subprocess if it is not running. If a previous child's done
    /// signal has fired, its state (threads included) is discarded first.
    async fn ensure_process(&self, ctx: &CallContext) -> Result<Arc<Process>, LlmError> {
        let proc = {
            let mut state = self.state.lock().await;
            if let Some(existing) = &state.proc {
                if existing.is_done() {
                    state.proc = None;
                    // Thread ids from the dead child mean nothing to the next one.
                    state.threads.clear();
                }
            }
            match &state.proc {
                Some(existing) => Arc::clone(existing),
                None => {
                    let proc = Process::spawn(&self.config)?;
                    state.proc = Some(Arc::clone(&proc));
                    proc
                }
            }
        };

        // Handshake runs once per child, outside the facade lock. A failed
        // handshake discards the child so the next call starts clean.
        if let Err(err) = proc
            .ensure_initialized(|| self.run_handshake(&proc, ctx))
            .await
        {
            proc.kill().await;
            let mut state = self.state.lock().await;
            if let Some(current) = &state.proc {
                if Arc::ptr_eq(current, &proc) {
                    state.proc = None;
                    state.threads.clear();
                }
            }
            return Err(err);
        }
        Ok(proc)
    }

    async fn run_handshake(
        &self,
        proc: &Arc<Process>,
        ctx: &CallContext,
    ) -> Result<(), LlmError> {
        let params = json!({
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            }
        });
        proc.call(&ctx.cancel, "initialize", Some(params)).await?;
        proc.notify("initialized", None).await?;
        self.check_auth(proc, ctx).await
    }

    /// Probe auth early so a missing sign-in surfaces as a clear sentinel
    /// instead of a failed turn. A probe transport failure is non-fatal; auth
    /// errors will surface during `turn/start` instead.
    async fn check_auth(&self, proc: &Arc<Process>, ctx: &CallContext) -> Result<(), LlmError> {
        let result = match proc.call(&ctx.cancel, "account/get", Some(json!({}))).await {
            Ok(result) => result,
            Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
            Err(err) => {
                tracing::warn!(error = %err, "account/get probe failed");
                return Ok(());
            }
        };
        let account: AccountGetResponse = match serde_json::from_value(result) {
            Ok(account) => account,
            Err(_) => return Ok(()),
        };
        if account.requires_openai_auth {
            return Err(LlmError::Unauthorized);
        }
        Ok(())
    }

    /// Resolve the thread for this conversation, creating one on first use.
    async fn get_or_create_thread(
        &self,
        ctx: &CallContext,
        proc: &Arc<Process>,
        req: &Request,
    ) -> Result<String, LlmError> {
        let conversation_id = conversation_key(ctx);
        {
            let state = self.state.lock().await;
            if let Some(thread_id) = state.threads.get(&conversation_id) {
                return Ok(thread_id);
            }
        }

        let dynamic_tools = req
            .tools
            .iter()
            .map(|tool| DynamicToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect();

        // "on-request" makes the server ask approval for its own built-in
        // operations, which the turn driver always rejects: only our dynamic
        // tools execute, regardless of the sandbox mode.
        let params = ThreadStartParams {
            approval_policy: Some("on-request"),
            sandbox: Some("danger-full-access"),
            dynamic_tools,
            model: self.config.model.clone(),
            cwd: std::env::current_dir()
                .ok()
                .map(|cwd| cwd.to_string_lossy().to_string()),
            base_instructions: system_instructions(req),
        };
        let params = serde_json::to_value(&params)
            .map_err(|err| LlmError::Protocol(format!("encode thread/start params: {err}")))?;

        let result = proc.call(&ctx.cancel, "thread/start", Some(params)).await?;
        let resp: ThreadStartResponse = serde_json::from_value(result)
            .map_err(|err| LlmError::Protocol(format!("parse thread/start response: {err}")))?;
        let thread_id = resp.thread.id;
        if thread_id.is_empty() {
            return Err(LlmError::Protocol(
                "thread/start returned an empty thread id".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        state.threads.insert(conversation_id, thread_id.clone());
        Ok(thread_id)
    }
}

#[async_trait]
impl Service for CodexService {
    fn token_context_window(&self) -> u64 {
        self.config.token_context_window
    }

    fn max_image_dimension(&self) -> u32 {
        // Images are not supported on this path.
        0
    }

    async fn complete(&self, ctx: &CallContext, req: &Request) -> Result<Response, LlmError> {
        let proc = self.ensure_process(ctx).await?;
        let thread_id = self.get_or_create_thread(ctx, &proc, req).await?;
        let user_text = extract_latest_user_text(req).ok_or(LlmError::NoUserInput)?;

        // Subscribe before turn/start so no notification can outrun us; the
        // subscription is torn down when this call exits.
        let sub = proc.subscribe(&thread_id);

        let started_at = Utc::now();
        let mut driver = TurnDriver::new(ctx, Arc::clone(&proc), req);

        let params = TurnStartParams {
            thread_id,
            input: vec![UserInput::text(user_text)],
        };
        let params = serde_json::to_value(&params)
            .map_err(|err| LlmError::Protocol(format!("encode turn/start params: {err}")))?;

        driver.call_draining(&sub, "turn/start", params).await?;
        driver.drain_until_done(&sub).await?;
        let ended_at = Utc::now();

        driver.into_response(self.config.model.clone(), started_at, ended_at)
    }
}

fn conversation_key(ctx: &CallContext) -> String {
    match ctx.conversation_id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => DEFAULT_CONVERSATION_ID.to_string(),
    }
}

fn system_instructions(req: &Request) -> Option<String> {
    let parts: Vec<&str> = req
        .system
        .iter()
        .map(|system| system.text.as_str())
        .filter(|text| !text.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_llm::SystemContent;

    #[test]
    fn conversation_key_falls_back_to_sentinel() {
        assert_eq!(conversation_key(&CallContext::new()), DEFAULT_CONVERSATION_ID);
        assert_eq!(
            conversation_key(&CallContext {
                conversation_id: Some(String::new()),
                ..CallContext::new()
            }),
            DEFAULT_CONVERSATION_ID
        );
        assert_eq!(
            conversation_key(&CallContext::for_conversation("conv-7")),
            "conv-7"
        );
    }

    #[test]
    fn system_instructions_join_non_empty_fragments() {
        let req = Request {
            system: vec![
                SystemContent {
                    text: "you are quill".to_string(),
                },
                SystemContent {
                    text: String::new(),
                },
                SystemContent {
                    text: "be brief".to_string(),
                },
            ],
            ..Request::default()
        };
        assert_eq!(
            system_instructions(&req).as_deref(),
            Some("you are quill\nbe brief")
        );
        assert_eq!(system_instructions(&Request::default()), None);
    }
}
