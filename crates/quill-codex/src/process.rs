//! Subprocess supervisor and message router.
//!
//! One `Process` owns the `codex app-server` child: its stdin (serialized
//! writes), a reader task that owns stdout and routes every decoded message,
//! and a `done` signal fired when the reader observes EOF. Routing is split
//! into two disjoint paths so a response can never be stolen by another call:
//! responses resolve through the pending table by id, everything else is
//! queued per thread.

use quill_llm::LlmError;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::CodexConfig;
use crate::framing::encode_frame;
use crate::framing::FrameError;
use crate::framing::FramedReader;
use crate::protocol::RpcError;
use crate::protocol::RpcErrorResponse;
use crate::protocol::RpcMessage;
use crate::protocol::RpcNotification;
use crate::protocol::RpcRequest;
use crate::protocol::RpcResponse;

const EXITED: &str = "codex subprocess exited";

pub(crate) struct Process {
    child: AsyncMutex<Child>,
    stdin: AsyncMutex<ChildStdin>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<String, oneshot::Sender<RpcMessage>>>,
    subs: Mutex<HashMap<String, Arc<ThreadQueue>>>,
    queue_depth: usize,
    done_rx: watch::Receiver<bool>,
    init: OnceCell<()>,
}

impl Process {
    /// Start the child and its reader/stderr tasks. The child stays alive
    /// until killed or it exits on its own; `done` fires when the reader sees
    /// EOF or an unrecoverable read failure.
    pub fn spawn(config: &CodexConfig) -> Result<Arc<Self>, LlmError> {
        let mut cmd = Command::new(&config.codex_bin);
        cmd.args(&config.codex_args)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            LlmError::Transport(format!("spawn {}: {err}", config.codex_bin.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .expect("codex app-server stdin must be piped");
        let stdout = child
            .stdout
            .take()
            .expect("codex app-server stdout must be piped");
        let stderr = child.stderr.take();

        let (done_tx, done_rx) = watch::channel(false);

        let proc = Arc::new(Self {
            child: AsyncMutex::new(child),
            stdin: AsyncMutex::new(stdin),
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
            queue_depth: config.queue_depth,
            done_rx,
            init: OnceCell::new(),
        });

        tokio::spawn(run_reader_loop(
            Arc::clone(&proc),
            stdout,
            config.max_frame_bytes,
            done_tx,
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(run_stderr_loop(stderr));
        }

        Ok(proc)
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Resolves when the reader task has finished, for whatever reason.
    pub async fn exited(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Run the protocol handshake exactly once for this child. Concurrent
    /// callers wait for the first one; a failed handshake is not cached (the
    /// failing child is discarded by the caller anyway).
    pub async fn ensure_initialized<F, Fut>(&self, handshake: F) -> Result<(), LlmError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), LlmError>>,
    {
        self.init.get_or_try_init(handshake).await.map(|_| ())
    }

    /// Register a response slot for an outbound request id. The guard removes
    /// the slot on every exit path, including cancellation.
    pub fn register_pending(
        self: &Arc<Self>,
        id: i64,
    ) -> (oneshot::Receiver<RpcMessage>, PendingGuard) {
        let (tx, rx) = oneshot::channel();
        let key = id.to_string();
        self.pending
            .lock()
            .unwrap()
            .insert(key.clone(), tx);
        let guard = PendingGuard {
            proc: Arc::clone(self),
            key,
        };
        (rx, guard)
    }

    /// Subscribe to all routed messages for a thread. Dropping the returned
    /// subscription unregisters it.
    pub fn subscribe(self: &Arc<Self>, thread_id: &str) -> Subscription {
        let queue = Arc::new(ThreadQueue::new(thread_id.to_string(), self.queue_depth));
        self.subs
            .lock()
            .unwrap()
            .insert(thread_id.to_string(), Arc::clone(&queue));
        Subscription {
            proc: Arc::clone(self),
            queue,
        }
    }

    /// Write one message to the child's stdin. The stdin mutex keeps
    /// concurrent writers from interleaving bytes.
    pub async fn send<T: Serialize>(&self, msg: &T) -> Result<(), LlmError> {
        if self.is_done() {
            return Err(LlmError::Transport(EXITED.to_string()));
        }
        let frame =
            encode_frame(msg).map_err(|err| LlmError::Protocol(format!("encode message: {err}")))?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&frame)
            .await
            .map_err(|err| LlmError::Transport(format!("write to codex: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| LlmError::Transport(format!("flush to codex: {err}")))?;
        Ok(())
    }

    /// Send a request and wait for its response, without draining any thread
    /// subscription. Used for the handshake and thread creation.
    pub async fn call(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, LlmError> {
        let id = self.next_request_id();
        let (resp_rx, _guard) = self.register_pending(id);
        self.send(&RpcRequest { id, method, params }).await?;

        tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            _ = self.exited() => Err(LlmError::Transport(EXITED.to_string())),
            resp = resp_rx => match resp {
                Ok(msg) => response_result(method, msg),
                Err(_) => Err(LlmError::Transport(EXITED.to_string())),
            },
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LlmError> {
        self.send(&RpcNotification { method, params }).await
    }

    /// Answer a server-initiated request.
    pub async fn respond(&self, id: Value, result: Value) -> Result<(), LlmError> {
        self.send(&RpcResponse { id, result }).await
    }

    /// Answer a server-initiated request with a JSON-RPC error so the child
    /// does not stall waiting on a method we do not handle.
    pub async fn respond_error(
        &self,
        id: Value,
        code: i64,
        message: String,
    ) -> Result<(), LlmError> {
        self.send(&RpcErrorResponse {
            id,
            error: RpcError { code, message },
        })
        .await
    }

    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    fn route(&self, msg: RpcMessage) {
        if msg.is_response() {
            if let Some(key) = msg.id_key() {
                let slot = self.pending.lock().unwrap().remove(&key);
                if let Some(tx) = slot {
                    let _ = tx.send(msg);
                    return;
                }
                // No pending call (deregistered by a cancelled caller); falls
                // through to thread routing like any other message.
            }
        }

        let thread_id = msg.thread_id().unwrap_or_default().to_string();
        let method = msg.method.clone().unwrap_or_default();
        if thread_id.is_empty() {
            tracing::warn!(%method, "dropping message with no thread context");
            return;
        }
        let queue = self.subs.lock().unwrap().get(&thread_id).cloned();
        match queue {
            Some(queue) => queue.push(msg),
            None => tracing::warn!(%thread_id, %method, "no subscriber for thread"),
        }
    }

    /// Drop every pending response slot; each waiting caller's receiver
    /// closes, unblocking it with a transport error.
    fn fail_pending(&self) {
        self.pending.lock().unwrap().clear();
    }
}

/// Map a response message to its result, turning a JSON-RPC error into a
/// protocol error for the caller.
pub(crate) fn response_result(method: &str, msg: RpcMessage) -> Result<Value, LlmError> {
    if let Some(err) = msg.error {
        return Err(LlmError::Protocol(format!(
            "{method}: server error {}: {}",
            err.code, err.message
        )));
    }
    Ok(msg.result.unwrap_or(Value::Null))
}

pub(crate) struct PendingGuard {
    proc: Arc<Process>,
    key: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.proc.pending.lock().unwrap().remove(&self.key);
    }
}

/// Bounded per-thread message queue. Overflow drops the oldest undelivered
/// message: blocking the reader here would stall every other thread, and the
/// authoritative turn outcome travels in `turn/completed`.
pub(crate) struct ThreadQueue {
    thread_id: String,
    capacity: usize,
    queue: Mutex<VecDeque<RpcMessage>>,
    ready: Notify,
}

impl ThreadQueue {
    fn new(thread_id: String, capacity: usize) -> Self {
        Self {
            thread_id,
            capacity,
            queue: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    fn push(&self, msg: RpcMessage) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
                tracing::warn!(
                    thread_id = %self.thread_id,
                    "subscriber queue full; dropping oldest message"
                );
            }
            queue.push_back(msg);
        }
        self.ready.notify_one();
    }

    async fn recv(&self) -> RpcMessage {
        loop {
            if let Some(msg) = self.queue.lock().unwrap().pop_front() {
                return msg;
            }
            self.ready.notified().await;
        }
    }
}

pub(crate) struct Subscription {
    proc: Arc<Process>,
    queue: Arc<ThreadQueue>,
}

impl Subscription {
    /// Next message routed to this thread, in arrival order. Pends while the
    /// queue is empty; callers select this against `Process::exited`.
    pub async fn recv(&self) -> RpcMessage {
        self.queue.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Only remove our own queue: a newer subscription for the same thread
        // must not be torn down by a stale guard.
        let mut subs = self.proc.subs.lock().unwrap();
        if let Some(current) = subs.get(&self.queue.thread_id) {
            if Arc::ptr_eq(current, &self.queue) {
                subs.remove(&self.queue.thread_id);
            }
        }
    }
}

async fn run_reader_loop(
    proc: Arc<Process>,
    stdout: ChildStdout,
    max_frame_bytes: usize,
    done_tx: watch::Sender<bool>,
) {
    let mut frames = FramedReader::new(stdout, max_frame_bytes);
    loop {
        let line = match frames.next_frame().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(FrameError::Oversized { limit }) => {
                tracing::warn!(limit, "dropping oversized line from codex app-server");
                continue;
            }
            Err(FrameError::Io(err)) => {
                tracing::warn!(error = %err, "codex app-server stdout read failed");
                break;
            }
        };

        let msg: RpcMessage = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(error = %err, %line, "unparseable line from codex app-server");
                continue;
            }
        };
        proc.route(msg);
    }

    // Unblock everything waiting on this child: pending callers see their
    // response slot close, subscribers observe the done signal.
    proc.fail_pending();
    let _ = done_tx.send(true);
}

async fn run_stderr_loop(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        tracing::debug!("codex app-server stderr: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(method: &str) -> RpcMessage {
        serde_json::from_str(&format!(
            r#"{{"method":"{method}","params":{{"threadId":"thr_1"}}}}"#
        ))
        .expect("decode test message")
    }

    #[tokio::test]
    async fn thread_queue_delivers_in_fifo_order() {
        let queue = ThreadQueue::new("thr_1".to_string(), 8);
        queue.push(msg("first"));
        queue.push(msg("second"));
        assert_eq!(queue.recv().await.method.as_deref(), Some("first"));
        assert_eq!(queue.recv().await.method.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn thread_queue_overflow_drops_oldest() {
        let queue = ThreadQueue::new("thr_1".to_string(), 2);
        queue.push(msg("a"));
        queue.push(msg("b"));
        queue.push(msg("c"));
        assert_eq!(queue.recv().await.method.as_deref(), Some("b"));
        assert_eq!(queue.recv().await.method.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn thread_queue_recv_wakes_on_push() {
        let queue = Arc::new(ThreadQueue::new("thr_1".to_string(), 8));
        let pusher = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            pusher.push(msg("late"));
        });
        assert_eq!(queue.recv().await.method.as_deref(), Some("late"));
        handle.await.expect("pusher task");
    }
}
