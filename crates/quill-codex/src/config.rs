use std::path::PathBuf;

const DEFAULT_CODEX_BIN: &str = "codex";
const DEFAULT_CLIENT_NAME: &str = "quill";
const DEFAULT_THREAD_CAPACITY: usize = 100;
const DEFAULT_QUEUE_DEPTH: usize = 64;
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_TOKEN_CONTEXT_WINDOW: u64 = 200_000;

#[derive(Debug, Clone)]
pub struct CodexConfig {
    /// Program to spawn. Defaults to `codex` (from PATH).
    pub codex_bin: PathBuf,

    /// Arguments passed to the spawned program. Defaults to `["app-server"]`.
    ///
    /// Notes:
    /// - This exists so tests (and advanced callers) can run a mock JSON-RPC server.
    /// - If you override this, you are responsible for including `app-server` if needed.
    pub codex_args: Vec<String>,

    /// Model name forwarded to `thread/start`. When unset, the server picks
    /// its default.
    pub model: Option<String>,

    /// `clientInfo` advertised during the `initialize` handshake.
    pub client_name: String,
    pub client_version: String,

    /// Conversation → thread mappings kept before wholesale eviction.
    pub thread_capacity: usize,

    /// Depth of each per-thread notification queue.
    pub queue_depth: usize,

    /// Largest stdout line the framing decoder accepts.
    pub max_frame_bytes: usize,

    /// Advertised context window until the protocol exposes discovery.
    pub token_context_window: u64,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            codex_bin: PathBuf::from(DEFAULT_CODEX_BIN),
            codex_args: vec!["app-server".to_string()],
            model: None,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            thread_capacity: DEFAULT_THREAD_CAPACITY,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            token_context_window: DEFAULT_TOKEN_CONTEXT_WINDOW,
        }
    }
}

impl CodexConfig {
    pub fn new() -> Self {
        Self::default()
    }
}
