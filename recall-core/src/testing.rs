//! In-memory fakes for exercising sessions and chat turns without
//! spawning processes or calling a real model.
//!
//! Enabled for this crate's tests and, through the `testing` feature,
//! for downstream crates.

use async_trait::async_trait;
use recall_llm::{BackendError, ChatMessage, LlmBackend, Role};
use recall_mcp::{
    methods, JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpClient, McpError, Transport,
    MCP_PROTOCOL_VERSION,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::SessionError;
use crate::identity::UserId;
use crate::session::{MemorySession, MemorySnippet, MemoryTools, SessionLauncher};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared, ordered record of tool calls across all fake peers.
pub type CallLog = Arc<Mutex<Vec<String>>>;

// ============================================================================
// Fake memory peer
// ============================================================================

/// A memory peer living in the test process, speaking MCP through the
/// [`Transport`] trait.
///
/// Call log entries look like `alice:retrieve_memory:Hi` and
/// `alice:add_memory:Hi=>Hello!`.
pub struct FakeMemoryPeer {
    user: UserId,
    memories: Arc<Mutex<Vec<MemorySnippet>>>,
    log: CallLog,
    dead: AtomicBool,
    closed: AtomicBool,
    hang_retrieve: AtomicBool,
    fail_store: AtomicBool,
    retrieve_reply: Mutex<Option<String>>,
    call_delay: Mutex<Duration>,
    close_delay: Mutex<Duration>,
}

impl FakeMemoryPeer {
    pub fn new(user: UserId) -> Self {
        Self::with_store(user, Arc::default(), Arc::default())
    }

    fn with_store(user: UserId, memories: Arc<Mutex<Vec<MemorySnippet>>>, log: CallLog) -> Self {
        Self {
            user,
            memories,
            log,
            dead: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            hang_retrieve: AtomicBool::new(false),
            fail_store: AtomicBool::new(false),
            retrieve_reply: Mutex::new(None),
            call_delay: Mutex::new(Duration::ZERO),
            close_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Simulate the peer process exiting.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    /// Make retrieve calls block until the client gives up.
    pub fn hang_retrieve(&self, hang: bool) {
        self.hang_retrieve.store(hang, Ordering::SeqCst);
    }

    /// Make store calls report a tool-level error.
    pub fn fail_store(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::SeqCst);
    }

    /// Replace the text of retrieve replies.
    pub fn set_retrieve_reply(&self, text: impl Into<String>) {
        *lock(&self.retrieve_reply) = Some(text.into());
    }

    /// Delay every tool call.
    pub fn set_call_delay(&self, delay: Duration) {
        *lock(&self.call_delay) = delay;
    }

    /// Make `close` take this long, like a peer working through its
    /// shutdown grace period.
    pub fn set_close_delay(&self, delay: Duration) {
        *lock(&self.close_delay) = delay;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn memories(&self) -> Vec<MemorySnippet> {
        lock(&self.memories).clone()
    }

    fn record(&self, entry: String) {
        lock(&self.log).push(format!("{}:{entry}", self.user));
    }

    fn text_result(text: impl Into<String>, is_error: bool) -> serde_json::Value {
        json!({"content": [{"type": "text", "text": text.into()}], "isError": is_error})
    }

    async fn call_tool(&self, params: &serde_json::Value) -> Result<serde_json::Value, JsonRpcError> {
        let name = params["name"].as_str().unwrap_or_default();
        let args = &params["arguments"];
        let arg = |key: &str| args[key].as_str().unwrap_or_default().to_string();

        let delay = *lock(&self.call_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match name {
            "retrieve_memory" => {
                self.record(format!("retrieve_memory:{}", arg("query")));
                if self.hang_retrieve.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                let canned = lock(&self.retrieve_reply).clone();
                let text = match canned {
                    Some(text) => text,
                    None => json!({
                        "status": "success",
                        "query": arg("query"),
                        "short_term_memory": self.memories(),
                    })
                    .to_string(),
                };
                Ok(Self::text_result(text, false))
            }
            "add_memory" => {
                self.record(format!("add_memory:{}=>{}", arg("user_input"), arg("agent_response")));
                if self.fail_store.load(Ordering::SeqCst) {
                    return Ok(Self::text_result("storage backend unavailable", true));
                }
                lock(&self.memories).push(MemorySnippet {
                    user_input: arg("user_input"),
                    agent_response: arg("agent_response"),
                    timestamp: None,
                });
                Ok(Self::text_result(
                    json!({"status": "success", "message": "Memory added"}).to_string(),
                    false,
                ))
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }
}

#[async_trait]
impl Transport for FakeMemoryPeer {
    async fn send(&self, request: &JsonRpcRequest) -> recall_mcp::Result<JsonRpcResponse> {
        if self.closed.load(Ordering::SeqCst) || self.dead.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        let id = request.id.clone().unwrap_or(0i64.into());

        let reply = match request.method.as_str() {
            methods::INITIALIZE => Ok(json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake-memory", "version": "0.0.0"}
            })),
            methods::TOOLS_LIST => Ok(json!({
                "tools": [{"name": "retrieve_memory"}, {"name": "add_memory"}]
            })),
            methods::TOOLS_CALL => {
                let params = request.params.clone().unwrap_or_default();
                self.call_tool(&params).await
            }
            other => Err(JsonRpcError::method_not_found(other)),
        };

        // a peer that died mid-call never answers
        if self.dead.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }

        Ok(match reply {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::error(Some(id), error),
        })
    }

    async fn notify(&self, _request: &JsonRpcRequest) -> recall_mcp::Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> recall_mcp::Result<()> {
        let delay = *lock(&self.close_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Build an initialized session over a fresh fake peer.
pub async fn fake_session(user: &UserId) -> (Arc<FakeMemoryPeer>, MemorySession) {
    let peer = Arc::new(FakeMemoryPeer::new(user.clone()));
    let client = McpClient::new(peer.clone(), format!("memory:{user}"))
        .with_request_timeout(Duration::from_secs(5));
    if let Err(e) = client.initialize().await {
        panic!("fake peer handshake failed: {e}");
    }
    let session = MemorySession::new(user.clone(), client, MemoryTools::default(), None);
    (peer, session)
}

// ============================================================================
// Fake launcher
// ============================================================================

/// Launcher producing sessions over [`FakeMemoryPeer`]s.
///
/// Memories persist per user across launches, like the on-disk store of a
/// real peer.
pub struct FakeLauncher {
    spawns: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    overlapping: AtomicUsize,
    fail_launches: AtomicUsize,
    launch_delay: Mutex<Duration>,
    request_timeout: Mutex<Duration>,
    hold: Mutex<Option<Arc<Semaphore>>>,
    stores: Mutex<HashMap<UserId, Arc<Mutex<Vec<MemorySnippet>>>>>,
    peers: Mutex<HashMap<UserId, Vec<Arc<FakeMemoryPeer>>>>,
    log: CallLog,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            spawns: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            overlapping: AtomicUsize::new(0),
            fail_launches: AtomicUsize::new(0),
            launch_delay: Mutex::new(Duration::ZERO),
            request_timeout: Mutex::new(Duration::from_secs(5)),
            hold: Mutex::new(None),
            stores: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            log: Arc::default(),
        }
    }

    /// Number of launch attempts so far, failed ones included.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Highest number of launches that were running at the same time,
    /// across all users.
    pub fn max_concurrent_launches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Launches that started while an earlier peer for the same user was
    /// still open.
    pub fn overlapping_launches(&self) -> usize {
        self.overlapping.load(Ordering::SeqCst)
    }

    /// Fail the next `n` launches.
    pub fn fail_next(&self, n: usize) {
        self.fail_launches.store(n, Ordering::SeqCst);
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *lock(&self.launch_delay) = delay;
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        *lock(&self.request_timeout) = timeout;
    }

    /// Block launches until permits are added to the returned semaphore,
    /// one permit per launch.
    pub fn hold_launches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.hold) = Some(gate.clone());
        gate
    }

    /// The most recently launched peer for `user`.
    pub fn peer(&self, user: &UserId) -> Option<Arc<FakeMemoryPeer>> {
        lock(&self.peers).get(user).and_then(|p| p.last().cloned())
    }

    /// Every peer launched for `user`, oldest first.
    pub fn peers(&self, user: &UserId) -> Vec<Arc<FakeMemoryPeer>> {
        lock(&self.peers).get(user).cloned().unwrap_or_default()
    }

    /// Seed remembered exchanges for `user`.
    pub fn remember(&self, user: &UserId, user_input: &str, agent_response: &str) {
        let store = self.store_for(user);
        lock(&store).push(MemorySnippet {
            user_input: user_input.into(),
            agent_response: agent_response.into(),
            timestamp: None,
        });
    }

    /// Ordered tool calls across all peers.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    fn store_for(&self, user: &UserId) -> Arc<Mutex<Vec<MemorySnippet>>> {
        lock(&self.stores).entry(user.clone()).or_default().clone()
    }
}

#[async_trait]
impl SessionLauncher for FakeLauncher {
    async fn launch(&self, user: &UserId) -> Result<MemorySession, SessionError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if self.peers(user).iter().any(|p| !p.is_closed()) {
            self.overlapping.fetch_add(1, Ordering::SeqCst);
        }

        let launched = self.start(user).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        launched
    }
}

impl FakeLauncher {
    async fn start(&self, user: &UserId) -> Result<MemorySession, SessionError> {
        let hold = lock(&self.hold).clone();
        if let Some(hold) = hold {
            if let Ok(permit) = hold.acquire().await {
                permit.forget();
            }
        }
        let delay = *lock(&self.launch_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .fail_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SessionError::Launch(McpError::Closed));
        }

        let peer = Arc::new(FakeMemoryPeer::with_store(
            user.clone(),
            self.store_for(user),
            self.log.clone(),
        ));
        let timeout = *lock(&self.request_timeout);
        let client =
            McpClient::new(peer.clone(), format!("memory:{user}")).with_request_timeout(timeout);
        client.initialize().await.map_err(SessionError::Launch)?;

        lock(&self.peers).entry(user.clone()).or_default().push(peer);
        Ok(MemorySession::new(
            user.clone(),
            client,
            MemoryTools::default(),
            None,
        ))
    }
}

// ============================================================================
// Scripted LLM backend
// ============================================================================

/// LLM backend that replays queued replies, falling back to
/// `"echo: <last user message>"`.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, BackendError>>>,
    conversations: Mutex<Vec<Vec<ChatMessage>>>,
    delay: Mutex<Duration>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: BackendError) {
        lock(&self.replies).push_back(Err(error));
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Conversations received so far.
    pub fn conversations(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.conversations).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.conversations).len()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, BackendError> {
        lock(&self.conversations).push(messages.to_vec());

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let queued = lock(&self.replies).pop_front();
        match queued {
            Some(reply) => reply,
            None => {
                let last = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                Ok(format!("echo: {last}"))
            }
        }
    }
}
