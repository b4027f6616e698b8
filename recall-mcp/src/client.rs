//! MCP Client
//!
//! Client for a single MCP server: handshake, tool discovery and tool calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::transport::{StdioTransport, Transport};
use crate::types::{
    methods, CallToolParams, CallToolResult, ClientCapabilities, Implementation,
    InitializeParams, InitializeResult, JsonRpcId, JsonRpcRequest, ListToolsResult, McpTool,
    ToolContent, MCP_PROTOCOL_VERSION,
};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// MCP client for connecting to external MCP servers
pub struct McpClient {
    transport: Arc<dyn Transport>,
    server_name: String,
    tools: RwLock<Vec<McpTool>>,
    server_info: RwLock<Option<Implementation>>,
    initialized: AtomicBool,
    next_id: AtomicI64,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl McpClient {
    /// Create a new MCP client with the given transport
    pub fn new(transport: Arc<dyn Transport>, server_name: impl Into<String>) -> Self {
        Self {
            transport,
            server_name: server_name.into(),
            tools: RwLock::new(Vec::new()),
            server_info: RwLock::new(None),
            initialized: AtomicBool::new(false),
            next_id: AtomicI64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Spawn a local MCP server and complete the handshake.
    ///
    /// The child is shut down again if the handshake fails.
    pub async fn connect_stdio(
        server_name: impl Into<String>,
        command: &[String],
        environment: &HashMap<String, String>,
        request_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Result<Self> {
        let name = server_name.into();
        tracing::info!(server = %name, "Connecting to local MCP server");

        let transport = StdioTransport::spawn(command, environment)?.with_shutdown_grace(shutdown_grace);
        let client = Self::new(Arc::new(transport), name).with_request_timeout(request_timeout);

        if let Err(e) = client.initialize().await {
            tracing::warn!(server = %client.server_name, error = %e, "MCP handshake failed");
            let _ = client.close().await;
            return Err(e);
        }

        Ok(client)
    }

    /// Get the next request ID
    fn next_request_id(&self) -> JsonRpcId {
        JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Send one request, bounded by the request timeout and the client's
    /// cancellation token. A timed-out stream may still carry the late reply,
    /// so callers should treat the connection as unusable afterwards.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut request = JsonRpcRequest::new(self.next_request_id(), method);
        if let Some(params) = params {
            request = request.with_params(params);
        }

        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(McpError::Cancelled),
            sent = tokio::time::timeout(self.request_timeout, self.transport.send(&request)) => {
                match sent {
                    Ok(response) => response?,
                    Err(_) => {
                        return Err(McpError::Timeout {
                            method: method.to_string(),
                            elapsed: self.request_timeout,
                        })
                    }
                }
            }
        };

        if let Some(error) = response.error {
            return Err(McpError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }

        response
            .result
            .ok_or_else(|| McpError::Protocol(format!("{method} returned no result")))
    }

    /// Run the initialize handshake and announce readiness.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "recall".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| McpError::Protocol(format!("failed to encode initialize params: {e}")))?;

        let value = self.request(methods::INITIALIZE, Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("invalid initialize result: {e}")))?;

        tracing::info!(
            server = %self.server_name,
            peer = %result.server_info.name,
            peer_version = %result.server_info.version,
            protocol = %result.protocol_version,
            "MCP server initialized"
        );

        let notification = JsonRpcRequest::notification(methods::INITIALIZED);
        self.transport.notify(&notification).await?;

        *self.server_info.write().await = Some(result.server_info.clone());
        self.initialized.store(true, Ordering::Release);

        Ok(result)
    }

    /// Fetch the server's tools and cache them.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.ensure_initialized()?;

        let value = self.request(methods::TOOLS_LIST, None).await?;
        let result: ListToolsResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("invalid tools/list result: {e}")))?;

        tracing::debug!(
            server = %self.server_name,
            count = result.tools.len(),
            "MCP tools listed"
        );

        *self.tools.write().await = result.tools.clone();
        Ok(result.tools)
    }

    /// Tools seen by the last `list_tools` call.
    pub async fn cached_tools(&self) -> Vec<McpTool> {
        self.tools.read().await.clone()
    }

    /// Call a tool by name with the given arguments.
    ///
    /// A JSON-RPC error from the server comes back as an `is_error` result;
    /// only transport and framing failures are `Err`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolResult> {
        self.ensure_initialized()?;

        let params = CallToolParams {
            name: name.into(),
            arguments,
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| McpError::Protocol(format!("failed to encode tool call: {e}")))?;

        tracing::debug!(server = %self.server_name, tool = %name, "Calling MCP tool");

        match self.request(methods::TOOLS_CALL, Some(params)).await {
            Ok(value) => serde_json::from_value(value)
                .map_err(|e| McpError::Protocol(format!("invalid tool result: {e}"))),
            Err(McpError::Rpc { code, message, .. }) => Ok(CallToolResult {
                content: vec![ToolContent::text(format!("MCP error: {message} ({code})"))],
                is_error: true,
            }),
            Err(e) => Err(e),
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(McpError::NotInitialized)
        }
    }

    /// Get the server name
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub async fn server_info(&self) -> Option<Implementation> {
        self.server_info.read().await.clone()
    }

    /// Check if the client is initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Check if the connection is alive
    pub async fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled() && self.transport.is_alive().await
    }

    /// Cancel in-flight requests and close the transport.
    pub async fn close(&self) -> Result<()> {
        tracing::info!(server = %self.server_name, "Closing MCP client");
        self.cancel.cancel();
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JsonRpcError, JsonRpcResponse};
    use async_trait::async_trait;
    use serde_json::json;

    // Mock transport for testing
    #[derive(Default)]
    struct MockTransport {
        responses: std::sync::Mutex<Vec<JsonRpcResponse>>,
        sent: std::sync::Mutex<Vec<JsonRpcRequest>>,
        hang: bool,
        closed: AtomicBool,
    }

    impl MockTransport {
        fn new(responses: Vec<JsonRpcResponse>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses),
                ..Self::default()
            }
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::default()
            }
        }

        fn methods(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.method.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
            self.sent.lock().unwrap().push(request.clone());
            if self.hang {
                std::future::pending::<()>().await;
            }
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(McpError::Closed);
            }
            Ok(responses.remove(0))
        }

        async fn notify(&self, request: &JsonRpcRequest) -> Result<()> {
            self.sent.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn is_alive(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn init_response(id: i64) -> JsonRpcResponse {
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "memory", "version": "1.0"}
            }),
        )
    }

    fn client_with(responses: Vec<JsonRpcResponse>) -> (Arc<MockTransport>, McpClient) {
        let transport = Arc::new(MockTransport::new(responses));
        let client = McpClient::new(transport.clone(), "test-server");
        (transport, client)
    }

    #[test]
    fn client_server_name() {
        let (_, client) = client_with(vec![]);
        assert_eq!(client.server_name(), "test-server");
        assert!(!client.is_initialized());
    }

    #[tokio::test]
    async fn client_call_tool_fails_when_not_initialized() {
        let (_, client) = client_with(vec![]);
        let err = client
            .call_tool("test", serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotInitialized));
    }

    #[tokio::test]
    async fn initialize_sends_handshake_then_notification() {
        let (transport, client) = client_with(vec![init_response(1)]);
        let result = client.initialize().await.unwrap();

        assert_eq!(result.server_info.name, "memory");
        assert!(client.is_initialized());
        assert_eq!(
            transport.methods(),
            vec![methods::INITIALIZE, methods::INITIALIZED]
        );
        assert_eq!(client.server_info().await.unwrap().version, "1.0");
    }

    #[tokio::test]
    async fn initialize_error_is_rpc_error() {
        let (_, client) = client_with(vec![JsonRpcResponse::error(
            Some(1i64.into()),
            JsonRpcError::new(-32603, "boom"),
        )]);
        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32603, .. }));
        assert!(!client.is_initialized());
    }

    #[tokio::test]
    async fn list_tools_caches_result() {
        let (_, client) = client_with(vec![
            init_response(1),
            JsonRpcResponse::success(
                2i64,
                json!({"tools": [{"name": "retrieve_memory"}, {"name": "add_memory"}]}),
            ),
        ]);
        client.initialize().await.unwrap();

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(client.cached_tools().await[1].name, "add_memory");
    }

    #[tokio::test]
    async fn call_tool_returns_content() {
        let (transport, client) = client_with(vec![
            init_response(1),
            JsonRpcResponse::success(
                2i64,
                json!({"content": [{"type": "text", "text": "ok"}], "isError": false}),
            ),
        ]);
        client.initialize().await.unwrap();

        let mut args = serde_json::Map::new();
        args.insert("query".into(), json!("hello"));
        let result = client.call_tool("retrieve_memory", args).await.unwrap();

        assert_eq!(result.first_text(), Some("ok"));
        let sent = transport.sent.lock().unwrap();
        let call = sent.last().unwrap();
        assert_eq!(call.method, methods::TOOLS_CALL);
        assert_eq!(call.params.as_ref().unwrap()["arguments"]["query"], "hello");
    }

    #[tokio::test]
    async fn call_tool_rpc_error_becomes_error_result() {
        let (_, client) = client_with(vec![
            init_response(1),
            JsonRpcResponse::error(Some(2i64.into()), JsonRpcError::method_not_found("nope")),
        ]);
        client.initialize().await.unwrap();

        let result = client.call_tool("nope", serde_json::Map::new()).await.unwrap();
        assert!(result.is_error);
        assert!(result.first_text().unwrap().contains("Method not found"));
    }

    #[tokio::test]
    async fn missing_result_is_protocol_error() {
        let (_, client) = client_with(vec![JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(1i64.into()),
            result: None,
            error: None,
        }]);
        let err = client.initialize().await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn request_times_out() {
        let client = McpClient::new(Arc::new(MockTransport::hanging()), "slow")
            .with_request_timeout(Duration::from_millis(20));
        let err = client.initialize().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn close_cancels_in_flight_request() {
        let transport = Arc::new(MockTransport::hanging());
        let client = Arc::new(McpClient::new(transport.clone(), "hung"));

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.initialize().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.close().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Cancelled));
        assert!(!client.is_alive().await);
    }

    #[tokio::test]
    async fn transport_failure_propagates() {
        let (_, client) = client_with(vec![]);
        let err = client.initialize().await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
