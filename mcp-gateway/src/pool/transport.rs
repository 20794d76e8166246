//! The four backend transports (§4.1, §6): stdio, SSE, HTTP, WebSocket.
//!
//! Each transport implements [`TransportClient`], a small capability-probe
//! and invoke surface the rest of the gateway depends on abstractly. Wire
//! framing is JSON-RPC 2.0-shaped (`{jsonrpc, id, method, params}` /
//! `{jsonrpc, id, result|error}`) over whichever byte stream the transport
//! owns, since that's the protocol MCP-style servers speak; the exact
//! schema of `params`/`result` is opaque `serde_json::Value` to the pool.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// A capability entry as reported by a backend's `list_tools`/`list_prompts`/
/// `list_resources` call, before it's attached to a server id and folded
/// into [`crate::registry::CapabilityEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: i64,
    method: String,
    params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    id: i64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcError {
    message: String,
}

/// Backend transport descriptor; part of [`crate::pool::ServerConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        headers: HashMap<String, String>,
    },
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
    WebSocket {
        url: String,
        reconnect: WebSocketReconnectPolicy,
        heartbeat: WebSocketHeartbeatPolicy,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WebSocketReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub jitter: bool,
}

impl Default for WebSocketReconnectPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, backoff_ms: 500, jitter: true }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WebSocketHeartbeatPolicy {
    pub interval_ms: u64,
}

impl Default for WebSocketHeartbeatPolicy {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

/// Auth descriptor; part of [`crate::pool::ServerConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthDescriptor {
    None,
    ApiKey { header: String, value: String },
    OAuth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    },
}

/// The capability surface every transport exposes to the pool.
#[async_trait::async_trait]
pub trait TransportClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<CapabilityDescriptor>>;
    async fn list_prompts(&self) -> Result<Vec<CapabilityDescriptor>>;
    async fn list_resources(&self) -> Result<Vec<CapabilityDescriptor>>;
    async fn call_tool(&self, name: &str, params: serde_json::Value, timeout: Duration) -> Result<serde_json::Value>;
    async fn get_prompt(&self, name: &str, args: serde_json::Value, timeout: Duration) -> Result<serde_json::Value>;
    async fn read_resource(&self, uri: &str, timeout: Duration) -> Result<serde_json::Value>;
    /// Low-cost health probe; default implementation lists tools.
    async fn probe(&self, timeout: Duration) -> Result<()> {
        self.list_tools_with_timeout(timeout).await.map(|_| ())
    }
    async fn list_tools_with_timeout(&self, timeout: Duration) -> Result<Vec<CapabilityDescriptor>> {
        tokio::time::timeout(timeout, self.list_tools())
            .await
            .map_err(|_| Error::Timeout("list_tools probe".into()))?
    }
    async fn close(&self);
}

fn rpc_request(method: &str, params: serde_json::Value, id: i64) -> String {
    let req = JsonRpcRequest { jsonrpc: "2.0", id, method: method.to_string(), params };
    serde_json::to_string(&req).unwrap_or_default()
}

fn parse_capabilities(result: Option<serde_json::Value>, field: &str) -> Vec<CapabilityDescriptor> {
    result
        .and_then(|v| v.get(field).cloned())
        .and_then(|v| serde_json::from_value::<Vec<CapabilityDescriptor>>(v).ok())
        .unwrap_or_default()
}

// ===========================================================================
// stdio transport
// ===========================================================================

/// A child-process transport; auth is expressed only through the child's
/// environment (§4.1). The client owns stdin/stdout; requests are
/// serialized through a mutex since a single pipe pair is shared.
pub struct StdioTransportClient {
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
    next_id: AtomicI64,
}

impl StdioTransportClient {
    pub async fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Upstream(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("child stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout not piped".into()))?;

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            next_id: AtomicI64::new(1),
        })
    }

    async fn request(&self, method: &str, params: serde_json::Value, timeout: Duration) -> Result<Option<serde_json::Value>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = rpc_request(method, params, id);

        tokio::time::timeout(timeout, async {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| Error::Upstream(format!("stdio write failed: {e}")))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| Error::Upstream(format!("stdio write failed: {e}")))?;
            drop(stdin);

            let mut stdout = self.stdout.lock().await;
            let mut response_line = String::new();
            stdout
                .read_line(&mut response_line)
                .await
                .map_err(|e| Error::Upstream(format!("stdio read failed: {e}")))?;

            if response_line.is_empty() {
                return Err(Error::Upstream("backend closed stdout".into()));
            }

            let response: JsonRpcResponse = serde_json::from_str(response_line.trim())
                .map_err(|e| Error::Upstream(format!("invalid JSON-RPC response: {e}")))?;

            if let Some(err) = response.error {
                return Err(Error::Upstream(err.message));
            }
            Ok(response.result)
        })
        .await
        .map_err(|_| Error::Timeout(format!("{method} timed out")))?
    }
}

#[async_trait::async_trait]
impl TransportClient for StdioTransportClient {
    async fn list_tools(&self) -> Result<Vec<CapabilityDescriptor>> {
        let result = self.request("tools/list", serde_json::json!({}), Duration::from_secs(10)).await?;
        Ok(parse_capabilities(result, "tools"))
    }

    async fn list_prompts(&self) -> Result<Vec<CapabilityDescriptor>> {
        let result = self.request("prompts/list", serde_json::json!({}), Duration::from_secs(10)).await?;
        Ok(parse_capabilities(result, "prompts"))
    }

    async fn list_resources(&self) -> Result<Vec<CapabilityDescriptor>> {
        let result = self.request("resources/list", serde_json::json!({}), Duration::from_secs(10)).await?;
        Ok(parse_capabilities(result, "resources"))
    }

    async fn call_tool(&self, name: &str, params: serde_json::Value, timeout: Duration) -> Result<serde_json::Value> {
        let result = self
            .request("tools/call", serde_json::json!({"name": name, "arguments": params}), timeout)
            .await?;
        Ok(result.unwrap_or(serde_json::Value::Null))
    }

    async fn get_prompt(&self, name: &str, args: serde_json::Value, timeout: Duration) -> Result<serde_json::Value> {
        let result = self
            .request("prompts/get", serde_json::json!({"name": name, "arguments": args}), timeout)
            .await?;
        Ok(result.unwrap_or(serde_json::Value::Null))
    }

    async fn read_resource(&self, uri: &str, timeout: Duration) -> Result<serde_json::Value> {
        let result = self.request("resources/read", serde_json::json!({"uri": uri}), timeout).await?;
        Ok(result.unwrap_or(serde_json::Value::Null))
    }

    async fn close(&self) {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

// ===========================================================================
// http / sse transport (request/response over reqwest; sse additionally
// holds a background task draining the push stream)
// ===========================================================================

/// Shared implementation for `http` and `sse` transports: both speak
/// request/response JSON-RPC over HTTP headers derived from the auth
/// descriptor; `sse` additionally keeps a streaming `GET` open for
/// server-pushed events (§4.1).
pub struct HttpTransportClient {
    client: reqwest::Client,
    url: String,
    headers: reqwest::header::HeaderMap,
    next_id: AtomicI64,
    sse_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HttpTransportClient {
    pub fn new(url: String, headers: &HashMap<String, String>) -> Result<Self> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (k, v) in headers {
            let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| Error::BadRequest(format!("invalid header name {k}: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(v)
                .map_err(|e| Error::BadRequest(format!("invalid header value for {k}: {e}")))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            url,
            headers: header_map,
            next_id: AtomicI64::new(1),
            sse_task: Mutex::new(None),
        })
    }

    /// Open the SSE push stream; failures are tolerated (the request/
    /// response path still works without it).
    pub async fn start_sse_stream(self: &Arc<Self>) {
        let client = self.client.clone();
        let url = self.url.clone();
        let headers = self.headers.clone();

        let handle = tokio::spawn(async move {
            let response = client
                .get(&url)
                .headers(headers)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send()
                .await;

            if let Ok(mut response) = response {
                while let Ok(Some(_chunk)) = response.chunk().await {
                    // Push payloads are opaque server notifications; the
                    // gateway's own event fabric (§4.5) is the supported
                    // notification path, so we just keep the connection
                    // alive rather than parse/re-dispatch here.
                }
            }
        });

        *self.sse_task.lock().await = Some(handle);
    }

    async fn request(&self, method: &str, params: serde_json::Value, timeout: Duration) -> Result<Option<serde_json::Value>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = JsonRpcRequest { jsonrpc: "2.0", id, method: method.to_string(), params };

        let response = tokio::time::timeout(
            timeout,
            self.client.post(&self.url).headers(self.headers.clone()).json(&body).send(),
        )
        .await
        .map_err(|_| Error::Timeout(format!("{method} timed out")))?
        .map_err(|e| Error::Upstream(format!("http request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Upstream(format!("backend returned status {}", response.status())));
        }

        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("invalid JSON-RPC response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(Error::Upstream(err.message));
        }
        Ok(parsed.result)
    }
}

#[async_trait::async_trait]
impl TransportClient for HttpTransportClient {
    async fn list_tools(&self) -> Result<Vec<CapabilityDescriptor>> {
        let result = self.request("tools/list", serde_json::json!({}), Duration::from_secs(10)).await?;
        Ok(parse_capabilities(result, "tools"))
    }

    async fn list_prompts(&self) -> Result<Vec<CapabilityDescriptor>> {
        let result = self.request("prompts/list", serde_json::json!({}), Duration::from_secs(10)).await?;
        Ok(parse_capabilities(result, "prompts"))
    }

    async fn list_resources(&self) -> Result<Vec<CapabilityDescriptor>> {
        let result = self.request("resources/list", serde_json::json!({}), Duration::from_secs(10)).await?;
        Ok(parse_capabilities(result, "resources"))
    }

    async fn call_tool(&self, name: &str, params: serde_json::Value, timeout: Duration) -> Result<serde_json::Value> {
        let result = self
            .request("tools/call", serde_json::json!({"name": name, "arguments": params}), timeout)
            .await?;
        Ok(result.unwrap_or(serde_json::Value::Null))
    }

    async fn get_prompt(&self, name: &str, args: serde_json::Value, timeout: Duration) -> Result<serde_json::Value> {
        let result = self
            .request("prompts/get", serde_json::json!({"name": name, "arguments": args}), timeout)
            .await?;
        Ok(result.unwrap_or(serde_json::Value::Null))
    }

    async fn read_resource(&self, uri: &str, timeout: Duration) -> Result<serde_json::Value> {
        let result = self.request("resources/read", serde_json::json!({"uri": uri}), timeout).await?;
        Ok(result.unwrap_or(serde_json::Value::Null))
    }

    async fn close(&self) {
        if let Some(handle) = self.sse_task.lock().await.take() {
            handle.abort();
        }
    }
}

// ===========================================================================
// websocket transport
// ===========================================================================

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// A persistent bidirectional WebSocket transport. `reconnect`/`heartbeat`
/// policies are consulted by [`crate::pool::ConnectionPool`]'s health loop
/// rather than by this client, which only owns a single live connection.
pub struct WebSocketTransportClient {
    sender: Mutex<futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        WsMessage,
    >>,
    receiver: Mutex<futures::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    >>,
    next_id: AtomicI64,
}

impl WebSocketTransportClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Upstream(format!("websocket connect failed: {e}")))?;
        let (sender, receiver) = stream.split();
        Ok(Self { sender: Mutex::new(sender), receiver: Mutex::new(receiver), next_id: AtomicI64::new(1) })
    }

    async fn request(&self, method: &str, params: serde_json::Value, timeout: Duration) -> Result<Option<serde_json::Value>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = rpc_request(method, params, id);

        tokio::time::timeout(timeout, async {
            self.sender
                .lock()
                .await
                .send(WsMessage::Text(line.into()))
                .await
                .map_err(|e| Error::Upstream(format!("websocket send failed: {e}")))?;

            let mut receiver = self.receiver.lock().await;
            loop {
                match receiver.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        let response: JsonRpcResponse = serde_json::from_str(&text)
                            .map_err(|e| Error::Upstream(format!("invalid JSON-RPC response: {e}")))?;
                        if response.id != id {
                            continue;
                        }
                        if let Some(err) = response.error {
                            return Err(Error::Upstream(err.message));
                        }
                        return Ok(response.result);
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(Error::Upstream(format!("websocket error: {e}"))),
                    None => return Err(Error::Upstream("websocket closed".into())),
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout(format!("{method} timed out")))?
    }
}

#[async_trait::async_trait]
impl TransportClient for WebSocketTransportClient {
    async fn list_tools(&self) -> Result<Vec<CapabilityDescriptor>> {
        let result = self.request("tools/list", serde_json::json!({}), Duration::from_secs(10)).await?;
        Ok(parse_capabilities(result, "tools"))
    }

    async fn list_prompts(&self) -> Result<Vec<CapabilityDescriptor>> {
        let result = self.request("prompts/list", serde_json::json!({}), Duration::from_secs(10)).await?;
        Ok(parse_capabilities(result, "prompts"))
    }

    async fn list_resources(&self) -> Result<Vec<CapabilityDescriptor>> {
        let result = self.request("resources/list", serde_json::json!({}), Duration::from_secs(10)).await?;
        Ok(parse_capabilities(result, "resources"))
    }

    async fn call_tool(&self, name: &str, params: serde_json::Value, timeout: Duration) -> Result<serde_json::Value> {
        let result = self
            .request("tools/call", serde_json::json!({"name": name, "arguments": params}), timeout)
            .await?;
        Ok(result.unwrap_or(serde_json::Value::Null))
    }

    async fn get_prompt(&self, name: &str, args: serde_json::Value, timeout: Duration) -> Result<serde_json::Value> {
        let result = self
            .request("prompts/get", serde_json::json!({"name": name, "arguments": args}), timeout)
            .await?;
        Ok(result.unwrap_or(serde_json::Value::Null))
    }

    async fn read_resource(&self, uri: &str, timeout: Duration) -> Result<serde_json::Value> {
        let result = self.request("resources/read", serde_json::json!({"uri": uri}), timeout).await?;
        Ok(result.unwrap_or(serde_json::Value::Null))
    }

    async fn close(&self) {
        let _ = self.sender.lock().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_capabilities_extracts_named_field() {
        let result = Some(serde_json::json!({"tools": [{"name": "read", "description": "reads", "input_schema": {}}]}));
        let caps = parse_capabilities(result, "tools");
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].name, "read");
    }

    #[test]
    fn parse_capabilities_missing_field_is_empty() {
        let result = Some(serde_json::json!({}));
        assert!(parse_capabilities(result, "tools").is_empty());
    }

    #[test]
    fn rpc_request_serializes_jsonrpc_envelope() {
        let line = rpc_request("tools/list", serde_json::json!({}), 7);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "tools/list");
    }
}
