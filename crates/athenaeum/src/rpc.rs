use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{AthenaeumError, Result};
use crate::librarian::{
    ExtractedMemory, Librarian, OptimizationReport, ReorganizationPlan, Turn, TopicClassification,
};
use crate::schema::Volume;

pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcErrorData {
    #[serde(rename = "vectorCode")]
    pub vector_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<RpcErrorData>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

type PendingMap = HashMap<u64, oneshot::Sender<std::result::Result<Value, RpcError>>>;
type Pending = Arc<Mutex<PendingMap>>;

/// Maps a wire error back to `AthenaeumError` via its `vectorCode`, falling
/// back to `LIBRARY_ERROR` for unrecognized or absent codes.
fn error_from_wire(err: RpcError) -> AthenaeumError {
    match err.data.as_ref().and_then(|d| d.vector_code.as_deref()) {
        Some("CONFIG_ERROR") => AthenaeumError::Config(err.message),
        Some("EMBEDDING_ERROR") => AthenaeumError::Embedding(err.message),
        Some("STACKS_CORRUPT") => AthenaeumError::StacksCorrupt {
            path: String::new(),
            reason: err.message,
        },
        Some("STACKS_ERROR") => AthenaeumError::Stacks(err.message),
        Some("OPERATION_TIMEOUT") => AthenaeumError::OperationTimeout(0),
        _ => AthenaeumError::Library(err.message),
    }
}

fn disposed_error() -> RpcError {
    RpcError {
        code: -32000,
        message: "rpc subprocess exited or client disposed".into(),
        data: None,
    }
}

/// Drains one NDJSON line at a time, dispatching each response to its
/// pending request by id. On EOF, fails everything still pending.
async fn read_loop<R: AsyncRead + Unpin>(reader: R, pending: Pending) {
    let mut lines = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match lines.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response: WireResponse = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "rpc: malformed response line");
                continue;
            }
        };

        let sender = pending.lock().await.remove(&response.id);
        if let Some(sender) = sender {
            let outcome = match (response.result, response.error) {
                (Some(value), _) => Ok(value),
                (None, Some(err)) => Err(err),
                (None, None) => Err(RpcError {
                    code: -32603,
                    message: "response carried neither result nor error".into(),
                    data: None,
                }),
            };
            let _ = sender.send(outcome);
        }
    }

    let mut remaining = pending.lock().await;
    for (_, sender) in remaining.drain() {
        let _ = sender.send(Err(disposed_error()));
    }
}

/// Line-delimited JSON-RPC 2.0 client over a child process's stdio.
/// Requests carry a monotonically increasing id; responses are matched by
/// id and cleared from the pending map along with their timeout.
pub struct RpcClient {
    next_id: AtomicU64,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    reader_task: JoinHandle<()>,
    child: Mutex<Child>,
    default_timeout: Duration,
}

impl RpcClient {
    pub async fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(AthenaeumError::StacksIo)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AthenaeumError::Library("subprocess stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AthenaeumError::Library("subprocess stdout unavailable".into()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            read_loop(stdout, reader_pending).await;
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(stdin),
            pending,
            reader_task,
            child: Mutex::new(child),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        })
    }

    /// Sends `method`/`params`, waits up to `timeout_ms` (or the client's
    /// default) for the matching response.
    pub async fn call(&self, method: &str, params: Value, timeout_ms: Option<u64>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = WireRequest { jsonrpc: "2.0", id, method, params };
        let mut line = serde_json::to_string(&request).map_err(|e| AthenaeumError::Library(e.to_string()))?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(err) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(AthenaeumError::StacksIo(err));
            }
            if let Err(err) = stdin.flush().await {
                self.pending.lock().await.remove(&id);
                return Err(AthenaeumError::StacksIo(err));
            }
        }

        let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(rpc_error))) => Err(error_from_wire(rpc_error)),
            Ok(Err(_canceled)) => Err(AthenaeumError::Library("rpc transport closed before response".into())),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                Err(AthenaeumError::OperationTimeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Fails every pending request, kills the subprocess, and stops the
    /// reader task.
    pub async fn dispose(&self) -> Result<()> {
        {
            let mut pending = self.pending.lock().await;
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err(disposed_error()));
            }
        }

        self.reader_task.abort();

        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireExtractedMemory {
    text: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl From<WireExtractedMemory> for ExtractedMemory {
    fn from(wire: WireExtractedMemory) -> Self {
        ExtractedMemory { text: wire.text, metadata: wire.metadata }
    }
}

#[derive(Debug, Deserialize)]
struct WireTopicClassification {
    topic: String,
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct WireReorganizationPlan {
    #[serde(default)]
    moves: Vec<(String, String)>,
    #[serde(default)]
    merges: Vec<(String, String)>,
    #[serde(rename = "newSubtopics", default)]
    new_subtopics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireOptimizationReport {
    #[serde(default)]
    pruned: Vec<String>,
    #[serde(default)]
    summary: Option<String>,
}

fn volume_payload(volumes: &[Volume]) -> Value {
    json!(volumes
        .iter()
        .map(|v| json!({"id": v.id, "text": v.text, "metadata": v.metadata}))
        .collect::<Vec<_>>())
}

/// A [`Librarian`] whose five collaborator operations are delegated to a
/// subprocess over [`RpcClient`]. `bid` stays local since the trait method
/// is synchronous; it answers from `default_bid` rather than making a call.
pub struct RpcLibrarian {
    name: String,
    client: RpcClient,
    default_bid: f32,
}

impl RpcLibrarian {
    pub fn new(name: impl Into<String>, client: RpcClient, default_bid: f32) -> Self {
        Self { name: name.into(), client, default_bid }
    }

    fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| AthenaeumError::Library(e.to_string()))
    }
}

#[async_trait]
impl Librarian for RpcLibrarian {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, turn: &Turn) -> Result<Vec<ExtractedMemory>> {
        let params = json!({"userInput": turn.user_input, "response": turn.response});
        let value = self.client.call("extract", params, None).await?;
        let wire: Vec<WireExtractedMemory> = Self::decode(value)?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn summarize(&self, volumes: &[Volume], topic: &str) -> Result<String> {
        let params = json!({"volumes": volume_payload(volumes), "topic": topic});
        let value = self.client.call("summarize", params, None).await?;
        Self::decode(value)
    }

    async fn classify_topic(&self, text: &str) -> Result<TopicClassification> {
        let params = json!({"text": text});
        let value = self.client.call("classifyTopic", params, None).await?;
        let wire: WireTopicClassification = Self::decode(value)?;
        Ok(TopicClassification { topic: wire.topic, confidence: wire.confidence })
    }

    async fn reorganize(&self, topic: &str, volumes: &[Volume]) -> Result<ReorganizationPlan> {
        let params = json!({"topic": topic, "volumes": volume_payload(volumes)});
        let value = self.client.call("reorganize", params, None).await?;
        let wire: WireReorganizationPlan = Self::decode(value)?;
        Ok(ReorganizationPlan {
            moves: wire.moves,
            merges: wire.merges,
            new_subtopics: wire.new_subtopics,
        })
    }

    async fn optimize(&self, topic: &str, volumes: &[Volume]) -> Result<OptimizationReport> {
        let params = json!({"topic": topic, "volumes": volume_payload(volumes)});
        let value = self.client.call("optimize", params, None).await?;
        let wire: WireOptimizationReport = Self::decode(value)?;
        Ok(OptimizationReport { pruned: wire.pruned, summary: wire.summary })
    }

    fn bid(&self, _topic: &str) -> f32 {
        self.default_bid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn read_loop_dispatches_a_successful_response_by_id() {
        let (client_side, mut server_side) = tokio::io::duplex(1024);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(7, tx);

        let task = tokio::spawn(read_loop(client_side, pending.clone()));

        server_side
            .write_all(br#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#)
            .await
            .unwrap();
        server_side.write_all(b"\n").await.unwrap();
        drop(server_side);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap(), json!({"ok": true}));
        let _ = task.await;
    }

    #[tokio::test]
    async fn read_loop_fails_pending_requests_on_eof() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(1, tx);

        let task = tokio::spawn(read_loop(client_side, pending));
        drop(server_side);

        let outcome = rx.await.unwrap();
        assert!(outcome.is_err());
        let _ = task.await;
    }

    #[tokio::test]
    async fn read_loop_ignores_malformed_lines_and_continues() {
        let (client_side, mut server_side) = tokio::io::duplex(1024);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(3, tx);

        let task = tokio::spawn(read_loop(client_side, pending));

        server_side.write_all(b"not json\n").await.unwrap();
        server_side
            .write_all(br#"{"jsonrpc":"2.0","id":3,"result":1}"#)
            .await
            .unwrap();
        server_side.write_all(b"\n").await.unwrap();
        drop(server_side);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap(), json!(1));
        let _ = task.await;
    }

    #[test]
    fn error_from_wire_maps_known_vector_codes() {
        let err = RpcError {
            code: -1,
            message: "bad vector".into(),
            data: Some(RpcErrorData { vector_code: Some("EMBEDDING_ERROR".into()) }),
        };
        assert_eq!(error_from_wire(err).code(), "EMBEDDING_ERROR");
    }

    #[test]
    fn error_from_wire_falls_back_to_library_error() {
        let err = RpcError { code: -1, message: "mystery".into(), data: None };
        assert_eq!(error_from_wire(err).code(), "LIBRARY_ERROR");
    }

    #[tokio::test]
    async fn rpc_client_round_trips_a_call_via_a_real_subprocess() {
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":"ok"}\n'"#;
        let client = RpcClient::spawn("sh", &["-c".to_string(), script.to_string()])
            .await
            .unwrap();

        let result = client.call("ping", json!({}), Some(5_000)).await.unwrap();
        assert_eq!(result, json!("ok"));

        client.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn rpc_client_times_out_when_the_subprocess_never_replies() {
        let client = RpcClient::spawn("sh", &["-c".to_string(), "sleep 10".to_string()])
            .await
            .unwrap();

        let result = client.call("ping", json!({}), Some(50)).await;
        assert!(matches!(result, Err(AthenaeumError::OperationTimeout(_))));

        client.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn rpc_client_fails_pending_calls_when_subprocess_exits() {
        let client = RpcClient::spawn("sh", &["-c".to_string(), "exit 0".to_string()])
            .await
            .unwrap();

        let result = client.call("ping", json!({}), Some(5_000)).await;
        assert!(result.is_err());
    }
}
