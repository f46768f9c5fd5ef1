//! Rust client for the Live Component Runtime.
//!
//! Connects over WebSocket, keeps a local cache of every subscribed
//! instance's state (applying `state_update` patches as they arrive),
//! and exposes `getInitialState`/`callMethod`/`subscribe`/`unsubscribe`
//! plus chunked upload as async methods:
//!
//! ```ignore
//! let client = LiveClient::connect("ws://localhost:8787/ws").await;
//! let initial = client
//!     .get_initial_state("Counter", serde_json::json!({"initial": 0}), None)
//!     .await?;
//! let result = client
//!     .call_method("Counter", &initial.id, "increment", vec![serde_json::json!(1)], None, false)
//!     .await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════════

/// A freshly hydrated (or newly created) component instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
    pub component_name: String,
    pub state: Json,
    #[serde(rename = "$ID")]
    pub id: String,
    pub fingerprint: String,
}

/// A `self`/`broadcast`/`room`-scoped event pushed from an instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentEvent {
    pub scope: EventScope,
    pub name: String,
    pub data: Json,
    pub from_instance_id: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventScope {
    #[serde(rename = "self")]
    SelfScope,
    Broadcast,
    Room,
}

#[derive(Debug, Clone)]
pub enum ClientError {
    /// The background connection is down and the call couldn't be sent.
    Disconnected,
    /// No response arrived before the per-call deadline.
    Timeout,
    /// The runtime replied with an `error`/`function-error` frame.
    Server { code: String, message: String },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Disconnected => write!(f, "not connected to the runtime"),
            ClientError::Timeout => write!(f, "timed out waiting for a response"),
            ClientError::Server { code, message } => write!(f, "{code}: {message}"),
        }
    }
}

impl std::error::Error for ClientError {}

// ═══════════════════════════════════════════════════════════════
// Wire types (mirrors the runtime's `protocol.rs`)
// ═══════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct OutEnvelope {
    updates: Vec<ClientUpdate>,
}

#[derive(Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
enum ClientUpdate {
    GetInitialState {
        component_name: String,
        props: Json,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_provided_id: Option<String>,
    },
    CallMethod {
        name: String,
        id: String,
        method_name: String,
        params: Vec<Json>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
        hydration_attempt: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Subscribe {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        known_version: Option<u64>,
    },
    Unsubscribe {
        id: String,
    },
    UploadBegin {
        instance_id: String,
        upload_id: String,
        file_name: String,
        total_bytes: u64,
        chunk_size: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
    UploadChunk {
        upload_id: String,
        seq: u64,
        bytes_base64: String,
    },
    UploadEnd {
        upload_id: String,
    },
    Ping,
}

#[derive(Deserialize)]
struct InEnvelope {
    updates: Vec<ServerUpdate>,
}

#[derive(Deserialize)]
#[serde(tag = "type", content = "payload")]
enum ServerUpdate {
    #[serde(rename = "initial_state")]
    InitialState(InitialState),
    #[serde(rename = "state_update")]
    StateUpdate(StateUpdateFrame),
    #[serde(rename = "event")]
    Event(ComponentEvent),
    #[serde(rename = "function-result")]
    FunctionResult(FunctionResultFrame),
    #[serde(rename = "function-error")]
    FunctionError(FunctionErrorFrame),
    #[serde(rename = "upload-progress")]
    UploadProgress(UploadProgressFrame),
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error(ErrorFrame),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateUpdateFrame {
    id: String,
    #[allow(dead_code)]
    from_version: u64,
    to_version: u64,
    #[serde(default)]
    patch: Option<Vec<PatchOp>>,
    #[serde(default)]
    state: Option<Json>,
    full: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase", tag = "op")]
enum PatchOp {
    Add { path: String, value: Json },
    Replace { path: String, value: Json },
    Remove { path: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionResultFrame {
    request_id: String,
    result: Json,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionErrorFrame {
    request_id: String,
    code: String,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadProgressFrame {
    #[allow(dead_code)]
    upload_id: String,
    received: u64,
    total: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorFrame {
    code: String,
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    request_id: Option<String>,
}

/// Applies a patch list to a cached state `Value` in place. Unknown
/// pointer paths are a no-op for `remove` and create intermediate
/// objects for `add`/`replace`, mirroring the leniency of `serde_json`'s
/// own `Value::pointer_mut`.
fn apply_patch(target: &mut Json, ops: &[PatchOp]) {
    for op in ops {
        match op {
            PatchOp::Add { path, value } | PatchOp::Replace { path, value } => {
                set_pointer(target, path, value.clone());
            }
            PatchOp::Remove { path } => {
                remove_pointer(target, path);
            }
        }
    }
}

fn set_pointer(target: &mut Json, pointer: &str, value: Json) {
    if pointer.is_empty() {
        *target = value;
        return;
    }
    let mut segments: Vec<&str> = pointer.split('/').skip(1).collect();
    let Some(last) = segments.pop() else { return };
    let mut cursor = target;
    for seg in segments {
        cursor = cursor
            .as_object_mut()
            .map(|obj| obj.entry(seg.to_string()).or_insert_with(|| Json::Object(Default::default())))
            .unwrap_or(cursor);
    }
    if let Some(obj) = cursor.as_object_mut() {
        obj.insert(last.to_string(), value);
    } else if let Some(arr) = cursor.as_array_mut() {
        if let Ok(idx) = last.parse::<usize>() {
            if idx < arr.len() {
                arr[idx] = value;
            } else {
                arr.push(value);
            }
        }
    }
}

fn remove_pointer(target: &mut Json, pointer: &str) {
    let mut segments: Vec<&str> = pointer.split('/').skip(1).collect();
    let Some(last) = segments.pop() else { return };
    let mut cursor = target;
    for seg in segments {
        match cursor.get_mut(seg) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(obj) = cursor.as_object_mut() {
        obj.remove(last);
    } else if let Some(arr) = cursor.as_array_mut() {
        if let Ok(idx) = last.parse::<usize>() {
            if idx < arr.len() {
                arr.remove(idx);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════

struct CachedInstance {
    component_name: String,
    state: Json,
    version: u64,
}

enum Outbound {
    Send(ClientUpdate),
}

/// A connected (or reconnecting) handle to a Live Component Runtime.
///
/// Cloning is cheap — every clone shares the same background connection,
/// pending-call table, and state cache.
#[derive(Clone)]
pub struct LiveClient {
    tx: mpsc::Sender<Outbound>,
    pending_calls: Arc<Mutex<HashMap<String, oneshot::Sender<Result<Json, ClientError>>>>>,
    pending_initial: Arc<Mutex<VecDeque<oneshot::Sender<InitialState>>>>,
    cache: Arc<Mutex<HashMap<String, CachedInstance>>>,
    events_tx: broadcast::Sender<ComponentEvent>,
    connected: Arc<AtomicBool>,
    request_seq: Arc<AtomicU64>,
}

impl LiveClient {
    /// Connects without signing upgrade headers (anonymous principal).
    pub async fn connect(url: impl Into<String>) -> Self {
        Self::connect_with(url, None).await
    }

    /// Connects and signs every (re)connect's upgrade request with
    /// `x-live-pubkey`/`x-live-timestamp`/`x-live-signature`, pairing
    /// with a server configured with `Ed25519HeaderVerifier`.
    pub async fn connect_with(url: impl Into<String>, signing_key: Option<SigningKey>) -> Self {
        let url = url.into();
        let (tx, rx) = mpsc::channel(256);
        let pending_calls = Arc::new(Mutex::new(HashMap::new()));
        let pending_initial = Arc::new(Mutex::new(VecDeque::new()));
        let cache = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, _) = broadcast::channel(256);
        let connected = Arc::new(AtomicBool::new(false));

        let client = Self {
            tx,
            pending_calls: pending_calls.clone(),
            pending_initial: pending_initial.clone(),
            cache: cache.clone(),
            events_tx: events_tx.clone(),
            connected: connected.clone(),
            request_seq: Arc::new(AtomicU64::new(0)),
        };

        tokio::spawn(ws_task(url, signing_key, rx, pending_calls, pending_initial, cache, events_tx, connected));

        client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Reads the cached state for an instance, if subscribed and known.
    pub async fn cached_state(&self, id: &str) -> Option<Json> {
        self.cache.lock().await.get(id).map(|c| c.state.clone())
    }

    /// Reads the component type name an instance was hydrated as.
    pub async fn cached_component_name(&self, id: &str) -> Option<String> {
        self.cache.lock().await.get(id).map(|c| c.component_name.clone())
    }

    /// Reads the last known `state_update` version for an instance — pass
    /// this as `known_version` when resubscribing after a reconnect.
    pub async fn cached_version(&self, id: &str) -> Option<u64> {
        self.cache.lock().await.get(id).map(|c| c.version)
    }

    /// Subscribes to this client's event stream (`self`/`broadcast`/`room`).
    pub fn events(&self) -> broadcast::Receiver<ComponentEvent> {
        self.events_tx.subscribe()
    }

    async fn send(&self, update: ClientUpdate) -> Result<(), ClientError> {
        self.tx.send(Outbound::Send(update)).await.map_err(|_| ClientError::Disconnected)
    }

    /// Mounts a component instance, creating it server-side if
    /// `user_provided_id` is absent or unknown, or rehydrating it
    /// otherwise.
    pub async fn get_initial_state(
        &self,
        component_name: impl Into<String>,
        props: Json,
        user_provided_id: Option<String>,
    ) -> Result<InitialState, ClientError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.pending_initial.lock().await.push_back(resp_tx);
        self.send(ClientUpdate::GetInitialState { component_name: component_name.into(), props, user_provided_id })
            .await?;
        tokio::time::timeout(Duration::from_secs(15), resp_rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::Disconnected)
    }

    /// Invokes a method and awaits its `function-result`/`function-error`
    /// reply, correlated by a client-generated `request_id`.
    pub async fn call_method(
        &self,
        component_name: impl Into<String>,
        id: impl Into<String>,
        method_name: impl Into<String>,
        params: Vec<Json>,
        fingerprint: Option<String>,
        hydration_attempt: bool,
    ) -> Result<Json, ClientError> {
        let request_id = format!("req-{}", self.request_seq.fetch_add(1, Ordering::Relaxed));
        let (resp_tx, resp_rx) = oneshot::channel();
        self.pending_calls.lock().await.insert(request_id.clone(), resp_tx);

        self.send(ClientUpdate::CallMethod {
            name: component_name.into(),
            id: id.into(),
            method_name: method_name.into(),
            params,
            fingerprint,
            hydration_attempt,
            request_id: Some(request_id.clone()),
        })
        .await
        .inspect_err(|_| {
            let pending = self.pending_calls.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                pending.lock().await.remove(&request_id);
            });
        })?;

        tokio::time::timeout(Duration::from_secs(15), resp_rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::Disconnected)?
    }

    /// Subscribes to an instance's `state_update` stream. `known_version`
    /// lets the runtime skip resending state that's already current on a
    /// rehydrated connection.
    pub async fn subscribe(&self, id: impl Into<String>, known_version: Option<u64>) -> Result<(), ClientError> {
        self.send(ClientUpdate::Subscribe { id: id.into(), known_version }).await
    }

    pub async fn unsubscribe(&self, id: impl Into<String>) -> Result<(), ClientError> {
        self.send(ClientUpdate::Unsubscribe { id: id.into() }).await
    }

    /// Streams `data` to the runtime in `chunk_size`-byte pieces, ending
    /// with `uploadEnd`. Returns once every chunk has been handed to the
    /// outbound channel — the runtime signals completion indirectly, via
    /// whatever `onUploadComplete` side effect the target component emits.
    pub async fn upload_file(
        &self,
        instance_id: impl Into<String>,
        file_name: impl Into<String>,
        data: &[u8],
        chunk_size: u32,
    ) -> Result<String, ClientError> {
        use sha2::{Digest, Sha256};

        let upload_id = Uuid::new_v4().to_string();
        let sha256 = base16(&Sha256::digest(data));

        self.send(ClientUpdate::UploadBegin {
            instance_id: instance_id.into(),
            upload_id: upload_id.clone(),
            file_name: file_name.into(),
            total_bytes: data.len() as u64,
            chunk_size,
            sha256: Some(sha256),
        })
        .await?;

        for (seq, chunk) in data.chunks(chunk_size.max(1) as usize).enumerate() {
            let bytes_base64 = base64::engine::general_purpose::STANDARD.encode(chunk);
            self.send(ClientUpdate::UploadChunk { upload_id: upload_id.clone(), seq: seq as u64, bytes_base64 })
                .await?;
        }

        self.send(ClientUpdate::UploadEnd { upload_id: upload_id.clone() }).await?;
        Ok(upload_id)
    }
}

fn base16(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn pub_key_string(key: &SigningKey) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(key.verifying_key().to_bytes());
    format!("ed25519:{b64}")
}

/// Background task: owns the WebSocket, relays outbound sends, applies
/// inbound frames to the cache/pending tables, reconnects on drop.
async fn ws_task(
    url: String,
    signing_key: Option<SigningKey>,
    mut rx: mpsc::Receiver<Outbound>,
    pending_calls: Arc<Mutex<HashMap<String, oneshot::Sender<Result<Json, ClientError>>>>>,
    pending_initial: Arc<Mutex<VecDeque<oneshot::Sender<InitialState>>>>,
    cache: Arc<Mutex<HashMap<String, CachedInstance>>>,
    events_tx: broadcast::Sender<ComponentEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut attempt: u32 = 0;

    'reconnect: loop {
        let mut request = match url.as_str().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "invalid runtime url");
                return;
            }
        };
        if let Some(key) = &signing_key {
            let timestamp = chrono::Utc::now().timestamp_millis().to_string();
            let signature = key.sign(timestamp.as_bytes());
            let sig_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());
            let headers = request.headers_mut();
            headers.insert("x-live-pubkey", HeaderValue::from_str(&pub_key_string(key)).unwrap());
            headers.insert("x-live-timestamp", HeaderValue::from_str(&timestamp).unwrap());
            headers.insert("x-live-signature", HeaderValue::from_str(&sig_b64).unwrap());
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => {
                info!(url = %url, "connected to runtime");
                attempt = 0;
                stream
            }
            Err(e) => {
                warn!(url = %url, attempt, "connect failed: {e}");
                connected.store(false, Ordering::Relaxed);
                backoff_sleep(attempt).await;
                attempt = attempt.saturating_add(1);
                continue 'reconnect;
            }
        };

        connected.store(true, Ordering::Relaxed);
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(Outbound::Send(update)) => {
                            let envelope = OutEnvelope { updates: vec![update] };
                            let json = match serde_json::to_string(&envelope) {
                                Ok(j) => j,
                                Err(e) => { warn!(error = %e, "failed to encode outbound frame"); continue; }
                            };
                            if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                                warn!("send error: {e}");
                                break;
                            }
                        }
                        None => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            connected.store(false, Ordering::Relaxed);
                            return;
                        }
                    }
                }
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            handle_inbound(&text, &pending_calls, &pending_initial, &cache, &events_tx).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("runtime closed connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("ws recv error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        connected.store(false, Ordering::Relaxed);
        drain_pending(&pending_calls, &pending_initial).await;
        backoff_sleep(attempt).await;
        attempt = attempt.saturating_add(1);
    }
}

async fn drain_pending(
    pending_calls: &Arc<Mutex<HashMap<String, oneshot::Sender<Result<Json, ClientError>>>>>,
    pending_initial: &Arc<Mutex<VecDeque<oneshot::Sender<InitialState>>>>,
) {
    for (_, tx) in pending_calls.lock().await.drain() {
        let _ = tx.send(Err(ClientError::Disconnected));
    }
    pending_initial.lock().await.clear();
}

async fn handle_inbound(
    text: &str,
    pending_calls: &Arc<Mutex<HashMap<String, oneshot::Sender<Result<Json, ClientError>>>>>,
    pending_initial: &Arc<Mutex<VecDeque<oneshot::Sender<InitialState>>>>,
    cache: &Arc<Mutex<HashMap<String, CachedInstance>>>,
    events_tx: &broadcast::Sender<ComponentEvent>,
) {
    let envelope: InEnvelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "failed to decode inbound frame");
            return;
        }
    };

    for update in envelope.updates {
        match update {
            ServerUpdate::InitialState(payload) => {
                cache.lock().await.insert(
                    payload.id.clone(),
                    CachedInstance { component_name: payload.component_name.clone(), state: payload.state.clone(), version: 0 },
                );
                if let Some(tx) = pending_initial.lock().await.pop_front() {
                    let _ = tx.send(payload);
                }
            }
            ServerUpdate::StateUpdate(frame) => {
                let mut guard = cache.lock().await;
                let entry = guard.entry(frame.id.clone()).or_insert_with(|| CachedInstance {
                    component_name: String::new(),
                    state: Json::Null,
                    version: 0,
                });
                if frame.full {
                    if let Some(state) = frame.state {
                        entry.state = state;
                    }
                } else if let Some(ops) = &frame.patch {
                    apply_patch(&mut entry.state, ops);
                }
                entry.version = frame.to_version;
            }
            ServerUpdate::Event(event) => {
                let _ = events_tx.send(event);
            }
            ServerUpdate::FunctionResult(frame) => {
                if let Some(tx) = pending_calls.lock().await.remove(&frame.request_id) {
                    let _ = tx.send(Ok(frame.result));
                }
            }
            ServerUpdate::FunctionError(frame) => {
                if let Some(tx) = pending_calls.lock().await.remove(&frame.request_id) {
                    let _ = tx.send(Err(ClientError::Server { code: frame.code, message: frame.message }));
                }
            }
            ServerUpdate::UploadProgress(frame) => {
                debug!(received = frame.received, total = frame.total, "upload progress");
            }
            ServerUpdate::Pong => {}
            ServerUpdate::Error(frame) => {
                if let Some(request_id) = frame.request_id {
                    if let Some(tx) = pending_calls.lock().await.remove(&request_id) {
                        let _ = tx.send(Err(ClientError::Server { code: frame.code, message: frame.message }));
                        continue;
                    }
                }
                warn!(code = %frame.code, message = %frame.message, "runtime error frame");
            }
        }
    }
}

/// Exponential backoff with jitter: `min(100ms * 2^attempt, 30s) + random(0, delay * 0.5)`.
async fn backoff_sleep(attempt: u32) {
    let base_ms = 100u64.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped_ms = base_ms.min(30_000);
    let jitter_ms = (rand::random::<f64>() * capped_ms as f64 * 0.5) as u64;
    let total = Duration::from_millis(capped_ms + jitter_ms);
    debug!(ms = total.as_millis(), attempt, "backoff sleep");
    tokio::time::sleep(total).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_replace_sets_nested_path() {
        let mut state = serde_json::json!({"count": 1, "nested": {"a": 1}});
        apply_patch(&mut state, &[PatchOp::Replace { path: "/nested/a".into(), value: serde_json::json!(9) }]);
        assert_eq!(state["nested"]["a"], 9);
    }

    #[test]
    fn patch_add_creates_intermediate_object() {
        let mut state = serde_json::json!({});
        apply_patch(&mut state, &[PatchOp::Add { path: "/a/b".into(), value: serde_json::json!(true) }]);
        assert_eq!(state["a"]["b"], true);
    }

    #[test]
    fn patch_remove_drops_key() {
        let mut state = serde_json::json!({"count": 1, "stale": true});
        apply_patch(&mut state, &[PatchOp::Remove { path: "/stale".into() }]);
        assert!(state.get("stale").is_none());
    }

    #[test]
    fn patch_remove_drops_array_element() {
        let mut state = serde_json::json!({"items": [1, 2, 3]});
        apply_patch(&mut state, &[PatchOp::Remove { path: "/items/1".into() }]);
        assert_eq!(state["items"], serde_json::json!([1, 3]));
    }

    #[test]
    fn pub_key_string_has_ed25519_prefix() {
        let mut rng = rand::thread_rng();
        let key = SigningKey::generate(&mut rng);
        assert!(pub_key_string(&key).starts_with("ed25519:"));
    }

    #[tokio::test]
    async fn backoff_sleep_returns_promptly_for_attempt_zero() {
        let start = std::time::Instant::now();
        backoff_sleep(0).await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
