//! Wire Codec — the framed-JSON envelope protocol. One envelope per WebSocket frame:
//! `{ "updates": [ Update... ] }`. Each `Update` is tagged by `type`, with its fields
//! nested under `payload` — i.e. `{"type":"callMethod", "payload":{...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Inbound envelope: `{ "updates": [ ... ] }`.
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    pub updates: Vec<InboundUpdate>,
}

/// Outbound envelope: `{ "updates": [ ... ] }`.
#[derive(Debug, Serialize, Default, Clone)]
pub struct OutboundEnvelope {
    pub updates: Vec<OutboundUpdate>,
}

impl OutboundEnvelope {
    pub fn single(update: OutboundUpdate) -> Self {
        Self { updates: vec![update] }
    }
}

// ═══════════════════════════════════════════════════════════════
// Inbound (browser → runtime)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum InboundUpdate {
    GetInitialState(GetInitialStatePayload),
    CallMethod(CallMethodPayload),
    Subscribe(SubscribePayload),
    Unsubscribe(UnsubscribePayload),
    UploadBegin(UploadBeginPayload),
    UploadChunk(UploadChunkPayload),
    UploadEnd(UploadEndPayload),
    Ping,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetInitialStatePayload {
    pub component_name: String,
    #[serde(default)]
    pub props: Json,
    #[serde(default)]
    pub user_provided_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMethodPayload {
    pub name: String,
    pub id: String,
    pub method_name: String,
    #[serde(default)]
    pub params: Vec<Json>,
    /// Optimistic client snapshot — diagnostics/rehydration fallback only.
    #[serde(default)]
    pub state: Option<Json>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub hydration_attempt: bool,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub id: String,
    #[serde(default)]
    pub known_version: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribePayload {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBeginPayload {
    pub instance_id: String,
    pub upload_id: String,
    pub file_name: String,
    pub total_bytes: u64,
    pub chunk_size: u32,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkPayload {
    pub upload_id: String,
    pub seq: u64,
    pub bytes_base64: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEndPayload {
    pub upload_id: String,
}

// ═══════════════════════════════════════════════════════════════
// Outbound (runtime → browser)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundUpdate {
    #[serde(rename = "initial_state")]
    InitialState(InitialStatePayload),
    #[serde(rename = "state_update")]
    StateUpdate(StateUpdatePayload),
    #[serde(rename = "event")]
    Event(EventPayload),
    #[serde(rename = "function-result")]
    FunctionResult(FunctionResultPayload),
    #[serde(rename = "function-error")]
    FunctionError(FunctionErrorPayload),
    #[serde(rename = "upload-progress")]
    UploadProgress(UploadProgressPayload),
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InitialStatePayload {
    pub component_name: String,
    pub state: Json,
    #[serde(rename = "$ID")]
    pub id: String,
    pub fingerprint: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdatePayload {
    pub id: String,
    pub from_version: u64,
    pub to_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<Vec<PatchOp>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Json>,
    pub full: bool,
}

/// A single JSON-Pointer patch operation.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase", tag = "op")]
pub enum PatchOp {
    Add { path: String, value: Json },
    Replace { path: String, value: Json },
    Remove { path: String },
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventScope {
    #[serde(rename = "self")]
    SelfScope,
    Broadcast,
    Room,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub scope: EventScope,
    pub name: String,
    pub data: Json,
    pub from_instance_id: String,
    /// Set only when `scope == Room`: the room name the event fanned out to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResultPayload {
    pub request_id: String,
    pub result: Json,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FunctionErrorPayload {
    pub request_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgressPayload {
    pub upload_id: String,
    pub received: u64,
    pub total: u64,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}
