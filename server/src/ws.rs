//! WebSocket handler — the runtime's one public transport. Flow per connection: 1. Verify
//! the upgrade request's headers against the configured `PrincipalVerifier` before
//! upgrading. 2. Register with the Connection Registry, which hands back a bounded
//! outbound mailbox drained by a dedicated writer task — so instance workers delivering
//! broadcasts never block on this connection's socket. 3. Receive loop: decode each frame
//! as an `InboundEnvelope`, route every update it carries to the Dispatcher or Upload
//! Assembler. 4. On disconnect: abort in-flight uploads owned by this connection, drop
//! its subscriptions, and remove it from the registry.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::connection::{ConnectionHandle, OutMsg};
use crate::error::RuntimeError;
use crate::instance::MailboxItem;
use crate::protocol::{
    ErrorPayload, FunctionErrorPayload, InboundEnvelope, InboundUpdate, OutboundEnvelope, OutboundUpdate,
    UploadProgressPayload,
};
use crate::state::AppState;

/// Axum handler for `GET /ws` — verifies the caller's principal, then
/// upgrades to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    match state.verifier.verify(&headers) {
        Ok(principal) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, principal))
            .into_response(),
        Err(e) => (StatusCode::UNAUTHORIZED, e.client_message()).into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, principal: crate::auth::Principal) {
    let (connection, mut out_rx) = state.connections.register();
    info!(connection_id = %connection.id, principal = principal.as_str(), "connection established");
    connection.attach_principal(principal);

    let (mut sink, mut stream) = socket.split();
    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match msg {
                OutMsg::Frame(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize outbound frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                OutMsg::Ping => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                OutMsg::Close(frame) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                connection.touch();
                if text.len() > state.config.max_frame_bytes {
                    reply_error(&state, connection.id, None, &RuntimeError::BadFrame("frame exceeds max size".into()));
                    break;
                }
                let envelope: InboundEnvelope = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        reply_error(&state, connection.id, None, &RuntimeError::BadFrame(e.to_string()));
                        break;
                    }
                };
                for update in envelope.updates {
                    handle_update(&state, &connection, update).await;
                }
            }
            Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => connection.touch(),
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {}
            Err(e) => {
                warn!(connection_id = %connection.id, error = %e, "ws recv error");
                break;
            }
        }
    }

    info!(connection_id = %connection.id, "connection closed, cleaning up");
    state.uploads.abort_for_connection(connection.id).await;
    for instance_id in connection.subscribed_instances.lock().expect("lock poisoned").drain() {
        state.dispatcher.unsubscribe(connection.id, &instance_id);
    }
    state.connections.close(connection.id, 1000, "connection closed");
    writer_handle.abort();
    let _ = writer_handle.await;
}

async fn handle_update(state: &Arc<AppState>, connection: &Arc<ConnectionHandle>, update: InboundUpdate) {
    match update {
        InboundUpdate::Ping => {
            state.connections.send(connection.id, OutboundEnvelope::single(OutboundUpdate::Pong));
        }
        InboundUpdate::GetInitialState(p) => {
            match state
                .dispatcher
                .get_initial_state(connection.id, &p.component_name, p.props, p.user_provided_id.as_deref())
                .await
            {
                Ok(payload) => {
                    state.connections.send(connection.id, OutboundEnvelope::single(OutboundUpdate::InitialState(payload)))
                }
                Err(e) => reply_error(state, connection.id, None, &e),
            }
        }
        InboundUpdate::CallMethod(p) => {
            let request_id = p.request_id.clone();
            if let Err(e) = state
                .dispatcher
                .call_method(
                    connection.id,
                    connection.principal(),
                    &p.name,
                    &p.id,
                    &p.method_name,
                    p.params,
                    p.fingerprint.as_deref(),
                    p.hydration_attempt,
                    request_id.clone(),
                )
                .await
            {
                reply_error(state, connection.id, request_id, &e);
            }
        }
        InboundUpdate::Subscribe(p) => {
            if let Err(e) = state.dispatcher.subscribe(connection.id, &p.id, p.known_version) {
                reply_error(state, connection.id, None, &e);
            }
        }
        InboundUpdate::Unsubscribe(p) => {
            state.dispatcher.unsubscribe(connection.id, &p.id);
        }
        InboundUpdate::UploadBegin(p) => {
            if state.instances.get(&p.instance_id).is_none() {
                reply_error(state, connection.id, None, &RuntimeError::BadFrame(format!(
                    "unknown instance '{}'", p.instance_id
                )));
                return;
            }
            let subscribed = connection.subscribed_instances.lock().expect("lock poisoned").contains(&p.instance_id);
            if !subscribed {
                reply_error(state, connection.id, None, &RuntimeError::BadFrame(format!(
                    "not subscribed to instance '{}'", p.instance_id
                )));
                return;
            }
            if let Err(e) = state
                .uploads
                .begin(&p.instance_id, &p.upload_id, connection.id, p.total_bytes, p.chunk_size, p.sha256)
                .await
            {
                reply_error(state, connection.id, None, &e);
            }
        }
        InboundUpdate::UploadChunk(p) => match state.uploads.chunk(&p.upload_id, p.seq, &p.bytes_base64).await {
            Ok(progress) => {
                if progress.should_emit {
                    state.connections.send(
                        progress.owner,
                        OutboundEnvelope::single(OutboundUpdate::UploadProgress(UploadProgressPayload {
                            upload_id: p.upload_id.clone(),
                            received: progress.received,
                            total: progress.total,
                        })),
                    );
                }
            }
            Err(e) => reply_error(state, connection.id, None, &e),
        },
        InboundUpdate::UploadEnd(p) => match state.uploads.end(&p.upload_id).await {
            Ok(outcome) => {
                if let Some(instance) = state.instances.get(&outcome.instance_id) {
                    let item = MailboxItem::UploadComplete { upload_id: p.upload_id.clone(), path: outcome.path };
                    let _ = instance.mailbox_tx.try_send(item);
                }
            }
            Err(e) => reply_error(state, connection.id, None, &e),
        },
    }
}

/// Sends an `error`/`function-error` frame and, for error classes the
/// taxonomy marks fatal, closes the connection with the matching WebSocket close code.
fn reply_error(state: &Arc<AppState>, connection_id: Uuid, request_id: Option<String>, e: &RuntimeError) {
    let frame = match request_id {
        Some(request_id) => OutboundEnvelope::single(OutboundUpdate::FunctionError(FunctionErrorPayload {
            request_id,
            code: e.code().to_string(),
            message: e.client_message(),
        })),
        None => OutboundEnvelope::single(OutboundUpdate::Error(ErrorPayload {
            code: e.code().to_string(),
            message: e.client_message(),
            request_id: None,
        })),
    };
    state.connections.send(connection_id, frame);
    if let Some(close) = e.close_frame() {
        state.connections.close(connection_id, close.code, close.reason.to_string());
    }
}
