//! Demo component registrations. Registered at boot so the binary is runnable out of the
//! box and so the integration tests have something real to drive over the wire.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::error::RuntimeError;
use crate::instance::InstanceStore;
use crate::registry::{ComponentRegistry, ComponentType, MethodSpec};

/// `Counter`: `initialState(props) = {count: props.initial ?? 0}`, `increment(n) {
/// setState({count: state.count + n}) }`.
fn counter() -> ComponentType {
    let mut methods = HashMap::new();
    methods.insert(
        "increment".to_string(),
        MethodSpec {
            handler: Arc::new(|ctx, params| {
                Box::pin(async move {
                    let n = params
                        .first()
                        .and_then(Json::as_i64)
                        .ok_or_else(|| RuntimeError::HandlerError("increment expects a numeric delta".into()))?;
                    let current = ctx.read_state().get("count").and_then(Json::as_i64).unwrap_or(0);
                    ctx.set_state(json!({ "count": current + n }));
                    ctx.emit_to_self("incremented", json!({ "by": n }));
                    Ok(Json::Null)
                })
            }),
            min_arity: 1,
            max_arity: Some(1),
        },
    );
    methods.insert(
        "reset".to_string(),
        MethodSpec {
            handler: Arc::new(|ctx, _params| {
                Box::pin(async move {
                    ctx.set_state(json!({ "count": 0 }));
                    Ok(Json::Null)
                })
            }),
            min_arity: 0,
            max_arity: Some(0),
        },
    );

    ComponentType {
        name: "Counter".to_string(),
        initial_state: Arc::new(|props| {
            let initial = props.get("initial").cloned().unwrap_or(json!(0));
            json!({ "count": initial })
        }),
        methods,
        mount: None,
        unmount: None,
        permitted_events: HashSet::from(["incremented".to_string()]),
        schema_version: 1,
    }
}

/// `FileBin`: a minimal host for a chunked upload, whose `onUploadComplete` hook the
/// Dispatcher invokes once the Upload Assembler reaches `done`.
fn file_bin() -> ComponentType {
    let mut methods = HashMap::new();
    methods.insert(
        "onUploadComplete".to_string(),
        MethodSpec {
            handler: Arc::new(|ctx, params| {
                Box::pin(async move {
                    let upload_id = params.first().and_then(Json::as_str).unwrap_or_default().to_string();
                    let path = params.get(1).and_then(Json::as_str).unwrap_or_default().to_string();
                    let mut files = ctx.read_state().get("files").cloned().unwrap_or(json!([]));
                    if let Json::Array(list) = &mut files {
                        list.push(json!({ "uploadId": upload_id, "path": path }));
                    }
                    ctx.set_state(json!({ "files": files }));
                    ctx.broadcast("file-received", json!({ "uploadId": upload_id }));
                    Ok(Json::Null)
                })
            }),
            min_arity: 2,
            max_arity: Some(2),
        },
    );

    ComponentType {
        name: "FileBin".to_string(),
        initial_state: Arc::new(|_props| json!({ "files": [] })),
        methods,
        mount: None,
        unmount: None,
        permitted_events: HashSet::from(["file-received".to_string()]),
        schema_version: 1,
    }
}

/// `ChatRoom` demonstrates room-scoped event fan-out: every instance that joins a room
/// shares its `message` broadcasts with every other instance's subscribers in that room.
/// Joining happens in `mount`, which closes over the process-wide Instance Store.
fn chat_room(instances: Arc<InstanceStore>) -> ComponentType {
    let mut methods = HashMap::new();
    methods.insert(
        "send".to_string(),
        MethodSpec {
            handler: Arc::new(|ctx, params| {
                Box::pin(async move {
                    let text = params.first().and_then(Json::as_str).unwrap_or_default().to_string();
                    ctx.emit_room("lobby", "message", json!({ "from": ctx.instance_id, "text": text }));
                    Ok(Json::Null)
                })
            }),
            min_arity: 1,
            max_arity: Some(1),
        },
    );

    ComponentType {
        name: "ChatRoom".to_string(),
        initial_state: Arc::new(|_props| json!({})),
        methods,
        mount: Some(Arc::new(move |ctx| {
            let instances = instances.clone();
            Box::pin(async move {
                instances.join_room(&ctx.instance_id, "lobby");
                Ok(())
            })
        })),
        unmount: None,
        permitted_events: HashSet::from(["message".to_string()]),
        schema_version: 1,
    }
}

/// Registers every demo component type. Idempotent, safe to call once at process start.
pub fn register_all(registry: &ComponentRegistry, instances: &Arc<InstanceStore>) -> Result<(), RuntimeError> {
    registry.register(counter())?;
    registry.register(file_bin())?;
    registry.register(chat_room(instances.clone()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_conflict() {
        let registry = ComponentRegistry::new();
        let instances = Arc::new(InstanceStore::new());
        register_all(&registry, &instances).unwrap();
        register_all(&registry, &instances).unwrap(); // idempotent
        assert!(registry.get("Counter").is_ok());
        assert!(registry.get("FileBin").is_ok());
        assert!(registry.get("ChatRoom").is_ok());
    }
}
