//! Dispatcher — routes inbound messages to instance mailboxes and runs each instance's
//! single-writer worker loop. The Instance Store (instance.rs) owns the catalogue and the
//! mailbox channel; this module owns what happens on either end of it: the creation path
//! (`get_initial_state`/first `call_method`) and the worker task a new instance is spawned
//! with (`insert`'s `spawn_worker` callback), which drains `MailboxItem`s one at a time and
//! produces `state_update`/`function-result`/`function-error`/`event` frames.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::connection::ConnectionRegistry;
use crate::diff;
use crate::error::{Result, RuntimeError};
use crate::events::EventBus;
use crate::hydration;
use crate::instance::{ComponentInstance, InstanceStore, MailboxItem};
use crate::protocol::{
    ErrorPayload, FunctionErrorPayload, FunctionResultPayload, InitialStatePayload, OutboundEnvelope,
    OutboundUpdate, StateUpdatePayload,
};
use crate::registry::{ComponentRegistry, LifecycleCtx, MethodCtx};
use crate::upload::UploadAssembler;

pub struct Dispatcher {
    pub registry: Arc<ComponentRegistry>,
    pub instances: Arc<InstanceStore>,
    pub connections: Arc<ConnectionRegistry>,
    pub events: Arc<EventBus>,
    pub uploads: Arc<UploadAssembler>,
    pub handler_timeout: Duration,
    pub max_mailbox: usize,
}

impl Dispatcher {
    /// `getInitialState`. Creates the instance on first reference; reuses it (and its
    /// current state/version) otherwise.
    pub async fn get_initial_state(
        &self,
        connection_id: Uuid,
        component_name: &str,
        props: Json,
        user_provided_id: Option<&str>,
    ) -> Result<InitialStatePayload> {
        let component_type = self.registry.get(component_name)?;
        let id = self.instances.resolve_id(component_name, user_provided_id)?;

        let instance = match self.instances.get(&id) {
            Some(existing) => existing,
            None => self.create_instance(&id, component_type.clone(), props).await?,
        };

        instance.add_subscriber(connection_id);
        if let Some(conn) = self.connections.get(connection_id) {
            conn.subscribed_instances.lock().expect("lock poisoned").insert(id.clone());
            conn.record_known_version(&id, instance.version.load(std::sync::atomic::Ordering::SeqCst));
        }

        Ok(InitialStatePayload {
            component_name: component_name.to_string(),
            state: instance.read_state(),
            id: instance.id.clone(),
            fingerprint: instance.fingerprint.clone(),
        })
    }

    async fn create_instance(
        &self,
        id: &str,
        component_type: Arc<crate::registry::ComponentType>,
        props: Json,
    ) -> Result<Arc<ComponentInstance>> {
        let initial_state = (component_type.initial_state)(&props);
        let fingerprint = hydration::fingerprint(&component_type.name, &props, component_type.schema_version);

        if let Some(mount) = component_type.mount.clone() {
            let ctx = LifecycleCtx { instance_id: id.to_string(), type_name: component_type.name.clone() };
            mount(ctx).await.map_err(|e| RuntimeError::MountFailed(e.to_string()))?;
        }

        let registry = self.registry.clone();
        let events = self.events.clone();
        let connections = self.connections.clone();
        let instances = self.instances.clone();
        let uploads = self.uploads.clone();
        let handler_timeout = self.handler_timeout;

        let instance = self.instances.insert(
            id.to_string(),
            component_type.name.clone(),
            props,
            fingerprint,
            initial_state,
            self.max_mailbox,
            move |instance, mailbox_rx| {
                tokio::spawn(run_worker(
                    instance, mailbox_rx, registry, instances, connections, events, uploads, handler_timeout,
                ));
            },
        );
        Ok(instance)
    }

    /// `callMethod`. Validates the method exists, applies rehydration policy when a
    /// fingerprint is supplied, then enqueues the invoke onto the instance's mailbox,
    /// preserving the inbound connection's receive order for that instance.
    pub async fn call_method(
        &self,
        connection_id: Uuid,
        principal: Principal,
        type_name: &str,
        instance_id: &str,
        method_name: &str,
        params: Vec<Json>,
        fingerprint: Option<&str>,
        hydration_attempt: bool,
        request_id: Option<String>,
    ) -> Result<()> {
        let component_type = self.registry.get(type_name)?;
        let method = component_type
            .methods
            .get(method_name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownMethod {
                type_name: type_name.to_string(),
                method: method_name.to_string(),
            })?;
        method.validate_arity(&params)?;

        if let Some(conn) = self.connections.get(connection_id) {
            conn.check_rate_limit()?;
        }

        let instance = match self.instances.get(instance_id) {
            Some(existing) => existing,
            None => self.create_instance(instance_id, component_type.clone(), Json::Null).await?,
        };

        if hydration_attempt {
            if let Some(client_fp) = fingerprint {
                if client_fp != instance.fingerprint {
                    let (tx, rx) = tokio::sync::oneshot::channel();
                    instance
                        .mailbox_tx
                        .send(MailboxItem::Rehydrate { component_type: component_type.clone(), done: tx })
                        .await
                        .map_err(|_| RuntimeError::Overloaded)?;
                    rx.await.map_err(|_| RuntimeError::Overloaded)??;
                }
            }
        }

        if let Some(conn) = self.connections.get(connection_id) {
            conn.subscribed_instances.lock().expect("lock poisoned").insert(instance_id.to_string());
        }
        instance.add_subscriber(connection_id);

        let item = MailboxItem::Invoke {
            connection_id,
            principal,
            request_id,
            method_name: method_name.to_string(),
            params,
        };
        instance
            .mailbox_tx
            .try_send(item)
            .map_err(|_| RuntimeError::Overloaded)?;
        Ok(())
    }

    pub fn subscribe(&self, connection_id: Uuid, instance_id: &str, known_version: Option<u64>) -> Result<()> {
        let instance = self
            .instances
            .get(instance_id)
            .ok_or_else(|| RuntimeError::BadFrame(format!("unknown instance '{instance_id}'")))?;
        instance.add_subscriber(connection_id);
        let Some(conn) = self.connections.get(connection_id) else { return Ok(()) };
        conn.subscribed_instances.lock().expect("lock poisoned").insert(instance_id.to_string());

        let current = instance.version.load(std::sync::atomic::Ordering::SeqCst);
        let needs_resync = known_version.map(|v| v != current).unwrap_or(true);
        if needs_resync {
            let frame = OutboundEnvelope::single(OutboundUpdate::StateUpdate(StateUpdatePayload {
                id: instance.id.clone(),
                from_version: known_version.unwrap_or(0),
                to_version: current,
                patch: None,
                state: Some(instance.read_state()),
                full: true,
            }));
            self.connections.send(connection_id, frame);
        }
        conn.record_known_version(instance_id, current);
        Ok(())
    }

    pub fn unsubscribe(&self, connection_id: Uuid, instance_id: &str) {
        if let Some(instance) = self.instances.get(instance_id) {
            instance.remove_subscriber(&connection_id);
        }
        if let Some(conn) = self.connections.get(connection_id) {
            conn.subscribed_instances.lock().expect("lock poisoned").remove(instance_id);
        }
    }
}

/// The per-instance mailbox worker. Runs until the channel closes (after an `Unmount`
/// item drains) or a second panic within 60 s quarantines the instance.
async fn run_worker(
    instance: Arc<ComponentInstance>,
    mut mailbox_rx: mpsc::Receiver<MailboxItem>,
    registry: Arc<ComponentRegistry>,
    instances: Arc<InstanceStore>,
    connections: Arc<ConnectionRegistry>,
    events: Arc<EventBus>,
    uploads: Arc<UploadAssembler>,
    handler_timeout: Duration,
) {
    while let Some(item) = mailbox_rx.recv().await {
        match item {
            MailboxItem::Invoke { connection_id, principal, request_id, method_name, params } => {
                handle_invoke(
                    &instance, &registry, &instances, &connections, &events, handler_timeout,
                    connection_id, principal, request_id, &method_name, params,
                )
                .await;
            }
            MailboxItem::UploadComplete { upload_id, path } => {
                handle_upload_complete(&instance, &registry, &instances, &connections, &events, handler_timeout, &upload_id, &path).await;
            }
            MailboxItem::Rehydrate { component_type, done } => {
                let result = handle_rehydrate(&instance, &connections, component_type).await;
                let _ = done.send(result);
            }
            MailboxItem::Unmount { done } => {
                if let Ok(component_type) = registry.get(&instance.type_name) {
                    if let Some(unmount) = component_type.unmount.clone() {
                        let ctx = LifecycleCtx { instance_id: instance.id.clone(), type_name: instance.type_name.clone() };
                        if let Err(e) = unmount(ctx).await {
                            warn!(instance_id = %instance.id, error = %e, "unmount failed");
                        }
                    }
                }
                // any in-flight uploads targeting this instance are abandoned with it
                uploads.abort_for_instance(&instance.id).await;
                instances.remove(&instance.id);
                let _ = done.send(());
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_invoke(
    instance: &Arc<ComponentInstance>,
    registry: &Arc<ComponentRegistry>,
    instances: &Arc<InstanceStore>,
    connections: &Arc<ConnectionRegistry>,
    events: &Arc<EventBus>,
    handler_timeout: Duration,
    connection_id: Uuid,
    principal: Principal,
    request_id: Option<String>,
    method_name: &str,
    params: Vec<Json>,
) {
    let component_type = match registry.get(&instance.type_name) {
        Ok(t) => t,
        Err(e) => {
            reply_error(connections, connection_id, request_id, &e);
            return;
        }
    };
    let Some(method) = component_type.methods.get(method_name).cloned() else {
        reply_error(
            connections,
            connection_id,
            request_id,
            &RuntimeError::UnknownMethod { type_name: instance.type_name.clone(), method: method_name.to_string() },
        );
        return;
    };

    let pre_call_state = instance.read_state();
    let abort = CancellationToken::new();
    let ctx = MethodCtx::new(instance.id.clone(), principal, pre_call_state.clone(), abort.clone());

    let handler_fut = AssertUnwindSafe((method.handler)(ctx.clone(), params)).catch_unwind();
    let outcome = tokio::time::timeout(handler_timeout, handler_fut).await;

    let result = match outcome {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_panic)) => {
            handle_panic(instance, instances, connections, connection_id, request_id).await;
            return;
        }
        Err(_) => {
            abort.cancel();
            Err(RuntimeError::Timeout)
        }
    };

    commit_and_reply(instance, instances, connections, events, connection_id, request_id, &ctx, pre_call_state, result).await;
}

/// A handler panic quarantines the instance; a second panic within 60s evicts it and
/// notifies subscribers with `INSTANCE_QUARANTINED`. The first panic instead sends a
/// `full=true` resync of the (unchanged) current state, since the handler's mutations
/// never committed.
async fn handle_panic(
    instance: &Arc<ComponentInstance>,
    instances: &Arc<InstanceStore>,
    connections: &Arc<ConnectionRegistry>,
    connection_id: Uuid,
    request_id: Option<String>,
) {
    error!(instance_id = %instance.id, "handler panicked");
    let evict = instance.record_panic();

    if evict {
        instances.remove(&instance.id);
        let frame = OutboundEnvelope::single(OutboundUpdate::Error(ErrorPayload {
            code: RuntimeError::InstanceQuarantined.code().to_string(),
            message: RuntimeError::InstanceQuarantined.client_message(),
            request_id: None,
        }));
        connections.broadcast(&instance.subscriber_set(), &frame);
    } else {
        let version = instance.version.load(std::sync::atomic::Ordering::SeqCst);
        let state = instance.read_state();
        let frame = OutboundEnvelope::single(OutboundUpdate::StateUpdate(StateUpdatePayload {
            id: instance.id.clone(),
            from_version: version,
            to_version: version,
            patch: None,
            state: Some(state),
            full: true,
        }));
        connections.broadcast(&instance.subscriber_set(), &frame);
    }

    reply_error(connections, connection_id, request_id, &RuntimeError::HandlerError("handler panicked".into()));
}

async fn handle_upload_complete(
    instance: &Arc<ComponentInstance>,
    registry: &Arc<ComponentRegistry>,
    instances: &Arc<InstanceStore>,
    connections: &Arc<ConnectionRegistry>,
    events: &Arc<EventBus>,
    handler_timeout: Duration,
    upload_id: &str,
    path: &str,
) {
    let Ok(component_type) = registry.get(&instance.type_name) else { return };
    let Some(method) = component_type.methods.get("onUploadComplete").cloned() else {
        return;
    };

    let pre_call_state = instance.read_state();
    let abort = CancellationToken::new();
    let ctx = MethodCtx::new(instance.id.clone(), Principal::Anonymous, pre_call_state.clone(), abort.clone());
    let params = vec![Json::String(upload_id.to_string()), Json::String(path.to_string())];

    let outcome = tokio::time::timeout(handler_timeout, (method.handler)(ctx.clone(), params)).await;
    let result = match outcome {
        Ok(r) => r,
        Err(_) => {
            abort.cancel();
            Err(RuntimeError::Timeout)
        }
    };

    // No originating connection/request for an upload-driven call; only
    // the state commit and event fan-out apply.
    let dummy_connection = Uuid::nil();
    commit_and_reply(instance, instances, connections, events, dummy_connection, None, &ctx, pre_call_state, result).await;
}

/// Discards the stored instance state and re-runs `mount` with the instance's
/// original props, serialized through the mailbox like any other mutation so it
/// can't race an in-flight `Invoke` on the same instance. The id and subscriber set
/// are preserved so the caller's subsequent subscribe/invoke still targets the same
/// instance.
async fn handle_rehydrate(
    instance: &Arc<ComponentInstance>,
    connections: &Arc<ConnectionRegistry>,
    component_type: Arc<crate::registry::ComponentType>,
) -> Result<()> {
    let fresh_state = (component_type.initial_state)(&instance.props);
    let new_fingerprint =
        hydration::fingerprint(&component_type.name, &instance.props, component_type.schema_version);

    if let Some(mount) = component_type.mount.clone() {
        let ctx = LifecycleCtx { instance_id: instance.id.clone(), type_name: component_type.name.clone() };
        mount(ctx).await.map_err(|e| RuntimeError::MountFailed(e.to_string()))?;
    }

    let from_version = instance.version.load(std::sync::atomic::Ordering::SeqCst);
    instance.write_state(fresh_state.clone());
    let to_version = instance.version.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
    instance.touch();

    // Forcing patch=None makes `deliver_state_update` send a full resync to every
    // subscriber regardless of their recorded known_version, and still records
    // `to_version` for each of them so the next normal commit can resume diffing.
    deliver_state_update(connections, &instance.subscriber_set(), &instance.id, from_version, to_version, None, &fresh_state);

    // Schema-version bump on reinit is captured by `new_fingerprint`
    // differing from the stale one stored on `instance`; the field
    // itself is immutable post-construction, so callers comparing
    // against the *old* fingerprint correctly see a mismatch until
    // they next call getInitialState.
    let _ = new_fingerprint;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn commit_and_reply(
    instance: &Arc<ComponentInstance>,
    instances: &Arc<InstanceStore>,
    connections: &Arc<ConnectionRegistry>,
    events: &Arc<EventBus>,
    connection_id: Uuid,
    request_id: Option<String>,
    ctx: &MethodCtx,
    pre_call_state: Json,
    result: Result<Json>,
) {
    use std::sync::atomic::Ordering;

    let final_state = ctx.final_state();
    let patch = diff::diff(&pre_call_state, &final_state);
    if !patch.is_empty() {
        let from_version = instance.version.load(Ordering::SeqCst);
        instance.write_state(final_state.clone());
        let to_version = instance.version.fetch_add(1, Ordering::SeqCst) + 1;
        instance.touch();

        let full = diff::patch_exceeds_threshold(&patch, &final_state);
        deliver_state_update(connections, &instance.subscriber_set(), &instance.id, from_version, to_version, if full { None } else { Some(patch) }, &final_state);
    }

    // Events are emitted after the state commit, in emission order.
    for ev in ctx.take_events() {
        events.deliver(
            &ev,
            &instance.id,
            connection_id,
            &instance.subscriber_set(),
            |room| instances.room_subscribers(room),
        );
    }

    if let Some(request_id) = request_id {
        match result {
            Ok(value) => connections.send(
                connection_id,
                OutboundEnvelope::single(OutboundUpdate::FunctionResult(FunctionResultPayload {
                    request_id,
                    result: value,
                })),
            ),
            Err(e) => connections.send(
                connection_id,
                OutboundEnvelope::single(OutboundUpdate::FunctionError(FunctionErrorPayload {
                    request_id,
                    code: e.code().to_string(),
                    message: e.client_message(),
                })),
            ),
        }
    } else if let Err(e) = result {
        error!(instance_id = %instance.id, error = %e, "unrequested handler call failed");
    }
}


/// Push a `state_update` to every subscriber, applying per-connection
/// gap detection: a connection whose recorded `known_version` doesn't match
/// `from_version` gets a `full=true` resync instead of the shared patch, since a patch
/// presumes it observed every prior transition.
fn deliver_state_update(
    connections: &Arc<ConnectionRegistry>,
    subscribers: &std::collections::HashSet<Uuid>,
    instance_id: &str,
    from_version: u64,
    to_version: u64,
    patch: Option<Vec<crate::protocol::PatchOp>>,
    full_state: &Json,
) {
    for &conn_id in subscribers {
        let Some(conn) = connections.get(conn_id) else { continue };
        let caught_up = conn.known_version(instance_id) == Some(from_version);
        let frame = if caught_up {
            OutboundEnvelope::single(OutboundUpdate::StateUpdate(StateUpdatePayload {
                id: instance_id.to_string(),
                from_version,
                to_version,
                patch: patch.clone(),
                state: if patch.is_none() { Some(full_state.clone()) } else { None },
                full: patch.is_none(),
            }))
        } else {
            OutboundEnvelope::single(OutboundUpdate::StateUpdate(StateUpdatePayload {
                id: instance_id.to_string(),
                from_version,
                to_version,
                patch: None,
                state: Some(full_state.clone()),
                full: true,
            }))
        };
        connections.send(conn_id, frame);
        conn.record_known_version(instance_id, to_version);
    }
}

fn reply_error(connections: &Arc<ConnectionRegistry>, connection_id: Uuid, request_id: Option<String>, e: &RuntimeError) {
    match request_id {
        Some(request_id) => connections.send(
            connection_id,
            OutboundEnvelope::single(OutboundUpdate::FunctionError(FunctionErrorPayload {
                request_id,
                code: e.code().to_string(),
                message: e.client_message(),
            })),
        ),
        None => connections.send(
            connection_id,
            OutboundEnvelope::single(OutboundUpdate::Error(ErrorPayload {
                code: e.code().to_string(),
                message: e.client_message(),
                request_id: None,
            })),
        ),
    }
}
