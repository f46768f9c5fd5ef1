//! Component Registry and the handler-facing context.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

use crate::auth::Principal;
use crate::error::RuntimeError;
use crate::hydration::canonical_event_name;
use crate::protocol::EventScope;

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Json, RuntimeError>> + Send>>;
pub type MethodHandler = Arc<dyn Fn(MethodCtx, Vec<Json>) -> MethodFuture + Send + Sync>;
pub type LifecycleFuture = Pin<Box<dyn Future<Output = Result<(), RuntimeError>> + Send>>;
pub type LifecycleHook = Arc<dyn Fn(LifecycleCtx) -> LifecycleFuture + Send + Sync>;
pub type InitialStateFn = Arc<dyn Fn(&Json) -> Json + Send + Sync>;

/// A registered method: its handler plus the arity it accepts. `max_arity: None` means
/// unbounded.
#[derive(Clone)]
pub struct MethodSpec {
    pub handler: MethodHandler,
    pub min_arity: usize,
    pub max_arity: Option<usize>,
}

impl MethodSpec {
    pub fn validate_arity(&self, params: &[Json]) -> Result<(), RuntimeError> {
        let n = params.len();
        let within_max = self.max_arity.map(|max| n <= max).unwrap_or(true);
        if n < self.min_arity || !within_max {
            return Err(RuntimeError::HandlerError(format!(
                "expected {}..{} params, got {n}",
                self.min_arity,
                self.max_arity
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "∞".into())
            )));
        }
        Ok(())
    }
}

/// A registered component type.
pub struct ComponentType {
    pub name: String,
    pub initial_state: InitialStateFn,
    pub methods: HashMap<String, MethodSpec>,
    pub mount: Option<LifecycleHook>,
    pub unmount: Option<LifecycleHook>,
    /// Canonicalized permitted event names; empty means no restriction.
    pub permitted_events: HashSet<String>,
    /// Bumped by the registrant when `propsSchema`/method shapes change;
    /// folded into the fingerprint.
    pub schema_version: u32,
}

impl ComponentType {
    pub fn permits_event(&self, raw_name: &str) -> bool {
        self.permitted_events.is_empty()
            || self.permitted_events.contains(&canonical_event_name(raw_name))
    }

    /// Identity used for the idempotent-registration check: same name + same schema
    /// version + same method names + same permitted events is a no-op; anything else is a
    /// startup failure.
    fn schema_fingerprint(&self) -> (u32, Vec<String>, Vec<String>) {
        let mut methods: Vec<String> = self.methods.keys().cloned().collect();
        methods.sort();
        let mut events: Vec<String> = self.permitted_events.iter().cloned().collect();
        events.sort();
        (self.schema_version, methods, events)
    }
}

/// Process-wide catalogue of registered component types. A type is immutable once
/// registered.
#[derive(Default)]
pub struct ComponentRegistry {
    types: DashMap<String, Arc<ComponentType>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type. Idempotent: registering the same name twice
    /// with an identical schema is a no-op; a differing schema is a
    /// startup failure.
    pub fn register(&self, component_type: ComponentType) -> Result<(), RuntimeError> {
        let name = component_type.name.clone();
        let incoming = Arc::new(component_type);

        match self.types.get(&name) {
            Some(existing) if existing.schema_fingerprint() == incoming.schema_fingerprint() => {
                Ok(())
            }
            Some(_) => Err(RuntimeError::Internal(format!(
                "component type '{name}' already registered with a different schema"
            ))),
            None => {
                self.types.insert(name, incoming);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<ComponentType>, RuntimeError> {
        self.types
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RuntimeError::UnknownType(name.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════
// Handler execution context
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub scope: EventScope,
    pub room: Option<String>,
    pub name: String,
    pub data: Json,
}

/// `ctx` passed to a method handler: `{ instanceId, principal, emit,
/// broadcast, emitToSelf, setState, readState, abort }`. Events are buffered rather than
/// sent immediately, so that every `setState` effect is emitted before the events produced
/// in the same call: the dispatcher commits the state patch first, then flushes
/// `taken_events()` afterward.
#[derive(Clone)]
pub struct MethodCtx {
    pub instance_id: String,
    pub principal: Principal,
    staged_state: Arc<Mutex<Json>>,
    pending_events: Arc<Mutex<Vec<PendingEvent>>>,
    abort: CancellationToken,
}

impl MethodCtx {
    pub fn new(instance_id: String, principal: Principal, pre_call_state: Json, abort: CancellationToken) -> Self {
        Self {
            instance_id,
            principal,
            staged_state: Arc::new(Mutex::new(pre_call_state)),
            pending_events: Arc::new(Mutex::new(Vec::new())),
            abort,
        }
    }

    pub fn read_state(&self) -> Json {
        self.staged_state.lock().expect("state lock poisoned").clone()
    }

    /// Shallow-merges `partial` (must be a JSON object) into the staged
    /// state, matching the `setState({count: ...})` idiom handlers use.
    pub fn set_state(&self, partial: Json) {
        let Json::Object(partial) = partial else { return };
        let mut guard = self.staged_state.lock().expect("state lock poisoned");
        if !guard.is_object() {
            *guard = Json::Object(Default::default());
        }
        let map = guard.as_object_mut().expect("state is always an object");
        for (k, v) in partial {
            map.insert(k, v);
        }
    }

    pub fn emit_to_self(&self, name: impl Into<String>, data: Json) {
        self.push_event(EventScope::SelfScope, None, name.into(), data);
    }

    pub fn broadcast(&self, name: impl Into<String>, data: Json) {
        self.push_event(EventScope::Broadcast, None, name.into(), data);
    }

    pub fn emit_room(&self, room: impl Into<String>, name: impl Into<String>, data: Json) {
        self.push_event(EventScope::Room, Some(room.into()), name.into(), data);
    }

    fn push_event(&self, scope: EventScope, room: Option<String>, name: String, data: Json) {
        self.pending_events
            .lock()
            .expect("events lock poisoned")
            .push(PendingEvent { scope, room, name, data });
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Drain buffered events, in emission order, for the dispatcher to
    /// flush after committing the state patch.
    pub fn take_events(&self) -> Vec<PendingEvent> {
        std::mem::take(&mut self.pending_events.lock().expect("events lock poisoned"))
    }

    pub fn final_state(&self) -> Json {
        self.read_state()
    }
}

/// Context passed to `mount`/`unmount` lifecycle hooks.
#[derive(Clone)]
pub struct LifecycleCtx {
    pub instance_id: String,
    pub type_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler() -> MethodHandler {
        Arc::new(|_ctx, _params| Box::pin(async { Ok(Json::Null) }))
    }

    #[test]
    fn register_is_idempotent_for_identical_schema() {
        let registry = ComponentRegistry::new();
        let make = || ComponentType {
            name: "Counter".into(),
            initial_state: Arc::new(|_props| json!({"count": 0})),
            methods: HashMap::from([(
                "increment".into(),
                MethodSpec { handler: noop_handler(), min_arity: 1, max_arity: Some(1) },
            )]),
            mount: None,
            unmount: None,
            permitted_events: HashSet::new(),
            schema_version: 1,
        };
        registry.register(make()).unwrap();
        registry.register(make()).unwrap(); // no-op, not an error
        assert!(registry.get("Counter").is_ok());
    }

    #[test]
    fn register_rejects_conflicting_schema() {
        let registry = ComponentRegistry::new();
        registry
            .register(ComponentType {
                name: "Counter".into(),
                initial_state: Arc::new(|_props| json!({"count": 0})),
                methods: HashMap::new(),
                mount: None,
                unmount: None,
                permitted_events: HashSet::new(),
                schema_version: 1,
            })
            .unwrap();

        let result = registry.register(ComponentType {
            name: "Counter".into(),
            initial_state: Arc::new(|_props| json!({"count": 0})),
            methods: HashMap::new(),
            mount: None,
            unmount: None,
            permitted_events: HashSet::new(),
            schema_version: 2,
        });
        assert!(result.is_err());
    }

    #[test]
    fn unknown_type_surfaces_unknown_type_error() {
        let registry = ComponentRegistry::new();
        assert!(matches!(registry.get("Nope"), Err(RuntimeError::UnknownType(_))));
    }

    #[test]
    fn set_state_merges_shallowly() {
        let ctx = MethodCtx::new(
            "id1".into(),
            Principal::Anonymous,
            json!({"count": 5, "label": "a"}),
            CancellationToken::new(),
        );
        ctx.set_state(json!({"count": 8}));
        assert_eq!(ctx.read_state(), json!({"count": 8, "label": "a"}));
    }

    #[test]
    fn events_are_buffered_in_order() {
        let ctx = MethodCtx::new("id1".into(), Principal::Anonymous, json!({}), CancellationToken::new());
        ctx.emit_to_self("first", json!(1));
        ctx.broadcast("second", json!(2));
        let events = ctx.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "first");
        assert_eq!(events[1].name, "second");
        assert!(ctx.take_events().is_empty());
    }

    #[test]
    fn arity_validation_rejects_out_of_range() {
        let spec = MethodSpec { handler: noop_handler(), min_arity: 1, max_arity: Some(1) };
        assert!(spec.validate_arity(&[]).is_err());
        assert!(spec.validate_arity(&[json!(1), json!(2)]).is_err());
        assert!(spec.validate_arity(&[json!(1)]).is_ok());
    }
}
