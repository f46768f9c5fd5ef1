//! Instance Store. Holds the process-wide catalogue of live component instances plus
//! each instance's own record: state, fingerprint, subscribers, rooms joined, and the
//! single-writer mailbox that the Dispatcher's worker task drains. The catalogue itself —
//! not the worker loop, which belongs to the Dispatcher (dispatcher.rs) — lives here, a
//! per-instance record keyed in a process-wide concurrent map.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::hydration::is_valid_client_id;

/// A work item enqueued on an instance's mailbox. `Initial` is handled synchronously at
/// creation time (mount failure must abort before the id is bound), so only the remaining
/// kinds actually flow through the mailbox.
pub enum MailboxItem {
    Invoke {
        connection_id: Uuid,
        principal: crate::auth::Principal,
        request_id: Option<String>,
        method_name: String,
        params: Vec<Json>,
    },
    /// A completed upload notifying the instance's `onUploadComplete`
    /// hook, if the registered type declares one.
    UploadComplete {
        upload_id: String,
        path: String,
    },
    /// A `hydrationAttempt` whose fingerprint no longer matches: discard the stored state,
    /// re-run `mount`, and broadcast a `full=true` resync — serialized through the mailbox
    /// like every other mutation so it can't race an in-flight `Invoke` on the same
    /// instance.
    Rehydrate {
        component_type: Arc<crate::registry::ComponentType>,
        done: tokio::sync::oneshot::Sender<Result<()>>,
    },
    Unmount {
        done: tokio::sync::oneshot::Sender<()>,
    },
}

/// A live component instance.
pub struct ComponentInstance {
    pub id: String,
    pub type_name: String,
    pub props: Json,
    pub fingerprint: String,
    state: Mutex<Json>,
    pub version: AtomicU64,
    pub subscribers: Mutex<HashSet<Uuid>>,
    pub rooms: Mutex<HashSet<String>>,
    pub last_activity_ms: AtomicI64,
    pub mailbox_tx: mpsc::Sender<MailboxItem>,
    /// Set after the first panic inside this instance's worker; a
    /// second panic within the 60 s window evicts it.
    pub quarantined: AtomicBool,
    panic_log: Mutex<Vec<i64>>,
}

impl ComponentInstance {
    pub fn read_state(&self) -> Json {
        self.state.lock().expect("state lock poisoned").clone()
    }

    pub fn write_state(&self, new_state: Json) {
        *self.state.lock().expect("state lock poisoned") = new_state;
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn is_idle_since(&self, cutoff_ms: i64) -> bool {
        self.subscribers.lock().expect("subscribers lock poisoned").is_empty()
            && self.last_activity_ms.load(Ordering::Relaxed) < cutoff_ms
    }

    pub fn add_subscriber(&self, connection_id: Uuid) {
        self.subscribers.lock().expect("subscribers lock poisoned").insert(connection_id);
        self.touch();
    }

    pub fn remove_subscriber(&self, connection_id: &Uuid) {
        self.subscribers.lock().expect("subscribers lock poisoned").remove(connection_id);
    }

    pub fn subscriber_set(&self) -> HashSet<Uuid> {
        self.subscribers.lock().expect("subscribers lock poisoned").clone()
    }

    pub fn join_room(&self, room: &str) {
        self.rooms.lock().expect("rooms lock poisoned").insert(room.to_string());
    }

    /// Records a worker panic and reports whether this is the second
    /// one within the 60 s quarantine window.
    pub fn record_panic(&self) -> bool {
        let now = now_ms();
        let mut log = self.panic_log.lock().expect("panic log lock poisoned");
        log.retain(|&t| now - t < 60_000);
        log.push(now);
        self.quarantined.store(true, Ordering::Relaxed);
        log.len() >= 2
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Process-wide catalogue of component instances.
#[derive(Default)]
pub struct InstanceStore {
    instances: DashMap<String, Arc<ComponentInstance>>,
    /// room name -> member instance ids.
    room_members: DashMap<String, HashSet<String>>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ComponentInstance>> {
        self.instances.get(id).map(|e| e.value().clone())
    }

    /// Resolve the id to bind a new instance under: a valid caller-supplied id is honored
    /// unless already bound to a different type; otherwise a server id is generated.
    pub fn resolve_id(&self, type_name: &str, user_provided_id: Option<&str>) -> Result<String> {
        if let Some(candidate) = user_provided_id {
            if !is_valid_client_id(candidate) {
                return Err(RuntimeError::BadFrame(format!("invalid id '{candidate}'")));
            }
            if let Some(existing) = self.get(candidate) {
                if existing.type_name != type_name {
                    return Err(RuntimeError::BadFrame(format!(
                        "id '{candidate}' already bound to type '{}'",
                        existing.type_name
                    )));
                }
            }
            return Ok(candidate.to_string());
        }
        Ok(crate::hydration::generate_server_id())
    }

    /// Insert a freshly constructed instance (mount already run and
    /// `version=1` state already committed by the caller) and spawn its
    /// mailbox worker via `spawn_worker`.
    pub fn insert(
        &self,
        id: String,
        type_name: String,
        props: Json,
        fingerprint: String,
        initial_state: Json,
        mailbox_capacity: usize,
        spawn_worker: impl FnOnce(Arc<ComponentInstance>, mpsc::Receiver<MailboxItem>),
    ) -> Arc<ComponentInstance> {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(mailbox_capacity);
        let instance = Arc::new(ComponentInstance {
            id: id.clone(),
            type_name,
            props,
            fingerprint,
            state: Mutex::new(initial_state),
            version: AtomicU64::new(1),
            subscribers: Mutex::new(HashSet::new()),
            rooms: Mutex::new(HashSet::new()),
            last_activity_ms: AtomicI64::new(now_ms()),
            mailbox_tx,
            quarantined: AtomicBool::new(false),
            panic_log: Mutex::new(Vec::new()),
        });
        self.instances.insert(id, instance.clone());
        spawn_worker(instance.clone(), mailbox_rx);
        instance
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ComponentInstance>> {
        for mut entry in self.room_members.iter_mut() {
            entry.value_mut().remove(id);
        }
        self.instances.remove(id).map(|(_, v)| v)
    }

    pub fn join_room(&self, instance_id: &str, room: &str) {
        if let Some(instance) = self.get(instance_id) {
            instance.join_room(room);
        }
        self.room_members
            .entry(room.to_string())
            .or_default()
            .insert(instance_id.to_string());
    }

    /// Union of subscriber connection ids across every instance that
    /// has joined `room`.
    pub fn room_subscribers(&self, room: &str) -> HashSet<Uuid> {
        let Some(members) = self.room_members.get(room) else {
            return HashSet::new();
        };
        let mut out = HashSet::new();
        for instance_id in members.value() {
            if let Some(instance) = self.get(instance_id) {
                out.extend(instance.subscriber_set());
            }
        }
        out
    }

    /// Ids eligible for reaping: no subscribers and idle past `cutoff_ms`.
    pub fn idle_instance_ids(&self, cutoff_ms: i64) -> Vec<String> {
        self.instances
            .iter()
            .filter(|e| e.value().is_idle_since(cutoff_ms))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_instance(id: &str) -> (InstanceStore, Arc<ComponentInstance>) {
        let store = InstanceStore::new();
        let instance = store.insert(
            id.to_string(),
            "Counter".into(),
            json!({"initial": 5}),
            "fp1".into(),
            json!({"count": 5}),
            16,
            |_instance, _rx| {},
        );
        (store, instance)
    }

    #[test]
    fn resolve_id_honors_valid_user_supplied_id() {
        let store = InstanceStore::new();
        let id = store.resolve_id("Counter", Some("abcdefgh12")).unwrap();
        assert_eq!(id, "abcdefgh12");
    }

    #[test]
    fn resolve_id_rejects_malformed_user_supplied_id() {
        let store = InstanceStore::new();
        assert!(store.resolve_id("Counter", Some("short")).is_err());
    }

    #[test]
    fn resolve_id_rejects_type_mismatch_on_existing_id() {
        let (store, _instance) = store_with_instance("abcdefgh12");
        let result = store.resolve_id("OtherType", Some("abcdefgh12"));
        assert!(result.is_err());
    }

    #[test]
    fn resolve_id_generates_server_id_when_absent() {
        let store = InstanceStore::new();
        let id = store.resolve_id("Counter", None).unwrap();
        assert!(is_valid_client_id(&id));
    }

    #[test]
    fn idle_instances_require_empty_subscribers_and_staleness() {
        let (store, instance) = store_with_instance("abcdefgh12");
        assert!(store.idle_instance_ids(now_ms() + 1).contains(&"abcdefgh12".to_string()));
        instance.add_subscriber(Uuid::new_v4());
        assert!(store.idle_instance_ids(now_ms() + 1).is_empty());
    }

    #[test]
    fn room_subscribers_unions_across_member_instances() {
        let store = InstanceStore::new();
        let a = store.insert("aaaaaaaa".into(), "Chat".into(), json!({}), "f".into(), json!({}), 16, |_, _| {});
        let b = store.insert("bbbbbbbb".into(), "Chat".into(), json!({}), "f".into(), json!({}), 16, |_, _| {});
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        a.add_subscriber(conn_a);
        b.add_subscriber(conn_b);
        store.join_room("aaaaaaaa", "lobby");
        store.join_room("bbbbbbbb", "lobby");
        let members = store.room_subscribers("lobby");
        assert!(members.contains(&conn_a) && members.contains(&conn_b));
    }

    #[test]
    fn second_panic_within_window_reports_eviction() {
        let (_store, instance) = store_with_instance("abcdefgh12");
        assert!(!instance.record_panic());
        assert!(instance.record_panic());
    }

    #[test]
    fn remove_clears_room_membership() {
        let store = InstanceStore::new();
        store.insert("aaaaaaaa".into(), "Chat".into(), json!({}), "f".into(), json!({}), 16, |_, _| {});
        store.join_room("aaaaaaaa", "lobby");
        store.remove("aaaaaaaa");
        assert!(store.room_subscribers("lobby").is_empty());
    }
}
