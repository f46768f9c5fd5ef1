//! Connection Registry. Sends are non-blocking through a bounded mailbox per connection;
//! overflow drops the connection with code `BACKPRESSURE`. Once broadcast and room
//! fan-out exist, many independent instance workers can target the same connection
//! concurrently, which a single shared socket lock can't express without blocking one
//! worker on another — the mailbox gives every sender its own non-blocking `try_send`
//! while a single dedicated writer task owns the actual socket.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use governor::state::{InMemoryState, NotKeyed};
use governor::clock::DefaultClock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::RuntimeError;
use crate::protocol::OutboundEnvelope;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Message handed to a connection's writer task.
pub enum OutMsg {
    Frame(OutboundEnvelope),
    Ping,
    Close(Option<axum::extract::ws::CloseFrame>),
}

/// Server-side record of one live WebSocket connection.
pub struct ConnectionHandle {
    pub id: Uuid,
    principal: Mutex<Principal>,
    out_tx: mpsc::Sender<OutMsg>,
    queued_bytes: AtomicUsize,
    queue_byte_limit: usize,
    pub subscribed_instances: Mutex<HashSet<String>>,
    /// request-id -> instance-id, for observability and for discarding
    /// a reply after the connection that asked for it is gone.
    pub pending_requests: DashMap<String, String>,
    /// Last `toVersion` this connection is known to have observed per
    /// instance. Consulted before every push so a connection that missed a transition
    /// gets a `full=true` resync instead of a patch that assumes continuity.
    known_versions: DashMap<String, u64>,
    last_seen_ms: AtomicI64,
    missed_pongs: AtomicU32,
    limiter: DirectRateLimiter,
}

impl ConnectionHandle {
    pub fn principal(&self) -> Principal {
        self.principal.lock().expect("principal lock poisoned").clone()
    }

    pub fn attach_principal(&self, principal: Principal) {
        *self.principal.lock().expect("principal lock poisoned") = principal;
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::Relaxed);
        self.missed_pongs.store(0, Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    /// Non-blocking send; drops the connection on backpressure.
    pub fn send(&self, frame: OutboundEnvelope) -> Result<(), RuntimeError> {
        let size = serde_json::to_string(&frame).map(|s| s.len()).unwrap_or(0);
        let prior = self.queued_bytes.fetch_add(size, Ordering::Relaxed);
        if prior + size > self.queue_byte_limit {
            self.queued_bytes.fetch_sub(size, Ordering::Relaxed);
            return Err(RuntimeError::Backpressure);
        }
        match self.out_tx.try_send(OutMsg::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.queued_bytes.fetch_sub(size, Ordering::Relaxed);
                Err(RuntimeError::Backpressure)
            }
        }
    }

    /// Called by the writer task once a frame has actually been
    /// written to the socket, releasing its share of the byte budget.
    pub fn release_bytes(&self, size: usize) {
        self.queued_bytes.fetch_sub(size.min(self.queued_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
    }

    pub fn check_rate_limit(&self) -> Result<(), RuntimeError> {
        self.limiter.check().map_err(|_| RuntimeError::RateLimited)
    }

    /// The last `toVersion` this connection is known to have observed
    /// for `instance_id`, if any.
    pub fn known_version(&self, instance_id: &str) -> Option<u64> {
        self.known_versions.get(instance_id).map(|v| *v)
    }

    pub fn record_known_version(&self, instance_id: &str, version: u64) {
        self.known_versions.insert(instance_id.to_string(), version);
    }

    pub fn record_missed_pong(&self) -> u32 {
        self.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn ping(&self) -> Result<(), RuntimeError> {
        self.out_tx.try_send(OutMsg::Ping).map_err(|_| RuntimeError::Backpressure)
    }

    pub fn close(&self, frame: Option<axum::extract::ws::CloseFrame>) {
        let _ = self.out_tx.try_send(OutMsg::Close(frame));
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Process-wide catalogue of live connections.
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    queue_frames: usize,
    queue_bytes: usize,
    rps: u32,
    burst: u32,
}

impl ConnectionRegistry {
    pub fn new(queue_frames: usize, queue_bytes: usize, rps: u32, burst: u32) -> Self {
        Self {
            connections: DashMap::new(),
            queue_frames,
            queue_bytes,
            rps,
            burst,
        }
    }

    /// Register a new connection. Returns the handle (stored in the
    /// registry) and the receiver the caller's writer task drains.
    pub fn register(&self) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutMsg>) {
        let (out_tx, out_rx) = mpsc::channel(self.queue_frames);
        let quota = Quota::per_second(self.rps.max(1).try_into().unwrap())
            .allow_burst(self.burst.max(1).try_into().unwrap());
        let handle = Arc::new(ConnectionHandle {
            id: Uuid::new_v4(),
            principal: Mutex::new(Principal::Anonymous),
            out_tx,
            queued_bytes: AtomicUsize::new(0),
            queue_byte_limit: self.queue_bytes,
            subscribed_instances: Mutex::new(HashSet::new()),
            pending_requests: DashMap::new(),
            known_versions: DashMap::new(),
            last_seen_ms: AtomicI64::new(now_ms()),
            missed_pongs: AtomicU32::new(0),
            limiter: RateLimiter::direct(quota),
        });
        self.connections.insert(handle.id, handle.clone());
        (handle, out_rx)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|e| e.value().clone())
    }

    pub fn close(&self, id: Uuid, code: u16, reason: impl Into<String>) {
        if let Some((_, handle)) = self.connections.remove(&id) {
            handle.close(Some(axum::extract::ws::CloseFrame {
                code,
                reason: reason.into().into(),
            }));
        }
    }

    pub fn send(&self, id: Uuid, frame: OutboundEnvelope) {
        if let Some(handle) = self.get(id) {
            if handle.send(frame).is_err() {
                self.close(id, 4008, "backpressure");
            }
        }
    }

    pub fn broadcast(&self, ids: &HashSet<Uuid>, frame: &OutboundEnvelope) {
        for id in ids {
            // cheap clone: frames are small JSON envelopes, not buffers.
            self.send(*id, frame.clone());
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Heartbeat: ping every connection; disconnect anyone who has missed
/// three consecutive pongs.
pub async fn run_heartbeat(registry: Arc<ConnectionRegistry>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tick.tick().await;
        let ids: Vec<Uuid> = registry.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            let Some(handle) = registry.get(id) else { continue };
            if handle.record_missed_pong() > 3 {
                registry.close(id, 1000, "heartbeat timeout");
                continue;
            }
            if handle.ping().is_err() {
                registry.close(id, 4008, "backpressure");
            }
        }
    }
}
