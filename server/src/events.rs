//! Event Bus. Packages a handler's buffered `PendingEvent`s (registry.rs) into
//! `event` frames and hands them to the Connection Registry for delivery. Resolving
//! *which* connections a broadcast or room event reaches is the Instance Store's job (it
//! owns subscriber sets and room membership); this module only knows how to fan a single
//! event out to an already-resolved set of connections, keeping the "self / room /
//! broadcast" primitives independent of how membership is computed.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::connection::ConnectionRegistry;
use crate::protocol::{EventPayload, EventScope, OutboundEnvelope, OutboundUpdate};
use crate::registry::PendingEvent;

pub struct EventBus {
    connections: Arc<ConnectionRegistry>,
}

impl EventBus {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self { connections }
    }

    /// Deliver to the single connection that owns the instance.
    pub fn deliver_self(&self, owner: Uuid, from_instance_id: &str, ev: &PendingEvent) {
        let frame = self.frame(EventScope::SelfScope, None, from_instance_id, ev);
        self.connections.send(owner, frame);
    }

    /// Deliver to every connection subscribed to the instance.
    pub fn deliver_broadcast(&self, subscribers: &HashSet<Uuid>, from_instance_id: &str, ev: &PendingEvent) {
        let frame = self.frame(EventScope::Broadcast, None, from_instance_id, ev);
        self.connections.broadcast(subscribers, &frame);
    }

    /// Deliver to every connection subscribed to any instance that has
    /// joined the named room.
    pub fn deliver_room(&self, members: &HashSet<Uuid>, room: &str, from_instance_id: &str, ev: &PendingEvent) {
        let frame = self.frame(EventScope::Room, Some(room.to_string()), from_instance_id, ev);
        self.connections.broadcast(members, &frame);
    }

    /// Dispatch a single buffered event by its recorded scope, given
    /// the resolved connection sets for broadcast/room delivery. `owner`
    /// is always required since a `self`-scoped event still needs a
    /// target even if the instance also has subscribers.
    pub fn deliver(
        &self,
        ev: &PendingEvent,
        from_instance_id: &str,
        owner: Uuid,
        subscribers: &HashSet<Uuid>,
        room_members: impl FnOnce(&str) -> HashSet<Uuid>,
    ) {
        match ev.scope {
            EventScope::SelfScope => self.deliver_self(owner, from_instance_id, ev),
            EventScope::Broadcast => self.deliver_broadcast(subscribers, from_instance_id, ev),
            EventScope::Room => {
                let room = ev.room.clone().unwrap_or_default();
                let members = room_members(&room);
                self.deliver_room(&members, &room, from_instance_id, ev);
            }
        }
    }

    fn frame(&self, scope: EventScope, room: Option<String>, from_instance_id: &str, ev: &PendingEvent) -> OutboundEnvelope {
        OutboundEnvelope::single(OutboundUpdate::Event(EventPayload {
            scope,
            name: ev.name.clone(),
            data: ev.data.clone(),
            from_instance_id: from_instance_id.to_string(),
            room,
            request_id: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventScope as Scope;
    use serde_json::json;

    fn bus() -> (EventBus, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new(256, 1024 * 1024, 50, 100));
        (EventBus::new(registry.clone()), registry)
    }

    #[test]
    fn self_scope_reaches_only_the_owner() {
        let (bus, registry) = bus();
        let (owner, mut owner_rx) = registry.register();
        let (_other, mut other_rx) = registry.register();
        let ev = PendingEvent { scope: Scope::SelfScope, room: None, name: "tick".into(), data: json!(1) };
        bus.deliver_self(owner.id, "inst-1", &ev);
        assert!(owner_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_reaches_all_subscribers() {
        let (bus, registry) = bus();
        let (a, mut a_rx) = registry.register();
        let (b, mut b_rx) = registry.register();
        let subs: HashSet<Uuid> = [a.id, b.id].into_iter().collect();
        let ev = PendingEvent { scope: Scope::Broadcast, room: None, name: "changed".into(), data: json!({}) };
        bus.deliver_broadcast(&subs, "inst-1", &ev);
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn room_events_carry_room_name() {
        let (bus, registry) = bus();
        let (member, mut member_rx) = registry.register();
        let members: HashSet<Uuid> = [member.id].into_iter().collect();
        let ev = PendingEvent { scope: Scope::Room, room: Some("lobby".into()), name: "joined".into(), data: json!({}) };
        bus.deliver_room(&members, "lobby", "inst-1", &ev);
        let crate::connection::OutMsg::Frame(frame) = member_rx.try_recv().unwrap() else {
            panic!("expected a frame");
        };
        match &frame.updates[0] {
            OutboundUpdate::Event(payload) => assert_eq!(payload.room.as_deref(), Some("lobby")),
            _ => panic!("wrong update variant"),
        }
    }
}
