use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::{
    protocol::Event,
    session::{Peer, SessionId},
};

/// Process-wide registry of logged-in users and room memberships.
///
/// Every read and mutation takes the same lock, so no caller can observe a
/// half-applied change. Fan-out also runs under the lock, which makes it the
/// single serialization point for everything delivered to a room.
#[derive(Default)]
pub struct Directory {
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    users: HashMap<String, Peer>,
    rooms: HashMap<String, HashMap<SessionId, Peer>>,
    // Reverse index keeping each session in at most one room.
    placement: HashMap<SessionId, String>,
}

impl Registry {
    fn remove_member(&mut self, room: &str, id: SessionId) -> bool {
        let removed = self
            .rooms
            .get_mut(room)
            .is_some_and(|members| members.remove(&id).is_some());
        if removed {
            self.placement.remove(&id);
        }
        removed
    }

    fn names(&self, room: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .rooms
            .get(room)
            .map(|members| {
                members
                    .values()
                    .map(|peer| peer.username().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the peer's username to it. Returns `false` without touching the
    /// existing binding when the name is already taken.
    pub async fn register(&self, peer: Peer) -> bool {
        let mut registry = self.registry.lock().await;
        if registry.users.contains_key(peer.username()) {
            return false;
        }
        registry.users.insert(peer.username().to_string(), peer);
        true
    }

    pub async fn unregister(&self, name: &str) {
        self.registry.lock().await.users.remove(name);
    }

    pub async fn lookup(&self, name: &str) -> Option<Peer> {
        self.registry.lock().await.users.get(name).cloned()
    }

    /// Adds the peer to `room`, creating it if needed. A peer that was in a
    /// different room is removed from it first; that room's name is returned.
    pub async fn join(&self, room: &str, peer: Peer) -> Option<String> {
        let mut registry = self.registry.lock().await;
        let id = peer.id();

        let previous = match registry.placement.get(&id) {
            Some(current) if current != room => Some(current.clone()),
            _ => None,
        };
        if let Some(previous) = &previous {
            registry.remove_member(previous, id);
        }

        registry
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(id, peer);
        registry.placement.insert(id, room.to_string());
        previous
    }

    pub async fn leave(&self, room: &str, id: SessionId) -> bool {
        self.registry.lock().await.remove_member(room, id)
    }

    pub async fn members(&self, room: &str) -> Vec<Peer> {
        self.registry
            .lock()
            .await
            .rooms
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn member_names(&self, room: &str) -> Vec<String> {
        self.registry.lock().await.names(room)
    }

    pub async fn room_of(&self, id: SessionId) -> Option<String> {
        self.registry.lock().await.placement.get(&id).cloned()
    }

    /// Renders one event from the current member names and hands it to every
    /// member of `room` without releasing the lock in between. Returns how
    /// many members accepted it.
    pub async fn fan_out<F>(&self, room: &str, render: F) -> usize
    where
        F: FnOnce(&[String]) -> Event,
    {
        let registry = self.registry.lock().await;
        let Some(members) = registry.rooms.get(room) else {
            return 0;
        };
        if members.is_empty() {
            return 0;
        }

        let event = render(&registry.names(room));
        let mut delivered = 0;
        for peer in members.values() {
            if peer.outbox().deliver(event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }
}
