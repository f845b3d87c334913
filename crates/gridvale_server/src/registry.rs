//! The session registry: who is connected, on which map, and how to reach
//! them.
//!
//! Two indices under one mutex: map → sessions, and player → map. The lock is
//! never held across I/O: broadcasts snapshot the recipients, release, then
//! push bytes into each session's outgoing channel; recipients whose channel
//! is gone are reaped under a second brief acquisition.

use std::sync::Arc;

use bytes::Bytes;
use gridvale_protocol::{MapId, PlayerId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;

/// A handle to one connected client. Sends are non-blocking pushes into the
/// session's bounded outgoing channel; the writer task drains it to the
/// socket in FIFO order, which is what keeps per-recipient ordering.
#[derive(Clone)]
pub struct Session {
    pub player_id: PlayerId,
    pub username: String,
    /// Serial distinguishing this session from a later one by the same
    /// player.
    pub serial: u64,
    outgoing: flume::Sender<Bytes>,
    closed: Arc<watch::Sender<bool>>,
}

impl Session {
    pub fn new(
        player_id: PlayerId,
        username: String,
        serial: u64,
        outgoing: flume::Sender<Bytes>,
    ) -> Self {
        Self {
            player_id,
            username,
            serial,
            outgoing,
            closed: Arc::new(watch::channel(false).0),
        }
    }

    /// Queues bytes for delivery. Fails when the channel is full (client not
    /// draining) or the writer task is gone; either way the session is due
    /// for cleanup.
    pub fn try_send(&self, bytes: Bytes) -> bool {
        self.outgoing.try_send(bytes).is_ok()
    }

    /// Asks the connection tasks to shut this session down. An empty frame
    /// doubles as the writer's hangup marker (real frames always carry at
    /// least a length prefix); the watch wakes the reader.
    pub fn close(&self) {
        let _ = self.outgoing.try_send(Bytes::new());
        let _ = self.closed.send(true);
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[derive(Default)]
struct Indices {
    by_map: FxHashMap<MapId, FxHashMap<PlayerId, Session>>,
    player_to_map: FxHashMap<PlayerId, MapId>,
}

#[derive(Default)]
pub struct SessionRegistry {
    indices: Mutex<Indices>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session on a map. If the player already has a session, the
    /// old one is atomically replaced and returned so the caller can close
    /// it.
    pub fn register(&self, session: Session, map_id: MapId) -> Option<Session> {
        let mut indices = self.indices.lock();
        let player = session.player_id;

        let old = indices.player_to_map.remove(&player).and_then(|old_map| {
            let sessions = indices.by_map.get_mut(&old_map)?;
            let old = sessions.remove(&player);
            if sessions.is_empty() {
                indices.by_map.remove(&old_map);
            }
            old
        });

        indices
            .by_map
            .entry(map_id.clone())
            .or_default()
            .insert(player, session);
        indices.player_to_map.insert(player, map_id);
        old
    }

    /// Removes a session. With `serial` given, only removes if the registered
    /// session is that exact one; a stale disconnect must not evict a
    /// replacement session.
    pub fn remove(&self, player: PlayerId, serial: Option<u64>) -> Option<Session> {
        let mut indices = self.indices.lock();
        let map_id = indices.player_to_map.get(&player)?.clone();
        let sessions = indices.by_map.get_mut(&map_id)?;

        if let Some(serial) = serial {
            if sessions.get(&player).is_some_and(|s| s.serial != serial) {
                return None;
            }
        }

        let removed = sessions.remove(&player);
        if sessions.is_empty() {
            indices.by_map.remove(&map_id);
        }
        indices.player_to_map.remove(&player);
        removed
    }

    pub fn map_of(&self, player: PlayerId) -> Option<MapId> {
        self.indices.lock().player_to_map.get(&player).cloned()
    }

    pub fn session_of(&self, player: PlayerId) -> Option<Session> {
        let indices = self.indices.lock();
        let map_id = indices.player_to_map.get(&player)?;
        indices.by_map.get(map_id)?.get(&player).cloned()
    }

    /// Moves a player between map indices (teleport). No-op if offline.
    pub fn move_to_map(&self, player: PlayerId, new_map: MapId) {
        let mut indices = self.indices.lock();
        let Some(old_map) = indices.player_to_map.get(&player).cloned() else {
            return;
        };
        if old_map == new_map {
            return;
        }
        let Some(session) = indices
            .by_map
            .get_mut(&old_map)
            .and_then(|s| s.remove(&player))
        else {
            return;
        };
        if indices.by_map.get(&old_map).is_some_and(|s| s.is_empty()) {
            indices.by_map.remove(&old_map);
        }
        indices.by_map.entry(new_map.clone()).or_default().insert(player, session);
        indices.player_to_map.insert(player, new_map);
    }

    pub fn players_on_map(&self, map_id: &MapId) -> Vec<PlayerId> {
        self.indices
            .lock()
            .by_map
            .get(map_id)
            .map(|sessions| sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.indices.lock().player_to_map.len()
    }

    fn snapshot_map(&self, map_id: &MapId) -> Vec<Session> {
        self.indices
            .lock()
            .by_map
            .get(map_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Sends to every session on a map. Failed recipients are dropped from
    /// the registry after the fan-out.
    pub fn broadcast_to_map(&self, map_id: &MapId, bytes: &Bytes) {
        let sessions = self.snapshot_map(map_id);
        let mut failed = Vec::new();
        for session in &sessions {
            if !session.try_send(bytes.clone()) {
                failed.push((session.player_id, session.serial));
            }
        }
        self.reap(&failed);
    }

    /// Sends to every session on a map except one player.
    pub fn broadcast_to_map_except(&self, map_id: &MapId, except: PlayerId, bytes: &Bytes) {
        let sessions = self.snapshot_map(map_id);
        let mut failed = Vec::new();
        for session in &sessions {
            if session.player_id == except {
                continue;
            }
            if !session.try_send(bytes.clone()) {
                failed.push((session.player_id, session.serial));
            }
        }
        self.reap(&failed);
    }

    /// Sends to one player. Returns whether the send was queued.
    pub fn send_personal(&self, player: PlayerId, bytes: Bytes) -> bool {
        let Some(session) = self.session_of(player) else {
            return false;
        };
        if session.try_send(bytes) {
            true
        } else {
            self.reap(&[(player, session.serial)]);
            false
        }
    }

    /// Sends to an explicit subset of players.
    pub fn broadcast_to_players(&self, players: &[PlayerId], bytes: &Bytes) {
        for &player in players {
            self.send_personal(player, bytes.clone());
        }
    }

    /// Sends to every connected session, regardless of map.
    pub fn broadcast_all(&self, bytes: &Bytes) {
        let sessions: Vec<Session> = {
            let indices = self.indices.lock();
            indices
                .by_map
                .values()
                .flat_map(|sessions| sessions.values().cloned())
                .collect()
        };
        let mut failed = Vec::new();
        for session in &sessions {
            if !session.try_send(bytes.clone()) {
                failed.push((session.player_id, session.serial));
            }
        }
        self.reap(&failed);
    }

    fn reap(&self, failed: &[(PlayerId, u64)]) {
        for &(player, serial) in failed {
            if self.remove(player, Some(serial)).is_some() {
                debug!(player_id = %player, "reaped unreachable session");
            }
        }
    }
}
