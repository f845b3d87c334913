//! The per-player visibility cache and diff computation.
//!
//! For every online player we remember the last payload sent for each visible
//! thing, keyed by its stable string id. Each tick the current view replaces
//! the previous one, and the difference (added, updated with a changed
//! payload, removed) is what goes on the wire. The cache is LRU-bounded so memory
//! stays flat even if the registry briefly exceeds capacity.

use std::num::NonZeroUsize;

use gridvale_protocol::messages::{StateEntry, StatePayload};
use gridvale_protocol::PlayerId;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// The diff between two consecutive views.
#[derive(Debug, Default, PartialEq)]
pub struct VisibilityDiff {
    pub added: Vec<StateEntry>,
    pub updated: Vec<StateEntry>,
    pub removed: Vec<String>,
}

impl VisibilityDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

pub struct VisibilityCache {
    seen: Mutex<LruCache<PlayerId, FxHashMap<String, StatePayload>>>,
}

impl VisibilityCache {
    pub fn new(max_players: usize) -> Self {
        let cap = NonZeroUsize::new(max_players.max(1)).expect("nonzero");
        Self {
            seen: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Replaces a player's view with `visible_now` and returns the diff
    /// against what they saw last.
    pub fn update(
        &self,
        player: PlayerId,
        visible_now: FxHashMap<String, StatePayload>,
    ) -> VisibilityDiff {
        let mut seen = self.seen.lock();
        let previous = seen.get(&player);

        let mut diff = VisibilityDiff::default();
        match previous {
            None => {
                for (id, payload) in &visible_now {
                    diff.added.push(StateEntry {
                        id: id.clone(),
                        payload: payload.clone(),
                    });
                }
            }
            Some(previous) => {
                for (id, payload) in &visible_now {
                    match previous.get(id) {
                        None => diff.added.push(StateEntry {
                            id: id.clone(),
                            payload: payload.clone(),
                        }),
                        Some(old) if old != payload => diff.updated.push(StateEntry {
                            id: id.clone(),
                            payload: payload.clone(),
                        }),
                        Some(_) => {}
                    }
                }
                for id in previous.keys() {
                    if !visible_now.contains_key(id) {
                        diff.removed.push(id.clone());
                    }
                }
            }
        }

        // Deterministic order for tests and stable wire output.
        diff.added.sort_by(|a, b| a.id.cmp(&b.id));
        diff.updated.sort_by(|a, b| a.id.cmp(&b.id));
        diff.removed.sort();

        seen.put(player, visible_now);
        diff
    }

    /// A deep copy of a player's current view.
    pub fn snapshot(&self, player: PlayerId) -> FxHashMap<String, StatePayload> {
        self.seen
            .lock()
            .get(&player)
            .cloned()
            .unwrap_or_default()
    }

    /// Forgets a player. Called from the disconnect path.
    pub fn remove(&self, player: PlayerId) {
        self.seen.lock().pop(&player);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use gridvale_protocol::messages::PlayerPayload;
    use gridvale_protocol::{Direction, TilePos};
    use pretty_assertions::assert_eq;

    use super::*;

    fn player_payload(id: i64, x: i32) -> StatePayload {
        StatePayload::Player(PlayerPayload {
            player_id: PlayerId(id),
            username: format!("p{id}"),
            position: TilePos::new(x, 0),
            current_hp: 10,
            max_hp: 10,
            facing: Direction::Down,
            visual_hash: 0,
        })
    }

    fn view(entries: &[(&str, StatePayload)]) -> FxHashMap<String, StatePayload> {
        entries
            .iter()
            .map(|(id, p)| ((*id).to_owned(), p.clone()))
            .collect()
    }

    #[test]
    fn first_view_is_all_added() {
        let cache = VisibilityCache::new(8);
        let diff = cache.update(
            PlayerId(1),
            view(&[("player:2", player_payload(2, 5))]),
        );
        assert_eq!(diff.added.len(), 1);
        assert!(diff.updated.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn diff_classifies_added_updated_removed() {
        let cache = VisibilityCache::new(8);
        cache.update(
            PlayerId(1),
            view(&[
                ("player:2", player_payload(2, 5)),
                ("player:3", player_payload(3, 7)),
            ]),
        );

        let diff = cache.update(
            PlayerId(1),
            view(&[
                // Unchanged payload: not reported.
                ("player:3", player_payload(3, 7)),
                // Changed payload: updated.
                ("player:2", player_payload(2, 6)),
                // Fresh id: added.
                ("player:4", player_payload(4, 1)),
            ]),
        );

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "player:4");
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].id, "player:2");
        assert!(diff.removed.is_empty());

        // Dropping player:3 from view reports a removal.
        let diff = cache.update(
            PlayerId(1),
            view(&[
                ("player:2", player_payload(2, 6)),
                ("player:4", player_payload(4, 1)),
            ]),
        );
        assert_eq!(diff.removed, vec!["player:3".to_owned()]);
        assert!(diff.added.is_empty());
        assert!(diff.updated.is_empty());
    }

    #[test]
    fn applying_diff_reconstructs_view() {
        let cache = VisibilityCache::new(8);
        let mut client: FxHashMap<String, StatePayload> = FxHashMap::default();

        let views = [
            view(&[("a", player_payload(1, 0)), ("b", player_payload(2, 0))]),
            view(&[("b", player_payload(2, 3)), ("c", player_payload(3, 0))]),
            view(&[]),
        ];

        for server_view in views {
            let diff = cache.update(PlayerId(1), server_view.clone());
            for entry in diff.added.iter().chain(&diff.updated) {
                client.insert(entry.id.clone(), entry.payload.clone());
            }
            for id in &diff.removed {
                client.remove(id);
            }
            assert_eq!(client, server_view);
        }
    }

    #[test]
    fn lru_bound_evicts_oldest() {
        let cache = VisibilityCache::new(2);
        cache.update(PlayerId(1), view(&[("a", player_payload(1, 0))]));
        cache.update(PlayerId(2), view(&[("a", player_payload(1, 0))]));
        cache.update(PlayerId(3), view(&[("a", player_payload(1, 0))]));
        assert_eq!(cache.len(), 2);
        // Player 1 was evicted; their next update reads as a fresh view.
        let diff = cache.update(PlayerId(1), view(&[("a", player_payload(1, 0))]));
        assert_eq!(diff.added.len(), 1);
    }

    #[test]
    fn remove_frees_entry() {
        let cache = VisibilityCache::new(4);
        cache.update(PlayerId(1), view(&[("a", player_payload(1, 0))]));
        cache.remove(PlayerId(1));
        assert!(cache.is_empty());
        assert!(cache.snapshot(PlayerId(1)).is_empty());
    }
}
