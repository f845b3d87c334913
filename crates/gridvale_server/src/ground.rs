//! Ground-item lifecycle: creation with loot-protection and despawn clocks,
//! the per-tick despawn sweep, and viewer-relative visibility payloads.

use gridvale_protocol::messages::GroundItemPayload;
use gridvale_protocol::{MapId, PlayerId, TilePos};
use gridvale_store::state::{unix_now, GroundItem, ItemKindDef};
use gridvale_store::GameStore;

use crate::config::ServerConfig;

/// Creates and registers a ground item at `position`. The protection and
/// despawn windows come from the kind's rarity.
pub fn create_ground_item(
    store: &GameStore,
    config: &ServerConfig,
    def: &ItemKindDef,
    quantity: u32,
    durability: Option<u32>,
    map_id: MapId,
    position: TilePos,
    dropped_by: Option<PlayerId>,
) -> GroundItem {
    let now = unix_now();
    let item = GroundItem {
        id: store.next_ground_item_id(),
        kind: def.id,
        display_name: def.display_name.clone(),
        rarity: def.rarity,
        map_id,
        position,
        quantity,
        durability,
        dropped_by,
        dropped_at: now,
        public_at: now + config.loot_protection.get(def.rarity),
        despawn_at: now + config.despawn.get(def.rarity),
    };
    store.add_ground_item(item.clone());
    item
}

/// Removes every item on a map whose despawn clock has lapsed. Returns the
/// removed items so the caller can broadcast their removal.
pub fn sweep_expired(store: &GameStore, map_id: &MapId, now: f64) -> Vec<GroundItem> {
    store
        .ground_items_on_map(map_id)
        .into_iter()
        .filter(|item| item.despawn_at <= now)
        .filter_map(|item| store.remove_ground_item(item.id))
        .collect()
}

/// The ground items `viewer` can see from `viewer_pos`: same map, within the
/// visibility radius, and either theirs or past loot protection.
pub fn visible_ground_items(
    store: &GameStore,
    config: &ServerConfig,
    map_id: &MapId,
    viewer: PlayerId,
    viewer_pos: TilePos,
    now: f64,
) -> Vec<(GroundItem, GroundItemPayload)> {
    store
        .ground_items_on_map(map_id)
        .into_iter()
        .filter(|item| item.despawn_at > now)
        .filter(|item| {
            viewer_pos.chebyshev_distance(item.position) <= config.visibility_radius
        })
        .filter(|item| item.visible_to(viewer, now))
        .map(|item| {
            let payload = GroundItemPayload {
                id: item.id,
                kind: item.kind,
                display_name: item.display_name.clone(),
                rarity: item.rarity,
                position: item.position,
                quantity: item.quantity,
                is_yours: item.dropped_by == Some(viewer),
                is_protected: item.is_protected(now),
            };
            (item, payload)
        })
        .collect()
}
