//! The typed facade over the hot cache and the durable store.
//!
//! All live game state flows through [`GameStore`]. Reads hit the cache first
//! and transparently auto-load from the durable store with a TTL, so callers
//! cannot tell an online player from an offline one. Writes land in the cache
//! and mark a dirty bucket; the flusher drains those buckets to SQL on an
//! interval and once more at shutdown.

use std::time::Duration;

use gridvale_protocol::messages::CombatTarget;
use gridvale_protocol::{
    Direction, EntityInstanceId, GroundItemId, MapId, PlayerId, Rarity, SkillKind,
};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::cache::{Cache, CacheKey, CacheValue, TxSnapshot, TxWrite};
use crate::catalog::ItemCatalog;
use crate::durable::{DurableStore, PlayerRecord};
use crate::state::{
    Appearance, CombatState, EntityInstance, Equipment, GroundItem, Inventory, PlayerHp,
    PlayerPosition, PlayerSettings, SkillSheet,
};
use crate::StoreError;

const GROUND_ITEM_COUNTER: &str = "ground_items:next_id";

/// Ids whose cache state has diverged from the durable store.
#[derive(Default)]
struct DirtyBuckets {
    position: FxHashSet<PlayerId>,
    hp: FxHashSet<PlayerId>,
    inventory: FxHashSet<PlayerId>,
    equipment: FxHashSet<PlayerId>,
    skills: FxHashSet<PlayerId>,
    ground_item_maps: FxHashSet<MapId>,
}

impl DirtyBuckets {
    fn is_empty(&self) -> bool {
        self.position.is_empty()
            && self.hp.is_empty()
            && self.inventory.is_empty()
            && self.equipment.is_empty()
            && self.skills.is_empty()
            && self.ground_item_maps.is_empty()
    }
}

pub struct GameStoreConfig {
    pub online_ttl: Duration,
    pub offline_ttl: Duration,
    pub inventory_size: usize,
}

impl Default for GameStoreConfig {
    fn default() -> Self {
        Self {
            online_ttl: Duration::from_secs(300),
            offline_ttl: Duration::from_secs(3600),
            inventory_size: Inventory::DEFAULT_SIZE,
        }
    }
}

pub struct GameStore {
    cache: Cache,
    durable: DurableStore,
    catalog: ItemCatalog,
    dirty: Mutex<DirtyBuckets>,
    /// The authoritative online registry: id → username.
    online: Mutex<FxHashMap<PlayerId, String>>,
    config: GameStoreConfig,
}

impl GameStore {
    /// Builds the store, loading the item catalog and re-materializing
    /// persisted ground items into the cache.
    pub async fn open(durable: DurableStore, config: GameStoreConfig) -> Result<Self, StoreError> {
        let catalog = ItemCatalog::load(&durable).await?;
        let store = Self {
            cache: Cache::new(),
            durable,
            catalog,
            dirty: Mutex::new(DirtyBuckets::default()),
            online: Mutex::new(FxHashMap::default()),
            config,
        };
        store.reload_ground_items().await?;
        Ok(store)
    }

    pub fn catalog(&self) -> &ItemCatalog {
        &self.catalog
    }

    pub fn durable(&self) -> &DurableStore {
        &self.durable
    }

    pub fn inventory_size(&self) -> usize {
        self.config.inventory_size
    }

    fn ttl_for(&self, player: PlayerId) -> Duration {
        if self.is_online(player) {
            self.config.online_ttl
        } else {
            self.config.offline_ttl
        }
    }

    fn mark_dirty(&self, f: impl FnOnce(&mut DirtyBuckets)) {
        f(&mut self.dirty.lock());
    }

    // ------------------------------------------------------------------
    // Online registry

    pub fn register_online(&self, player: PlayerId, username: &str) {
        self.online.lock().insert(player, username.to_owned());
    }

    pub fn unregister_online(&self, player: PlayerId) {
        self.online.lock().remove(&player);
    }

    pub fn is_online(&self, player: PlayerId) -> bool {
        self.online.lock().contains_key(&player)
    }

    pub fn username_of(&self, player: PlayerId) -> Option<String> {
        self.online.lock().get(&player).cloned()
    }

    /// Online players in ascending id order, so per-tick iteration is
    /// deterministic.
    pub fn online_players(&self) -> Vec<(PlayerId, String)> {
        let mut players: Vec<_> = self
            .online
            .lock()
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        players.sort_by_key(|(id, _)| *id);
        players
    }

    /// The set of maps with at least one online player. Entity AI only runs
    /// on these.
    pub async fn populated_maps(&self) -> Result<Vec<MapId>, StoreError> {
        let mut maps = FxHashSet::default();
        for (player, _) in self.online_players() {
            if let Ok(pos) = self.position(player).await {
                maps.insert(pos.map_id);
            }
        }
        let mut maps: Vec<_> = maps.into_iter().collect();
        maps.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(maps)
    }

    // ------------------------------------------------------------------
    // Player records

    pub async fn player_record(&self, player: PlayerId) -> Result<PlayerRecord, StoreError> {
        self.durable
            .player_by_id(player)
            .await?
            .ok_or(StoreError::PlayerNotFound(player))
    }

    pub async fn player_record_by_username(
        &self,
        username: &str,
    ) -> Result<Option<PlayerRecord>, StoreError> {
        self.durable.player_by_username(username).await
    }

    // ------------------------------------------------------------------
    // Position

    pub async fn position(&self, player: PlayerId) -> Result<PlayerPosition, StoreError> {
        let key = CacheKey::Position(player);
        if let Some(value) = self.cache.get_refresh(&key, self.ttl_for(player)) {
            return value.into_position();
        }

        let record = self.player_record(player).await?;
        let position = PlayerPosition {
            map_id: record.map_id,
            pos: record.position,
            facing: Direction::Down,
            last_move_at: 0.0,
        };
        self.cache.put_with_ttl(
            key,
            CacheValue::Position(position.clone()),
            self.ttl_for(player),
        );
        Ok(position)
    }

    pub fn set_position(&self, player: PlayerId, position: PlayerPosition) {
        self.cache.put_with_ttl(
            CacheKey::Position(player),
            CacheValue::Position(position),
            self.ttl_for(player),
        );
        self.mark_dirty(|d| {
            d.position.insert(player);
        });
    }

    // ------------------------------------------------------------------
    // HP

    pub async fn hp(&self, player: PlayerId) -> Result<PlayerHp, StoreError> {
        let key = CacheKey::Hp(player);
        if let Some(value) = self.cache.get_refresh(&key, self.ttl_for(player)) {
            return value.into_hp();
        }

        let record = self.player_record(player).await?;
        let sheet = self.skills(player).await?;
        let max = sheet.level(SkillKind::Hitpoints);
        let hp = PlayerHp {
            current: record.current_hp.min(max),
            max,
        };
        self.cache
            .put_with_ttl(key, CacheValue::Hp(hp), self.ttl_for(player));
        Ok(hp)
    }

    pub fn set_hp(&self, player: PlayerId, hp: PlayerHp) {
        self.cache
            .put_with_ttl(CacheKey::Hp(player), CacheValue::Hp(hp), self.ttl_for(player));
        self.mark_dirty(|d| {
            d.hp.insert(player);
        });
    }

    // ------------------------------------------------------------------
    // Combat state (hot only; never persisted)

    pub fn combat_state(&self, player: PlayerId) -> Option<CombatState> {
        self.cache
            .get_refresh(&CacheKey::Combat(player), self.config.online_ttl)
            .and_then(|v| v.into_combat().ok())
    }

    pub fn set_combat_state(&self, player: PlayerId, state: CombatState) {
        self.cache.put_with_ttl(
            CacheKey::Combat(player),
            CacheValue::Combat(state),
            self.config.online_ttl,
        );
    }

    pub fn clear_combat_state(&self, player: PlayerId) {
        self.cache.delete(&CacheKey::Combat(player));
    }

    /// Clears every combat state targeting `target`. Used when an entity dies
    /// or a player disconnects.
    pub fn clear_combat_against(&self, target: CombatTarget) {
        for (player, _) in self.online_players() {
            if self.combat_state(player).is_some_and(|s| s.target == target) {
                self.clear_combat_state(player);
            }
        }
    }

    // ------------------------------------------------------------------
    // Settings

    pub fn settings(&self, player: PlayerId) -> PlayerSettings {
        self.cache
            .get_refresh(&CacheKey::Settings(player), self.config.online_ttl)
            .and_then(|v| v.into_settings().ok())
            .unwrap_or_default()
    }

    pub fn set_auto_retaliate(&self, player: PlayerId, enabled: bool) {
        let mut settings = self.settings(player);
        settings.auto_retaliate = enabled;
        self.cache.put_with_ttl(
            CacheKey::Settings(player),
            CacheValue::Settings(settings),
            self.config.online_ttl,
        );
    }

    // ------------------------------------------------------------------
    // Appearance

    pub async fn appearance(&self, player: PlayerId) -> Result<Appearance, StoreError> {
        let key = CacheKey::Appearance(player);
        if let Some(value) = self.cache.get_refresh(&key, self.ttl_for(player)) {
            return value.into_appearance();
        }
        let record = self.player_record(player).await?;
        self.cache.put_with_ttl(
            key,
            CacheValue::Appearance(record.appearance.clone()),
            self.ttl_for(player),
        );
        Ok(record.appearance)
    }

    /// Appearance writes go straight through to durable; they are rare and
    /// must survive a crash.
    pub async fn set_appearance(
        &self,
        player: PlayerId,
        appearance: Appearance,
    ) -> Result<(), StoreError> {
        self.durable
            .save_player_appearance(player, &appearance)
            .await?;
        self.cache.put_with_ttl(
            CacheKey::Appearance(player),
            CacheValue::Appearance(appearance),
            self.ttl_for(player),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inventory / equipment / skills

    pub async fn inventory(&self, player: PlayerId) -> Result<Inventory, StoreError> {
        let key = CacheKey::Inventory(player);
        if let Some(value) = self.cache.get_refresh(&key, self.ttl_for(player)) {
            return value.into_inventory();
        }
        let inv = self
            .durable
            .load_inventory(player, self.config.inventory_size)
            .await?
            .unwrap_or_else(|| Inventory::empty(self.config.inventory_size));
        self.cache
            .put_with_ttl(key, CacheValue::Inventory(inv.clone()), self.ttl_for(player));
        Ok(inv)
    }

    pub fn set_inventory(&self, player: PlayerId, inv: Inventory) {
        self.cache.put_with_ttl(
            CacheKey::Inventory(player),
            CacheValue::Inventory(inv),
            self.ttl_for(player),
        );
        self.mark_dirty(|d| {
            d.inventory.insert(player);
        });
    }

    pub async fn equipment(&self, player: PlayerId) -> Result<Equipment, StoreError> {
        let key = CacheKey::Equipment(player);
        if let Some(value) = self.cache.get_refresh(&key, self.ttl_for(player)) {
            return value.into_equipment();
        }
        let eq = self
            .durable
            .load_equipment(player)
            .await?
            .unwrap_or_default();
        self.cache
            .put_with_ttl(key, CacheValue::Equipment(eq.clone()), self.ttl_for(player));
        Ok(eq)
    }

    pub fn set_equipment(&self, player: PlayerId, eq: Equipment) {
        self.cache.put_with_ttl(
            CacheKey::Equipment(player),
            CacheValue::Equipment(eq),
            self.ttl_for(player),
        );
        self.mark_dirty(|d| {
            d.equipment.insert(player);
        });
    }

    pub async fn skills(&self, player: PlayerId) -> Result<SkillSheet, StoreError> {
        let key = CacheKey::Skills(player);
        if let Some(value) = self.cache.get_refresh(&key, self.ttl_for(player)) {
            return value.into_skills();
        }
        let sheet = self
            .durable
            .load_skills(player)
            .await?
            .unwrap_or_else(SkillSheet::starting);
        self.cache
            .put_with_ttl(key, CacheValue::Skills(sheet.clone()), self.ttl_for(player));
        Ok(sheet)
    }

    pub fn set_skills(&self, player: PlayerId, sheet: SkillSheet) {
        self.cache.put_with_ttl(
            CacheKey::Skills(player),
            CacheValue::Skills(sheet),
            self.ttl_for(player),
        );
        self.mark_dirty(|d| {
            d.skills.insert(player);
        });
    }

    // ------------------------------------------------------------------
    // Atomic multi-key writes

    /// Runs an atomic transaction over the given keys. Retries on conflict
    /// and never falls back to non-atomic writes; see [`Cache::transact`].
    ///
    /// The caller is responsible for marking dirty buckets for whatever it
    /// wrote, via [`GameStore::mark_player_dirty`].
    pub async fn transact<T, F>(&self, keys: &[CacheKey], f: F) -> Result<T, StoreError>
    where
        F: FnMut(&TxSnapshot) -> Result<(Vec<TxWrite>, T), StoreError>,
    {
        self.cache.transact(keys, f).await
    }

    /// Marks player-owned buckets dirty after a successful transaction.
    pub fn mark_player_dirty(
        &self,
        player: PlayerId,
        position: bool,
        hp: bool,
        inventory: bool,
        equipment: bool,
        skills: bool,
    ) {
        self.mark_dirty(|d| {
            if position {
                d.position.insert(player);
            }
            if hp {
                d.hp.insert(player);
            }
            if inventory {
                d.inventory.insert(player);
            }
            if equipment {
                d.equipment.insert(player);
            }
            if skills {
                d.skills.insert(player);
            }
        });
    }

    // ------------------------------------------------------------------
    // Entity instances (no TTL; authoritative live objects)

    pub fn insert_entity(&self, entity: EntityInstance) {
        let map_key = CacheKey::EntitiesOnMap(entity.map_id.clone());
        let mut ids = self
            .cache
            .get(&map_key)
            .and_then(|v| v.into_id_set().ok())
            .unwrap_or_default();
        if !ids.contains(&entity.id.0) {
            ids.push(entity.id.0);
            ids.sort_unstable();
        }
        self.cache.put(map_key, CacheValue::IdSet(ids));
        self.cache
            .put(CacheKey::Entity(entity.id), CacheValue::Entity(entity));
    }

    pub fn entity(&self, id: EntityInstanceId) -> Option<EntityInstance> {
        self.cache
            .get(&CacheKey::Entity(id))
            .and_then(|v| v.into_entity().ok())
    }

    /// Applies `f` to an entity under the cache's transactional primitive.
    /// Returns the updated instance, or `None` if the entity is gone.
    pub async fn update_entity<F>(
        &self,
        id: EntityInstanceId,
        mut f: F,
    ) -> Result<Option<EntityInstance>, StoreError>
    where
        F: FnMut(&mut EntityInstance),
    {
        let key = CacheKey::Entity(id);
        self.cache
            .transact(&[key.clone()], move |snap| {
                let Some(value) = snap.get(&key) else {
                    return Ok((vec![], None));
                };
                let mut entity = value.clone().into_entity()?;
                f(&mut entity);
                Ok((
                    vec![(key.clone(), Some(CacheValue::Entity(entity.clone())))],
                    Some(entity),
                ))
            })
            .await
    }

    pub fn entities_on_map(&self, map_id: &MapId) -> Vec<EntityInstance> {
        let Some(ids) = self
            .cache
            .get(&CacheKey::EntitiesOnMap(map_id.clone()))
            .and_then(|v| v.into_id_set().ok())
        else {
            return vec![];
        };
        ids.into_iter()
            .filter_map(|id| self.entity(EntityInstanceId(id)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Ground items (no TTL; authoritative live objects)

    pub fn next_ground_item_id(&self) -> GroundItemId {
        GroundItemId(self.cache.incr(GROUND_ITEM_COUNTER))
    }

    pub fn add_ground_item(&self, item: GroundItem) {
        let map_key = CacheKey::GroundItemsOnMap(item.map_id.clone());
        let mut ids = self
            .cache
            .get(&map_key)
            .and_then(|v| v.into_id_set().ok())
            .unwrap_or_default();
        if !ids.contains(&item.id.0) {
            ids.push(item.id.0);
            ids.sort_unstable();
        }
        self.cache.put(map_key, CacheValue::IdSet(ids));
        self.mark_dirty(|d| {
            d.ground_item_maps.insert(item.map_id.clone());
        });
        self.cache
            .put(CacheKey::GroundItem(item.id), CacheValue::GroundItem(item));
    }

    pub fn ground_item(&self, id: GroundItemId) -> Option<GroundItem> {
        self.cache
            .get(&CacheKey::GroundItem(id))
            .and_then(|v| v.into_ground_item().ok())
    }

    /// Removes a ground item. Returns the removed item, or `None` if someone
    /// else got there first.
    pub fn remove_ground_item(&self, id: GroundItemId) -> Option<GroundItem> {
        let item = self.ground_item(id)?;
        if !self.cache.delete(&CacheKey::GroundItem(id)) {
            return None;
        }

        let map_key = CacheKey::GroundItemsOnMap(item.map_id.clone());
        if let Some(mut ids) = self
            .cache
            .get(&map_key)
            .and_then(|v| v.into_id_set().ok())
        {
            ids.retain(|&i| i != id.0);
            self.cache.put(map_key, CacheValue::IdSet(ids));
        }
        self.mark_dirty(|d| {
            d.ground_item_maps.insert(item.map_id.clone());
        });
        Some(item)
    }

    pub fn ground_items_on_map(&self, map_id: &MapId) -> Vec<GroundItem> {
        let Some(ids) = self
            .cache
            .get(&CacheKey::GroundItemsOnMap(map_id.clone()))
            .and_then(|v| v.into_id_set().ok())
        else {
            return vec![];
        };
        ids.into_iter()
            .filter_map(|id| self.ground_item(GroundItemId(id)))
            .collect()
    }

    /// Re-materializes persisted ground items into the cache and raises the
    /// id counter past them. Called once at startup.
    async fn reload_ground_items(&self) -> Result<(), StoreError> {
        let items = self
            .durable
            .load_all_ground_items(|kind| {
                self.catalog
                    .get(kind)
                    .map(|def| (def.display_name.clone(), def.rarity))
                    .unwrap_or_else(|| (format!("item #{}", kind.0), Rarity::Common))
            })
            .await?;

        let mut max_id = 0;
        for item in items {
            max_id = max_id.max(item.id.0);
            self.add_ground_item(item);
        }
        self.cache.raise_counter(GROUND_ITEM_COUNTER, max_id);

        // Freshly reloaded state matches durable; nothing is dirty yet.
        self.dirty.lock().ground_item_maps.clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flushing

    /// Drains every dirty bucket to the durable store. Entries that fail stay
    /// dirty for the next cycle.
    pub async fn flush_dirty(&self) -> Result<(), StoreError> {
        let drained = {
            let mut dirty = self.dirty.lock();
            std::mem::take(&mut *dirty)
        };

        if drained.is_empty() {
            return Ok(());
        }

        let mut players: FxHashSet<PlayerId> = FxHashSet::default();
        players.extend(&drained.position);
        players.extend(&drained.hp);
        players.extend(&drained.inventory);
        players.extend(&drained.equipment);
        players.extend(&drained.skills);

        let mut player_count = 0usize;
        for &player in &players {
            if let Err(e) = self.flush_player_state(&drained, player).await {
                warn!(player_id = %player, error = %e, "flush failed; keeping dirty");
                self.requeue_player(&drained, player);
            } else {
                player_count += 1;
            }
        }

        let mut map_count = 0usize;
        for map_id in &drained.ground_item_maps {
            let items = self.ground_items_on_map(map_id);
            if let Err(e) = self.durable.replace_ground_items(map_id, &items).await {
                warn!(map_id = %map_id, error = %e, "ground-item flush failed; keeping dirty");
                self.mark_dirty(|d| {
                    d.ground_item_maps.insert(map_id.clone());
                });
            } else {
                map_count += 1;
            }
        }

        debug!(players = player_count, maps = map_count, "flushed dirty state");
        Ok(())
    }

    async fn flush_player_state(
        &self,
        drained: &DirtyBuckets,
        player: PlayerId,
    ) -> Result<(), StoreError> {
        if drained.position.contains(&player) || drained.hp.contains(&player) {
            let position = self.position(player).await?;
            let hp = self.hp(player).await?;
            self.durable
                .save_player_state(player, &position.map_id, position.pos, hp.current)
                .await?;
        }
        if drained.inventory.contains(&player) {
            let inv = self.inventory(player).await?;
            self.durable.replace_inventory(player, &inv).await?;
        }
        if drained.equipment.contains(&player) {
            let eq = self.equipment(player).await?;
            self.durable.replace_equipment(player, &eq).await?;
        }
        if drained.skills.contains(&player) {
            let sheet = self.skills(player).await?;
            self.durable.replace_skills(player, &sheet).await?;
        }
        Ok(())
    }

    fn requeue_player(&self, drained: &DirtyBuckets, player: PlayerId) {
        self.mark_dirty(|d| {
            if drained.position.contains(&player) {
                d.position.insert(player);
            }
            if drained.hp.contains(&player) {
                d.hp.insert(player);
            }
            if drained.inventory.contains(&player) {
                d.inventory.insert(player);
            }
            if drained.equipment.contains(&player) {
                d.equipment.insert(player);
            }
            if drained.skills.contains(&player) {
                d.skills.insert(player);
            }
        });
    }

    /// Flushes one player's full live state. Used on disconnect so the
    /// durable row is current before the session is forgotten.
    pub async fn flush_player(&self, player: PlayerId) -> Result<(), StoreError> {
        let position = self.position(player).await?;
        let hp = self.hp(player).await?;
        self.durable
            .save_player_state(player, &position.map_id, position.pos, hp.current)
            .await?;
        let inv = self.inventory(player).await?;
        self.durable.replace_inventory(player, &inv).await?;
        let eq = self.equipment(player).await?;
        self.durable.replace_equipment(player, &eq).await?;
        let sheet = self.skills(player).await?;
        self.durable.replace_skills(player, &sheet).await?;

        self.mark_dirty(|d| {
            d.position.remove(&player);
            d.hp.remove(&player);
            d.inventory.remove(&player);
            d.equipment.remove(&player);
            d.skills.remove(&player);
        });
        Ok(())
    }

    /// Drops a player's hot-only entries after their final flush.
    pub fn cleanup_player(&self, player: PlayerId) {
        self.cache.delete(&CacheKey::Combat(player));
        self.cache.delete(&CacheKey::Settings(player));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::state::unix_now;
    use gridvale_protocol::{ItemKindId, ItemStack, Role, TilePos};

    async fn open_store() -> (std::sync::Arc<GameStore>, PlayerRecord) {
        let durable = DurableStore::in_memory().await.unwrap();
        let record = durable
            .create_player(
                "alice",
                "hash",
                Role::Player,
                &MapId::from("meadowbrook"),
                TilePos::new(25, 25),
                10,
            )
            .await
            .unwrap();
        let store = GameStore::open(durable, GameStoreConfig::default())
            .await
            .unwrap();
        (std::sync::Arc::new(store), record)
    }

    #[tokio::test]
    async fn auto_loads_position_transparently() {
        let (store, record) = open_store().await;
        // Never registered online; reads still work.
        let pos = store.position(record.id).await.unwrap();
        assert_eq!(pos.pos, TilePos::new(25, 25));
        assert_eq!(pos.map_id, MapId::from("meadowbrook"));
    }

    #[tokio::test]
    async fn hp_defaults_from_hitpoints_level() {
        let (store, record) = open_store().await;
        let hp = store.hp(record.id).await.unwrap();
        assert_eq!(hp, PlayerHp { current: 10, max: 10 });
    }

    #[tokio::test]
    async fn unknown_player_is_an_error() {
        let (store, _) = open_store().await;
        assert!(matches!(
            store.position(PlayerId(999)).await,
            Err(StoreError::PlayerNotFound(PlayerId(999)))
        ));
    }

    #[tokio::test]
    async fn flush_then_cold_start_round_trips() {
        let durable = DurableStore::in_memory().await.unwrap();
        let record = durable
            .create_player(
                "alice",
                "hash",
                Role::Player,
                &MapId::from("meadowbrook"),
                TilePos::new(25, 25),
                10,
            )
            .await
            .unwrap();
        let store = GameStore::open(durable, GameStoreConfig::default())
            .await
            .unwrap();

        // Mutate live state.
        let mut pos = store.position(record.id).await.unwrap();
        pos.pos = TilePos::new(30, 31);
        store.set_position(record.id, pos);
        store.set_hp(record.id, PlayerHp { current: 7, max: 10 });
        let mut inv = store.inventory(record.id).await.unwrap();
        inv.slots[3] = Some(ItemStack::new(ItemKindId(1), 99, None));
        store.set_inventory(record.id, inv.clone());

        store.flush_dirty().await.unwrap();

        let record2 = store.durable().player_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(record2.position, TilePos::new(30, 31));
        assert_eq!(record2.current_hp, 7);
        let inv2 = store
            .durable()
            .load_inventory(record.id, Inventory::DEFAULT_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inv2, inv);
    }

    #[tokio::test]
    async fn ground_item_lifecycle_and_counter() {
        let (store, record) = open_store().await;
        let map = MapId::from("meadowbrook");

        let id = store.next_ground_item_id();
        let now = unix_now();
        store.add_ground_item(GroundItem {
            id,
            kind: ItemKindId(1),
            display_name: "Coins".into(),
            rarity: Rarity::Common,
            map_id: map.clone(),
            position: TilePos::new(10, 10),
            quantity: 5,
            durability: None,
            dropped_by: Some(record.id),
            dropped_at: now,
            public_at: now + 45.0,
            despawn_at: now + 120.0,
        });

        assert_eq!(store.ground_items_on_map(&map).len(), 1);
        assert!(store.ground_item(id).is_some());

        let removed = store.remove_ground_item(id).unwrap();
        assert_eq!(removed.quantity, 5);
        assert!(store.ground_item(id).is_none());
        assert!(store.ground_items_on_map(&map).is_empty());
        // Double remove is a normal "gone" case.
        assert!(store.remove_ground_item(id).is_none());

        let next = store.next_ground_item_id();
        assert!(next.0 > id.0);
    }

    #[tokio::test]
    async fn entity_update_is_transactional() {
        let (store, _) = open_store().await;
        let map = MapId::from("meadowbrook");

        store.insert_entity(EntityInstance {
            id: EntityInstanceId(1),
            kind_name: "goblin".into(),
            map_id: map.clone(),
            position: TilePos::new(5, 5),
            facing: Direction::Down,
            spawn_position: TilePos::new(5, 5),
            spawn_point_id: 0,
            wander_radius: 3,
            aggro_range: 5,
            disengage_range: 10,
            current_hp: 10,
            max_hp: 10,
            state: gridvale_protocol::EntityState::Idle,
            aggro_target: None,
            last_action_tick: 0,
            last_attack_tick: 0,
            death_tick: None,
            respawn_at: None,
        });

        let updated = store
            .update_entity(EntityInstanceId(1), |e| e.current_hp = 4)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.current_hp, 4);
        assert_eq!(store.entity(EntityInstanceId(1)).unwrap().current_hp, 4);

        assert_eq!(store.entities_on_map(&map).len(), 1);
        assert!(store
            .update_entity(EntityInstanceId(99), |_| ())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn catalog_is_seeded() {
        let (store, _) = open_store().await;
        assert!(!store.catalog().is_empty());
        assert!(store.catalog().by_name("coins").is_some());
    }
}
