//! The in-process hot cache.
//!
//! Entries are keyed by [`CacheKey`] and carry a version counter and an
//! optional expiry. Multi-key writes go through [`Cache::transact`], which
//! snapshots the involved versions, lets the caller compute writes, and
//! commits only if nothing moved underneath, retrying with exponential
//! backoff otherwise. There is no fallback to non-atomic writes; conflict
//! exhaustion surfaces to the caller.

use std::time::{Duration, Instant};

use gridvale_protocol::{EntityInstanceId, GroundItemId, MapId, PlayerId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::state::{
    Appearance, CombatState, EntityInstance, Equipment, GroundItem, Inventory, PlayerHp,
    PlayerPosition, PlayerSettings, SkillSheet,
};
use crate::StoreError;

/// Which piece of hot state a cache entry holds.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum CacheKey {
    Position(PlayerId),
    Hp(PlayerId),
    Combat(PlayerId),
    Settings(PlayerId),
    Appearance(PlayerId),
    Inventory(PlayerId),
    Equipment(PlayerId),
    Skills(PlayerId),
    Entity(EntityInstanceId),
    /// Index of entity instances on a map.
    EntitiesOnMap(MapId),
    GroundItem(GroundItemId),
    /// Index of ground items on a map.
    GroundItemsOnMap(MapId),
    /// Monotonic id counter, e.g. for ground items.
    Counter(&'static str),
}

/// A value stored in the cache. Variants correspond to [`CacheKey`]
/// categories; a mismatch is a programming error and surfaces as
/// [`StoreError::WrongKind`].
#[derive(Clone, PartialEq, Debug)]
pub enum CacheValue {
    Position(PlayerPosition),
    Hp(PlayerHp),
    Combat(CombatState),
    Settings(PlayerSettings),
    Appearance(Appearance),
    Inventory(Inventory),
    Equipment(Equipment),
    Skills(SkillSheet),
    Entity(EntityInstance),
    IdSet(Vec<i64>),
    Counter(i64),
    GroundItem(GroundItem),
}

macro_rules! value_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(self) -> Result<$ty, StoreError> {
            match self {
                CacheValue::$variant(v) => Ok(v),
                other => Err(StoreError::WrongKind {
                    expected: stringify!($variant),
                    got: other.kind_name(),
                }),
            }
        }
    };
}

impl CacheValue {
    fn kind_name(&self) -> &'static str {
        match self {
            CacheValue::Position(_) => "Position",
            CacheValue::Hp(_) => "Hp",
            CacheValue::Combat(_) => "Combat",
            CacheValue::Settings(_) => "Settings",
            CacheValue::Appearance(_) => "Appearance",
            CacheValue::Inventory(_) => "Inventory",
            CacheValue::Equipment(_) => "Equipment",
            CacheValue::Skills(_) => "Skills",
            CacheValue::Entity(_) => "Entity",
            CacheValue::IdSet(_) => "IdSet",
            CacheValue::Counter(_) => "Counter",
            CacheValue::GroundItem(_) => "GroundItem",
        }
    }

    value_accessor!(into_position, Position, PlayerPosition);
    value_accessor!(into_hp, Hp, PlayerHp);
    value_accessor!(into_combat, Combat, CombatState);
    value_accessor!(into_settings, Settings, PlayerSettings);
    value_accessor!(into_appearance, Appearance, Appearance);
    value_accessor!(into_inventory, Inventory, Inventory);
    value_accessor!(into_equipment, Equipment, Equipment);
    value_accessor!(into_skills, Skills, SkillSheet);
    value_accessor!(into_entity, Entity, EntityInstance);
    value_accessor!(into_id_set, IdSet, Vec<i64>);
    value_accessor!(into_counter, Counter, i64);
    value_accessor!(into_ground_item, GroundItem, GroundItem);
}

struct Entry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Inner {
    entries: FxHashMap<CacheKey, Entry>,
    /// Version counters survive deletion so transactions can detect
    /// delete/recreate races.
    versions: FxHashMap<CacheKey, u64>,
}

impl Inner {
    fn bump(&mut self, key: &CacheKey) -> u64 {
        let v = self.versions.entry(key.clone()).or_insert(0);
        *v += 1;
        *v
    }

    fn version(&self, key: &CacheKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn live_value(&self, key: &CacheKey, now: Instant) -> Option<&CacheValue> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| &e.value)
    }
}

/// Snapshot handed to a transaction closure. Reads are taken at a single
/// version point; the commit re-validates those versions.
pub struct TxSnapshot {
    values: FxHashMap<CacheKey, Option<CacheValue>>,
}

impl TxSnapshot {
    pub fn get(&self, key: &CacheKey) -> Option<&CacheValue> {
        self.values.get(key).and_then(|v| v.as_ref())
    }
}

/// A write produced by a transaction closure. `None` deletes the key.
pub type TxWrite = (CacheKey, Option<CacheValue>);

pub struct Cache {
    inner: Mutex<Inner>,
    backoff_base: Duration,
    max_retries: u32,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            backoff_base: Duration::from_millis(10),
            max_retries: 3,
        }
    }

    /// Fetches a live (non-expired) value.
    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        let inner = self.inner.lock();
        inner.live_value(key, Instant::now()).cloned()
    }

    /// Fetches and pushes the entry's expiry out by `ttl` (refresh-on-access).
    pub fn get_refresh(&self, key: &CacheKey, ttl: Duration) -> Option<CacheValue> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let entry = inner.entries.get_mut(key).filter(|e| !e.is_expired(now))?;
        if entry.expires_at.is_some() {
            entry.expires_at = Some(now + ttl);
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, key: CacheKey, value: CacheValue) {
        self.put_entry(key, value, None);
    }

    pub fn put_with_ttl(&self, key: CacheKey, value: CacheValue, ttl: Duration) {
        self.put_entry(key, value, Some(Instant::now() + ttl));
    }

    fn put_entry(&self, key: CacheKey, value: CacheValue, expires_at: Option<Instant>) {
        let mut inner = self.inner.lock();
        inner.bump(&key);
        inner.entries.insert(key, Entry { value, expires_at });
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        let existed = inner.entries.remove(key).is_some();
        if existed {
            inner.bump(key);
        }
        existed
    }

    /// Atomically increments a counter key, creating it at 1.
    pub fn incr(&self, name: &'static str) -> i64 {
        let key = CacheKey::Counter(name);
        let mut inner = self.inner.lock();
        let next = match inner.live_value(&key, Instant::now()) {
            Some(CacheValue::Counter(n)) => n + 1,
            _ => 1,
        };
        inner.bump(&key);
        inner.entries.insert(
            key,
            Entry {
                value: CacheValue::Counter(next),
                expires_at: None,
            },
        );
        next
    }

    /// Sets a counter to at least `floor`. Used when reloading persisted ids
    /// at cold start.
    pub fn raise_counter(&self, name: &'static str, floor: i64) {
        let key = CacheKey::Counter(name);
        let mut inner = self.inner.lock();
        let current = match inner.live_value(&key, Instant::now()) {
            Some(CacheValue::Counter(n)) => *n,
            _ => 0,
        };
        if floor > current {
            inner.bump(&key);
            inner.entries.insert(
                key,
                Entry {
                    value: CacheValue::Counter(floor),
                    expires_at: None,
                },
            );
        }
    }

    /// Runs `f` over a consistent snapshot of `keys` and commits its writes
    /// atomically. If any involved key changed version between snapshot and
    /// commit, the transaction retries with exponential backoff; exhaustion
    /// returns [`StoreError::TransactionConflict`].
    ///
    /// Writes keep the expiry of the entry they replace.
    pub async fn transact<T, F>(&self, keys: &[CacheKey], mut f: F) -> Result<T, StoreError>
    where
        F: FnMut(&TxSnapshot) -> Result<(Vec<TxWrite>, T), StoreError>,
    {
        let mut attempt = 0;
        loop {
            let (snapshot, versions) = {
                let inner = self.inner.lock();
                let now = Instant::now();
                let mut values = FxHashMap::default();
                let mut versions = Vec::with_capacity(keys.len());
                for key in keys {
                    values.insert(key.clone(), inner.live_value(key, now).cloned());
                    versions.push(inner.version(key));
                }
                (TxSnapshot { values }, versions)
            };

            let (writes, result) = f(&snapshot)?;

            let committed = {
                let mut inner = self.inner.lock();
                let unchanged = keys
                    .iter()
                    .zip(&versions)
                    .all(|(key, &v)| inner.version(key) == v);

                if unchanged {
                    for (key, value) in writes {
                        inner.bump(&key);
                        match value {
                            Some(value) => {
                                let expires_at =
                                    inner.entries.get(&key).and_then(|e| e.expires_at);
                                inner.entries.insert(key, Entry { value, expires_at });
                            }
                            None => {
                                inner.entries.remove(&key);
                            }
                        }
                    }
                    true
                } else {
                    false
                }
            };

            if committed {
                return Ok(result);
            }

            if attempt >= self.max_retries {
                return Err(StoreError::TransactionConflict);
            }
            let backoff = self.backoff_base * 2u32.pow(attempt);
            attempt += 1;
            tokio::time::sleep(backoff).await;
        }
    }

    /// Drops every entry. Test helper.
    #[doc(hidden)]
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let keys: Vec<_> = inner.entries.keys().cloned().collect();
        for key in keys {
            inner.bump(&key);
        }
        inner.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use gridvale_protocol::TilePos;

    use super::*;

    fn pos(x: i32, y: i32) -> CacheValue {
        CacheValue::Position(PlayerPosition {
            map_id: "m".into(),
            pos: TilePos::new(x, y),
            facing: gridvale_protocol::Direction::Down,
            last_move_at: 0.0,
        })
    }

    #[test]
    fn put_get_delete() {
        let cache = Cache::new();
        let key = CacheKey::Position(PlayerId(1));

        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), pos(3, 4));
        assert_eq!(cache.get(&key), Some(pos(3, 4)));
        assert!(cache.delete(&key));
        assert!(cache.get(&key).is_none());
        assert!(!cache.delete(&key));
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let cache = Cache::new();
        let key = CacheKey::Hp(PlayerId(1));
        cache.put_with_ttl(
            key.clone(),
            CacheValue::Hp(PlayerHp { current: 5, max: 10 }),
            Duration::from_secs(0),
        );
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn counters_increment_and_raise() {
        let cache = Cache::new();
        assert_eq!(cache.incr("ground_items"), 1);
        assert_eq!(cache.incr("ground_items"), 2);
        cache.raise_counter("ground_items", 10);
        assert_eq!(cache.incr("ground_items"), 11);
        cache.raise_counter("ground_items", 4);
        assert_eq!(cache.incr("ground_items"), 12);
    }

    #[test]
    fn wrong_kind_is_an_error() {
        let cache = Cache::new();
        let key = CacheKey::Position(PlayerId(1));
        cache.put(key.clone(), pos(0, 0));
        assert!(matches!(
            cache.get(&key).unwrap().into_hp(),
            Err(StoreError::WrongKind { .. })
        ));
    }

    #[tokio::test]
    async fn transact_commits_writes() {
        let cache = Cache::new();
        let key = CacheKey::Position(PlayerId(1));
        cache.put(key.clone(), pos(1, 1));

        let moved = cache
            .transact(&[key.clone()], |snap| {
                let mut p = snap
                    .get(&key)
                    .cloned()
                    .expect("present")
                    .into_position()?;
                p.pos = TilePos::new(2, 1);
                Ok((
                    vec![(key.clone(), Some(CacheValue::Position(p.clone())))],
                    p.pos,
                ))
            })
            .await
            .unwrap();

        assert_eq!(moved, TilePos::new(2, 1));
        assert_eq!(cache.get(&key), Some(pos(2, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn transact_retries_then_conflicts() {
        let cache = std::sync::Arc::new(Cache::new());
        let key = CacheKey::Position(PlayerId(1));
        cache.put(key.clone(), pos(0, 0));

        // Interfere on every attempt so the transaction can never commit.
        let interfering = cache.clone();
        let interfere_key = key.clone();
        let result = cache
            .transact(&[key.clone()], move |_snap| {
                interfering.put(interfere_key.clone(), pos(9, 9));
                Ok((vec![(interfere_key.clone(), Some(pos(1, 1)))], ()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::TransactionConflict)));
    }

    #[tokio::test]
    async fn transact_sees_consistent_snapshot() {
        let cache = Cache::new();
        let a = CacheKey::Position(PlayerId(1));
        let b = CacheKey::Hp(PlayerId(1));
        cache.put(a.clone(), pos(5, 5));
        cache.put(b.clone(), CacheValue::Hp(PlayerHp { current: 7, max: 10 }));

        cache
            .transact(&[a.clone(), b.clone()], |snap| {
                assert!(snap.get(&a).is_some());
                assert!(snap.get(&b).is_some());
                Ok((
                    vec![
                        (a.clone(), None),
                        (b.clone(), Some(CacheValue::Hp(PlayerHp { current: 6, max: 10 }))),
                    ],
                    (),
                ))
            })
            .await
            .unwrap();

        assert!(cache.get(&a).is_none());
        assert_eq!(
            cache.get(&b),
            Some(CacheValue::Hp(PlayerHp { current: 6, max: 10 }))
        );
    }
}
