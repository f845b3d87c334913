//! Entity kind definitions and the per-tick AI state machine.
//!
//! Kinds are a static catalog; instances live in the hot-state store and are
//! spawned from map spawn points at startup. AI only runs on maps with at
//! least one online player. Respawn clocks use wall time so idle maps do not
//! accumulate a backlog.

use std::sync::atomic::{AtomicI64, Ordering};

use gridvale_protocol::{
    Direction, EntityInstanceId, EntityState, MapId, PlayerId, TilePos,
};
use gridvale_map::{EntitySpawn, MapService};
use gridvale_store::state::{unix_now, EntityInstance};
use gridvale_store::{GameStore, StoreError};
use rand::Rng;
use tracing::info;

/// Static definition of an entity kind.
#[derive(Clone, Debug)]
pub struct EntityKindDef {
    pub name: &'static str,
    pub display_name: &'static str,
    pub max_hp: u32,
    pub attack_level: u32,
    pub strength_level: u32,
    pub defence_level: u32,
    pub attack_bonus: i32,
    pub strength_bonus: i32,
    pub defence_bonus: i32,
    /// Seconds between auto-attacks.
    pub attack_speed_secs: f64,
    /// Merchants and quest givers are not attackable and never aggro.
    pub is_attackable: bool,
    /// Aggressive kinds scan for players while idle or wandering.
    pub aggressive: bool,
    pub aggro_range: u32,
    pub disengage_range: u32,
    pub wander_radius: u32,
    /// Ticks between wander steps.
    pub wander_interval_ticks: u64,
    /// Ticks between chase steps while pursuing a target.
    pub chase_interval_ticks: u64,
}

/// The built-in kind catalog.
pub struct EntityCatalog {
    kinds: Vec<EntityKindDef>,
    next_instance_id: AtomicI64,
}

impl Default for EntityCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCatalog {
    pub fn new() -> Self {
        Self {
            kinds: builtin_kinds(),
            next_instance_id: AtomicI64::new(1),
        }
    }

    pub fn get(&self, name: &str) -> Option<&EntityKindDef> {
        self.kinds.iter().find(|k| k.name == name)
    }

    fn next_id(&self) -> EntityInstanceId {
        EntityInstanceId(self.next_instance_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Materializes an instance for a spawn point, honoring its overrides.
    pub fn instantiate(&self, map_id: &MapId, spawn: &EntitySpawn) -> Option<EntityInstance> {
        let kind = self.get(&spawn.entity_id)?;
        Some(EntityInstance {
            id: self.next_id(),
            kind_name: kind.name.to_owned(),
            map_id: map_id.clone(),
            position: spawn.position,
            facing: Direction::Down,
            spawn_position: spawn.position,
            spawn_point_id: spawn.spawn_point_id,
            wander_radius: spawn.wander_radius.unwrap_or(kind.wander_radius),
            aggro_range: spawn.aggro_override.unwrap_or(kind.aggro_range),
            disengage_range: spawn.disengage_override.unwrap_or(kind.disengage_range),
            current_hp: kind.max_hp,
            max_hp: kind.max_hp,
            state: EntityState::Idle,
            aggro_target: None,
            last_action_tick: 0,
            last_attack_tick: 0,
            death_tick: None,
            respawn_at: None,
        })
    }
}

fn builtin_kinds() -> Vec<EntityKindDef> {
    let base = EntityKindDef {
        name: "",
        display_name: "",
        max_hp: 1,
        attack_level: 1,
        strength_level: 1,
        defence_level: 1,
        attack_bonus: 0,
        strength_bonus: 0,
        defence_bonus: 0,
        attack_speed_secs: 3.0,
        is_attackable: true,
        aggressive: false,
        aggro_range: 0,
        disengage_range: 0,
        wander_radius: 3,
        wander_interval_ticks: 60,
        chase_interval_ticks: 10,
    };

    vec![
        EntityKindDef {
            name: "rat",
            display_name: "Giant Rat",
            max_hp: 5,
            wander_interval_ticks: 40,
            ..base.clone()
        },
        EntityKindDef {
            name: "goblin",
            display_name: "Goblin",
            max_hp: 10,
            attack_level: 5,
            strength_level: 4,
            defence_level: 3,
            attack_speed_secs: 3.0,
            aggressive: true,
            aggro_range: 5,
            disengage_range: 10,
            ..base.clone()
        },
        EntityKindDef {
            name: "wolf",
            display_name: "Grey Wolf",
            max_hp: 25,
            attack_level: 18,
            strength_level: 16,
            defence_level: 12,
            attack_bonus: 6,
            strength_bonus: 8,
            attack_speed_secs: 2.4,
            aggressive: true,
            aggro_range: 7,
            disengage_range: 14,
            wander_radius: 6,
            ..base.clone()
        },
        EntityKindDef {
            name: "merchant",
            display_name: "Merchant",
            max_hp: 10,
            is_attackable: false,
            wander_radius: 0,
            ..base.clone()
        },
        EntityKindDef {
            name: "guard",
            display_name: "Town Guard",
            max_hp: 40,
            attack_level: 25,
            strength_level: 22,
            defence_level: 25,
            attack_bonus: 10,
            strength_bonus: 8,
            defence_bonus: 12,
            attack_speed_secs: 2.4,
            wander_radius: 2,
            wander_interval_ticks: 100,
            ..base
        },
    ]
}

/// Spawns every entity from every map's spawn points. Called once at startup.
pub fn spawn_all(store: &GameStore, maps: &MapService, catalog: &EntityCatalog) -> usize {
    let mut spawned = 0;
    for map in maps.iter() {
        for spawn in map.entity_spawns() {
            match catalog.instantiate(&map.id, spawn) {
                Some(instance) => {
                    store.insert_entity(instance);
                    spawned += 1;
                }
                None => {
                    tracing::warn!(
                        map_id = %map.id,
                        entity_id = spawn.entity_id,
                        "spawn point references unknown entity kind"
                    );
                }
            }
        }
    }
    info!(count = spawned, "spawned map entities");
    spawned
}

/// What the AI decided an entity should do this tick, beyond state mutation.
#[derive(Debug, PartialEq, Eq)]
pub enum AiAction {
    None,
    /// The entity is in attacking state with an attack due; the combat tick
    /// resolves it.
    AttackPlayer(PlayerId),
}

/// Advances one entity's AI for this tick. Movement and state transitions are
/// committed through the store; combat is reported back to the caller so the
/// tick loop can route it through the combat resolver.
///
/// `players` is the positions of online players on this map.
pub async fn tick_entity(
    store: &GameStore,
    catalog: &EntityCatalog,
    maps: &MapService,
    entity_id: EntityInstanceId,
    players: &[(PlayerId, TilePos)],
    current_tick: u64,
    tick_rate: f64,
    rng: &mut impl Rng,
) -> Result<AiAction, StoreError> {
    let Some(entity) = store.entity(entity_id) else {
        return Ok(AiAction::None);
    };
    let Some(kind) = catalog.get(&entity.kind_name) else {
        return Ok(AiAction::None);
    };

    match entity.state {
        EntityState::Dying | EntityState::Dead => Ok(AiAction::None),

        EntityState::Idle | EntityState::Wandering => {
            // Aggressive kinds scan for a target first.
            if kind.aggressive && kind.is_attackable {
                if let Some(&(player, _)) = players
                    .iter()
                    .filter(|(_, pos)| {
                        entity.position.chebyshev_distance(*pos) <= entity.aggro_range
                    })
                    .min_by_key(|(_, pos)| entity.position.chebyshev_distance(*pos))
                {
                    store
                        .update_entity(entity_id, |e| {
                            e.state = EntityState::Aggro;
                            e.aggro_target = Some(player);
                        })
                        .await?;
                    return Ok(AiAction::None);
                }
            }

            // Wander on the kind's cadence.
            if entity.wander_radius > 0
                && current_tick.saturating_sub(entity.last_action_tick)
                    >= kind.wander_interval_ticks
            {
                let dir = random_direction(rng);
                let dest = entity.position.step(dir);
                let within_radius =
                    entity.spawn_position.chebyshev_distance(dest) <= entity.wander_radius;
                let walkable = maps
                    .get(&entity.map_id)
                    .is_some_and(|m| m.is_walkable(dest));

                store
                    .update_entity(entity_id, |e| {
                        e.last_action_tick = current_tick;
                        e.facing = dir;
                        if within_radius && walkable {
                            e.state = EntityState::Wandering;
                            e.position = dest;
                        } else {
                            e.state = EntityState::Idle;
                        }
                    })
                    .await?;
            }
            Ok(AiAction::None)
        }

        EntityState::Aggro => {
            let Some((_, target_pos)) = resolve_target(&entity, players) else {
                return drop_target(store, entity_id).await;
            };

            let distance = entity.position.chebyshev_distance(target_pos);
            if distance > entity.disengage_range {
                return drop_target(store, entity_id).await;
            }
            if distance <= 1 {
                store
                    .update_entity(entity_id, |e| e.state = EntityState::Attacking)
                    .await?;
                return Ok(AiAction::None);
            }

            // Step one tile toward the target on the chase cadence.
            if current_tick.saturating_sub(entity.last_action_tick) >= kind.chase_interval_ticks {
                if let Some((dir, dest)) = step_toward(maps, &entity, target_pos) {
                    store
                        .update_entity(entity_id, |e| {
                            e.last_action_tick = current_tick;
                            e.facing = dir;
                            e.position = dest;
                        })
                        .await?;
                } else {
                    store
                        .update_entity(entity_id, |e| e.last_action_tick = current_tick)
                        .await?;
                }
            }
            Ok(AiAction::None)
        }

        EntityState::Attacking => {
            let Some((target, target_pos)) = resolve_target(&entity, players) else {
                return drop_target(store, entity_id).await;
            };

            let distance = entity.position.chebyshev_distance(target_pos);
            if distance > entity.disengage_range {
                return drop_target(store, entity_id).await;
            }
            if distance > 1 {
                store
                    .update_entity(entity_id, |e| e.state = EntityState::Aggro)
                    .await?;
                return Ok(AiAction::None);
            }

            let cooldown_ticks = (kind.attack_speed_secs * tick_rate).ceil() as u64;
            if current_tick.saturating_sub(entity.last_attack_tick) >= cooldown_ticks {
                return Ok(AiAction::AttackPlayer(target));
            }
            Ok(AiAction::None)
        }
    }
}

fn resolve_target(
    entity: &EntityInstance,
    players: &[(PlayerId, TilePos)],
) -> Option<(PlayerId, TilePos)> {
    let target = entity.aggro_target?;
    players
        .iter()
        .find(|(id, _)| *id == target)
        .map(|&(id, pos)| (id, pos))
}

async fn drop_target(
    store: &GameStore,
    entity_id: EntityInstanceId,
) -> Result<AiAction, StoreError> {
    store
        .update_entity(entity_id, |e| {
            e.state = EntityState::Idle;
            e.aggro_target = None;
        })
        .await?;
    Ok(AiAction::None)
}

fn step_toward(
    maps: &MapService,
    entity: &EntityInstance,
    target: TilePos,
) -> Option<(Direction, TilePos)> {
    let map = maps.get(&entity.map_id)?;

    // Prefer closing the larger axis first.
    let dx = target.x - entity.position.x;
    let dy = target.y - entity.position.y;
    let mut candidates = Vec::with_capacity(2);
    let horizontal = if dx > 0 { Direction::Right } else { Direction::Left };
    let vertical = if dy > 0 { Direction::Down } else { Direction::Up };
    if dx.abs() >= dy.abs() {
        if dx != 0 {
            candidates.push(horizontal);
        }
        if dy != 0 {
            candidates.push(vertical);
        }
    } else {
        candidates.push(vertical);
        if dx != 0 {
            candidates.push(horizontal);
        }
    }

    for dir in candidates {
        let dest = entity.position.step(dir);
        if map.is_walkable(dest) {
            return Some((dir, dest));
        }
    }
    None
}

fn random_direction(rng: &mut impl Rng) -> Direction {
    match rng.gen_range(0..4) {
        0 => Direction::Up,
        1 => Direction::Down,
        2 => Direction::Left,
        _ => Direction::Right,
    }
}

/// Transitions a killed entity into the dying state and books its respawn.
pub async fn begin_death(
    store: &GameStore,
    entity_id: EntityInstanceId,
    current_tick: u64,
    death_anim_ticks: u64,
    respawn_delay_secs: f64,
) -> Result<(), StoreError> {
    store
        .update_entity(entity_id, |e| {
            e.state = EntityState::Dying;
            e.current_hp = 0;
            e.aggro_target = None;
            e.death_tick = Some(current_tick + death_anim_ticks);
            e.respawn_at = Some(unix_now() + respawn_delay_secs);
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use gridvale_map::GameMap;
    use gridvale_store::{DurableStore, GameStoreConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn open_field_map() -> GameMap {
        // 12x12 of plain walkable ground.
        let data: Vec<u32> = vec![1; 144];
        let json = format!(
            r#"{{"width": 12, "height": 12, "tilewidth": 32, "tileheight": 32,
                "layers": [{{"type": "tilelayer", "name": "ground", "data": {data:?}}}],
                "tilesets": []}}"#
        );
        GameMap::from_json("field".into(), &json, &[]).unwrap()
    }

    async fn setup() -> (std::sync::Arc<GameStore>, MapService, EntityCatalog) {
        let durable = DurableStore::in_memory().await.unwrap();
        let store = GameStore::open(durable, GameStoreConfig::default())
            .await
            .unwrap();
        let mut maps = MapService::new();
        maps.insert(open_field_map());
        (std::sync::Arc::new(store), maps, EntityCatalog::new())
    }

    fn spawn(catalog: &EntityCatalog, kind: &str, at: TilePos) -> EntityInstance {
        catalog
            .instantiate(
                &MapId::from("field"),
                &EntitySpawn {
                    spawn_point_id: 0,
                    entity_id: kind.into(),
                    position: at,
                    wander_radius: None,
                    aggro_override: None,
                    disengage_override: None,
                },
            )
            .unwrap()
    }

    #[tokio::test]
    async fn aggressive_kind_acquires_target_and_closes_in() {
        let (store, maps, catalog) = setup().await;
        let goblin = spawn(&catalog, "goblin", TilePos::new(5, 5));
        let id = goblin.id;
        store.insert_entity(goblin);

        let players = vec![(PlayerId(1), TilePos::new(8, 5))];
        let mut rng = StdRng::seed_from_u64(7);

        // Tick 1: sees the player (distance 3 <= aggro range 5) and aggros.
        let action = tick_entity(&store, &catalog, &maps, id, &players, 100, 20.0, &mut rng)
            .await
            .unwrap();
        assert_eq!(action, AiAction::None);
        let e = store.entity(id).unwrap();
        assert_eq!(e.state, EntityState::Aggro);
        assert_eq!(e.aggro_target, Some(PlayerId(1)));

        // Chase steps close the gap one tile at a time.
        let mut tick = 120;
        loop {
            tick_entity(&store, &catalog, &maps, id, &players, tick, 20.0, &mut rng)
                .await
                .unwrap();
            let e = store.entity(id).unwrap();
            if e.state == EntityState::Attacking {
                break;
            }
            assert!(tick < 400, "entity never reached its target");
            tick += 20;
        }
        let e = store.entity(id).unwrap();
        assert_eq!(e.position.chebyshev_distance(TilePos::new(8, 5)), 1);

        // In attacking state with the cooldown elapsed, it asks to attack.
        let action = tick_entity(
            &store,
            &catalog,
            &maps,
            id,
            &players,
            tick + 100,
            20.0,
            &mut rng,
        )
        .await
        .unwrap();
        assert_eq!(action, AiAction::AttackPlayer(PlayerId(1)));
    }

    #[tokio::test]
    async fn target_leaving_disengage_range_resets() {
        let (store, maps, catalog) = setup().await;
        let goblin = spawn(&catalog, "goblin", TilePos::new(5, 5));
        let id = goblin.id;
        store.insert_entity(goblin);
        store
            .update_entity(id, |e| {
                e.state = EntityState::Aggro;
                e.aggro_target = Some(PlayerId(1));
            })
            .await
            .unwrap();

        // Player is far beyond the goblin's disengage range of 10.
        let players = vec![(PlayerId(1), TilePos::new(5, 50))];
        let mut rng = StdRng::seed_from_u64(7);
        tick_entity(&store, &catalog, &maps, id, &players, 10, 20.0, &mut rng)
            .await
            .unwrap();

        let e = store.entity(id).unwrap();
        assert_eq!(e.state, EntityState::Idle);
        assert_eq!(e.aggro_target, None);
    }

    #[tokio::test]
    async fn non_attackable_kinds_never_aggro() {
        let (store, maps, catalog) = setup().await;
        let merchant = spawn(&catalog, "merchant", TilePos::new(5, 5));
        let id = merchant.id;
        store.insert_entity(merchant);

        let players = vec![(PlayerId(1), TilePos::new(6, 5))];
        let mut rng = StdRng::seed_from_u64(7);
        for tick in 0..200u64 {
            tick_entity(&store, &catalog, &maps, id, &players, tick, 20.0, &mut rng)
                .await
                .unwrap();
        }
        let e = store.entity(id).unwrap();
        assert!(matches!(
            e.state,
            EntityState::Idle | EntityState::Wandering
        ));
    }

    #[tokio::test]
    async fn wanderer_stays_within_radius() {
        let (store, maps, catalog) = setup().await;
        let rat = spawn(&catalog, "rat", TilePos::new(6, 6));
        let id = rat.id;
        store.insert_entity(rat);

        let mut rng = StdRng::seed_from_u64(42);
        for tick in (0..4000u64).step_by(40) {
            tick_entity(&store, &catalog, &maps, id, &[], tick, 20.0, &mut rng)
                .await
                .unwrap();
            let e = store.entity(id).unwrap();
            assert!(
                e.spawn_position.chebyshev_distance(e.position) <= e.wander_radius,
                "wandered out of its radius"
            );
        }
    }

    #[tokio::test]
    async fn begin_death_schedules_respawn() {
        let (store, _maps, catalog) = setup().await;
        let goblin = spawn(&catalog, "goblin", TilePos::new(5, 5));
        let id = goblin.id;
        store.insert_entity(goblin);

        begin_death(&store, id, 500, 10, 30.0).await.unwrap();
        let e = store.entity(id).unwrap();
        assert_eq!(e.state, EntityState::Dying);
        assert_eq!(e.death_tick, Some(510));
        assert!(e.respawn_at.is_some());
        assert_eq!(e.current_hp, 0);
    }
}
