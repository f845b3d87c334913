//! The fixed-rate game loop.
//!
//! One cooperative task advances the world at `tick_rate` ticks per second.
//! Within a tick the phases run in a fixed order: entity AI, combat, the
//! ground-item sweep, death-animation progression, respawns, and finally the
//! per-player visibility diffs (in ascending player-id order, so output is
//! deterministic). The loop sleeps for whatever remains of the tick period;
//! an overrunning tick is logged and the next one starts immediately.

use std::sync::Arc;
use std::time::Instant;

use gridvale_protocol::codec::encode_event;
use gridvale_protocol::messages::{
    CombatTarget, EntityPayload, EventPlayerDied, EventPlayerRespawn, EventStateUpdate,
    PlayerPayload, StatePayload,
};
use gridvale_protocol::{EntityState, MapId, PlayerId, TilePos};
use gridvale_store::state::{unix_now, PlayerHp, PlayerPosition};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::combat::{self, Combatant};
use crate::ground;
use crate::handler;
use crate::GameContext;

/// Loop-local state that survives across ticks.
pub struct TickState {
    rng: StdRng,
    /// Players waiting out the death delay, with their due time.
    pending_respawns: Vec<(PlayerId, f64)>,
}

impl Default for TickState {
    fn default() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            pending_respawns: Vec::new(),
        }
    }
}

impl TickState {
    /// Deterministic state for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            pending_respawns: Vec::new(),
        }
    }
}

/// Runs the loop until shutdown, then triggers a final drain of the store's
/// dirty buckets.
pub async fn run_tick_loop(ctx: Arc<GameContext>, mut shutdown: watch::Receiver<bool>) {
    let mut state = TickState::default();
    let period = ctx.config.tick_period();
    info!(
        tick_rate = ctx.config.tick_rate,
        period_ms = period.as_millis(),
        "tick loop started"
    );

    loop {
        let started = Instant::now();
        let tick = ctx.advance_tick();

        if let Err(e) = run_tick(&ctx, &mut state, tick).await {
            error!(tick, error = %e, "tick failed");
        }

        let work = started.elapsed();
        if work >= period {
            warn!(tick, work_ms = work.as_millis(), "tick overran its period");
            if *shutdown.borrow() {
                break;
            }
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(period - work) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // The loop owns no dirty state itself, but shutdown means no further
    // ticks will push writes; drain what is pending.
    if let Err(e) = ctx.store.flush_dirty().await {
        error!(error = %e, "flush after tick loop shutdown failed");
    }
    info!("tick loop stopped");
}

/// One tick's worth of work.
pub async fn run_tick(
    ctx: &Arc<GameContext>,
    state: &mut TickState,
    tick: u64,
) -> anyhow::Result<()> {
    let now = unix_now();
    let populated = ctx.store.populated_maps().await?;

    // 1. Entity AI on populated maps. Attacks the AI decides on are resolved
    //    in the combat phase below, after all AI writes.
    let mut entity_attacks: Vec<(gridvale_protocol::EntityInstanceId, PlayerId, MapId)> = vec![];
    for map_id in &populated {
        let players = players_on_map(ctx, map_id).await;
        for entity in ctx.store.entities_on_map(map_id) {
            let action = crate::entity::tick_entity(
                &ctx.store,
                &ctx.entities,
                &ctx.maps,
                entity.id,
                &players,
                tick,
                ctx.config.tick_rate,
                &mut state.rng,
            )
            .await?;
            if let crate::entity::AiAction::AttackPlayer(target) = action {
                entity_attacks.push((entity.id, target, map_id.clone()));
            }
        }
    }

    // 2a. Player auto-attacks that have come due.
    run_player_combat(ctx, state, tick).await?;

    // 2b. Entity attacks decided this tick.
    for (entity_id, target, map_id) in entity_attacks {
        run_entity_attack(ctx, state, tick, entity_id, target, &map_id).await?;
    }

    // 3. Ground-item despawn sweep. Every map is swept: despawn clocks are
    //    wall time, so items on unvisited maps still expire.
    for map in ctx.maps.iter() {
        for item in ground::sweep_expired(&ctx.store, &map.id, now) {
            handler::broadcast_ground_item_removed(ctx, &map.id, item.id);
        }
    }

    // 4 & 5. Death-animation progression and entity respawns, again on every
    //    map so long-idle maps do not accumulate a backlog.
    for map in ctx.maps.iter() {
        for entity in ctx.store.entities_on_map(&map.id) {
            match entity.state {
                EntityState::Dying if entity.death_tick.is_some_and(|t| t <= tick) => {
                    ctx.store
                        .update_entity(entity.id, |e| e.state = EntityState::Dead)
                        .await?;
                }
                EntityState::Dead if entity.respawn_at.is_some_and(|at| at <= now) => {
                    ctx.store
                        .update_entity(entity.id, |e| {
                            e.state = EntityState::Idle;
                            e.position = e.spawn_position;
                            e.current_hp = e.max_hp;
                            e.aggro_target = None;
                            e.death_tick = None;
                            e.respawn_at = None;
                            e.last_action_tick = tick;
                        })
                        .await?;
                }
                _ => {}
            }
        }
    }

    // Player respawns past the death delay. Disconnecting during the delay
    // does not cancel it; the state lands in the store either way and a
    // re-login resumes at spawn.
    let due: Vec<PlayerId> = state
        .pending_respawns
        .iter()
        .filter(|(_, at)| *at <= now)
        .map(|(player, _)| *player)
        .collect();
    state.pending_respawns.retain(|(_, at)| *at > now);
    for player in due {
        respawn_player(ctx, player).await?;
    }

    // 6. Visibility diffs, ascending player id.
    emit_visibility_diffs(ctx, now).await;

    Ok(())
}

async fn players_on_map(ctx: &Arc<GameContext>, map_id: &MapId) -> Vec<(PlayerId, TilePos)> {
    let mut players = Vec::new();
    for player in ctx.registry.players_on_map(map_id) {
        if let Ok(pos) = ctx.store.position(player).await {
            players.push((player, pos.pos));
        }
    }
    players.sort_by_key(|(id, _)| *id);
    players
}

/// Resolves due auto-attacks for every player with a combat target.
async fn run_player_combat(
    ctx: &Arc<GameContext>,
    state: &mut TickState,
    tick: u64,
) -> anyhow::Result<()> {
    let rules = ctx.config.combat_rules();

    for (player, _) in ctx.store.online_players() {
        let Some(combat_state) = ctx.store.combat_state(player) else {
            continue;
        };

        let cooldown_ticks = (combat_state.attack_speed_secs * ctx.config.tick_rate).ceil() as u64;
        if tick.saturating_sub(combat_state.last_attack_tick) < cooldown_ticks {
            continue;
        }

        // Re-validate the engagement; targets move, die, and despawn between
        // swings.
        let Ok(position) = ctx.store.position(player).await else {
            continue;
        };
        let target_ok = match combat_state.target {
            CombatTarget::Entity(id) => ctx.store.entity(id).is_some_and(|e| {
                e.map_id == position.map_id
                    && e.state.is_attackable()
                    && position.pos.chebyshev_distance(e.position) <= 1
            }),
            // PVP is gated at the handler; a lingering player target is
            // stale state.
            CombatTarget::Player(_) => false,
        };
        if !target_ok {
            ctx.store.clear_combat_state(player);
            continue;
        }

        let report = match combat::perform_attack(
            &ctx.store,
            &ctx.entities,
            &rules,
            tick,
            Combatant::Player(player),
            combat_state.target.into(),
            &mut state.rng,
        )
        .await
        {
            Ok(report) => report,
            Err(combat::CombatError::TargetAlreadyDead | combat::CombatError::TargetGone) => {
                ctx.store.clear_combat_state(player);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if report.defender_died {
            ctx.store.clear_combat_state(player);
        } else {
            ctx.store.set_combat_state(
                player,
                gridvale_store::state::CombatState {
                    last_attack_tick: tick,
                    ..combat_state
                },
            );
        }

        handler::broadcast_combat_action(ctx, &position.map_id, &report);
    }
    Ok(())
}

async fn run_entity_attack(
    ctx: &Arc<GameContext>,
    state: &mut TickState,
    tick: u64,
    entity_id: gridvale_protocol::EntityInstanceId,
    target: PlayerId,
    map_id: &MapId,
) -> anyhow::Result<()> {
    // The combat phase runs after AI writes; re-check the engagement.
    let Some(entity) = ctx.store.entity(entity_id) else {
        return Ok(());
    };
    if entity.state != EntityState::Attacking {
        return Ok(());
    }
    let Ok(target_pos) = ctx.store.position(target).await else {
        return Ok(());
    };
    if target_pos.map_id != *map_id
        || entity.position.chebyshev_distance(target_pos.pos) > 1
    {
        return Ok(());
    }

    let rules = ctx.config.combat_rules();
    let report = match combat::perform_attack(
        &ctx.store,
        &ctx.entities,
        &rules,
        tick,
        Combatant::Entity(entity_id),
        Combatant::Player(target),
        &mut state.rng,
    )
    .await
    {
        Ok(report) => report,
        Err(combat::CombatError::TargetAlreadyDead | combat::CombatError::TargetGone) => {
            return Ok(())
        }
        Err(e) => return Err(e.into()),
    };

    ctx.store
        .update_entity(entity_id, |e| e.last_attack_tick = tick)
        .await?;

    handler::broadcast_combat_action(ctx, map_id, &report);

    if report.defender_died {
        handle_player_death(ctx, state, target, map_id).await?;
    }
    Ok(())
}

/// The full player death sequence: everything drops where they fell, the map
/// hears about it, and the respawn is booked for after the death delay.
async fn handle_player_death(
    ctx: &Arc<GameContext>,
    state: &mut TickState,
    player: PlayerId,
    map_id: &MapId,
) -> anyhow::Result<()> {
    let position = ctx.store.position(player).await?;
    let username = ctx
        .store
        .username_of(player)
        .unwrap_or_else(|| format!("Player {}", player.0));

    // Drop every carried and worn item at the death tile. The dropper keeps
    // loot protection so they have first claim on recovery.
    let inventory = ctx.store.inventory(player).await?;
    let equipment = ctx.store.equipment(player).await?;

    let mut dropped = Vec::new();
    for stack in inventory.slots.iter().flatten() {
        dropped.push(*stack);
    }
    for (_, stack) in equipment.iter() {
        dropped.push(*stack);
    }

    ctx.store.set_inventory(
        player,
        gridvale_store::state::Inventory::empty(ctx.store.inventory_size()),
    );
    ctx.store
        .set_equipment(player, gridvale_store::state::Equipment::default());

    for stack in dropped {
        if let Some(def) = ctx.store.catalog().get(stack.kind) {
            let item = ground::create_ground_item(
                &ctx.store,
                &ctx.config,
                def,
                stack.quantity,
                stack.durability,
                map_id.clone(),
                position.pos,
                Some(player),
            );
            debug!(player_id = %player, item_id = %item.id, "death drop");
        }
    }

    ctx.store.clear_combat_state(player);
    ctx.store
        .clear_combat_against(CombatTarget::Player(player));

    // Entities lose interest in a corpse.
    for entity in ctx.store.entities_on_map(map_id) {
        if entity.aggro_target == Some(player) {
            ctx.store
                .update_entity(entity.id, |e| {
                    e.aggro_target = None;
                    if matches!(e.state, EntityState::Aggro | EntityState::Attacking) {
                        e.state = EntityState::Idle;
                    }
                })
                .await?;
        }
    }

    let died = EventPlayerDied {
        player_id: player,
        username,
        position: position.pos,
    };
    if let Ok(bytes) = encode_event(&died) {
        ctx.registry.broadcast_to_map(map_id, &bytes.freeze());
    }

    state
        .pending_respawns
        .push((player, unix_now() + ctx.config.death_respawn_delay_secs));
    Ok(())
}

/// Brings a dead player back at the configured spawn with full HP. Max HP is
/// recomputed from the hitpoints level, without the dropped equipment.
async fn respawn_player(ctx: &Arc<GameContext>, player: PlayerId) -> anyhow::Result<()> {
    let sheet = ctx.store.skills(player).await?;
    let max = sheet.level(gridvale_protocol::SkillKind::Hitpoints);
    ctx.store.set_hp(player, PlayerHp { current: max, max });

    ctx.store.set_position(
        player,
        PlayerPosition {
            map_id: ctx.config.spawn_map.clone(),
            pos: ctx.config.spawn_position,
            facing: gridvale_protocol::Direction::Down,
            last_move_at: 0.0,
        },
    );
    ctx.registry
        .move_to_map(player, ctx.config.spawn_map.clone());

    let username = ctx
        .store
        .username_of(player)
        .unwrap_or_else(|| format!("Player {}", player.0));
    info!(player_id = %player, username, "player respawned");

    let event = EventPlayerRespawn {
        player_id: player,
        map_id: ctx.config.spawn_map.clone(),
        position: ctx.config.spawn_position,
        current_hp: max,
        max_hp: max,
    };
    if let Ok(bytes) = encode_event(&event) {
        ctx.registry
            .broadcast_to_map(&ctx.config.spawn_map, &bytes.freeze());
    }
    Ok(())
}

async fn emit_visibility_diffs(ctx: &Arc<GameContext>, now: f64) {
    for (player, _) in ctx.store.online_players() {
        // Never wait on a player lock from the loop; a busy player catches
        // up next tick.
        let Some(_guard) = ctx.locks.try_acquire(player) else {
            continue;
        };

        let Ok(position) = ctx.store.position(player).await else {
            continue;
        };

        let mut visible: FxHashMap<String, StatePayload> = FxHashMap::default();

        // Entities in radius (dying included, dead hidden).
        for entity in ctx.store.entities_on_map(&position.map_id) {
            if !entity.state.is_visible() {
                continue;
            }
            if position.pos.chebyshev_distance(entity.position) > ctx.config.visibility_radius {
                continue;
            }
            let Some(kind) = ctx.entities.get(&entity.kind_name) else {
                continue;
            };
            visible.insert(
                format!("entity:{}", entity.id),
                StatePayload::Entity(EntityPayload {
                    instance_id: entity.id,
                    kind_name: entity.kind_name.clone(),
                    display_name: kind.display_name.to_owned(),
                    position: entity.position,
                    current_hp: entity.current_hp,
                    max_hp: entity.max_hp,
                    state: entity.state,
                    facing: entity.facing,
                    is_attackable: kind.is_attackable && entity.state.is_attackable(),
                }),
            );
        }

        // Other players in radius.
        for other in ctx.registry.players_on_map(&position.map_id) {
            if other == player {
                continue;
            }
            let Ok(other_pos) = ctx.store.position(other).await else {
                continue;
            };
            if position.pos.chebyshev_distance(other_pos.pos) > ctx.config.visibility_radius {
                continue;
            }
            let Ok(hp) = ctx.store.hp(other).await else {
                continue;
            };
            let Ok(appearance) = ctx.store.appearance(other).await else {
                continue;
            };
            let Some(name) = ctx.store.username_of(other) else {
                continue;
            };
            visible.insert(
                format!("player:{other}"),
                StatePayload::Player(PlayerPayload {
                    player_id: other,
                    username: name,
                    position: other_pos.pos,
                    current_hp: hp.current,
                    max_hp: hp.max,
                    facing: other_pos.facing,
                    visual_hash: appearance.visual_hash(),
                }),
            );
        }

        // Ground items the viewer is allowed to see.
        for (item, payload) in ground::visible_ground_items(
            &ctx.store,
            &ctx.config,
            &position.map_id,
            player,
            position.pos,
            now,
        ) {
            visible.insert(
                format!("ground_item:{}", item.id),
                StatePayload::GroundItem(payload),
            );
        }

        let diff = ctx.visibility.update(player, visible);
        if diff.is_empty() {
            continue;
        }

        let mut entities = diff.added;
        entities.extend(diff.updated);
        let update = EventStateUpdate {
            map_id: position.map_id.clone(),
            entities,
            removed: diff.removed,
        };
        if let Ok(bytes) = encode_event(&update) {
            ctx.registry.send_personal(player, bytes.freeze());
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use gridvale_map::{EntitySpawn, GameMap, MapService};
    use gridvale_protocol::codec::FrameDecoder;
    use gridvale_protocol::messages::{EventCombatAction, MessageKind};
    use gridvale_protocol::{MessageFrame, Role};
    use gridvale_store::{DurableStore, GameStore, GameStoreConfig};

    use super::*;
    use crate::auth::TokenKey;
    use crate::registry::Session;
    use crate::ServerConfig;

    fn open_field(width: u32, height: u32) -> GameMap {
        let data: Vec<u32> = vec![1; (width * height) as usize];
        let json = format!(
            r#"{{"width": {width}, "height": {height}, "tilewidth": 32, "tileheight": 32,
                "layers": [{{"type": "tilelayer", "name": "ground", "data": {data:?}}}],
                "tilesets": []}}"#
        );
        GameMap::from_json("field".into(), &json, &[]).unwrap()
    }

    async fn test_ctx() -> Arc<GameContext> {
        let durable = DurableStore::in_memory().await.unwrap();
        let store = GameStore::open(durable, GameStoreConfig::default())
            .await
            .unwrap();
        let mut maps = MapService::new();
        maps.insert(open_field(80, 80));

        let config = ServerConfig {
            spawn_map: "field".into(),
            spawn_position: TilePos::new(40, 40),
            ..ServerConfig::default()
        };
        Arc::new(GameContext::new(
            Arc::new(store),
            Arc::new(maps),
            TokenKey::new(b"test-secret"),
            config,
        ))
    }

    async fn join_player(
        ctx: &Arc<GameContext>,
        username: &str,
        at: TilePos,
    ) -> (PlayerId, flume::Receiver<Bytes>) {
        let record = ctx
            .store
            .durable()
            .create_player(
                username,
                "hash",
                Role::Player,
                &"field".into(),
                at,
                10,
            )
            .await
            .unwrap();
        ctx.store.register_online(record.id, username);

        let (tx, rx) = flume::bounded(64);
        let session = Session::new(record.id, username.to_owned(), record.id.0 as u64, tx);
        ctx.registry.register(session, "field".into());
        (record.id, rx)
    }

    fn spawn_goblin(ctx: &Arc<GameContext>, at: TilePos) -> gridvale_protocol::EntityInstanceId {
        let instance = ctx
            .entities
            .instantiate(
                &"field".into(),
                &EntitySpawn {
                    spawn_point_id: 0,
                    entity_id: "goblin".into(),
                    position: at,
                    wander_radius: None,
                    aggro_override: None,
                    disengage_override: None,
                },
            )
            .unwrap();
        let id = instance.id;
        ctx.store.insert_entity(instance);
        id
    }

    fn drain_frames(rx: &flume::Receiver<Bytes>) -> Vec<MessageFrame> {
        let mut dec = FrameDecoder::new();
        while let Ok(bytes) = rx.try_recv() {
            dec.queue_slice(&bytes);
        }
        let mut frames = vec![];
        while let Ok(Some(frame)) = dec.try_next_frame() {
            frames.push(frame);
        }
        frames
    }

    fn state_updates(frames: &[MessageFrame]) -> Vec<EventStateUpdate> {
        frames
            .iter()
            .filter(|f| f.message_kind() == Some(MessageKind::EventStateUpdate))
            .map(|f| f.decode().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn visibility_diff_tracks_movement_and_departure() {
        let ctx = test_ctx().await;
        let (alice, alice_rx) = join_player(&ctx, "alice", TilePos::new(10, 10)).await;
        let (bob, _bob_rx) = join_player(&ctx, "bob", TilePos::new(12, 10)).await;
        let mut state = TickState::seeded(7);

        run_tick(&ctx, &mut state, 1).await.unwrap();
        let updates = state_updates(&drain_frames(&alice_rx));
        assert_eq!(updates.len(), 1);
        assert!(updates[0].entities.iter().any(|e| e.id == format!("player:{bob}")));
        assert!(updates[0].removed.is_empty());

        // Bob steps one tile: next diff reports him as updated.
        let mut pos = ctx.store.position(bob).await.unwrap();
        pos.pos = TilePos::new(13, 10);
        ctx.store.set_position(bob, pos);
        run_tick(&ctx, &mut state, 2).await.unwrap();
        let updates = state_updates(&drain_frames(&alice_rx));
        assert_eq!(updates.len(), 1);
        let entry = updates[0]
            .entities
            .iter()
            .find(|e| e.id == format!("player:{bob}"))
            .expect("bob updated");
        match &entry.payload {
            StatePayload::Player(p) => assert_eq!(p.position, TilePos::new(13, 10)),
            other => panic!("unexpected payload {other:?}"),
        }

        // Bob leaves visibility range entirely: reported as removed.
        let mut pos = ctx.store.position(bob).await.unwrap();
        pos.pos = TilePos::new(70, 70);
        ctx.store.set_position(bob, pos);
        run_tick(&ctx, &mut state, 3).await.unwrap();
        let updates = state_updates(&drain_frames(&alice_rx));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].removed, vec![format!("player:{bob}")]);

        // Nothing changed: no update at all.
        run_tick(&ctx, &mut state, 4).await.unwrap();
        assert!(state_updates(&drain_frames(&alice_rx)).is_empty());
    }

    #[tokio::test]
    async fn dying_entities_stay_visible_until_dead_then_respawn() {
        let ctx = test_ctx().await;
        let (_alice, alice_rx) = join_player(&ctx, "alice", TilePos::new(10, 10)).await;
        let goblin = spawn_goblin(&ctx, TilePos::new(11, 10));
        let mut state = TickState::seeded(7);

        crate::entity::begin_death(&ctx.store, goblin, 100, 10, 0.05)
            .await
            .unwrap();

        // Before the death tick: dying, still visible, not attackable.
        run_tick(&ctx, &mut state, 105).await.unwrap();
        let updates = state_updates(&drain_frames(&alice_rx));
        let entry = updates
            .iter()
            .flat_map(|u| &u.entities)
            .find(|e| e.id == format!("entity:{goblin}"))
            .expect("dying goblin visible");
        match &entry.payload {
            StatePayload::Entity(e) => {
                assert_eq!(e.state, EntityState::Dying);
                assert!(!e.is_attackable);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        // At the death tick it goes dead and disappears from view.
        run_tick(&ctx, &mut state, 110).await.unwrap();
        assert_eq!(ctx.store.entity(goblin).unwrap().state, EntityState::Dead);
        let updates = state_updates(&drain_frames(&alice_rx));
        assert!(updates
            .iter()
            .any(|u| u.removed.contains(&format!("entity:{goblin}"))));

        // Past the respawn delay it comes back fresh at its spawn point.
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        run_tick(&ctx, &mut state, 111).await.unwrap();
        let e = ctx.store.entity(goblin).unwrap();
        assert_eq!(e.state, EntityState::Idle);
        assert_eq!(e.current_hp, e.max_hp);
        assert_eq!(e.position, e.spawn_position);
    }

    #[tokio::test]
    async fn due_auto_attacks_resolve_on_tick() {
        let ctx = test_ctx().await;
        let (alice, alice_rx) = join_player(&ctx, "alice", TilePos::new(10, 10)).await;
        let goblin = spawn_goblin(&ctx, TilePos::new(11, 10));
        let mut state = TickState::seeded(7);

        ctx.store.set_combat_state(
            alice,
            gridvale_store::state::CombatState {
                target: CombatTarget::Entity(goblin),
                last_attack_tick: 0,
                attack_speed_secs: 3.0,
            },
        );

        // Cooldown is ceil(3.0 * 20) = 60 ticks; tick 30 is too early.
        run_tick(&ctx, &mut state, 30).await.unwrap();
        assert_eq!(
            ctx.store.combat_state(alice).unwrap().last_attack_tick,
            0,
            "attack fired early"
        );

        run_tick(&ctx, &mut state, 60).await.unwrap();
        let combat_state = ctx.store.combat_state(alice);
        let frames = drain_frames(&alice_rx);
        let combat_events: Vec<EventCombatAction> = frames
            .iter()
            .filter(|f| f.message_kind() == Some(MessageKind::EventCombatAction))
            .map(|f| f.decode().unwrap())
            .collect();
        assert_eq!(combat_events.len(), 1);

        if combat_events[0].defender_died {
            assert!(combat_state.is_none());
        } else {
            assert_eq!(combat_state.unwrap().last_attack_tick, 60);
        }
    }

    #[tokio::test]
    async fn stale_combat_targets_are_dropped() {
        let ctx = test_ctx().await;
        let (alice, _rx) = join_player(&ctx, "alice", TilePos::new(10, 10)).await;
        let goblin = spawn_goblin(&ctx, TilePos::new(30, 30)); // far away
        let mut state = TickState::seeded(7);

        ctx.store.set_combat_state(
            alice,
            gridvale_store::state::CombatState {
                target: CombatTarget::Entity(goblin),
                last_attack_tick: 0,
                attack_speed_secs: 3.0,
            },
        );

        run_tick(&ctx, &mut state, 100).await.unwrap();
        assert!(ctx.store.combat_state(alice).is_none());
    }
}
