//! Command dispatch and handlers.
//!
//! Every handler runs under the issuing player's mutex, validates its payload
//! and preconditions, mutates hot state (atomically where several keys are
//! involved), replies on the issuing session correlated by the client id, and
//! optionally broadcasts to the map. A handler failure never tears down the
//! session; a top-level guard converts unexpected errors into
//! `SYS_INTERNAL_ERROR` with the detail kept in the log.

use std::sync::Arc;

use gridvale_protocol::codec::encode_event;
use gridvale_protocol::messages::{
    AdminAction, ChatChannel, ChunkLayerPayload, ChunkPayload, CmdAdmin, CmdAttack,
    CmdChatMessage, CmdInventoryMove, CmdInventorySort, CmdItemDrop, CmdItemEquip, CmdItemPickup,
    CmdItemUnequip, CmdMove, CmdToggleAutoRetaliate, CmdUpdateAppearance, CombatTarget,
    EventChatMessage, EventCombatAction, EventGroundItemAdded, EventGroundItemRemoved,
    GroundItemPayload, QueryMapChunks, RespData, RespError, RespSuccess, ResponseData, SkillEntry,
};
use gridvale_protocol::codec::MessageFrame;
use gridvale_protocol::{Direction, ErrorCode, MapId, MessageKind, PlayerId, SkillKind};
use gridvale_store::state::{unix_now, CombatState, PlayerHp, PlayerPosition};
use gridvale_store::{CacheKey, CacheValue, StoreError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info, warn};

use crate::combat::{self, Combatant, CombatError};
use crate::ground;
use crate::items::{self, ItemOpError};
use crate::locks::LockTimeout;
use crate::registry::Session;
use crate::skill;
use crate::GameContext;

/// A handler's failure reply.
#[derive(Debug)]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Vec<(String, String)>,
    pub suggested_action: Option<String>,
    pub cooldown_remaining_ms: Option<u32>,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: vec![],
            suggested_action: None,
            cooldown_remaining_ms: None,
        }
    }

    fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.push((key.to_owned(), value.to_string()));
        self
    }

    fn suggest(mut self, action: &str) -> Self {
        self.suggested_action = Some(action.to_owned());
        self
    }

    fn cooldown(mut self, remaining_ms: u32) -> Self {
        self.cooldown_remaining_ms = Some(remaining_ms);
        self
    }

    fn internal() -> Self {
        Self::new(ErrorCode::SysInternalError, "Something went wrong")
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "store failure inside handler");
        Self::internal()
    }
}

impl From<LockTimeout> for CommandError {
    fn from(e: LockTimeout) -> Self {
        error!(error = %e, "player lock timed out");
        Self::internal()
    }
}

impl From<gridvale_map::MapError> for CommandError {
    fn from(e: gridvale_map::MapError) -> Self {
        error!(error = %e, "map failure inside handler");
        Self::internal()
    }
}

impl From<CombatError> for CommandError {
    fn from(e: CombatError) -> Self {
        match e {
            CombatError::AttackerGone | CombatError::TargetGone => Self::new(
                ErrorCode::CombatTargetInvalid,
                "Target cannot be attacked",
            ),
            CombatError::TargetAlreadyDead => {
                Self::new(ErrorCode::CombatTargetInvalid, "Target is already dead")
            }
            CombatError::Store(e) => e.into(),
        }
    }
}

impl From<ItemOpError> for CommandError {
    fn from(e: ItemOpError) -> Self {
        let message = e.to_string();
        let code = match e {
            ItemOpError::InvalidSlot(_) => ErrorCode::InvInvalidSlot,
            ItemOpError::SlotEmpty(_) => ErrorCode::InvSlotEmpty,
            ItemOpError::EquipmentSlotEmpty => ErrorCode::EqInvalidSlot,
            ItemOpError::UnknownKind(_) => ErrorCode::InvInvalidSlot,
            ItemOpError::NotEquipable => ErrorCode::EqItemNotEquipable,
            ItemOpError::LevelTooLow { .. } => ErrorCode::EqLevelTooLow,
            ItemOpError::InventoryFull => ErrorCode::InvInventoryFull,
            ItemOpError::InsufficientQuantity => ErrorCode::InvInsufficientQuantity,
        };
        Self::new(code, message)
    }
}

/// A handler's success reply.
pub enum Reply {
    Success(String),
    Data(ResponseData),
}

type HandlerResult = Result<Reply, CommandError>;

/// Sends the reply (or error) for one command frame on the issuing session.
fn respond(session: &Session, correlation: i32, result: HandlerResult) {
    let bytes = match result {
        Ok(Reply::Success(message)) => {
            let mut enc = gridvale_protocol::FrameEncoder::new();
            enc.append_message(correlation, &RespSuccess { message })
                .map(|()| enc.take())
        }
        Ok(Reply::Data(data)) => {
            let mut enc = gridvale_protocol::FrameEncoder::new();
            enc.append_message(correlation, &RespData { data })
                .map(|()| enc.take())
        }
        Err(err) => {
            let mut enc = gridvale_protocol::FrameEncoder::new();
            enc.append_message(
                correlation,
                &RespError {
                    code: err.code,
                    category: err.code.category(),
                    message: err.message,
                    details: err.details,
                    suggested_action: err.suggested_action,
                    cooldown_remaining_ms: err.cooldown_remaining_ms,
                },
            )
            .map(|()| enc.take())
        }
    };

    match bytes {
        Ok(bytes) => {
            session.try_send(bytes.freeze());
        }
        Err(e) => warn!(error = %e, "failed to encode reply"),
    }
}

/// Dispatches one decoded frame from an authenticated session.
pub async fn dispatch(ctx: &Arc<GameContext>, session: &Session, frame: MessageFrame) {
    let player = session.player_id;

    let Some(kind) = frame.message_kind() else {
        respond(
            session,
            frame.correlation,
            Err(CommandError::new(
                ErrorCode::MsgUnknownType,
                format!("unknown message kind {}", frame.kind),
            )),
        );
        return;
    };

    if !kind.is_client_kind() || kind == MessageKind::CmdAuthenticate {
        respond(
            session,
            frame.correlation,
            Err(CommandError::new(
                ErrorCode::MsgMalformed,
                "unexpected message kind on an established session",
            )),
        );
        return;
    }

    // Per-player serialization: a player's commands apply in send order.
    let _guard = match ctx.locks.acquire(player).await {
        Ok(guard) => guard,
        Err(e) => {
            respond(session, frame.correlation, Err(e.into()));
            return;
        }
    };

    let result = run_handler(ctx, session, kind, &frame).await;
    respond(session, frame.correlation, result);
}

/// Decodes the payload and runs the matching handler. Decode failures are
/// validation errors; anything a handler did not classify is a system error.
async fn run_handler(
    ctx: &Arc<GameContext>,
    session: &Session,
    kind: MessageKind,
    frame: &MessageFrame,
) -> HandlerResult {
    macro_rules! decode {
        ($ty:ty) => {
            match frame.decode::<$ty>() {
                Ok(msg) => msg,
                Err(e) => {
                    return Err(CommandError::new(
                        ErrorCode::MsgMalformed,
                        format!("malformed payload: {e}"),
                    ))
                }
            }
        };
    }

    let player = session.player_id;
    match kind {
        MessageKind::CmdMove => handle_move(ctx, player, decode!(CmdMove)).await,
        MessageKind::CmdAttack => handle_attack(ctx, session, decode!(CmdAttack)).await,
        MessageKind::CmdToggleAutoRetaliate => {
            let msg = decode!(CmdToggleAutoRetaliate);
            ctx.store.set_auto_retaliate(player, msg.enabled);
            Ok(Reply::Success(format!(
                "Auto-retaliate {}",
                if msg.enabled { "enabled" } else { "disabled" }
            )))
        }
        MessageKind::CmdInventoryMove => {
            handle_inventory_move(ctx, player, decode!(CmdInventoryMove)).await
        }
        MessageKind::CmdInventorySort => {
            handle_inventory_sort(ctx, player, decode!(CmdInventorySort)).await
        }
        MessageKind::CmdItemEquip => handle_equip(ctx, player, decode!(CmdItemEquip)).await,
        MessageKind::CmdItemUnequip => handle_unequip(ctx, player, decode!(CmdItemUnequip)).await,
        MessageKind::CmdItemDrop => handle_drop(ctx, session, decode!(CmdItemDrop)).await,
        MessageKind::CmdItemPickup => handle_pickup(ctx, session, decode!(CmdItemPickup)).await,
        MessageKind::CmdChatMessage => handle_chat(ctx, session, decode!(CmdChatMessage)).await,
        MessageKind::CmdUpdateAppearance => {
            handle_appearance(ctx, player, decode!(CmdUpdateAppearance)).await
        }
        MessageKind::CmdAdmin => handle_admin(ctx, session, decode!(CmdAdmin)).await,
        MessageKind::QueryInventory => {
            let inv = ctx.store.inventory(player).await?;
            Ok(Reply::Data(ResponseData::Inventory { slots: inv.slots }))
        }
        MessageKind::QueryEquipment => {
            let eq = ctx.store.equipment(player).await?;
            Ok(Reply::Data(ResponseData::Equipment {
                slots: eq.iter().map(|(slot, stack)| (slot, *stack)).collect(),
            }))
        }
        MessageKind::QueryStats => handle_query_stats(ctx, player).await,
        MessageKind::QueryMapChunks => {
            handle_query_chunks(ctx, player, decode!(QueryMapChunks)).await
        }
        MessageKind::CmdAuthenticate
        | MessageKind::RespSuccess
        | MessageKind::RespData
        | MessageKind::RespError
        | MessageKind::EventWelcome
        | MessageKind::EventStateUpdate
        | MessageKind::EventPlayerJoined
        | MessageKind::EventPlayerLeft
        | MessageKind::EventChatMessage
        | MessageKind::EventCombatAction
        | MessageKind::EventGroundItemAdded
        | MessageKind::EventGroundItemRemoved
        | MessageKind::EventPlayerDied
        | MessageKind::EventPlayerRespawn => unreachable!("filtered by dispatch"),
    }
}

// ---------------------------------------------------------------------------
// Movement

async fn handle_move(ctx: &Arc<GameContext>, player: PlayerId, msg: CmdMove) -> HandlerResult {
    if !ctx.store.is_online(player) {
        return Err(CommandError::new(
            ErrorCode::SysInternalError,
            "Player not properly initialized - please reconnect",
        ));
    }

    let position = ctx.store.position(player).await?;
    let now = unix_now();

    let cooldown = ctx.config.move_cooldown.as_secs_f64();
    let elapsed = now - position.last_move_at;
    if elapsed < cooldown {
        let remaining_ms = ((cooldown - elapsed) * 1000.0).ceil() as u32;
        return Err(CommandError::new(
            ErrorCode::MoveRateLimited,
            "Movement cooldown active",
        )
        .cooldown(remaining_ms)
        .suggest("Wait before moving again"));
    }

    let dest = ctx
        .maps
        .validate_step(&position.map_id, position.pos, msg.direction)?;
    let Some(dest) = dest else {
        return Err(
            CommandError::new(ErrorCode::MoveCollisionDetected, "Movement blocked by obstacle")
                .detail("current_position", position.pos),
        );
    };

    let old = position.pos;
    ctx.store.set_position(
        player,
        PlayerPosition {
            map_id: position.map_id,
            pos: dest,
            facing: msg.direction,
            last_move_at: now,
        },
    );

    // No per-move broadcast: the next tick's visibility diff carries it.
    Ok(Reply::Data(ResponseData::Moved {
        old_position: old,
        new_position: dest,
    }))
}

// ---------------------------------------------------------------------------
// Combat

async fn handle_attack(
    ctx: &Arc<GameContext>,
    session: &Session,
    msg: CmdAttack,
) -> HandlerResult {
    let player = session.player_id;

    if !ctx
        .rate_limiter
        .check(player, "attack", ctx.config.attack_cooldown)
    {
        return Err(CommandError::new(
            ErrorCode::CombatRateLimited,
            "You are attacking too fast",
        ));
    }

    let hp = ctx.store.hp(player).await?;
    if hp.current == 0 {
        return Err(CommandError::new(
            ErrorCode::CombatAttackerDead,
            "You cannot attack while dead",
        ));
    }

    let entity_id = match msg.target {
        CombatTarget::Player(_) => {
            // The resolver handles player defenders; the boundary does not.
            return Err(CommandError::new(
                ErrorCode::CombatTargetInvalid,
                "Attacking other players is not enabled",
            ));
        }
        CombatTarget::Entity(id) => id,
    };

    let position = ctx.store.position(player).await?;
    let Some(entity) = ctx.store.entity(entity_id) else {
        return Err(CommandError::new(
            ErrorCode::CombatTargetInvalid,
            "Target cannot be attacked",
        ));
    };

    let kind_attackable = ctx
        .entities
        .get(&entity.kind_name)
        .is_some_and(|k| k.is_attackable);
    if !kind_attackable {
        return Err(CommandError::new(
            ErrorCode::CombatTargetInvalid,
            "Target cannot be attacked",
        ));
    }
    if !entity.state.is_attackable() {
        return Err(CommandError::new(
            ErrorCode::CombatTargetInvalid,
            "Target is already dead",
        ));
    }
    if entity.map_id != position.map_id {
        return Err(CommandError::new(
            ErrorCode::CombatTargetInvalid,
            "Target cannot be attacked",
        ));
    }
    if position.pos.chebyshev_distance(entity.position) > 1 {
        return Err(CommandError::new(
            ErrorCode::CombatOutOfRange,
            "Target is too far away",
        ));
    }

    let current_tick = ctx.current_tick();
    let rules = ctx.config.combat_rules();
    // Thread-local RNGs cannot cross an await point; take a seeded one.
    let mut rng = StdRng::from_entropy();
    let report = combat::perform_attack(
        &ctx.store,
        &ctx.entities,
        &rules,
        current_tick,
        Combatant::Player(player),
        Combatant::Entity(entity_id),
        &mut rng,
    )
    .await?;

    if !report.defender_died {
        // Keep auto-attacking until something breaks the engagement.
        let speed = combat::player_attack_speed(&ctx.store, player, &rules).await?;
        ctx.store.set_combat_state(
            player,
            CombatState {
                target: CombatTarget::Entity(entity_id),
                last_attack_tick: current_tick,
                attack_speed_secs: speed,
            },
        );
    } else {
        ctx.store.clear_combat_state(player);
    }

    broadcast_combat_action(ctx, &position.map_id, &report);
    Ok(Reply::Success(report.message))
}

pub(crate) fn broadcast_combat_action(
    ctx: &GameContext,
    map_id: &MapId,
    report: &combat::AttackReport,
) {
    let event = EventCombatAction {
        attacker: report.attacker.clone(),
        defender: report.defender.clone(),
        hit: report.hit,
        damage: report.damage,
        defender_hp: report.defender_hp,
        defender_died: report.defender_died,
        message: report.message.clone(),
    };
    if let Ok(bytes) = encode_event(&event) {
        ctx.registry.broadcast_to_map(map_id, &bytes.freeze());
    }
}

// ---------------------------------------------------------------------------
// Inventory

async fn handle_inventory_move(
    ctx: &Arc<GameContext>,
    player: PlayerId,
    msg: CmdInventoryMove,
) -> HandlerResult {
    // Warm the cache so the transaction snapshot has the inventory.
    let fallback = ctx.store.inventory(player).await?;
    let key = CacheKey::Inventory(player);

    let slots = ctx
        .store
        .transact(&[key.clone()], |snap| {
            let mut inv = match snap.get(&key) {
                Some(value) => value.clone().into_inventory()?,
                None => fallback.clone(),
            };
            match items::move_slot(
                &mut inv,
                ctx.store.catalog(),
                msg.from_slot as usize,
                msg.to_slot as usize,
            ) {
                Ok(_) => {}
                Err(e) => return Ok((vec![], Err(e))),
            }
            Ok((
                vec![(key.clone(), Some(CacheValue::Inventory(inv.clone())))],
                Ok(inv.slots),
            ))
        })
        .await?
        .map_err(CommandError::from)?;

    ctx.store
        .mark_player_dirty(player, false, false, true, false, false);
    Ok(Reply::Data(ResponseData::Inventory { slots }))
}

async fn handle_inventory_sort(
    ctx: &Arc<GameContext>,
    player: PlayerId,
    msg: CmdInventorySort,
) -> HandlerResult {
    let fallback = ctx.store.inventory(player).await?;
    let key = CacheKey::Inventory(player);

    let summary = ctx
        .store
        .transact(&[key.clone()], |snap| {
            let mut inv = match snap.get(&key) {
                Some(value) => value.clone().into_inventory()?,
                None => fallback.clone(),
            };
            let summary = items::sort(&mut inv, ctx.store.catalog(), msg.sort_by);
            Ok((
                vec![(key.clone(), Some(CacheValue::Inventory(inv)))],
                summary,
            ))
        })
        .await?;

    ctx.store
        .mark_player_dirty(player, false, false, true, false, false);
    Ok(Reply::Data(ResponseData::SortSummary {
        items_moved: summary.items_moved,
        stacks_merged: summary.stacks_merged,
    }))
}

// ---------------------------------------------------------------------------
// Equipment

async fn handle_equip(
    ctx: &Arc<GameContext>,
    player: PlayerId,
    msg: CmdItemEquip,
) -> HandlerResult {
    let inv_fallback = ctx.store.inventory(player).await?;
    let eq_fallback = ctx.store.equipment(player).await?;
    let sheet = ctx.store.skills(player).await?;
    let inv_key = CacheKey::Inventory(player);
    let eq_key = CacheKey::Equipment(player);

    let result = ctx
        .store
        .transact(&[inv_key.clone(), eq_key.clone()], |snap| {
            let mut inv = match snap.get(&inv_key) {
                Some(value) => value.clone().into_inventory()?,
                None => inv_fallback.clone(),
            };
            let mut eq = match snap.get(&eq_key) {
                Some(value) => value.clone().into_equipment()?,
                None => eq_fallback.clone(),
            };

            match items::equip(
                &mut inv,
                &mut eq,
                &sheet,
                ctx.store.catalog(),
                msg.inventory_slot as usize,
            ) {
                Ok(slot) => Ok((
                    vec![
                        (inv_key.clone(), Some(CacheValue::Inventory(inv))),
                        (eq_key.clone(), Some(CacheValue::Equipment(eq))),
                    ],
                    Ok(slot),
                )),
                Err(e) => Ok((vec![], Err(e))),
            }
        })
        .await?;

    let slot = result.map_err(CommandError::from)?;
    ctx.store
        .mark_player_dirty(player, false, false, true, true, false);
    Ok(Reply::Success(format!("Equipped to {}", slot.name())))
}

async fn handle_unequip(
    ctx: &Arc<GameContext>,
    player: PlayerId,
    msg: CmdItemUnequip,
) -> HandlerResult {
    let inv_fallback = ctx.store.inventory(player).await?;
    let eq_fallback = ctx.store.equipment(player).await?;
    let inv_key = CacheKey::Inventory(player);
    let eq_key = CacheKey::Equipment(player);

    let result = ctx
        .store
        .transact(&[inv_key.clone(), eq_key.clone()], |snap| {
            let mut inv = match snap.get(&inv_key) {
                Some(value) => value.clone().into_inventory()?,
                None => inv_fallback.clone(),
            };
            let mut eq = match snap.get(&eq_key) {
                Some(value) => value.clone().into_equipment()?,
                None => eq_fallback.clone(),
            };

            match items::unequip(&mut inv, &mut eq, ctx.store.catalog(), msg.equipment_slot) {
                Ok(()) => Ok((
                    vec![
                        (inv_key.clone(), Some(CacheValue::Inventory(inv))),
                        (eq_key.clone(), Some(CacheValue::Equipment(eq))),
                    ],
                    Ok(()),
                )),
                Err(e) => Ok((vec![], Err(e))),
            }
        })
        .await?;

    result.map_err(|e| match e {
        ItemOpError::InventoryFull => CommandError::new(
            ErrorCode::EqCannotUnequipFullInv,
            "No inventory space to unequip",
        ),
        other => CommandError::from(other),
    })?;
    ctx.store
        .mark_player_dirty(player, false, false, true, true, false);
    Ok(Reply::Success(format!(
        "Unequipped {}",
        msg.equipment_slot.name()
    )))
}

// ---------------------------------------------------------------------------
// Ground items

async fn handle_drop(ctx: &Arc<GameContext>, session: &Session, msg: CmdItemDrop) -> HandlerResult {
    let player = session.player_id;
    let position = ctx.store.position(player).await?;
    let fallback = ctx.store.inventory(player).await?;
    let key = CacheKey::Inventory(player);

    let taken = ctx
        .store
        .transact(&[key.clone()], |snap| {
            let mut inv = match snap.get(&key) {
                Some(value) => value.clone().into_inventory()?,
                None => fallback.clone(),
            };
            match items::remove_quantity(&mut inv, msg.inventory_slot as usize, msg.quantity) {
                Ok(taken) => Ok((
                    vec![(key.clone(), Some(CacheValue::Inventory(inv)))],
                    Ok(taken),
                )),
                Err(e) => Ok((vec![], Err(e))),
            }
        })
        .await?
        .map_err(CommandError::from)?;
    ctx.store
        .mark_player_dirty(player, false, false, true, false, false);

    let def = ctx
        .store
        .catalog()
        .get(taken.kind)
        .ok_or_else(CommandError::internal)?
        .clone();
    let item = ground::create_ground_item(
        &ctx.store,
        &ctx.config,
        &def,
        taken.quantity,
        taken.durability,
        position.map_id.clone(),
        position.pos,
        Some(player),
    );

    // Dropping breaks combat.
    ctx.store.clear_combat_state(player);

    broadcast_ground_item_added(ctx, &position.map_id, player, &item);
    Ok(Reply::Data(ResponseData::Dropped {
        ground_item_id: item.id,
    }))
}

fn ground_item_payload(
    item: &gridvale_store::state::GroundItem,
    viewer: PlayerId,
    now: f64,
) -> GroundItemPayload {
    GroundItemPayload {
        id: item.id,
        kind: item.kind,
        display_name: item.display_name.clone(),
        rarity: item.rarity,
        position: item.position,
        quantity: item.quantity,
        is_yours: item.dropped_by == Some(viewer),
        is_protected: item.is_protected(now),
    }
}

fn broadcast_ground_item_added(
    ctx: &GameContext,
    map_id: &MapId,
    dropper: PlayerId,
    item: &gridvale_store::state::GroundItem,
) {
    let now = unix_now();

    // The dropper gets the owner view; everyone else the bystander view.
    let to_dropper = EventGroundItemAdded {
        map_id: map_id.clone(),
        item: ground_item_payload(item, dropper, now),
    };
    if let Ok(bytes) = encode_event(&to_dropper) {
        ctx.registry.send_personal(dropper, bytes.freeze());
    }

    let to_rest = EventGroundItemAdded {
        map_id: map_id.clone(),
        item: ground_item_payload(item, PlayerId(-1), now),
    };
    if let Ok(bytes) = encode_event(&to_rest) {
        ctx.registry
            .broadcast_to_map_except(map_id, dropper, &bytes.freeze());
    }
}

pub(crate) fn broadcast_ground_item_removed(
    ctx: &GameContext,
    map_id: &MapId,
    id: gridvale_protocol::GroundItemId,
) {
    let event = EventGroundItemRemoved {
        map_id: map_id.clone(),
        ground_item_id: id,
    };
    if let Ok(bytes) = encode_event(&event) {
        ctx.registry.broadcast_to_map(map_id, &bytes.freeze());
    }
}

async fn handle_pickup(
    ctx: &Arc<GameContext>,
    session: &Session,
    msg: CmdItemPickup,
) -> HandlerResult {
    let player = session.player_id;
    let position = ctx.store.position(player).await?;
    let now = unix_now();

    let not_found = || {
        CommandError::new(ErrorCode::GroundItemNotFound, "Item not found")
            .detail("ground_item_id", msg.ground_item_id)
    };

    let Some(item) = ctx.store.ground_item(msg.ground_item_id) else {
        return Err(not_found());
    };
    // Protected items belonging to someone else are invisible, so the reply
    // does not admit they exist. A different map means the same.
    if item.map_id != position.map_id || !item.visible_to(player, now) {
        return Err(not_found());
    }
    if position.pos.chebyshev_distance(item.position) > ctx.config.pickup_range {
        return Err(CommandError::new(
            ErrorCode::GroundItemOutOfRange,
            "You are too far away to pick that up",
        ));
    }

    // Claim the item first; losing the race is a normal "gone" case.
    let Some(item) = ctx.store.remove_ground_item(msg.ground_item_id) else {
        return Err(not_found());
    };

    let fallback = ctx.store.inventory(player).await?;
    let key = CacheKey::Inventory(player);
    let added = ctx
        .store
        .transact(&[key.clone()], |snap| {
            let mut inv = match snap.get(&key) {
                Some(value) => value.clone().into_inventory()?,
                None => fallback.clone(),
            };
            match items::add_stack(
                &mut inv,
                ctx.store.catalog(),
                item.kind,
                item.quantity,
                item.durability,
            ) {
                Ok(()) => Ok((
                    vec![(key.clone(), Some(CacheValue::Inventory(inv)))],
                    Ok(()),
                )),
                Err(e) => Ok((vec![], Err(e))),
            }
        })
        .await?;

    if let Err(e) = added {
        // No room: put the item back where it was.
        ctx.store.add_ground_item(item);
        return Err(CommandError::from(e));
    }
    ctx.store
        .mark_player_dirty(player, false, false, true, false, false);

    // Pickup breaks combat.
    ctx.store.clear_combat_state(player);

    broadcast_ground_item_removed(ctx, &position.map_id, item.id);
    Ok(Reply::Success(format!(
        "Picked up {}x {}",
        item.quantity, item.display_name
    )))
}

// ---------------------------------------------------------------------------
// Chat

async fn handle_chat(
    ctx: &Arc<GameContext>,
    session: &Session,
    msg: CmdChatMessage,
) -> HandlerResult {
    let player = session.player_id;

    if msg.body.is_empty() {
        return Err(CommandError::new(
            ErrorCode::MsgMalformed,
            "Empty chat message",
        ));
    }
    if msg.body.chars().count() > ctx.config.chat_max_len {
        return Err(CommandError::new(
            ErrorCode::ChatMessageTooLong,
            format!("Messages are capped at {} characters", ctx.config.chat_max_len),
        ));
    }

    match msg.channel {
        ChatChannel::System => Err(CommandError::new(
            ErrorCode::ChatInvalidChannel,
            "The system channel is server-only",
        )),
        ChatChannel::Say => {
            let position = ctx.store.position(player).await?;
            let event = EventChatMessage {
                channel: ChatChannel::Say,
                sender: Some(session.username.clone()),
                body: msg.body,
                position: Some(position.pos),
            };
            let bytes = encode_event(&event)
                .map_err(|_| CommandError::internal())?
                .freeze();

            // Radius-limited: only players near the speaker hear it.
            let mut recipients = Vec::new();
            for other in ctx.registry.players_on_map(&position.map_id) {
                if other == player {
                    recipients.push(other);
                    continue;
                }
                if let Ok(other_pos) = ctx.store.position(other).await {
                    if position.pos.chebyshev_distance(other_pos.pos) <= ctx.config.say_radius {
                        recipients.push(other);
                    }
                }
            }
            ctx.registry.broadcast_to_players(&recipients, &bytes);
            Ok(Reply::Success(String::new()))
        }
        ChatChannel::Global => {
            let event = EventChatMessage {
                channel: ChatChannel::Global,
                sender: Some(session.username.clone()),
                body: msg.body,
                position: None,
            };
            let bytes = encode_event(&event)
                .map_err(|_| CommandError::internal())?
                .freeze();
            ctx.registry.broadcast_all(&bytes);
            Ok(Reply::Success(String::new()))
        }
        ChatChannel::Whisper => {
            let Some(recipient_name) = msg.recipient else {
                return Err(CommandError::new(
                    ErrorCode::MsgMalformed,
                    "Whisper requires a recipient",
                ));
            };
            let recipient = ctx
                .store
                .online_players()
                .into_iter()
                .find(|(_, name)| *name == recipient_name)
                .map(|(id, _)| id);
            let Some(recipient) = recipient else {
                return Err(CommandError::new(
                    ErrorCode::ChatRecipientOffline,
                    format!("{recipient_name} is not online"),
                ));
            };

            let event = EventChatMessage {
                channel: ChatChannel::Whisper,
                sender: Some(session.username.clone()),
                body: msg.body,
                position: None,
            };
            let bytes = encode_event(&event)
                .map_err(|_| CommandError::internal())?
                .freeze();
            ctx.registry
                .broadcast_to_players(&[recipient, player], &bytes);
            Ok(Reply::Success(String::new()))
        }
    }
}

// ---------------------------------------------------------------------------
// Queries

async fn handle_query_stats(ctx: &Arc<GameContext>, player: PlayerId) -> HandlerResult {
    let sheet = ctx.store.skills(player).await?;
    let hp = ctx.store.hp(player).await?;

    let skills = SkillKind::ALL
        .into_iter()
        .map(|kind| {
            let progress = sheet.get(kind);
            let multiplier = ctx.config.xp_multiplier(kind);
            SkillEntry {
                kind,
                level: progress.level,
                xp: progress.xp,
                xp_to_next_level: skill::xp_to_next_level(progress.xp, multiplier),
                progress_percent: skill::progress_to_next_level(progress.xp, multiplier),
            }
        })
        .collect();

    Ok(Reply::Data(ResponseData::Stats {
        skills,
        current_hp: hp.current,
        max_hp: hp.max,
    }))
}

async fn handle_query_chunks(
    ctx: &Arc<GameContext>,
    player: PlayerId,
    msg: QueryMapChunks,
) -> HandlerResult {
    if msg.radius > ctx.config.max_chunk_radius {
        return Err(CommandError::new(
            ErrorCode::MapChunkRadiusTooLarge,
            format!("Chunk radius is capped at {}", ctx.config.max_chunk_radius),
        ));
    }

    let position = ctx.store.position(player).await?;
    if position.pos.chebyshev_distance(msg.center) > ctx.config.max_chunk_query_distance {
        return Err(CommandError::new(
            ErrorCode::MapInvalidCoords,
            "Query center is too far from your position",
        ));
    }

    let map = ctx.maps.require(&position.map_id)?;
    let chunks = map
        .chunks_around(msg.center, msg.radius, ctx.config.chunk_size)
        .into_iter()
        .map(|chunk| ChunkPayload {
            chunk_x: chunk.chunk_x,
            chunk_y: chunk.chunk_y,
            size: chunk.size,
            layers: chunk
                .layers
                .into_iter()
                .map(|layer| ChunkLayerPayload {
                    name: layer.name,
                    is_collision: layer.is_collision,
                    gids: layer.gids,
                })
                .collect(),
            walkable: chunk.walkable,
        })
        .collect();

    Ok(Reply::Data(ResponseData::MapChunks {
        map_id: position.map_id,
        chunks,
    }))
}

// ---------------------------------------------------------------------------
// Appearance

async fn handle_appearance(
    ctx: &Arc<GameContext>,
    player: PlayerId,
    msg: CmdUpdateAppearance,
) -> HandlerResult {
    const MAX_FIELDS: usize = 16;
    const MAX_VALUE_LEN: usize = 64;

    if msg.fields.len() > MAX_FIELDS {
        return Err(CommandError::new(
            ErrorCode::MsgMalformed,
            "Too many appearance fields",
        ));
    }

    let mut appearance = ctx.store.appearance(player).await?;
    for (field, value) in msg.fields {
        if field.is_empty() || field.len() > MAX_VALUE_LEN || value.len() > MAX_VALUE_LEN {
            return Err(CommandError::new(
                ErrorCode::MsgMalformed,
                "Invalid appearance field",
            ));
        }
        appearance.fields.insert(field, value);
    }
    ctx.store.set_appearance(player, appearance).await?;

    // The bumped visual hash reaches other players via the next tick's diff.
    Ok(Reply::Success("Appearance updated".to_owned()))
}

// ---------------------------------------------------------------------------
// Admin

async fn handle_admin(ctx: &Arc<GameContext>, session: &Session, msg: CmdAdmin) -> HandlerResult {
    let player = session.player_id;
    let record = ctx.store.player_record(player).await?;

    let forbidden = || CommandError::new(ErrorCode::AdminForbidden, "You cannot do that");

    // Moderators get the people tools; everything else is admin-only.
    let allowed = match &msg.action {
        AdminAction::Kick { .. } | AdminAction::Timeout { .. } => record.role.is_privileged(),
        _ => record.role == gridvale_protocol::Role::Admin,
    };
    if !allowed {
        return Err(forbidden());
    }

    info!(
        admin = session.username,
        role = record.role.name(),
        action = ?msg.action,
        "admin command"
    );

    match msg.action {
        AdminAction::Teleport {
            target,
            map_id,
            position,
        } => {
            let target_record = require_target(ctx, &target).await?;
            ctx.maps.require(&map_id)?;
            let facing = Direction::Down;
            ctx.store.set_position(
                target_record.id,
                PlayerPosition {
                    map_id: map_id.clone(),
                    pos: position,
                    facing,
                    last_move_at: 0.0,
                },
            );
            ctx.registry.move_to_map(target_record.id, map_id);
            ctx.store.clear_combat_state(target_record.id);
            Ok(Reply::Success(format!("Teleported {target}")))
        }
        AdminAction::Kick { target } => {
            let target_record = require_target(ctx, &target).await?;
            if let Some(victim) = ctx.registry.session_of(target_record.id) {
                victim.close();
                Ok(Reply::Success(format!("Kicked {target}")))
            } else {
                Err(CommandError::new(
                    ErrorCode::ChatRecipientOffline,
                    format!("{target} is not online"),
                ))
            }
        }
        AdminAction::SetBanned { target, banned } => {
            let target_record = require_target(ctx, &target).await?;
            ctx.store.durable().set_player_banned(target_record.id, banned).await
                .map_err(CommandError::from)?;
            if banned {
                if let Some(victim) = ctx.registry.session_of(target_record.id) {
                    victim.close();
                }
            }
            Ok(Reply::Success(format!(
                "{} {target}",
                if banned { "Banned" } else { "Unbanned" }
            )))
        }
        AdminAction::Timeout {
            target,
            until_unix_secs,
        } => {
            let target_record = require_target(ctx, &target).await?;
            ctx.store
                .durable()
                .set_player_timeout(target_record.id, Some(until_unix_secs as f64))
                .await
                .map_err(CommandError::from)?;
            if let Some(victim) = ctx.registry.session_of(target_record.id) {
                victim.close();
            }
            Ok(Reply::Success(format!("Timed out {target}")))
        }
        AdminAction::Heal { target } => {
            let target_record = require_target(ctx, &target).await?;
            let hp = ctx.store.hp(target_record.id).await?;
            ctx.store.set_hp(
                target_record.id,
                PlayerHp {
                    current: hp.max,
                    max: hp.max,
                },
            );
            Ok(Reply::Success(format!("Healed {target}")))
        }
        AdminAction::GrantItem {
            target,
            kind,
            quantity,
        } => {
            if quantity == 0 {
                return Err(CommandError::new(
                    ErrorCode::InvInsufficientQuantity,
                    "Quantity must be positive",
                ));
            }
            let target_record = require_target(ctx, &target).await?;
            let def = ctx
                .store
                .catalog()
                .get(kind)
                .ok_or_else(|| CommandError::new(ErrorCode::InvInvalidSlot, "Unknown item kind"))?
                .clone();

            let fallback = ctx.store.inventory(target_record.id).await?;
            let key = CacheKey::Inventory(target_record.id);
            let catalog = ctx.store.catalog();
            let durability = def.max_durability;
            let result = ctx
                .store
                .transact(&[key.clone()], |snap| {
                    let mut inv = match snap.get(&key) {
                        Some(value) => value.clone().into_inventory()?,
                        None => fallback.clone(),
                    };
                    match items::add_stack(&mut inv, catalog, kind, quantity, durability) {
                        Ok(()) => Ok((
                            vec![(key.clone(), Some(CacheValue::Inventory(inv)))],
                            Ok(()),
                        )),
                        Err(e) => Ok((vec![], Err(e))),
                    }
                })
                .await?;
            result.map_err(CommandError::from)?;
            ctx.store
                .mark_player_dirty(target_record.id, false, false, true, false, false);
            Ok(Reply::Success(format!(
                "Granted {quantity}x {} to {target}",
                def.display_name
            )))
        }
    }
}

async fn require_target(
    ctx: &Arc<GameContext>,
    username: &str,
) -> Result<gridvale_store::PlayerRecord, CommandError> {
    ctx.store
        .player_record_by_username(username)
        .await?
        .ok_or_else(|| {
            CommandError::new(
                ErrorCode::ChatRecipientOffline,
                format!("No such player: {username}"),
            )
        })
}
