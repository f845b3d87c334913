//! Message schemas for every command, response, and event.
//!
//! Commands originate from clients and carry a nonzero correlation id;
//! responses echo that id; events are uncorrelated server pushes. Payload
//! structs are defined through [`messages!`] which derives the field-ordered
//! [`Encode`]/[`Decode`] implementations and the [`Message`] kind binding.

use std::io::Write;

use anyhow::bail;

use crate::error::{ErrorCategory, ErrorCode};
use crate::types::{
    Direction, EntityInstanceId, EntityState, EquipmentSlot, GroundItemId, ItemKindId, ItemStack,
    MapId, PlayerId, Rarity, SkillKind, TilePos,
};
use crate::var_int::VarInt;
use crate::{Decode, Encode, Message};

/// Numeric kind tags. Commands and queries occupy 1..=29, responses 30..=39,
/// events 50 and up. Tags are wire-stable; append, never renumber.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(i32)]
pub enum MessageKind {
    CmdAuthenticate = 1,
    CmdMove = 2,
    CmdAttack = 3,
    CmdToggleAutoRetaliate = 4,
    CmdInventoryMove = 5,
    CmdInventorySort = 6,
    CmdItemEquip = 7,
    CmdItemUnequip = 8,
    CmdItemDrop = 9,
    CmdItemPickup = 10,
    CmdChatMessage = 11,
    CmdUpdateAppearance = 12,
    CmdAdmin = 13,
    QueryInventory = 20,
    QueryEquipment = 21,
    QueryStats = 22,
    QueryMapChunks = 23,
    RespSuccess = 30,
    RespData = 31,
    RespError = 32,
    EventWelcome = 50,
    EventStateUpdate = 51,
    EventPlayerJoined = 52,
    EventPlayerLeft = 53,
    EventChatMessage = 54,
    EventCombatAction = 55,
    EventGroundItemAdded = 56,
    EventGroundItemRemoved = 57,
    EventPlayerDied = 58,
    EventPlayerRespawn = 59,
}

impl MessageKind {
    pub fn from_i32(n: i32) -> Option<Self> {
        Some(match n {
            1 => Self::CmdAuthenticate,
            2 => Self::CmdMove,
            3 => Self::CmdAttack,
            4 => Self::CmdToggleAutoRetaliate,
            5 => Self::CmdInventoryMove,
            6 => Self::CmdInventorySort,
            7 => Self::CmdItemEquip,
            8 => Self::CmdItemUnequip,
            9 => Self::CmdItemDrop,
            10 => Self::CmdItemPickup,
            11 => Self::CmdChatMessage,
            12 => Self::CmdUpdateAppearance,
            13 => Self::CmdAdmin,
            20 => Self::QueryInventory,
            21 => Self::QueryEquipment,
            22 => Self::QueryStats,
            23 => Self::QueryMapChunks,
            30 => Self::RespSuccess,
            31 => Self::RespData,
            32 => Self::RespError,
            50 => Self::EventWelcome,
            51 => Self::EventStateUpdate,
            52 => Self::EventPlayerJoined,
            53 => Self::EventPlayerLeft,
            54 => Self::EventChatMessage,
            55 => Self::EventCombatAction,
            56 => Self::EventGroundItemAdded,
            57 => Self::EventGroundItemRemoved,
            58 => Self::EventPlayerDied,
            59 => Self::EventPlayerRespawn,
            _ => return None,
        })
    }

    /// True for kinds a client is allowed to send.
    pub const fn is_client_kind(self) -> bool {
        (self as i32) < 30
    }
}

macro_rules! messages {
    (
        $(
            $(#[$meta:meta])*
            $kind:ident : $name:ident {
                $( $(#[$fmeta:meta])* pub $field:ident : $fty:ty, )*
            }
        )*
    ) => {
        $(
            $(#[$meta])*
            #[derive(Clone, PartialEq, Debug)]
            pub struct $name {
                $( $(#[$fmeta])* pub $field: $fty, )*
            }

            impl Encode for $name {
                #[allow(unused_mut, unused_variables)]
                fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
                    $( self.$field.encode(&mut w)?; )*
                    Ok(())
                }
            }

            impl Decode<'_> for $name {
                #[allow(unused_variables)]
                fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
                    Ok(Self {
                        $( $field: Decode::decode(r)?, )*
                    })
                }
            }

            impl Message for $name {
                const KIND: MessageKind = MessageKind::$kind;
                const NAME: &'static str = stringify!($name);
            }
        )*
    };
}

macro_rules! tagged_enum_codec {
    ($ty:ident { $($tag:literal => $variant:ident),* $(,)? }) => {
        impl Encode for $ty {
            fn encode(&self, w: impl Write) -> anyhow::Result<()> {
                VarInt(match self {
                    $($ty::$variant => $tag,)*
                })
                .encode(w)
            }
        }

        impl Decode<'_> for $ty {
            fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
                Ok(match VarInt::decode(r)?.0 {
                    $($tag => $ty::$variant,)*
                    n => bail!(concat!("invalid ", stringify!($ty), " tag {}"), n),
                })
            }
        }
    };
}

/// What an attack is aimed at.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CombatTarget {
    Player(PlayerId),
    Entity(EntityInstanceId),
}

impl CombatTarget {
    pub const fn kind_name(self) -> &'static str {
        match self {
            CombatTarget::Player(_) => "player",
            CombatTarget::Entity(_) => "entity",
        }
    }
}

impl Encode for CombatTarget {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        match self {
            CombatTarget::Player(id) => {
                VarInt(0).encode(&mut w)?;
                id.encode(w)
            }
            CombatTarget::Entity(id) => {
                VarInt(1).encode(&mut w)?;
                id.encode(w)
            }
        }
    }
}

impl Decode<'_> for CombatTarget {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(match VarInt::decode(r)?.0 {
            0 => CombatTarget::Player(PlayerId::decode(r)?),
            1 => CombatTarget::Entity(EntityInstanceId::decode(r)?),
            n => bail!("invalid combat target tag {n}"),
        })
    }
}

/// Chat delivery scopes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ChatChannel {
    /// Map-scoped, radius-limited.
    Say,
    /// Every online player.
    Global,
    /// One recipient by username.
    Whisper,
    /// Server-originated notices. Clients may not send on this channel.
    System,
}

tagged_enum_codec!(ChatChannel {
    0 => Say,
    1 => Global,
    2 => Whisper,
    3 => System,
});

/// Inventory sort orderings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SortKey {
    Name,
    Value,
    Quantity,
    Rarity,
}

tagged_enum_codec!(SortKey {
    0 => Name,
    1 => Value,
    2 => Quantity,
    3 => Rarity,
});

/// Role-gated administrative actions. Targets are usernames so operators can
/// act on offline players.
#[derive(Clone, PartialEq, Debug)]
pub enum AdminAction {
    Teleport {
        target: String,
        map_id: MapId,
        position: TilePos,
    },
    Kick {
        target: String,
    },
    SetBanned {
        target: String,
        banned: bool,
    },
    Timeout {
        target: String,
        until_unix_secs: u64,
    },
    Heal {
        target: String,
    },
    GrantItem {
        target: String,
        kind: ItemKindId,
        quantity: u32,
    },
}

impl Encode for AdminAction {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        match self {
            AdminAction::Teleport {
                target,
                map_id,
                position,
            } => {
                VarInt(0).encode(&mut w)?;
                target.encode(&mut w)?;
                map_id.encode(&mut w)?;
                position.encode(w)
            }
            AdminAction::Kick { target } => {
                VarInt(1).encode(&mut w)?;
                target.encode(w)
            }
            AdminAction::SetBanned { target, banned } => {
                VarInt(2).encode(&mut w)?;
                target.encode(&mut w)?;
                banned.encode(w)
            }
            AdminAction::Timeout {
                target,
                until_unix_secs,
            } => {
                VarInt(3).encode(&mut w)?;
                target.encode(&mut w)?;
                until_unix_secs.encode(w)
            }
            AdminAction::Heal { target } => {
                VarInt(4).encode(&mut w)?;
                target.encode(w)
            }
            AdminAction::GrantItem {
                target,
                kind,
                quantity,
            } => {
                VarInt(5).encode(&mut w)?;
                target.encode(&mut w)?;
                kind.encode(&mut w)?;
                quantity.encode(w)
            }
        }
    }
}

impl Decode<'_> for AdminAction {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(match VarInt::decode(r)?.0 {
            0 => AdminAction::Teleport {
                target: String::decode(r)?,
                map_id: MapId::decode(r)?,
                position: TilePos::decode(r)?,
            },
            1 => AdminAction::Kick {
                target: String::decode(r)?,
            },
            2 => AdminAction::SetBanned {
                target: String::decode(r)?,
                banned: bool::decode(r)?,
            },
            3 => AdminAction::Timeout {
                target: String::decode(r)?,
                until_unix_secs: u64::decode(r)?,
            },
            4 => AdminAction::Heal {
                target: String::decode(r)?,
            },
            5 => AdminAction::GrantItem {
                target: String::decode(r)?,
                kind: ItemKindId::decode(r)?,
                quantity: u32::decode(r)?,
            },
            n => bail!("invalid admin action tag {n}"),
        })
    }
}

/// Cosmetic state of a player: appearance fields plus a hash that bumps on
/// every change so clients know when to re-resolve sprites.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct VisualState {
    pub fields: Vec<(String, String)>,
    pub visual_hash: u64,
}

impl Encode for VisualState {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.fields.encode(&mut w)?;
        self.visual_hash.encode(w)
    }
}

impl Decode<'_> for VisualState {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            fields: Vec::decode(r)?,
            visual_hash: u64::decode(r)?,
        })
    }
}

/// One visible thing in a state update. The `id` is the stable string key the
/// visibility engine diffs on (`"player:<id>"`, `"entity:<id>"`,
/// `"ground_item:<id>"`).
#[derive(Clone, PartialEq, Debug)]
pub struct StateEntry {
    pub id: String,
    pub payload: StatePayload,
}

impl Encode for StateEntry {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.id.encode(&mut w)?;
        self.payload.encode(w)
    }
}

impl Decode<'_> for StateEntry {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            id: String::decode(r)?,
            payload: StatePayload::decode(r)?,
        })
    }
}

/// Per-kind payloads inside [`StateEntry`].
#[derive(Clone, PartialEq, Debug)]
pub enum StatePayload {
    Player(PlayerPayload),
    Entity(EntityPayload),
    GroundItem(GroundItemPayload),
}

impl Encode for StatePayload {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        match self {
            StatePayload::Player(p) => {
                VarInt(0).encode(&mut w)?;
                p.encode(w)
            }
            StatePayload::Entity(p) => {
                VarInt(1).encode(&mut w)?;
                p.encode(w)
            }
            StatePayload::GroundItem(p) => {
                VarInt(2).encode(&mut w)?;
                p.encode(w)
            }
        }
    }
}

impl Decode<'_> for StatePayload {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(match VarInt::decode(r)?.0 {
            0 => StatePayload::Player(PlayerPayload::decode(r)?),
            1 => StatePayload::Entity(EntityPayload::decode(r)?),
            2 => StatePayload::GroundItem(GroundItemPayload::decode(r)?),
            n => bail!("invalid state payload tag {n}"),
        })
    }
}

macro_rules! payload_struct {
    (
        $(#[$meta:meta])*
        $name:ident { $( pub $field:ident : $fty:ty, )* }
    ) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Debug)]
        pub struct $name {
            $( pub $field: $fty, )*
        }

        impl Encode for $name {
            #[allow(unused_mut, unused_variables)]
            fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
                $( self.$field.encode(&mut w)?; )*
                Ok(())
            }
        }

        impl Decode<'_> for $name {
            #[allow(unused_variables)]
            fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
                Ok(Self {
                    $( $field: Decode::decode(r)?, )*
                })
            }
        }
    };
}

payload_struct! {
    /// Another player as seen by a viewer.
    PlayerPayload {
        pub player_id: PlayerId,
        pub username: String,
        pub position: TilePos,
        pub current_hp: u32,
        pub max_hp: u32,
        pub facing: Direction,
        pub visual_hash: u64,
    }
}

payload_struct! {
    /// An NPC or monster instance as seen by a viewer.
    EntityPayload {
        pub instance_id: EntityInstanceId,
        pub kind_name: String,
        pub display_name: String,
        pub position: TilePos,
        pub current_hp: u32,
        pub max_hp: u32,
        pub state: EntityState,
        pub facing: Direction,
        pub is_attackable: bool,
    }
}

payload_struct! {
    /// A ground item as seen by a viewer. `is_yours`/`is_protected` are
    /// viewer-relative.
    GroundItemPayload {
        pub id: GroundItemId,
        pub kind: ItemKindId,
        pub display_name: String,
        pub rarity: Rarity,
        pub position: TilePos,
        pub quantity: u32,
        pub is_yours: bool,
        pub is_protected: bool,
    }
}

payload_struct! {
    /// One skill row in a stats response.
    SkillEntry {
        pub kind: SkillKind,
        pub level: u32,
        pub xp: u64,
        pub xp_to_next_level: u64,
        pub progress_percent: f32,
    }
}

payload_struct! {
    /// One tile layer inside a chunk payload. `gids` is row-major,
    /// `size * size` entries, zero meaning no tile.
    ChunkLayerPayload {
        pub name: String,
        pub is_collision: bool,
        pub gids: Vec<u32>,
    }
}

payload_struct! {
    /// One `size`×`size` chunk of map tiles. `walkable` is row-major over the
    /// same grid.
    ChunkPayload {
        pub chunk_x: i32,
        pub chunk_y: i32,
        pub size: u32,
        pub layers: Vec<ChunkLayerPayload>,
        pub walkable: Vec<bool>,
    }
}

payload_struct! {
    /// Client-relevant knobs delivered at welcome time.
    ClientConfig {
        pub move_cooldown_ms: u32,
        pub animation_duration_ms: u32,
        pub protocol_version: i32,
    }
}

/// Typed payloads carried by `RESP_DATA`.
#[derive(Clone, PartialEq, Debug)]
pub enum ResponseData {
    Moved {
        old_position: TilePos,
        new_position: TilePos,
    },
    Inventory {
        slots: Vec<Option<ItemStack>>,
    },
    Equipment {
        slots: Vec<(EquipmentSlot, ItemStack)>,
    },
    Stats {
        skills: Vec<SkillEntry>,
        current_hp: u32,
        max_hp: u32,
    },
    MapChunks {
        map_id: MapId,
        chunks: Vec<ChunkPayload>,
    },
    SortSummary {
        items_moved: u32,
        stacks_merged: u32,
    },
    Dropped {
        ground_item_id: GroundItemId,
    },
}

impl Encode for ResponseData {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        match self {
            ResponseData::Moved {
                old_position,
                new_position,
            } => {
                VarInt(0).encode(&mut w)?;
                old_position.encode(&mut w)?;
                new_position.encode(w)
            }
            ResponseData::Inventory { slots } => {
                VarInt(1).encode(&mut w)?;
                slots.encode(w)
            }
            ResponseData::Equipment { slots } => {
                VarInt(2).encode(&mut w)?;
                slots.encode(w)
            }
            ResponseData::Stats {
                skills,
                current_hp,
                max_hp,
            } => {
                VarInt(3).encode(&mut w)?;
                skills.encode(&mut w)?;
                current_hp.encode(&mut w)?;
                max_hp.encode(w)
            }
            ResponseData::MapChunks { map_id, chunks } => {
                VarInt(4).encode(&mut w)?;
                map_id.encode(&mut w)?;
                chunks.encode(w)
            }
            ResponseData::SortSummary {
                items_moved,
                stacks_merged,
            } => {
                VarInt(5).encode(&mut w)?;
                items_moved.encode(&mut w)?;
                stacks_merged.encode(w)
            }
            ResponseData::Dropped { ground_item_id } => {
                VarInt(6).encode(&mut w)?;
                ground_item_id.encode(w)
            }
        }
    }
}

impl Decode<'_> for ResponseData {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(match VarInt::decode(r)?.0 {
            0 => ResponseData::Moved {
                old_position: TilePos::decode(r)?,
                new_position: TilePos::decode(r)?,
            },
            1 => ResponseData::Inventory {
                slots: Vec::decode(r)?,
            },
            2 => ResponseData::Equipment {
                slots: Vec::decode(r)?,
            },
            3 => ResponseData::Stats {
                skills: Vec::decode(r)?,
                current_hp: u32::decode(r)?,
                max_hp: u32::decode(r)?,
            },
            4 => ResponseData::MapChunks {
                map_id: MapId::decode(r)?,
                chunks: Vec::decode(r)?,
            },
            5 => ResponseData::SortSummary {
                items_moved: u32::decode(r)?,
                stacks_merged: u32::decode(r)?,
            },
            6 => ResponseData::Dropped {
                ground_item_id: GroundItemId::decode(r)?,
            },
            n => bail!("invalid response data tag {n}"),
        })
    }
}

/// Either end of a combat exchange, for broadcast display.
#[derive(Clone, PartialEq, Debug)]
pub enum CombatantRef {
    Player { id: PlayerId, name: String },
    Entity { id: EntityInstanceId, name: String },
}

impl Encode for CombatantRef {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        match self {
            CombatantRef::Player { id, name } => {
                VarInt(0).encode(&mut w)?;
                id.encode(&mut w)?;
                name.encode(w)
            }
            CombatantRef::Entity { id, name } => {
                VarInt(1).encode(&mut w)?;
                id.encode(&mut w)?;
                name.encode(w)
            }
        }
    }
}

impl Decode<'_> for CombatantRef {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(match VarInt::decode(r)?.0 {
            0 => CombatantRef::Player {
                id: PlayerId::decode(r)?,
                name: String::decode(r)?,
            },
            1 => CombatantRef::Entity {
                id: EntityInstanceId::decode(r)?,
                name: String::decode(r)?,
            },
            n => bail!("invalid combatant tag {n}"),
        })
    }
}

messages! {
    /// First and only pre-registration message on a fresh connection.
    CmdAuthenticate: CmdAuthenticate {
        pub token: String,
    }

    /// Step one tile in a direction.
    CmdMove: CmdMove {
        pub direction: Direction,
    }

    /// Open combat against (or continue attacking) a target.
    CmdAttack: CmdAttack {
        pub target: CombatTarget,
    }

    CmdToggleAutoRetaliate: CmdToggleAutoRetaliate {
        pub enabled: bool,
    }

    /// Move, merge, or swap between two inventory slots.
    CmdInventoryMove: CmdInventoryMove {
        pub from_slot: u16,
        pub to_slot: u16,
    }

    CmdInventorySort: CmdInventorySort {
        pub sort_by: SortKey,
    }

    CmdItemEquip: CmdItemEquip {
        pub inventory_slot: u16,
    }

    CmdItemUnequip: CmdItemUnequip {
        pub equipment_slot: EquipmentSlot,
    }

    CmdItemDrop: CmdItemDrop {
        pub inventory_slot: u16,
        pub quantity: u32,
    }

    CmdItemPickup: CmdItemPickup {
        pub ground_item_id: GroundItemId,
    }

    /// `recipient` is required for whispers and ignored elsewhere.
    CmdChatMessage: CmdChatMessage {
        pub channel: ChatChannel,
        pub body: String,
        pub recipient: Option<String>,
    }

    CmdUpdateAppearance: CmdUpdateAppearance {
        pub fields: Vec<(String, String)>,
    }

    CmdAdmin: CmdAdmin {
        pub action: AdminAction,
    }

    QueryInventory: QueryInventory {}

    QueryEquipment: QueryEquipment {}

    QueryStats: QueryStats {}

    /// Chunk query around a center the server validates against the player's
    /// own position.
    QueryMapChunks: QueryMapChunks {
        pub center: TilePos,
        pub radius: u32,
    }

    RespSuccess: RespSuccess {
        pub message: String,
    }

    RespData: RespData {
        pub data: ResponseData,
    }

    RespError: RespError {
        pub code: ErrorCode,
        pub category: ErrorCategory,
        pub message: String,
        pub details: Vec<(String, String)>,
        pub suggested_action: Option<String>,
        pub cooldown_remaining_ms: Option<u32>,
    }

    /// Sent once after successful registration.
    EventWelcome: EventWelcome {
        pub player_id: PlayerId,
        pub username: String,
        pub map_id: MapId,
        pub position: TilePos,
        pub current_hp: u32,
        pub max_hp: u32,
        pub visual: VisualState,
        pub motd: String,
        pub config: ClientConfig,
    }

    /// Per-tick visibility diff. `entities` holds added and updated entries;
    /// `removed` holds the stable ids that left view.
    EventStateUpdate: EventStateUpdate {
        pub map_id: MapId,
        pub entities: Vec<StateEntry>,
        pub removed: Vec<String>,
    }

    EventPlayerJoined: EventPlayerJoined {
        pub player_id: PlayerId,
        pub username: String,
        pub position: TilePos,
    }

    EventPlayerLeft: EventPlayerLeft {
        pub player_id: PlayerId,
        pub username: String,
    }

    /// `position` is present on `say` messages so clients can cull by range.
    EventChatMessage: EventChatMessage {
        pub channel: ChatChannel,
        pub sender: Option<String>,
        pub body: String,
        pub position: Option<TilePos>,
    }

    EventCombatAction: EventCombatAction {
        pub attacker: CombatantRef,
        pub defender: CombatantRef,
        pub hit: bool,
        pub damage: u32,
        pub defender_hp: u32,
        pub defender_died: bool,
        pub message: String,
    }

    EventGroundItemAdded: EventGroundItemAdded {
        pub map_id: MapId,
        pub item: GroundItemPayload,
    }

    EventGroundItemRemoved: EventGroundItemRemoved {
        pub map_id: MapId,
        pub ground_item_id: GroundItemId,
    }

    EventPlayerDied: EventPlayerDied {
        pub player_id: PlayerId,
        pub username: String,
        pub position: TilePos,
    }

    EventPlayerRespawn: EventPlayerRespawn {
        pub player_id: PlayerId,
        pub map_id: MapId,
        pub position: TilePos,
        pub current_hp: u32,
        pub max_hp: u32,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn round_trip<M>(msg: M)
    where
        M: Message + Encode + for<'a> Decode<'a> + PartialEq + Clone,
    {
        let mut buf = vec![];
        msg.encode(&mut buf).unwrap();
        let mut slice = buf.as_slice();
        let decoded = M::decode(&mut slice).unwrap();
        assert!(slice.is_empty(), "{} left bytes behind", M::NAME);
        assert_eq!(msg, decoded);
    }

    #[test]
    fn command_round_trips() {
        round_trip(CmdAuthenticate {
            token: "abc.def".into(),
        });
        round_trip(CmdAttack {
            target: CombatTarget::Entity(EntityInstanceId(42)),
        });
        round_trip(CmdInventoryMove {
            from_slot: 0,
            to_slot: 27,
        });
        round_trip(CmdChatMessage {
            channel: ChatChannel::Whisper,
            body: "psst".into(),
            recipient: Some("bob".into()),
        });
        round_trip(CmdAdmin {
            action: AdminAction::Teleport {
                target: "alice".into(),
                map_id: "meadowbrook".into(),
                position: TilePos::new(4, 9),
            },
        });
    }

    #[test]
    fn state_update_round_trip() {
        round_trip(EventStateUpdate {
            map_id: "meadowbrook".into(),
            entities: vec![
                StateEntry {
                    id: "entity:3".into(),
                    payload: StatePayload::Entity(EntityPayload {
                        instance_id: EntityInstanceId(3),
                        kind_name: "goblin".into(),
                        display_name: "Goblin".into(),
                        position: TilePos::new(12, 8),
                        current_hp: 5,
                        max_hp: 10,
                        state: EntityState::Aggro,
                        facing: Direction::Left,
                        is_attackable: true,
                    }),
                },
                StateEntry {
                    id: "ground_item:9".into(),
                    payload: StatePayload::GroundItem(GroundItemPayload {
                        id: GroundItemId(9),
                        kind: ItemKindId(2),
                        display_name: "Bronze Sword".into(),
                        rarity: Rarity::Common,
                        position: TilePos::new(11, 8),
                        quantity: 1,
                        is_yours: true,
                        is_protected: true,
                    }),
                },
            ],
            removed: vec!["player:7".into()],
        });
    }

    #[test]
    fn error_response_round_trip() {
        round_trip(RespError {
            code: ErrorCode::MoveRateLimited,
            category: ErrorCategory::RateLimit,
            message: "Movement cooldown active".into(),
            details: vec![("direction".into(), "up".into())],
            suggested_action: Some("Wait before moving again".into()),
            cooldown_remaining_ms: Some(50),
        });
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(MessageKind::CmdAuthenticate as i32, 1);
        assert_eq!(MessageKind::RespError as i32, 32);
        assert_eq!(MessageKind::EventStateUpdate as i32, 51);
        assert_eq!(MessageKind::from_i32(51), Some(MessageKind::EventStateUpdate));
        assert_eq!(MessageKind::from_i32(999), None);
        assert!(MessageKind::CmdMove.is_client_kind());
        assert!(!MessageKind::EventWelcome.is_client_kind());
    }
}
