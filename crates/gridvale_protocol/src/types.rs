//! Core identifier and world types shared by every subsystem.
//!
//! Ids are plain integers used as weak references: the owning manager resolves
//! them, and a failed resolution is a normal "gone" case rather than an error.

use std::fmt;
use std::io::Write;

use anyhow::bail;
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};

use crate::var_int::VarInt;
use crate::{Decode, Encode};

/// Durable identity of a player.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, From, Into, Serialize, Deserialize,
)]
pub struct PlayerId(pub i64);

/// Identity of a live entity instance. Instance ids are unique for the
/// lifetime of the process; a respawned entity keeps its id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, From, Into)]
pub struct EntityInstanceId(pub i64);

/// Identity of an item lying on the ground.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, From, Into)]
pub struct GroundItemId(pub i64);

/// Key into the item-kind reference catalog.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, From, Into)]
pub struct ItemKindId(pub i32);

macro_rules! encode_id {
    ($ty:ty, $repr:ty) => {
        impl Encode for $ty {
            fn encode(&self, w: impl Write) -> anyhow::Result<()> {
                <$repr>::from(self.0).encode(w)
            }
        }

        impl Decode<'_> for $ty {
            fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
                Ok(Self(<$repr>::decode(r)?.into()))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

encode_id!(PlayerId, i64);
encode_id!(EntityInstanceId, i64);
encode_id!(GroundItemId, i64);
encode_id!(ItemKindId, i32);

/// Identifier of a static map. Matches the file stem of the map document it
/// was loaded from.
#[derive(Clone, PartialEq, Eq, Hash, Debug, From, Into, Serialize, Deserialize)]
pub struct MapId(pub String);

impl MapId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MapId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for MapId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Encode for MapId {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.0.encode(w)
    }
}

impl Decode<'_> for MapId {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self(String::decode(r)?))
    }
}

/// A position on the tile grid of a map.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct TilePos {
    pub x: i32,
    pub y: i32,
}

impl TilePos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// `max(|Δx|, |Δy|)`, the range metric on a square grid.
    pub fn chebyshev_distance(self, other: Self) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dy = self.y.abs_diff(other.y);
        dx.max(dy)
    }

    /// The adjacent tile in `dir`. Not bounds-checked; the map service decides
    /// whether the result exists.
    pub fn step(self, dir: Direction) -> Self {
        let (dx, dy) = dir.delta();
        Self::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for TilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl Encode for TilePos {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.x.encode(&mut w)?;
        self.y.encode(w)
    }
}

impl Decode<'_> for TilePos {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            x: i32::decode(r)?,
            y: i32::decode(r)?,
        })
    }
}

/// One of the four grid-movement directions. Also used as the facing of
/// players and entities.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

impl Encode for Direction {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        VarInt(*self as i32).encode(w)
    }
}

impl Decode<'_> for Direction {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(match VarInt::decode(r)?.0 {
            0 => Direction::Up,
            1 => Direction::Down,
            2 => Direction::Left,
            3 => Direction::Right,
            n => bail!("invalid direction tag {n}"),
        })
    }
}

/// Where an item can be worn.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentSlot {
    Head,
    Body,
    Legs,
    Weapon,
    Shield,
    Ammo,
}

impl EquipmentSlot {
    pub const ALL: [EquipmentSlot; 6] = [
        EquipmentSlot::Head,
        EquipmentSlot::Body,
        EquipmentSlot::Legs,
        EquipmentSlot::Weapon,
        EquipmentSlot::Shield,
        EquipmentSlot::Ammo,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            EquipmentSlot::Head => "head",
            EquipmentSlot::Body => "body",
            EquipmentSlot::Legs => "legs",
            EquipmentSlot::Weapon => "weapon",
            EquipmentSlot::Shield => "shield",
            EquipmentSlot::Ammo => "ammo",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

impl Encode for EquipmentSlot {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        VarInt(*self as i32).encode(w)
    }
}

impl Decode<'_> for EquipmentSlot {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let n = VarInt::decode(r)?.0;
        Self::ALL
            .get(n as usize)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("invalid equipment slot tag {n}"))
    }
}

/// Trainable skills. Combat skills feed the combat resolver; the rest exist
/// for world interactions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillKind {
    Attack,
    Strength,
    Defence,
    Hitpoints,
    Ranged,
    Magic,
    Mining,
    Fishing,
    Woodcutting,
    Cooking,
    Crafting,
}

impl SkillKind {
    pub const ALL: [SkillKind; 11] = [
        SkillKind::Attack,
        SkillKind::Strength,
        SkillKind::Defence,
        SkillKind::Hitpoints,
        SkillKind::Ranged,
        SkillKind::Magic,
        SkillKind::Mining,
        SkillKind::Fishing,
        SkillKind::Woodcutting,
        SkillKind::Cooking,
        SkillKind::Crafting,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            SkillKind::Attack => "attack",
            SkillKind::Strength => "strength",
            SkillKind::Defence => "defence",
            SkillKind::Hitpoints => "hitpoints",
            SkillKind::Ranged => "ranged",
            SkillKind::Magic => "magic",
            SkillKind::Mining => "mining",
            SkillKind::Fishing => "fishing",
            SkillKind::Woodcutting => "woodcutting",
            SkillKind::Cooking => "cooking",
            SkillKind::Crafting => "crafting",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    /// Starting level for a fresh character.
    pub const fn starting_level(self) -> u32 {
        match self {
            SkillKind::Hitpoints => 10,
            _ => 1,
        }
    }
}

impl Encode for SkillKind {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        VarInt(*self as i32).encode(w)
    }
}

impl Decode<'_> for SkillKind {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let n = VarInt::decode(r)?.0;
        Self::ALL
            .get(n as usize)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("invalid skill tag {n}"))
    }
}

/// Item rarity. Drives ground-item loot-protection and despawn clocks and is
/// surfaced to clients for display.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Epic,
}

impl Rarity {
    pub const ALL: [Rarity; 4] = [Rarity::Common, Rarity::Uncommon, Rarity::Rare, Rarity::Epic];

    pub const fn name(self) -> &'static str {
        match self {
            Rarity::Common => "common",
            Rarity::Uncommon => "uncommon",
            Rarity::Rare => "rare",
            Rarity::Epic => "epic",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }
}

impl Encode for Rarity {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        VarInt(*self as i32).encode(w)
    }
}

impl Decode<'_> for Rarity {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let n = VarInt::decode(r)?.0;
        Self::ALL
            .get(n as usize)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("invalid rarity tag {n}"))
    }
}

/// Privilege level of a durable player record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Player,
    Moderator,
    Admin,
}

impl Role {
    pub const fn name(self) -> &'static str {
        match self {
            Role::Player => "player",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "player" => Some(Role::Player),
            "moderator" => Some(Role::Moderator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    /// Moderators and admins bypass the player cap and may issue admin
    /// commands.
    pub const fn is_privileged(self) -> bool {
        matches!(self, Role::Moderator | Role::Admin)
    }
}

/// Lifecycle state of an entity instance as seen by clients.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    Idle,
    Wandering,
    Aggro,
    Attacking,
    Dying,
    Dead,
}

impl EntityState {
    pub const ALL: [EntityState; 6] = [
        EntityState::Idle,
        EntityState::Wandering,
        EntityState::Aggro,
        EntityState::Attacking,
        EntityState::Dying,
        EntityState::Dead,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            EntityState::Idle => "idle",
            EntityState::Wandering => "wandering",
            EntityState::Aggro => "aggro",
            EntityState::Attacking => "attacking",
            EntityState::Dying => "dying",
            EntityState::Dead => "dead",
        }
    }

    /// A dying entity is still rendered; a dead one is hidden until respawn.
    pub const fn is_visible(self) -> bool {
        !matches!(self, EntityState::Dead)
    }

    /// Attacks only land on live entities.
    pub const fn is_attackable(self) -> bool {
        !matches!(self, EntityState::Dying | EntityState::Dead)
    }
}

impl Encode for EntityState {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        VarInt(*self as i32).encode(w)
    }
}

impl Decode<'_> for EntityState {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let n = VarInt::decode(r)?.0;
        Self::ALL
            .get(n as usize)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("invalid entity state tag {n}"))
    }
}

/// A stack of items occupying one inventory or equipment slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ItemStack {
    pub kind: ItemKindId,
    pub quantity: u32,
    /// Remaining durability. Only meaningful for equipable kinds with a
    /// nonzero maximum durability.
    pub durability: Option<u32>,
}

impl ItemStack {
    pub const fn new(kind: ItemKindId, quantity: u32, durability: Option<u32>) -> Self {
        Self {
            kind,
            quantity,
            durability,
        }
    }
}

impl Encode for ItemStack {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.kind.encode(&mut w)?;
        VarInt(self.quantity as i32).encode(&mut w)?;
        self.durability.map(|d| d as i32).map(VarInt).encode(w)
    }
}

impl Decode<'_> for ItemStack {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let kind = ItemKindId::decode(r)?;
        let quantity = VarInt::decode(r)?.0;
        anyhow::ensure!(quantity > 0, "item stack quantity must be positive");
        let durability = Option::<VarInt>::decode(r)?.map(|v| v.0 as u32);
        Ok(Self {
            kind,
            quantity: quantity as u32,
            durability,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chebyshev() {
        let a = TilePos::new(10, 10);
        assert_eq!(a.chebyshev_distance(TilePos::new(10, 10)), 0);
        assert_eq!(a.chebyshev_distance(TilePos::new(11, 9)), 1);
        assert_eq!(a.chebyshev_distance(TilePos::new(13, 8)), 3);
        assert_eq!(a.chebyshev_distance(TilePos::new(-2, 10)), 12);
    }

    #[test]
    fn step_matches_screen_coordinates() {
        let a = TilePos::new(5, 5);
        assert_eq!(a.step(Direction::Up), TilePos::new(5, 4));
        assert_eq!(a.step(Direction::Down), TilePos::new(5, 6));
        assert_eq!(a.step(Direction::Left), TilePos::new(4, 5));
        assert_eq!(a.step(Direction::Right), TilePos::new(6, 5));
    }

    #[test]
    fn slot_names_round_trip() {
        for slot in EquipmentSlot::ALL {
            assert_eq!(EquipmentSlot::from_name(slot.name()), Some(slot));
        }
        assert_eq!(EquipmentSlot::from_name("cape"), None);
    }
}
