//! Hot-state value types held by the cache.
//!
//! These are the authoritative live forms of player and world state. The
//! durable store persists flattened copies of a subset of them; everything
//! here is owned data with no references into other managers.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use gridvale_protocol::messages::CombatTarget;
use gridvale_protocol::{
    Direction, EntityInstanceId, EntityState, EquipmentSlot, GroundItemId, ItemKindId, ItemStack,
    MapId, PlayerId, Rarity, SkillKind, TilePos,
};

/// Wall-clock seconds since the Unix epoch. Respawn and despawn clocks use
/// wall time so long-idle maps do not accumulate a tick backlog.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Where a player stands and faces.
#[derive(Clone, PartialEq, Debug)]
pub struct PlayerPosition {
    pub map_id: MapId,
    pub pos: TilePos,
    pub facing: Direction,
    /// Unix seconds of the last accepted move, for the movement cooldown.
    pub last_move_at: f64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PlayerHp {
    pub current: u32,
    pub max: u32,
}

/// An ongoing auto-attack schedule.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct CombatState {
    pub target: CombatTarget,
    pub last_attack_tick: u64,
    /// Seconds between auto-attacks, derived from the equipped weapon.
    pub attack_speed_secs: f64,
}

#[derive(Clone, PartialEq, Debug)]
pub struct PlayerSettings {
    pub auto_retaliate: bool,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            auto_retaliate: true,
        }
    }
}

/// Cosmetic appearance fields plus the hash clients key sprite caches on.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Appearance {
    pub fields: BTreeMap<String, String>,
}

impl Appearance {
    /// Stable hash over the appearance fields. Bumps whenever any field
    /// changes, which is all clients need to invalidate.
    pub fn visual_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for (k, v) in &self.fields {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// A player's ordered bag of item slots.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Inventory {
    pub slots: Vec<Option<ItemStack>>,
}

impl Inventory {
    pub const DEFAULT_SIZE: usize = 28;

    pub fn empty(size: usize) -> Self {
        Self {
            slots: vec![None; size],
        }
    }

    pub fn slot(&self, idx: usize) -> Option<&ItemStack> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    pub fn first_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Total quantity of `kind` across all slots.
    pub fn total_quantity(&self, kind: ItemKindId) -> u64 {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.kind == kind)
            .map(|s| u64::from(s.quantity))
            .sum()
    }
}

impl Default for Inventory {
    fn default() -> Self {
        Self::empty(Self::DEFAULT_SIZE)
    }
}

/// Worn items, one slot per [`EquipmentSlot`].
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Equipment {
    slots: [Option<ItemStack>; EquipmentSlot::ALL.len()],
}

impl Equipment {
    pub fn get(&self, slot: EquipmentSlot) -> Option<&ItemStack> {
        self.slots[slot as usize].as_ref()
    }

    pub fn set(&mut self, slot: EquipmentSlot, stack: Option<ItemStack>) -> Option<ItemStack> {
        std::mem::replace(&mut self.slots[slot as usize], stack)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EquipmentSlot, &ItemStack)> + '_ {
        EquipmentSlot::ALL
            .into_iter()
            .filter_map(|slot| self.slots[slot as usize].as_ref().map(|s| (slot, s)))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SkillProgress {
    pub level: u32,
    pub xp: u64,
}

/// All trainable skills of one player.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SkillSheet {
    skills: [SkillProgress; SkillKind::ALL.len()],
}

impl SkillSheet {
    /// A fresh character: everything at level 1 except hitpoints at 10.
    pub fn starting() -> Self {
        let mut skills = [SkillProgress { level: 1, xp: 0 }; SkillKind::ALL.len()];
        for kind in SkillKind::ALL {
            skills[kind as usize].level = kind.starting_level();
        }
        Self { skills }
    }

    pub fn get(&self, kind: SkillKind) -> SkillProgress {
        self.skills[kind as usize]
    }

    pub fn set(&mut self, kind: SkillKind, progress: SkillProgress) {
        self.skills[kind as usize] = progress;
    }

    pub fn level(&self, kind: SkillKind) -> u32 {
        self.get(kind).level
    }

    pub fn iter(&self) -> impl Iterator<Item = (SkillKind, SkillProgress)> + '_ {
        SkillKind::ALL
            .into_iter()
            .map(|kind| (kind, self.get(kind)))
    }
}

impl Default for SkillSheet {
    fn default() -> Self {
        Self::starting()
    }
}

/// A live NPC or monster.
#[derive(Clone, PartialEq, Debug)]
pub struct EntityInstance {
    pub id: EntityInstanceId,
    pub kind_name: String,
    pub map_id: MapId,
    pub position: TilePos,
    pub facing: Direction,
    pub spawn_position: TilePos,
    pub spawn_point_id: u32,
    pub wander_radius: u32,
    pub aggro_range: u32,
    pub disengage_range: u32,
    pub current_hp: u32,
    pub max_hp: u32,
    pub state: EntityState,
    pub aggro_target: Option<PlayerId>,
    /// Tick of the last AI movement step, for wander/chase cadence.
    pub last_action_tick: u64,
    /// Tick of the last attack this entity landed or attempted.
    pub last_attack_tick: u64,
    /// Tick at which a dying entity finishes its death animation.
    pub death_tick: Option<u64>,
    /// Unix seconds at which a dead entity comes back.
    pub respawn_at: Option<f64>,
}

/// An item lying on a map tile.
#[derive(Clone, PartialEq, Debug)]
pub struct GroundItem {
    pub id: GroundItemId,
    pub kind: ItemKindId,
    pub display_name: String,
    pub rarity: Rarity,
    pub map_id: MapId,
    pub position: TilePos,
    pub quantity: u32,
    pub durability: Option<u32>,
    pub dropped_by: Option<PlayerId>,
    pub dropped_at: f64,
    /// When loot protection expires and anyone may take it.
    pub public_at: f64,
    pub despawn_at: f64,
}

impl GroundItem {
    /// Visibility rule: the dropper always sees their item; everyone else
    /// sees it once protection has lapsed.
    pub fn visible_to(&self, viewer: PlayerId, now: f64) -> bool {
        self.dropped_by == Some(viewer) || self.public_at <= now
    }

    pub fn is_protected(&self, now: f64) -> bool {
        self.public_at > now
    }
}

/// Reference data for one item kind, loaded once at startup.
#[derive(Clone, PartialEq, Debug)]
pub struct ItemKindDef {
    pub id: ItemKindId,
    pub name: String,
    pub display_name: String,
    pub rarity: Rarity,
    pub stackable: bool,
    pub max_stack: u32,
    pub value: u32,
    pub equip_slot: Option<EquipmentSlot>,
    pub two_handed: bool,
    pub attack_bonus: i32,
    pub strength_bonus: i32,
    pub defence_bonus: i32,
    /// Seconds between auto-attacks when wielded. Only meaningful for
    /// weapons.
    pub attack_speed_secs: Option<f64>,
    pub max_durability: Option<u32>,
    /// Minimum skill levels to equip.
    pub requirements: Vec<(SkillKind, u32)>,
}

impl ItemKindDef {
    pub fn is_equipable(&self) -> bool {
        self.equip_slot.is_some()
    }

    /// How many of this kind fit in one slot.
    pub fn stack_cap(&self) -> u32 {
        if self.stackable {
            self.max_stack
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_sheet_levels() {
        let sheet = SkillSheet::starting();
        assert_eq!(sheet.level(SkillKind::Attack), 1);
        assert_eq!(sheet.level(SkillKind::Hitpoints), 10);
        assert_eq!(sheet.get(SkillKind::Hitpoints).xp, 0);
    }

    #[test]
    fn appearance_hash_changes_with_fields() {
        let mut a = Appearance::default();
        let before = a.visual_hash();
        a.fields.insert("hair".into(), "red".into());
        assert_ne!(before, a.visual_hash());
    }

    #[test]
    fn ground_item_visibility_window() {
        let item = GroundItem {
            id: GroundItemId(1),
            kind: ItemKindId(1),
            display_name: "Coins".into(),
            rarity: Rarity::Common,
            map_id: "m".into(),
            position: TilePos::new(0, 0),
            quantity: 5,
            durability: None,
            dropped_by: Some(PlayerId(9)),
            dropped_at: 100.0,
            public_at: 145.0,
            despawn_at: 220.0,
        };

        // Dropper always sees it; others only after protection lapses.
        assert!(item.visible_to(PlayerId(9), 110.0));
        assert!(!item.visible_to(PlayerId(4), 110.0));
        assert!(item.visible_to(PlayerId(4), 150.0));
        assert!(item.is_protected(110.0));
        assert!(!item.is_protected(146.0));
    }
}
