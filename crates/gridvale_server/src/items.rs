//! Inventory and equipment rules.
//!
//! Pure operations over [`Inventory`] and [`Equipment`] values. Handlers run
//! them inside a cache transaction: clone the snapshot, apply, commit. On an
//! error the clones are discarded, so nothing here needs to roll back.

use gridvale_protocol::messages::SortKey;
use gridvale_protocol::{EquipmentSlot, ItemKindId, ItemStack, SkillKind};
use gridvale_store::state::{Equipment, Inventory, SkillSheet};
use gridvale_store::ItemCatalog;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItemOpError {
    #[error("invalid inventory slot {0}")]
    InvalidSlot(usize),
    #[error("inventory slot {0} is empty")]
    SlotEmpty(usize),
    #[error("nothing equipped in that slot")]
    EquipmentSlotEmpty,
    #[error("unknown item kind {0:?}")]
    UnknownKind(ItemKindId),
    #[error("item is not equipable")]
    NotEquipable,
    #[error("requires {skill:?} level {required} (you have {current})")]
    LevelTooLow {
        skill: SkillKind,
        required: u32,
        current: u32,
    },
    #[error("inventory is full")]
    InventoryFull,
    #[error("not enough of that item")]
    InsufficientQuantity,
}

/// What `move_slot` did.
#[derive(Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    Swapped,
    /// Stacks merged; the source slot was fully absorbed.
    Merged,
    /// Stacks merged up to the cap; the remainder stays in the source slot.
    PartiallyMerged { remainder: u32 },
}

/// Moves, merges, or swaps between two inventory slots.
pub fn move_slot(
    inv: &mut Inventory,
    catalog: &ItemCatalog,
    from: usize,
    to: usize,
) -> Result<MoveOutcome, ItemOpError> {
    let size = inv.slots.len();
    if from >= size {
        return Err(ItemOpError::InvalidSlot(from));
    }
    if to >= size {
        return Err(ItemOpError::InvalidSlot(to));
    }

    let source = inv.slots[from].ok_or(ItemOpError::SlotEmpty(from))?;
    if from == to {
        return Ok(MoveOutcome::Moved);
    }

    match inv.slots[to] {
        None => {
            inv.slots[to] = Some(source);
            inv.slots[from] = None;
            Ok(MoveOutcome::Moved)
        }
        Some(dest) if dest.kind == source.kind => {
            let def = catalog.get(source.kind).ok_or(ItemOpError::UnknownKind(source.kind))?;
            if !def.stackable {
                inv.slots.swap(from, to);
                return Ok(MoveOutcome::Swapped);
            }

            let space = def.stack_cap().saturating_sub(dest.quantity);
            if space == 0 {
                inv.slots.swap(from, to);
                return Ok(MoveOutcome::Swapped);
            }

            let moved = source.quantity.min(space);
            inv.slots[to] = Some(ItemStack::new(dest.kind, dest.quantity + moved, dest.durability));
            if moved == source.quantity {
                inv.slots[from] = None;
                Ok(MoveOutcome::Merged)
            } else {
                let remainder = source.quantity - moved;
                inv.slots[from] = Some(ItemStack::new(source.kind, remainder, source.durability));
                Ok(MoveOutcome::PartiallyMerged { remainder })
            }
        }
        Some(_) => {
            inv.slots.swap(from, to);
            Ok(MoveOutcome::Swapped)
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SortSummary {
    pub items_moved: u32,
    pub stacks_merged: u32,
}

/// Compacts and sorts the inventory, merging stacks where allowed.
pub fn sort(inv: &mut Inventory, catalog: &ItemCatalog, key: SortKey) -> SortSummary {
    let before = inv.slots.clone();

    let mut stacks: Vec<ItemStack> = inv.slots.iter().flatten().copied().collect();

    // Merge stackable kinds first.
    let mut merged: Vec<ItemStack> = Vec::with_capacity(stacks.len());
    let mut stacks_merged = 0u32;
    for stack in stacks.drain(..) {
        let cap = catalog.get(stack.kind).map_or(1, |def| def.stack_cap());
        if cap > 1 {
            if let Some(existing) = merged
                .iter_mut()
                .find(|s| s.kind == stack.kind && s.quantity < cap)
            {
                let space = cap - existing.quantity;
                let moved = stack.quantity.min(space);
                existing.quantity += moved;
                stacks_merged += 1;
                if moved < stack.quantity {
                    merged.push(ItemStack::new(stack.kind, stack.quantity - moved, stack.durability));
                }
                continue;
            }
        }
        merged.push(stack);
    }

    merged.sort_by(|a, b| {
        let (da, db) = (catalog.get(a.kind), catalog.get(b.kind));
        let ord = match key {
            SortKey::Name => {
                let name = |d: Option<&gridvale_store::state::ItemKindDef>| {
                    d.map(|d| d.display_name.clone()).unwrap_or_default()
                };
                name(da).cmp(&name(db))
            }
            SortKey::Value => {
                let value = |d: Option<&gridvale_store::state::ItemKindDef>| {
                    d.map_or(0, |d| d.value)
                };
                value(db).cmp(&value(da))
            }
            SortKey::Quantity => b.quantity.cmp(&a.quantity),
            SortKey::Rarity => {
                let rarity = |d: Option<&gridvale_store::state::ItemKindDef>| {
                    d.map(|d| d.rarity)
                };
                rarity(db).cmp(&rarity(da))
            }
        };
        // Stable tiebreak so sorting is deterministic.
        ord.then_with(|| a.kind.0.cmp(&b.kind.0))
    });

    for (i, slot) in inv.slots.iter_mut().enumerate() {
        *slot = merged.get(i).copied();
    }

    let items_moved = inv
        .slots
        .iter()
        .zip(&before)
        .filter(|(now, was)| now != was)
        .count() as u32;

    SortSummary {
        items_moved,
        stacks_merged,
    }
}

/// Adds a stack to the inventory, merging into existing stacks first.
/// All-or-nothing: on `InventoryFull` the inventory is unchanged.
pub fn add_stack(
    inv: &mut Inventory,
    catalog: &ItemCatalog,
    kind: ItemKindId,
    quantity: u32,
    durability: Option<u32>,
) -> Result<(), ItemOpError> {
    let def = catalog.get(kind).ok_or(ItemOpError::UnknownKind(kind))?;
    let cap = def.stack_cap();

    let mut staged = inv.clone();
    let mut remaining = quantity;

    if cap > 1 {
        for slot in staged.slots.iter_mut().flatten() {
            if slot.kind == kind && slot.quantity < cap {
                let moved = remaining.min(cap - slot.quantity);
                slot.quantity += moved;
                remaining -= moved;
                if remaining == 0 {
                    break;
                }
            }
        }
    }

    while remaining > 0 {
        let portion = remaining.min(cap);
        let Some(free) = staged.first_free_slot() else {
            return Err(ItemOpError::InventoryFull);
        };
        staged.slots[free] = Some(ItemStack::new(kind, portion, durability));
        remaining -= portion;
    }

    *inv = staged;
    Ok(())
}

/// Takes `quantity` out of a slot, returning what was removed.
pub fn remove_quantity(
    inv: &mut Inventory,
    slot: usize,
    quantity: u32,
) -> Result<ItemStack, ItemOpError> {
    if slot >= inv.slots.len() {
        return Err(ItemOpError::InvalidSlot(slot));
    }
    let stack = inv.slots[slot].ok_or(ItemOpError::SlotEmpty(slot))?;
    if quantity == 0 || quantity > stack.quantity {
        return Err(ItemOpError::InsufficientQuantity);
    }

    if quantity == stack.quantity {
        inv.slots[slot] = None;
    } else {
        inv.slots[slot] = Some(ItemStack::new(
            stack.kind,
            stack.quantity - quantity,
            stack.durability,
        ));
    }
    Ok(ItemStack::new(stack.kind, quantity, stack.durability))
}

/// Equips the item in an inventory slot.
///
/// Two-handed weapons displace the shield (and equipping a shield displaces a
/// two-handed weapon); whatever was in the target slot swaps into the freed
/// inventory slot; displaced items go to the first free slots.
pub fn equip(
    inv: &mut Inventory,
    eq: &mut Equipment,
    sheet: &SkillSheet,
    catalog: &ItemCatalog,
    from_slot: usize,
) -> Result<EquipmentSlot, ItemOpError> {
    if from_slot >= inv.slots.len() {
        return Err(ItemOpError::InvalidSlot(from_slot));
    }
    let stack = inv.slots[from_slot].ok_or(ItemOpError::SlotEmpty(from_slot))?;
    let def = catalog.get(stack.kind).ok_or(ItemOpError::UnknownKind(stack.kind))?;
    let target = def.equip_slot.ok_or(ItemOpError::NotEquipable)?;

    for &(skill, required) in &def.requirements {
        let current = sheet.level(skill);
        if current < required {
            return Err(ItemOpError::LevelTooLow {
                skill,
                required,
                current,
            });
        }
    }

    // Displaced off-hand/main-hand items land in the first slot that is free
    // before the equipped item vacates its own; a full bag fails the whole
    // operation up front.
    let displaced = if target == EquipmentSlot::Weapon && def.two_handed {
        eq.get(EquipmentSlot::Shield)
            .copied()
            .map(|s| (EquipmentSlot::Shield, s))
    } else if target == EquipmentSlot::Shield {
        let wielding_two_hander = eq
            .get(EquipmentSlot::Weapon)
            .and_then(|w| catalog.get(w.kind))
            .is_some_and(|d| d.two_handed);
        wielding_two_hander
            .then(|| eq.get(EquipmentSlot::Weapon).copied())
            .flatten()
            .map(|w| (EquipmentSlot::Weapon, w))
    } else {
        None
    };

    if let Some((displaced_slot, item)) = displaced {
        let Some(free) = inv.first_free_slot() else {
            return Err(ItemOpError::InventoryFull);
        };
        inv.slots[free] = Some(item);
        eq.set(displaced_slot, None);
    }

    inv.slots[from_slot] = None;

    // The previously-equipped item swaps into the freed inventory slot.
    if let Some(old) = eq.set(target, Some(stack)) {
        inv.slots[from_slot] = Some(old);
    }

    Ok(target)
}

/// Unequips a slot into the inventory (merging stackables).
pub fn unequip(
    inv: &mut Inventory,
    eq: &mut Equipment,
    catalog: &ItemCatalog,
    slot: EquipmentSlot,
) -> Result<(), ItemOpError> {
    let stack = *eq.get(slot).ok_or(ItemOpError::EquipmentSlotEmpty)?;

    add_stack(inv, catalog, stack.kind, stack.quantity, stack.durability)
        .map_err(|_| ItemOpError::InventoryFull)?;
    eq.set(slot, None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use gridvale_store::seed_defs;
    use pretty_assertions::assert_eq;

    use super::*;

    fn catalog() -> ItemCatalog {
        ItemCatalog::from_defs(seed_defs())
    }

    fn kind(catalog: &ItemCatalog, name: &str) -> ItemKindId {
        catalog.by_name(name).unwrap().id
    }

    #[test]
    fn move_into_empty_slot() {
        let catalog = catalog();
        let coins = kind(&catalog, "coins");
        let mut inv = Inventory::default();
        inv.slots[0] = Some(ItemStack::new(coins, 10, None));

        assert_eq!(move_slot(&mut inv, &catalog, 0, 5), Ok(MoveOutcome::Moved));
        assert!(inv.slots[0].is_none());
        assert_eq!(inv.slots[5], Some(ItemStack::new(coins, 10, None)));
    }

    #[test]
    fn move_merges_stackables() {
        let catalog = catalog();
        let coins = kind(&catalog, "coins");
        let mut inv = Inventory::default();
        inv.slots[0] = Some(ItemStack::new(coins, 10, None));
        inv.slots[1] = Some(ItemStack::new(coins, 5, None));

        assert_eq!(move_slot(&mut inv, &catalog, 0, 1), Ok(MoveOutcome::Merged));
        assert!(inv.slots[0].is_none());
        assert_eq!(inv.slots[1], Some(ItemStack::new(coins, 15, None)));
    }

    #[test]
    fn move_swaps_different_kinds_and_unstackables() {
        let catalog = catalog();
        let coins = kind(&catalog, "coins");
        let sword = kind(&catalog, "bronze_sword");
        let mut inv = Inventory::default();
        inv.slots[0] = Some(ItemStack::new(coins, 10, None));
        inv.slots[1] = Some(ItemStack::new(sword, 1, Some(100)));

        assert_eq!(move_slot(&mut inv, &catalog, 0, 1), Ok(MoveOutcome::Swapped));
        assert_eq!(inv.slots[0], Some(ItemStack::new(sword, 1, Some(100))));
        assert_eq!(inv.slots[1], Some(ItemStack::new(coins, 10, None)));

        // Two unstackable swords swap rather than merge.
        let mut inv = Inventory::default();
        inv.slots[0] = Some(ItemStack::new(sword, 1, Some(50)));
        inv.slots[1] = Some(ItemStack::new(sword, 1, Some(80)));
        assert_eq!(move_slot(&mut inv, &catalog, 0, 1), Ok(MoveOutcome::Swapped));
        assert_eq!(inv.slots[0].unwrap().durability, Some(80));
    }

    #[test]
    fn move_from_empty_fails() {
        let catalog = catalog();
        let mut inv = Inventory::default();
        assert_eq!(
            move_slot(&mut inv, &catalog, 3, 4),
            Err(ItemOpError::SlotEmpty(3))
        );
        assert_eq!(
            move_slot(&mut inv, &catalog, 99, 4),
            Err(ItemOpError::InvalidSlot(99))
        );
    }

    #[test]
    fn sort_compacts_merges_and_counts() {
        let catalog = catalog();
        let coins = kind(&catalog, "coins");
        let arrows = kind(&catalog, "iron_arrow");
        let mut inv = Inventory::default();
        inv.slots[3] = Some(ItemStack::new(coins, 10, None));
        inv.slots[10] = Some(ItemStack::new(arrows, 40, None));
        inv.slots[20] = Some(ItemStack::new(coins, 7, None));

        let summary = sort(&mut inv, &catalog, SortKey::Quantity);
        assert_eq!(summary.stacks_merged, 1);
        assert!(summary.items_moved > 0);

        // Compact: two stacks at the front, coins merged, sorted by quantity
        // descending.
        assert_eq!(inv.slots[0], Some(ItemStack::new(arrows, 40, None)));
        assert_eq!(inv.slots[1], Some(ItemStack::new(coins, 17, None)));
        assert!(inv.slots[2..].iter().all(Option::is_none));
    }

    #[test]
    fn add_stack_merges_then_fills_and_is_atomic() {
        let catalog = catalog();
        let coins = kind(&catalog, "coins");
        let sword = kind(&catalog, "bronze_sword");

        let mut inv = Inventory::empty(2);
        inv.slots[0] = Some(ItemStack::new(coins, 10, None));
        add_stack(&mut inv, &catalog, coins, 15, None).unwrap();
        assert_eq!(inv.slots[0], Some(ItemStack::new(coins, 25, None)));
        assert!(inv.slots[1].is_none());

        // Unstackable swords need one slot each; two do not fit in one free
        // slot, and the failure leaves the inventory untouched.
        let before = inv.clone();
        assert_eq!(
            add_stack(&mut inv, &catalog, sword, 2, Some(100)),
            Err(ItemOpError::InventoryFull)
        );
        assert_eq!(inv, before);

        add_stack(&mut inv, &catalog, sword, 1, Some(100)).unwrap();
        assert_eq!(inv.slots[1], Some(ItemStack::new(sword, 1, Some(100))));
    }

    #[test]
    fn remove_quantity_splits_stacks() {
        let catalog = catalog();
        let coins = kind(&catalog, "coins");
        let mut inv = Inventory::default();
        inv.slots[0] = Some(ItemStack::new(coins, 10, None));

        let taken = remove_quantity(&mut inv, 0, 4).unwrap();
        assert_eq!(taken.quantity, 4);
        assert_eq!(inv.slots[0], Some(ItemStack::new(coins, 6, None)));

        assert_eq!(
            remove_quantity(&mut inv, 0, 7),
            Err(ItemOpError::InsufficientQuantity)
        );

        let taken = remove_quantity(&mut inv, 0, 6).unwrap();
        assert_eq!(taken.quantity, 6);
        assert!(inv.slots[0].is_none());
    }

    #[test]
    fn equip_and_swap() {
        let catalog = catalog();
        let sword = kind(&catalog, "bronze_sword");
        let mut inv = Inventory::default();
        let mut eq = Equipment::default();
        let sheet = SkillSheet::starting();

        inv.slots[0] = Some(ItemStack::new(sword, 1, Some(100)));
        assert_eq!(
            equip(&mut inv, &mut eq, &sheet, &catalog, 0),
            Ok(EquipmentSlot::Weapon)
        );
        assert!(inv.slots[0].is_none());
        assert_eq!(eq.get(EquipmentSlot::Weapon).unwrap().durability, Some(100));

        // Equipping a second weapon swaps the first back into the freed slot.
        inv.slots[0] = Some(ItemStack::new(sword, 1, Some(40)));
        equip(&mut inv, &mut eq, &sheet, &catalog, 0).unwrap();
        assert_eq!(inv.slots[0].unwrap().durability, Some(100));
        assert_eq!(eq.get(EquipmentSlot::Weapon).unwrap().durability, Some(40));
    }

    #[test]
    fn equip_checks_requirements() {
        let catalog = catalog();
        let blade = kind(&catalog, "rune_blade");
        let mut inv = Inventory::default();
        let mut eq = Equipment::default();
        let sheet = SkillSheet::starting();

        inv.slots[0] = Some(ItemStack::new(blade, 1, Some(220)));
        assert_eq!(
            equip(&mut inv, &mut eq, &sheet, &catalog, 0),
            Err(ItemOpError::LevelTooLow {
                skill: SkillKind::Attack,
                required: 40,
                current: 1,
            })
        );

        let coins = kind(&catalog, "coins");
        inv.slots[1] = Some(ItemStack::new(coins, 5, None));
        assert_eq!(
            equip(&mut inv, &mut eq, &sheet, &catalog, 1),
            Err(ItemOpError::NotEquipable)
        );
    }

    #[test]
    fn two_handed_displaces_shield() {
        let catalog = catalog();
        let shield = kind(&catalog, "wooden_shield");
        let greatsword = kind(&catalog, "iron_greatsword");
        let mut inv = Inventory::default();
        let mut eq = Equipment::default();
        let mut sheet = SkillSheet::starting();
        sheet.set(
            SkillKind::Attack,
            gridvale_store::state::SkillProgress { level: 10, xp: 1200 },
        );

        eq.set(EquipmentSlot::Shield, Some(ItemStack::new(shield, 1, Some(120))));
        inv.slots[0] = Some(ItemStack::new(greatsword, 1, Some(140)));

        assert_eq!(
            equip(&mut inv, &mut eq, &sheet, &catalog, 0),
            Ok(EquipmentSlot::Weapon)
        );
        // Invariant: two-handed weapon equipped ⇒ shield slot empty.
        assert!(eq.get(EquipmentSlot::Shield).is_none());
        assert_eq!(eq.get(EquipmentSlot::Weapon).unwrap().kind, greatsword);
        // The weapon's slot is left empty; the shield went to the first slot
        // that was free before the swap.
        assert!(inv.slots[0].is_none());
        assert_eq!(inv.slots[1].unwrap().kind, shield);
    }

    #[test]
    fn two_handed_swap_fails_when_bag_is_full() {
        let catalog = catalog();
        let shield = kind(&catalog, "wooden_shield");
        let greatsword = kind(&catalog, "iron_greatsword");
        let coins = kind(&catalog, "coins");
        let mut inv = Inventory::empty(2);
        let mut eq = Equipment::default();
        let mut sheet = SkillSheet::starting();
        sheet.set(
            SkillKind::Attack,
            gridvale_store::state::SkillProgress { level: 10, xp: 1200 },
        );

        eq.set(EquipmentSlot::Shield, Some(ItemStack::new(shield, 1, Some(120))));
        inv.slots[0] = Some(ItemStack::new(greatsword, 1, Some(140)));
        inv.slots[1] = Some(ItemStack::new(coins, 5, None));

        // No slot is free before the weapon vacates its own, so the shield
        // has nowhere to go.
        assert_eq!(
            equip(&mut inv, &mut eq, &sheet, &catalog, 0),
            Err(ItemOpError::InventoryFull)
        );
    }

    #[test]
    fn shield_displaces_two_handed_weapon() {
        let catalog = catalog();
        let shield = kind(&catalog, "wooden_shield");
        let greatsword = kind(&catalog, "iron_greatsword");
        let mut inv = Inventory::default();
        let mut eq = Equipment::default();
        let sheet = SkillSheet::starting();

        eq.set(
            EquipmentSlot::Weapon,
            Some(ItemStack::new(greatsword, 1, Some(140))),
        );
        inv.slots[2] = Some(ItemStack::new(shield, 1, Some(120)));

        assert_eq!(
            equip(&mut inv, &mut eq, &sheet, &catalog, 2),
            Ok(EquipmentSlot::Shield)
        );
        assert!(eq.get(EquipmentSlot::Weapon).is_none());
        assert_eq!(eq.get(EquipmentSlot::Shield).unwrap().kind, shield);
        assert_eq!(inv.slots[0].unwrap().kind, greatsword);
        assert!(inv.slots[2].is_none());
    }

    #[test]
    fn unequip_requires_space_and_round_trips() {
        let catalog = catalog();
        let sword = kind(&catalog, "bronze_sword");
        let coins = kind(&catalog, "coins");
        let mut eq = Equipment::default();
        eq.set(EquipmentSlot::Weapon, Some(ItemStack::new(sword, 1, Some(87))));

        // Full inventory: unequip fails, nothing changes.
        let mut full = Inventory::empty(1);
        full.slots[0] = Some(ItemStack::new(coins, 1, None));
        assert_eq!(
            unequip(&mut full, &mut eq, &catalog, EquipmentSlot::Weapon),
            Err(ItemOpError::InventoryFull)
        );
        assert!(eq.get(EquipmentSlot::Weapon).is_some());

        // With space: durability survives the round trip.
        let mut inv = Inventory::default();
        unequip(&mut inv, &mut eq, &catalog, EquipmentSlot::Weapon).unwrap();
        assert!(eq.get(EquipmentSlot::Weapon).is_none());
        assert_eq!(inv.slots[0], Some(ItemStack::new(sword, 1, Some(87))));

        assert_eq!(
            unequip(&mut inv, &mut eq, &catalog, EquipmentSlot::Weapon),
            Err(ItemOpError::EquipmentSlotEmpty)
        );
    }
}
