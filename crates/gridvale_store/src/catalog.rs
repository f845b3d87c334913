//! Item-kind reference data.
//!
//! Loaded once at startup from the durable store. A built-in seed catalog is
//! inserted on first run so a fresh database has something to play with.

use gridvale_protocol::{EquipmentSlot, ItemKindId, Rarity, SkillKind};
use rustc_hash::FxHashMap;

use crate::durable::DurableStore;
use crate::state::ItemKindDef;
use crate::StoreError;

/// Immutable lookup over every known item kind.
#[derive(Debug, Default)]
pub struct ItemCatalog {
    by_id: FxHashMap<ItemKindId, ItemKindDef>,
    by_name: FxHashMap<String, ItemKindId>,
}

impl ItemCatalog {
    pub fn from_defs(defs: Vec<ItemKindDef>) -> Self {
        let mut by_id = FxHashMap::default();
        let mut by_name = FxHashMap::default();
        for def in defs {
            by_name.insert(def.name.clone(), def.id);
            by_id.insert(def.id, def);
        }
        Self { by_id, by_name }
    }

    /// Loads the catalog, seeding the reference table first if it is empty.
    pub async fn load(durable: &DurableStore) -> Result<Self, StoreError> {
        let mut defs = durable.load_item_kinds().await?;
        if defs.is_empty() {
            for def in seed_defs() {
                durable.insert_item_kind(&def).await?;
            }
            defs = durable.load_item_kinds().await?;
        }
        Ok(Self::from_defs(defs))
    }

    pub fn get(&self, id: ItemKindId) -> Option<&ItemKindDef> {
        self.by_id.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ItemKindDef> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn def(
    id: i32,
    name: &str,
    display_name: &str,
    rarity: Rarity,
    value: u32,
) -> ItemKindDef {
    ItemKindDef {
        id: ItemKindId(id),
        name: name.into(),
        display_name: display_name.into(),
        rarity,
        stackable: false,
        max_stack: 1,
        value,
        equip_slot: None,
        two_handed: false,
        attack_bonus: 0,
        strength_bonus: 0,
        defence_bonus: 0,
        attack_speed_secs: None,
        max_durability: None,
        requirements: vec![],
    }
}

/// The built-in item kinds inserted into a fresh database.
pub fn seed_defs() -> Vec<ItemKindDef> {
    vec![
        ItemKindDef {
            stackable: true,
            max_stack: 1_000_000,
            ..def(1, "coins", "Coins", Rarity::Common, 1)
        },
        ItemKindDef {
            equip_slot: Some(EquipmentSlot::Weapon),
            attack_bonus: 7,
            strength_bonus: 6,
            attack_speed_secs: Some(2.4),
            max_durability: Some(100),
            ..def(2, "bronze_sword", "Bronze Sword", Rarity::Common, 25)
        },
        ItemKindDef {
            equip_slot: Some(EquipmentSlot::Shield),
            defence_bonus: 5,
            max_durability: Some(120),
            ..def(3, "wooden_shield", "Wooden Shield", Rarity::Common, 20)
        },
        ItemKindDef {
            equip_slot: Some(EquipmentSlot::Weapon),
            two_handed: true,
            attack_bonus: 18,
            strength_bonus: 21,
            attack_speed_secs: Some(3.6),
            max_durability: Some(140),
            requirements: vec![(SkillKind::Attack, 10)],
            ..def(4, "iron_greatsword", "Iron Greatsword", Rarity::Uncommon, 180)
        },
        ItemKindDef {
            equip_slot: Some(EquipmentSlot::Head),
            defence_bonus: 2,
            max_durability: Some(80),
            ..def(5, "leather_cap", "Leather Cap", Rarity::Common, 10)
        },
        ItemKindDef {
            equip_slot: Some(EquipmentSlot::Body),
            defence_bonus: 4,
            max_durability: Some(90),
            ..def(6, "leather_tunic", "Leather Tunic", Rarity::Common, 18)
        },
        ItemKindDef {
            equip_slot: Some(EquipmentSlot::Legs),
            defence_bonus: 3,
            max_durability: Some(90),
            ..def(7, "leather_trousers", "Leather Trousers", Rarity::Common, 14)
        },
        ItemKindDef {
            equip_slot: Some(EquipmentSlot::Ammo),
            stackable: true,
            max_stack: 5000,
            ..def(8, "iron_arrow", "Iron Arrow", Rarity::Common, 2)
        },
        def(9, "cooked_trout", "Cooked Trout", Rarity::Common, 8),
        ItemKindDef {
            equip_slot: Some(EquipmentSlot::Weapon),
            attack_bonus: 45,
            strength_bonus: 40,
            attack_speed_secs: Some(2.4),
            max_durability: Some(220),
            requirements: vec![(SkillKind::Attack, 40)],
            ..def(10, "rune_blade", "Rune Blade", Rarity::Rare, 4200)
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeds_fresh_database_once() {
        let durable = DurableStore::in_memory().await.unwrap();
        let catalog = ItemCatalog::load(&durable).await.unwrap();
        assert_eq!(catalog.len(), seed_defs().len());

        // Loading again does not duplicate anything.
        let again = ItemCatalog::load(&durable).await.unwrap();
        assert_eq!(again.len(), catalog.len());

        let sword = catalog.by_name("bronze_sword").unwrap();
        assert_eq!(sword.equip_slot, Some(EquipmentSlot::Weapon));
        assert!(!sword.two_handed);
        assert_eq!(sword.stack_cap(), 1);

        let greatsword = catalog.by_name("iron_greatsword").unwrap();
        assert!(greatsword.two_handed);
        assert_eq!(greatsword.requirements, vec![(SkillKind::Attack, 10)]);

        let coins = catalog.by_name("coins").unwrap();
        assert!(coins.stackable);
        assert_eq!(coins.stack_cap(), 1_000_000);
    }
}
