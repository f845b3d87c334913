//! The durable relational store.
//!
//! SQLite via `sqlx`. The cache is authoritative while state is live; this
//! layer is authoritative at cold start and receives batched writes from the
//! flusher. Set-valued data (inventory, equipment, skills, per-map ground
//! items) is written delete-then-insert inside one SQL transaction.

use gridvale_protocol::{
    EquipmentSlot, GroundItemId, ItemKindId, ItemStack, MapId, PlayerId, Rarity, Role, SkillKind,
    TilePos,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::state::{
    unix_now, Appearance, Equipment, GroundItem, Inventory, ItemKindDef, PlayerHp, SkillProgress,
    SkillSheet,
};
use crate::StoreError;

/// A row of the `players` table.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub username: String,
    pub hashed_password: String,
    pub role: Role,
    pub is_banned: bool,
    pub timeout_until: Option<f64>,
    pub map_id: MapId,
    pub position: TilePos,
    pub current_hp: u32,
    pub appearance: Appearance,
}

impl PlayerRecord {
    /// Whether a timeout is still in force.
    pub fn is_timed_out(&self, now: f64) -> bool {
        self.timeout_until.is_some_and(|until| until > now)
    }
}

pub struct DurableStore {
    pool: SqlitePool,
}

impl DurableStore {
    /// Opens (and creates if missing) the database at `url` and ensures the
    /// schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options: SqliteConnectOptions = url
            .parse::<SqliteConnectOptions>()
            .map_err(StoreError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// An isolated in-memory database. Used by tests and local runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let ddl = [
            "CREATE TABLE IF NOT EXISTS players (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                hashed_password TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'player',
                is_banned INTEGER NOT NULL DEFAULT 0,
                timeout_until REAL,
                map_id TEXT NOT NULL,
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                current_hp INTEGER NOT NULL,
                appearance TEXT NOT NULL DEFAULT '{}',
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS player_skills (
                player_id INTEGER NOT NULL,
                skill TEXT NOT NULL,
                level INTEGER NOT NULL,
                xp INTEGER NOT NULL,
                PRIMARY KEY (player_id, skill)
            )",
            "CREATE TABLE IF NOT EXISTS player_inventory (
                player_id INTEGER NOT NULL,
                slot INTEGER NOT NULL,
                item_kind INTEGER NOT NULL,
                quantity INTEGER NOT NULL,
                durability INTEGER,
                PRIMARY KEY (player_id, slot)
            )",
            "CREATE TABLE IF NOT EXISTS player_equipment (
                player_id INTEGER NOT NULL,
                slot TEXT NOT NULL,
                item_kind INTEGER NOT NULL,
                quantity INTEGER NOT NULL,
                durability INTEGER,
                PRIMARY KEY (player_id, slot)
            )",
            "CREATE TABLE IF NOT EXISTS ground_items (
                id INTEGER PRIMARY KEY,
                item_kind INTEGER NOT NULL,
                map_id TEXT NOT NULL,
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                quantity INTEGER NOT NULL,
                durability INTEGER,
                dropped_by INTEGER,
                dropped_at REAL NOT NULL,
                public_at REAL NOT NULL,
                despawn_at REAL NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS item_kinds (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                rarity TEXT NOT NULL,
                stackable INTEGER NOT NULL,
                max_stack INTEGER NOT NULL,
                value INTEGER NOT NULL,
                equip_slot TEXT,
                two_handed INTEGER NOT NULL DEFAULT 0,
                attack_bonus INTEGER NOT NULL DEFAULT 0,
                strength_bonus INTEGER NOT NULL DEFAULT 0,
                defence_bonus INTEGER NOT NULL DEFAULT 0,
                attack_speed REAL,
                max_durability INTEGER,
                requirements TEXT NOT NULL DEFAULT '[]'
            )",
        ];

        for stmt in ddl {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Players

    pub async fn create_player(
        &self,
        username: &str,
        hashed_password: &str,
        role: Role,
        map_id: &MapId,
        position: TilePos,
        current_hp: u32,
    ) -> Result<PlayerRecord, StoreError> {
        let now = unix_now();
        let result = sqlx::query(
            "INSERT INTO players (username, hashed_password, role, map_id, x, y, current_hp, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(hashed_password)
        .bind(role.name())
        .bind(map_id.as_str())
        .bind(position.x)
        .bind(position.y)
        .bind(i64::from(current_hp))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = PlayerId(result.last_insert_rowid());
        info!(player_id = %id, username, "created player record");

        self.player_by_id(id)
            .await?
            .ok_or(StoreError::PlayerNotFound(id))
    }

    pub async fn player_by_id(&self, id: PlayerId) -> Result<Option<PlayerRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM players WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_player).transpose()
    }

    pub async fn player_by_username(
        &self,
        username: &str,
    ) -> Result<Option<PlayerRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM players WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_player).transpose()
    }

    /// Persists the flushed live state of a player onto their row.
    pub async fn save_player_state(
        &self,
        id: PlayerId,
        map_id: &MapId,
        position: TilePos,
        current_hp: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE players SET map_id = ?, x = ?, y = ?, current_hp = ?, updated_at = ? WHERE \
             id = ?",
        )
        .bind(map_id.as_str())
        .bind(position.x)
        .bind(position.y)
        .bind(i64::from(current_hp))
        .bind(unix_now())
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_player_appearance(
        &self,
        id: PlayerId,
        appearance: &Appearance,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(&appearance.fields)?;
        sqlx::query("UPDATE players SET appearance = ?, updated_at = ? WHERE id = ?")
            .bind(json)
            .bind(unix_now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_player_banned(&self, id: PlayerId, banned: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE players SET is_banned = ?, updated_at = ? WHERE id = ?")
            .bind(banned)
            .bind(unix_now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_player_timeout(
        &self,
        id: PlayerId,
        until: Option<f64>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE players SET timeout_until = ?, updated_at = ? WHERE id = ?")
            .bind(until)
            .bind(unix_now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Skills

    /// Loads a player's skills, or `None` if they have no rows yet.
    pub async fn load_skills(&self, id: PlayerId) -> Result<Option<SkillSheet>, StoreError> {
        let rows = sqlx::query("SELECT skill, level, xp FROM player_skills WHERE player_id = ?")
            .bind(id.0)
            .fetch_all(&self.pool)
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut sheet = SkillSheet::starting();
        for row in rows {
            let name: String = row.try_get("skill")?;
            let Some(kind) = SkillKind::from_name(&name) else {
                continue;
            };
            sheet.set(
                kind,
                SkillProgress {
                    level: row.try_get::<i64, _>("level")? as u32,
                    xp: row.try_get::<i64, _>("xp")? as u64,
                },
            );
        }
        Ok(Some(sheet))
    }

    pub async fn replace_skills(&self, id: PlayerId, sheet: &SkillSheet) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM player_skills WHERE player_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        for (kind, progress) in sheet.iter() {
            sqlx::query(
                "INSERT INTO player_skills (player_id, skill, level, xp) VALUES (?, ?, ?, ?)",
            )
            .bind(id.0)
            .bind(kind.name())
            .bind(i64::from(progress.level))
            .bind(progress.xp as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inventory / equipment

    pub async fn load_inventory(
        &self,
        id: PlayerId,
        size: usize,
    ) -> Result<Option<Inventory>, StoreError> {
        let rows = sqlx::query(
            "SELECT slot, item_kind, quantity, durability FROM player_inventory WHERE player_id \
             = ?",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut inv = Inventory::empty(size);
        for row in rows {
            let slot = row.try_get::<i64, _>("slot")? as usize;
            if slot >= inv.slots.len() {
                continue;
            }
            inv.slots[slot] = Some(row_to_stack(&row)?);
        }
        Ok(Some(inv))
    }

    pub async fn replace_inventory(
        &self,
        id: PlayerId,
        inv: &Inventory,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM player_inventory WHERE player_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        for (slot, stack) in inv.slots.iter().enumerate() {
            let Some(stack) = stack else { continue };
            sqlx::query(
                "INSERT INTO player_inventory (player_id, slot, item_kind, quantity, durability) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id.0)
            .bind(slot as i64)
            .bind(stack.kind.0)
            .bind(i64::from(stack.quantity))
            .bind(stack.durability.map(i64::from))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_equipment(&self, id: PlayerId) -> Result<Option<Equipment>, StoreError> {
        let rows = sqlx::query(
            "SELECT slot, item_kind, quantity, durability FROM player_equipment WHERE player_id \
             = ?",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut eq = Equipment::default();
        for row in rows {
            let name: String = row.try_get("slot")?;
            let Some(slot) = EquipmentSlot::from_name(&name) else {
                continue;
            };
            eq.set(slot, Some(row_to_stack(&row)?));
        }
        Ok(Some(eq))
    }

    pub async fn replace_equipment(
        &self,
        id: PlayerId,
        eq: &Equipment,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM player_equipment WHERE player_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        for (slot, stack) in eq.iter() {
            sqlx::query(
                "INSERT INTO player_equipment (player_id, slot, item_kind, quantity, durability) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id.0)
            .bind(slot.name())
            .bind(stack.kind.0)
            .bind(i64::from(stack.quantity))
            .bind(stack.durability.map(i64::from))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ground items

    pub async fn load_all_ground_items(
        &self,
        display_name: impl Fn(ItemKindId) -> (String, Rarity),
    ) -> Result<Vec<GroundItem>, StoreError> {
        let rows = sqlx::query("SELECT * FROM ground_items")
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let kind = ItemKindId(row.try_get::<i64, _>("item_kind")? as i32);
            let (name, rarity) = display_name(kind);
            items.push(GroundItem {
                id: GroundItemId(row.try_get("id")?),
                kind,
                display_name: name,
                rarity,
                map_id: MapId(row.try_get("map_id")?),
                position: TilePos::new(
                    row.try_get::<i64, _>("x")? as i32,
                    row.try_get::<i64, _>("y")? as i32,
                ),
                quantity: row.try_get::<i64, _>("quantity")? as u32,
                durability: row
                    .try_get::<Option<i64>, _>("durability")?
                    .map(|d| d as u32),
                dropped_by: row
                    .try_get::<Option<i64>, _>("dropped_by")?
                    .map(PlayerId),
                dropped_at: row.try_get("dropped_at")?,
                public_at: row.try_get("public_at")?,
                despawn_at: row.try_get("despawn_at")?,
            });
        }
        Ok(items)
    }

    /// Replaces the persisted ground items of one map with the live set.
    pub async fn replace_ground_items(
        &self,
        map_id: &MapId,
        items: &[GroundItem],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ground_items WHERE map_id = ?")
            .bind(map_id.as_str())
            .execute(&mut *tx)
            .await?;
        for item in items {
            sqlx::query(
                "INSERT INTO ground_items (id, item_kind, map_id, x, y, quantity, durability, \
                 dropped_by, dropped_at, public_at, despawn_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, \
                 ?, ?, ?)",
            )
            .bind(item.id.0)
            .bind(item.kind.0)
            .bind(item.map_id.as_str())
            .bind(item.position.x)
            .bind(item.position.y)
            .bind(i64::from(item.quantity))
            .bind(item.durability.map(i64::from))
            .bind(item.dropped_by.map(|p| p.0))
            .bind(item.dropped_at)
            .bind(item.public_at)
            .bind(item.despawn_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Item reference data

    pub async fn load_item_kinds(&self) -> Result<Vec<ItemKindDef>, StoreError> {
        let rows = sqlx::query("SELECT * FROM item_kinds ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in rows {
            let requirements: Vec<(String, u32)> =
                serde_json::from_str(row.try_get::<String, _>("requirements")?.as_str())?;
            defs.push(ItemKindDef {
                id: ItemKindId(row.try_get::<i64, _>("id")? as i32),
                name: row.try_get("name")?,
                display_name: row.try_get("display_name")?,
                rarity: Rarity::from_name(row.try_get::<String, _>("rarity")?.as_str())
                    .unwrap_or(Rarity::Common),
                stackable: row.try_get("stackable")?,
                max_stack: row.try_get::<i64, _>("max_stack")? as u32,
                value: row.try_get::<i64, _>("value")? as u32,
                equip_slot: row
                    .try_get::<Option<String>, _>("equip_slot")?
                    .as_deref()
                    .and_then(EquipmentSlot::from_name),
                two_handed: row.try_get("two_handed")?,
                attack_bonus: row.try_get::<i64, _>("attack_bonus")? as i32,
                strength_bonus: row.try_get::<i64, _>("strength_bonus")? as i32,
                defence_bonus: row.try_get::<i64, _>("defence_bonus")? as i32,
                attack_speed_secs: row.try_get("attack_speed")?,
                max_durability: row
                    .try_get::<Option<i64>, _>("max_durability")?
                    .map(|d| d as u32),
                requirements: requirements
                    .into_iter()
                    .filter_map(|(name, level)| {
                        SkillKind::from_name(&name).map(|kind| (kind, level))
                    })
                    .collect(),
            });
        }
        Ok(defs)
    }

    pub async fn insert_item_kind(&self, def: &ItemKindDef) -> Result<(), StoreError> {
        let requirements: Vec<(&str, u32)> = def
            .requirements
            .iter()
            .map(|(kind, level)| (kind.name(), *level))
            .collect();
        sqlx::query(
            "INSERT OR IGNORE INTO item_kinds (id, name, display_name, rarity, stackable, \
             max_stack, value, equip_slot, two_handed, attack_bonus, strength_bonus, \
             defence_bonus, attack_speed, max_durability, requirements) VALUES (?, ?, ?, ?, ?, \
             ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(i64::from(def.id.0))
        .bind(&def.name)
        .bind(&def.display_name)
        .bind(def.rarity.name())
        .bind(def.stackable)
        .bind(i64::from(def.max_stack))
        .bind(i64::from(def.value))
        .bind(def.equip_slot.map(|s| s.name()))
        .bind(def.two_handed)
        .bind(i64::from(def.attack_bonus))
        .bind(i64::from(def.strength_bonus))
        .bind(i64::from(def.defence_bonus))
        .bind(def.attack_speed_secs)
        .bind(def.max_durability.map(i64::from))
        .bind(serde_json::to_string(&requirements)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_player(row: sqlx::sqlite::SqliteRow) -> Result<PlayerRecord, StoreError> {
    let appearance_json: String = row.try_get("appearance")?;
    let fields = serde_json::from_str(&appearance_json).unwrap_or_default();

    Ok(PlayerRecord {
        id: PlayerId(row.try_get("id")?),
        username: row.try_get("username")?,
        hashed_password: row.try_get("hashed_password")?,
        role: Role::from_name(row.try_get::<String, _>("role")?.as_str())
            .unwrap_or(Role::Player),
        is_banned: row.try_get("is_banned")?,
        timeout_until: row.try_get("timeout_until")?,
        map_id: MapId(row.try_get("map_id")?),
        position: TilePos::new(
            row.try_get::<i64, _>("x")? as i32,
            row.try_get::<i64, _>("y")? as i32,
        ),
        current_hp: row.try_get::<i64, _>("current_hp")? as u32,
        appearance: Appearance { fields },
    })
}

fn row_to_stack(row: &sqlx::sqlite::SqliteRow) -> Result<ItemStack, StoreError> {
    Ok(ItemStack {
        kind: ItemKindId(row.try_get::<i64, _>("item_kind")? as i32),
        quantity: row.try_get::<i64, _>("quantity")? as u32,
        durability: row
            .try_get::<Option<i64>, _>("durability")?
            .map(|d| d as u32),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_player() -> (DurableStore, PlayerRecord) {
        let store = DurableStore::in_memory().await.unwrap();
        let record = store
            .create_player(
                "alice",
                "not-a-real-hash",
                Role::Player,
                &MapId::from("meadowbrook"),
                TilePos::new(25, 25),
                10,
            )
            .await
            .unwrap();
        (store, record)
    }

    #[tokio::test]
    async fn create_and_fetch_player() {
        let (store, record) = store_with_player().await;
        assert_eq!(record.username, "alice");
        assert_eq!(record.role, Role::Player);
        assert!(!record.is_banned);

        let by_name = store.player_by_username("alice").await.unwrap().unwrap();
        assert_eq!(by_name, record);
        assert!(store.player_by_username("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_username_rejected() {
        let (store, _) = store_with_player().await;
        let err = store
            .create_player(
                "alice",
                "x",
                Role::Player,
                &MapId::from("meadowbrook"),
                TilePos::new(0, 0),
                10,
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn skills_round_trip() {
        let (store, record) = store_with_player().await;
        assert!(store.load_skills(record.id).await.unwrap().is_none());

        let mut sheet = SkillSheet::starting();
        sheet.set(
            SkillKind::Attack,
            SkillProgress {
                level: 40,
                xp: 37_224,
            },
        );
        store.replace_skills(record.id, &sheet).await.unwrap();

        let loaded = store.load_skills(record.id).await.unwrap().unwrap();
        assert_eq!(loaded, sheet);
    }

    #[tokio::test]
    async fn inventory_and_equipment_round_trip() {
        let (store, record) = store_with_player().await;

        let mut inv = Inventory::default();
        inv.slots[0] = Some(ItemStack::new(ItemKindId(1), 250, None));
        inv.slots[5] = Some(ItemStack::new(ItemKindId(2), 1, Some(87)));
        store.replace_inventory(record.id, &inv).await.unwrap();

        let mut eq = Equipment::default();
        eq.set(
            EquipmentSlot::Weapon,
            Some(ItemStack::new(ItemKindId(2), 1, Some(87))),
        );
        store.replace_equipment(record.id, &eq).await.unwrap();

        assert_eq!(
            store
                .load_inventory(record.id, Inventory::DEFAULT_SIZE)
                .await
                .unwrap()
                .unwrap(),
            inv
        );
        assert_eq!(store.load_equipment(record.id).await.unwrap().unwrap(), eq);
    }

    #[tokio::test]
    async fn ground_items_round_trip() {
        let (store, record) = store_with_player().await;
        let map = MapId::from("meadowbrook");

        let item = GroundItem {
            id: GroundItemId(7),
            kind: ItemKindId(1),
            display_name: "Coins".into(),
            rarity: Rarity::Common,
            map_id: map.clone(),
            position: TilePos::new(10, 10),
            quantity: 25,
            durability: None,
            dropped_by: Some(record.id),
            dropped_at: 50.0,
            public_at: 95.0,
            despawn_at: 170.0,
        };
        store.replace_ground_items(&map, &[item.clone()]).await.unwrap();

        let loaded = store
            .load_all_ground_items(|_| ("Coins".into(), Rarity::Common))
            .await
            .unwrap();
        assert_eq!(loaded, vec![item]);

        store.replace_ground_items(&map, &[]).await.unwrap();
        assert!(store
            .load_all_ground_items(|_| ("".into(), Rarity::Common))
            .await
            .unwrap()
            .is_empty());
    }
}
