//! The configuration document.
//!
//! One TOML file; every key is optional and falls back to the documented
//! default. Secrets and connection strings may also come from the
//! environment (`GRIDVALE_DATABASE_URL`, `GRIDVALE_TOKEN_SECRET`), which wins
//! over the file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use gridvale_protocol::{MapId, SkillKind, TilePos};
use gridvale_server::config::RarityTimes;
use gridvale_server::ServerConfig;
use gridvale_store::GameStoreConfig;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    pub game: GameSection,
    pub map: MapSection,
    pub store: StoreSection,
    pub security: SecuritySection,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub address: SocketAddr,
    pub max_players: usize,
    pub max_connections: usize,
    pub motd: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:4640".parse().expect("valid default address"),
            max_players: 200,
            max_connections: 1024,
            motd: "Welcome to Gridvale.".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GameSection {
    pub tick_rate: f64,
    pub move_cooldown_ms: u64,
    pub animation_duration_ms: u64,
    pub combat: CombatSection,
    pub spawn: SpawnSection,
    pub visibility: VisibilitySection,
    pub chat: ChatSection,
    pub ground_items: GroundItemSection,
    pub skills: SkillSection,
}

impl Default for GameSection {
    fn default() -> Self {
        Self {
            tick_rate: 20.0,
            move_cooldown_ms: 150,
            animation_duration_ms: 300,
            combat: CombatSection::default(),
            spawn: SpawnSection::default(),
            visibility: VisibilitySection::default(),
            chat: ChatSection::default(),
            ground_items: GroundItemSection::default(),
            skills: SkillSection::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CombatSection {
    pub base_attack_speed_secs: f64,
    pub attack_cooldown_ms: u64,
    pub death_anim_ticks: u64,
    pub entity_respawn_delay_secs: f64,
    pub death_respawn_delay_secs: f64,
}

impl Default for CombatSection {
    fn default() -> Self {
        Self {
            base_attack_speed_secs: 3.0,
            attack_cooldown_ms: 600,
            death_anim_ticks: 10,
            entity_respawn_delay_secs: 30.0,
            death_respawn_delay_secs: 5.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpawnSection {
    pub map_id: String,
    pub x: i32,
    pub y: i32,
}

impl Default for SpawnSection {
    fn default() -> Self {
        Self {
            map_id: "meadowbrook".to_owned(),
            x: 25,
            y: 25,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VisibilitySection {
    pub tile_radius: u32,
    pub pickup_range: u32,
}

impl Default for VisibilitySection {
    fn default() -> Self {
        Self {
            tile_radius: 32,
            pickup_range: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChatSection {
    pub max_len: usize,
    pub say_radius: u32,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            max_len: 256,
            say_radius: 32,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RaritySecondsSection {
    pub common: f64,
    pub uncommon: f64,
    pub rare: f64,
    pub epic: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroundItemSection {
    pub loot_protection_times: RaritySecondsSection,
    pub despawn_times: RaritySecondsSection,
}

impl Default for GroundItemSection {
    fn default() -> Self {
        Self {
            loot_protection_times: RaritySecondsSection {
                common: 45.0,
                uncommon: 60.0,
                rare: 90.0,
                epic: 120.0,
            },
            despawn_times: RaritySecondsSection {
                common: 120.0,
                uncommon: 180.0,
                rare: 300.0,
                epic: 600.0,
            },
        }
    }
}

impl Default for RaritySecondsSection {
    fn default() -> Self {
        GroundItemSection::default().loot_protection_times
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SkillSection {
    /// Per-skill XP multipliers, keyed by lowercase skill name.
    pub xp_multipliers: Vec<(String, f64)>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MapSection {
    pub directory: PathBuf,
    pub collision_layer_names: Vec<String>,
    pub chunk_size: u32,
    pub max_chunk_radius: u32,
    pub max_query_distance: u32,
}

impl Default for MapSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("maps"),
            collision_layer_names: vec![
                "tree".to_owned(),
                "building".to_owned(),
                "water".to_owned(),
                "farm".to_owned(),
                "obstacles".to_owned(),
                "collision".to_owned(),
            ],
            chunk_size: 16,
            max_chunk_radius: 2,
            max_query_distance: 32,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub database_url: String,
    pub flush_interval_secs: u64,
    pub online_ttl_secs: u64,
    pub offline_ttl_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database_url: "sqlite://gridvale.db".to_owned(),
            flush_interval_secs: 30,
            online_ttl_secs: 300,
            offline_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySection {
    pub token_secret: String,
    pub token_ttl_secs: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            token_secret: "change-me-before-going-live".to_owned(),
            token_ttl_secs: 1800,
        }
    }
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: FileConfig = toml::from_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Environment variables override the file for secrets and connection
    /// strings.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("GRIDVALE_DATABASE_URL") {
            self.store.database_url = url;
        }
        if let Ok(secret) = std::env::var("GRIDVALE_TOKEN_SECRET") {
            self.security.token_secret = secret;
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_players: self.server.max_players,
            max_connections: self.server.max_connections,
            motd: self.server.motd.clone(),
            tick_rate: self.game.tick_rate,
            move_cooldown: Duration::from_millis(self.game.move_cooldown_ms),
            animation_duration: Duration::from_millis(self.game.animation_duration_ms),
            attack_cooldown: Duration::from_millis(self.game.combat.attack_cooldown_ms),
            base_attack_speed_secs: self.game.combat.base_attack_speed_secs,
            death_anim_ticks: self.game.combat.death_anim_ticks,
            entity_respawn_delay_secs: self.game.combat.entity_respawn_delay_secs,
            death_respawn_delay_secs: self.game.combat.death_respawn_delay_secs,
            spawn_map: MapId::from(self.game.spawn.map_id.as_str()),
            spawn_position: TilePos::new(self.game.spawn.x, self.game.spawn.y),
            visibility_radius: self.game.visibility.tile_radius,
            pickup_range: self.game.visibility.pickup_range,
            chat_max_len: self.game.chat.max_len,
            say_radius: self.game.chat.say_radius,
            loot_protection: rarity_times(&self.game.ground_items.loot_protection_times),
            despawn: rarity_times(&self.game.ground_items.despawn_times),
            chunk_size: self.map.chunk_size,
            max_chunk_radius: self.map.max_chunk_radius,
            max_chunk_query_distance: self.map.max_query_distance,
            xp_multipliers: self
                .game
                .skills
                .xp_multipliers
                .iter()
                .filter_map(|(name, m)| SkillKind::from_name(name).map(|kind| (kind, *m)))
                .collect(),
            ..ServerConfig::default()
        }
    }

    pub fn store_config(&self) -> GameStoreConfig {
        GameStoreConfig {
            online_ttl: Duration::from_secs(self.store.online_ttl_secs),
            offline_ttl: Duration::from_secs(self.store.offline_ttl_secs),
            ..GameStoreConfig::default()
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.store.flush_interval_secs)
    }
}

fn rarity_times(section: &RaritySecondsSection) -> RarityTimes {
    RarityTimes {
        common: section.common,
        uncommon: section.uncommon,
        rare: section.rare,
        epic: section.epic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert_eq!(config.game.tick_rate, 20.0);
        assert_eq!(config.server.max_players, 200);
        assert_eq!(config.map.chunk_size, 16);

        let server = config.server_config();
        assert_eq!(server.move_cooldown, Duration::from_millis(150));
        assert_eq!(server.spawn_map, MapId::from("meadowbrook"));
        assert_eq!(server.loot_protection.common, 45.0);
    }

    #[test]
    fn partial_document_overrides() {
        let config: FileConfig = toml::from_str(
            r#"
            [game]
            tick_rate = 10.0
            move_cooldown_ms = 200

            [game.combat]
            base_attack_speed_secs = 2.4

            [game.skills]
            xp_multipliers = [["attack", 2.0]]

            [store]
            database_url = "sqlite://test.db"
            "#,
        )
        .unwrap();

        let server = config.server_config();
        assert_eq!(server.tick_rate, 10.0);
        assert_eq!(server.move_cooldown, Duration::from_millis(200));
        assert_eq!(server.base_attack_speed_secs, 2.4);
        assert_eq!(server.xp_multiplier(SkillKind::Attack), 2.0);
        assert_eq!(server.xp_multiplier(SkillKind::Strength), 1.0);
        assert_eq!(config.store.database_url, "sqlite://test.db");
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<FileConfig>("[server]\nbogus = 1").is_err());
    }
}
