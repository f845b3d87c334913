//! Game-mechanic knobs the server crate consumes.
//!
//! The binary crate loads the full configuration document and builds this
//! struct; defaults here are the documented fallbacks.

use std::time::Duration;

use gridvale_protocol::{MapId, Rarity, SkillKind, TilePos};

use crate::combat::CombatRules;

/// Per-rarity second counts for ground-item clocks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RarityTimes {
    pub common: f64,
    pub uncommon: f64,
    pub rare: f64,
    pub epic: f64,
}

impl RarityTimes {
    pub fn get(&self, rarity: Rarity) -> f64 {
        match rarity {
            Rarity::Common => self.common,
            Rarity::Uncommon => self.uncommon,
            Rarity::Rare => self.rare,
            Rarity::Epic => self.epic,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub max_players: usize,
    /// Simultaneous connections allowed before the play state.
    pub max_connections: usize,
    pub motd: String,

    /// Ticks per second of the game loop.
    pub tick_rate: f64,
    pub move_cooldown: Duration,
    pub animation_duration: Duration,

    /// Rate limit between explicit `CMD_ATTACK` actions; auto-attacks are
    /// governed by weapon speed instead.
    pub attack_cooldown: Duration,
    pub base_attack_speed_secs: f64,
    pub death_anim_ticks: u64,
    pub entity_respawn_delay_secs: f64,
    pub death_respawn_delay_secs: f64,

    pub spawn_map: MapId,
    pub spawn_position: TilePos,

    pub visibility_radius: u32,
    pub pickup_range: u32,

    pub chat_max_len: usize,
    pub say_radius: u32,

    pub loot_protection: RarityTimes,
    pub despawn: RarityTimes,

    pub chunk_size: u32,
    pub max_chunk_radius: u32,
    /// How far (in tiles) a chunk-query center may sit from the player.
    pub max_chunk_query_distance: u32,

    pub xp_multipliers: Vec<(SkillKind, f64)>,

    pub lock_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Frames queued per session before sends start failing.
    pub session_queue_frames: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_players: 200,
            max_connections: 1024,
            motd: "Welcome to Gridvale.".to_owned(),
            tick_rate: 20.0,
            move_cooldown: Duration::from_millis(150),
            animation_duration: Duration::from_millis(300),
            attack_cooldown: Duration::from_millis(600),
            base_attack_speed_secs: 3.0,
            death_anim_ticks: 10,
            entity_respawn_delay_secs: 30.0,
            death_respawn_delay_secs: 5.0,
            spawn_map: MapId::from("meadowbrook"),
            spawn_position: TilePos::new(25, 25),
            visibility_radius: 32,
            pickup_range: 1,
            chat_max_len: 256,
            say_radius: 32,
            loot_protection: RarityTimes {
                common: 45.0,
                uncommon: 60.0,
                rare: 90.0,
                epic: 120.0,
            },
            despawn: RarityTimes {
                common: 120.0,
                uncommon: 180.0,
                rare: 300.0,
                epic: 600.0,
            },
            chunk_size: 16,
            max_chunk_radius: 2,
            max_chunk_query_distance: 32,
            xp_multipliers: vec![],
            lock_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            session_queue_frames: 256,
        }
    }
}

impl ServerConfig {
    pub fn combat_rules(&self) -> CombatRules {
        CombatRules {
            base_attack_speed_secs: self.base_attack_speed_secs,
            death_anim_ticks: self.death_anim_ticks,
            entity_respawn_delay_secs: self.entity_respawn_delay_secs,
            xp_multipliers: self.xp_multipliers.clone(),
        }
    }

    pub fn xp_multiplier(&self, kind: SkillKind) -> f64 {
        self.xp_multipliers
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, m)| *m)
            .unwrap_or(1.0)
    }

    /// Tick length at the configured rate.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate)
    }
}
