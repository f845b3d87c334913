//! Combat resolution: hit/damage formulas, XP award, death handling, and
//! auto-retaliation bookkeeping.
//!
//! The formulas are deterministic except for two explicit draws, the hit
//! roll and the damage roll, both taken from an injected RNG so tests can
//! seed them. The resolver treats players and entities as first-class on both
//! sides; player-versus-player is gated out at the handler boundary, not
//! here.

use gridvale_protocol::messages::{CombatTarget, CombatantRef};
use gridvale_protocol::{EntityInstanceId, PlayerId, SkillKind};
use gridvale_store::state::{CombatState, PlayerHp, SkillProgress};
use gridvale_store::{GameStore, StoreError};
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::entity::EntityCatalog;
use crate::skill;

/// Denominator of the accuracy rolls.
const ROLL_SCALE: f64 = 64.0;

#[derive(Debug, Error)]
pub enum CombatError {
    #[error("attacker not found")]
    AttackerGone,
    #[error("target not found")]
    TargetGone,
    #[error("target is already dead")]
    TargetAlreadyDead,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Either side of an attack.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Combatant {
    Player(PlayerId),
    Entity(EntityInstanceId),
}

impl From<CombatTarget> for Combatant {
    fn from(target: CombatTarget) -> Self {
        match target {
            CombatTarget::Player(id) => Combatant::Player(id),
            CombatTarget::Entity(id) => Combatant::Entity(id),
        }
    }
}

impl From<Combatant> for CombatTarget {
    fn from(c: Combatant) -> Self {
        match c {
            Combatant::Player(id) => CombatTarget::Player(id),
            Combatant::Entity(id) => CombatTarget::Entity(id),
        }
    }
}

/// Flattened stats of one side of an exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct CombatStats {
    pub attack_level: u32,
    pub strength_level: u32,
    pub defence_level: u32,
    pub attack_bonus: i32,
    pub strength_bonus: i32,
    pub defence_bonus: i32,
    pub current_hp: u32,
    pub max_hp: u32,
    pub name: String,
}

/// `(level + bonus + 8) * (64 + bonus) / 64`
pub fn attack_roll(stats: &CombatStats) -> f64 {
    (f64::from(stats.attack_level) + f64::from(stats.attack_bonus) + 8.0)
        * (ROLL_SCALE + f64::from(stats.attack_bonus))
        / ROLL_SCALE
}

/// `(level + bonus + 8) * (64 + bonus) / 64`
pub fn defence_roll(stats: &CombatStats) -> f64 {
    (f64::from(stats.defence_level) + f64::from(stats.defence_bonus) + 8.0)
        * (ROLL_SCALE + f64::from(stats.defence_bonus))
        / ROLL_SCALE
}

/// Accuracy clamped into `[0.05, 0.95]` so neither side is ever a sure thing.
pub fn hit_chance(attacker: &CombatStats, defender: &CombatStats) -> f64 {
    let attack = attack_roll(attacker);
    let defence = defence_roll(defender);
    if attack + defence == 0.0 {
        return 0.5;
    }
    (attack / (attack + defence)).clamp(0.05, 0.95)
}

/// `max(1, floor((strength_level * (strength_bonus + 64) + 320) / 640))`
pub fn max_hit(attacker: &CombatStats) -> u32 {
    let raw = (i64::from(attacker.strength_level) * (i64::from(attacker.strength_bonus) + 64)
        + 320)
        / 640;
    raw.max(1) as u32
}

/// The two random draws of one attack.
pub fn roll_attack(attacker: &CombatStats, defender: &CombatStats, rng: &mut impl Rng) -> (bool, u32) {
    let hit = rng.gen::<f64>() < hit_chance(attacker, defender);
    let damage = if hit {
        rng.gen_range(0..=max_hit(attacker))
    } else {
        0
    };
    (hit, damage)
}

/// XP the attacker earns for dealing `damage`. Nothing on a zero-damage hit.
pub fn attacker_xp(damage: u32) -> Vec<(SkillKind, u64)> {
    if damage == 0 {
        return vec![];
    }
    let damage = u64::from(damage);
    vec![
        (SkillKind::Attack, damage * 4),
        (SkillKind::Strength, damage * 4),
        (SkillKind::Hitpoints, damage * 4 / 3),
    ]
}

/// XP the defender earns: a flat Defence award for dodging, or at least one
/// Hitpoints XP for absorbing a hit.
pub fn defender_xp(hit: bool, damage: u32) -> Vec<(SkillKind, u64)> {
    if !hit {
        vec![(SkillKind::Defence, 4)]
    } else {
        vec![(SkillKind::Hitpoints, u64::from(damage / 3).max(1))]
    }
}

/// Everything the caller needs to broadcast and follow up on one attack.
#[derive(Clone, Debug)]
pub struct AttackReport {
    pub attacker: CombatantRef,
    pub defender: CombatantRef,
    pub hit: bool,
    pub damage: u32,
    pub defender_hp: u32,
    pub defender_died: bool,
    pub message: String,
}

pub struct CombatRules {
    /// Unarmed attack interval in seconds.
    pub base_attack_speed_secs: f64,
    pub death_anim_ticks: u64,
    pub entity_respawn_delay_secs: f64,
    /// Per-skill XP multipliers; skills not listed use 1.0.
    pub xp_multipliers: Vec<(SkillKind, f64)>,
}

impl Default for CombatRules {
    fn default() -> Self {
        Self {
            base_attack_speed_secs: 3.0,
            death_anim_ticks: 10,
            entity_respawn_delay_secs: 30.0,
            xp_multipliers: vec![],
        }
    }
}

impl CombatRules {
    fn xp_multiplier(&self, kind: SkillKind) -> f64 {
        self.xp_multipliers
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, m)| *m)
            .unwrap_or(1.0)
    }
}

/// Gathers a player's flattened combat stats: skill levels plus equipment
/// bonuses from the item catalog.
pub async fn player_stats(
    store: &GameStore,
    player: PlayerId,
) -> Result<CombatStats, CombatError> {
    let sheet = store.skills(player).await?;
    let hp = store.hp(player).await?;
    let equipment = store.equipment(player).await?;

    let mut attack_bonus = 0;
    let mut strength_bonus = 0;
    let mut defence_bonus = 0;
    for (_, stack) in equipment.iter() {
        if let Some(def) = store.catalog().get(stack.kind) {
            attack_bonus += def.attack_bonus;
            strength_bonus += def.strength_bonus;
            defence_bonus += def.defence_bonus;
        }
    }

    let name = store
        .username_of(player)
        .unwrap_or_else(|| format!("Player {}", player.0));

    Ok(CombatStats {
        attack_level: sheet.level(SkillKind::Attack),
        strength_level: sheet.level(SkillKind::Strength),
        defence_level: sheet.level(SkillKind::Defence),
        attack_bonus,
        strength_bonus,
        defence_bonus,
        current_hp: hp.current,
        max_hp: hp.max,
        name,
    })
}

fn entity_stats(catalog: &EntityCatalog, store: &GameStore, id: EntityInstanceId) -> Option<CombatStats> {
    let instance = store.entity(id)?;
    let kind = catalog.get(&instance.kind_name)?;
    Some(CombatStats {
        attack_level: kind.attack_level,
        strength_level: kind.strength_level,
        defence_level: kind.defence_level,
        attack_bonus: kind.attack_bonus,
        strength_bonus: kind.strength_bonus,
        defence_bonus: kind.defence_bonus,
        current_hp: instance.current_hp,
        max_hp: instance.max_hp,
        name: kind.display_name.to_owned(),
    })
}

/// The attack interval a player's equipped weapon grants them.
pub async fn player_attack_speed(
    store: &GameStore,
    player: PlayerId,
    rules: &CombatRules,
) -> Result<f64, CombatError> {
    let equipment = store.equipment(player).await?;
    let speed = equipment
        .get(gridvale_protocol::EquipmentSlot::Weapon)
        .and_then(|stack| store.catalog().get(stack.kind))
        .and_then(|def| def.attack_speed_secs)
        .unwrap_or(rules.base_attack_speed_secs);
    Ok(speed)
}

/// Resolves one attack: rolls, applies HP atomically, awards XP both ways,
/// begins entity death, and books auto-retaliation for player defenders.
///
/// The caller validates range, attackability, and rate limits before calling;
/// the resolver re-checks only liveness (the defender may have died between
/// validation and resolution).
pub async fn perform_attack(
    store: &GameStore,
    catalog: &EntityCatalog,
    rules: &CombatRules,
    current_tick: u64,
    attacker: Combatant,
    defender: Combatant,
    rng: &mut impl Rng,
) -> Result<AttackReport, CombatError> {
    let attacker_stats = match attacker {
        Combatant::Player(id) => player_stats(store, id).await?,
        Combatant::Entity(id) => {
            entity_stats(catalog, store, id).ok_or(CombatError::AttackerGone)?
        }
    };
    let defender_stats = match defender {
        Combatant::Player(id) => player_stats(store, id).await?,
        Combatant::Entity(id) => entity_stats(catalog, store, id).ok_or(CombatError::TargetGone)?,
    };

    if defender_stats.current_hp == 0 {
        return Err(CombatError::TargetAlreadyDead);
    }

    let (hit, damage) = roll_attack(&attacker_stats, &defender_stats, rng);
    let defender_hp = defender_stats.current_hp.saturating_sub(damage);
    let defender_died = defender_hp == 0;

    // Apply the HP update.
    match defender {
        Combatant::Player(id) => {
            store.set_hp(
                id,
                PlayerHp {
                    current: defender_hp,
                    max: defender_stats.max_hp,
                },
            );
        }
        Combatant::Entity(id) => {
            if defender_died {
                crate::entity::begin_death(
                    store,
                    id,
                    current_tick,
                    rules.death_anim_ticks,
                    rules.entity_respawn_delay_secs,
                )
                .await?;
                // Whoever was swinging at it stops.
                store.clear_combat_against(CombatTarget::Entity(id));
            } else {
                store.update_entity(id, |e| e.current_hp = defender_hp).await?;
            }
        }
    }

    // XP flows to player participants only.
    if let Combatant::Player(id) = attacker {
        award_xp(store, rules, id, &attacker_xp(damage)).await?;
    }
    if let Combatant::Player(id) = defender {
        if !defender_died {
            award_xp(store, rules, id, &defender_xp(hit, damage)).await?;
        }

        // Auto-retaliation: alive, setting on, not already fighting.
        if !defender_died
            && store.settings(id).auto_retaliate
            && store.combat_state(id).is_none()
        {
            let speed = player_attack_speed(store, id, rules).await?;
            store.set_combat_state(
                id,
                CombatState {
                    target: attacker.into(),
                    last_attack_tick: current_tick,
                    attack_speed_secs: speed,
                },
            );
            debug!(defender = %id, "auto-retaliation engaged");
        }
    }

    let message = combat_message(&attacker_stats.name, &defender_stats.name, hit, damage, defender_died);

    let to_ref = |c: Combatant, stats: &CombatStats| match c {
        Combatant::Player(id) => CombatantRef::Player {
            id,
            name: stats.name.clone(),
        },
        Combatant::Entity(id) => CombatantRef::Entity {
            id,
            name: stats.name.clone(),
        },
    };

    Ok(AttackReport {
        attacker: to_ref(attacker, &attacker_stats),
        defender: to_ref(defender, &defender_stats),
        hit,
        damage,
        defender_hp,
        defender_died,
        message,
    })
}

async fn award_xp(
    store: &GameStore,
    rules: &CombatRules,
    player: PlayerId,
    awards: &[(SkillKind, u64)],
) -> Result<(), CombatError> {
    if awards.is_empty() {
        return Ok(());
    }

    let mut sheet = store.skills(player).await?;
    for &(kind, amount) in awards {
        let progress = sheet.get(kind);
        let xp = progress.xp + amount;
        // Levels are a pure function of XP; hitpoints uses the same rule but
        // never drops below its starting level.
        let level = skill::level_for_xp(xp, rules.xp_multiplier(kind)).max(kind.starting_level());
        sheet.set(kind, SkillProgress { level, xp });
    }
    store.set_skills(player, sheet.clone());

    // Max HP tracks the hitpoints level.
    let hp = store.hp(player).await?;
    let new_max = sheet.level(SkillKind::Hitpoints);
    if new_max != hp.max {
        store.set_hp(
            player,
            PlayerHp {
                current: hp.current.min(new_max),
                max: new_max,
            },
        );
    }
    Ok(())
}

fn combat_message(attacker: &str, defender: &str, hit: bool, damage: u32, died: bool) -> String {
    let mut message = if !hit {
        format!("{attacker} attacked {defender} but missed")
    } else if damage == 0 {
        format!("{attacker} hit {defender} but dealt no damage")
    } else {
        format!("{attacker} hit {defender} for {damage} damage")
    };
    if died {
        message.push_str(&format!(" - {defender} died!"));
    }
    message
}

#[cfg(test)]
mod tests {
    use gridvale_protocol::{EntityState, MapId, Role, TilePos};
    use gridvale_map::EntitySpawn;
    use gridvale_store::{DurableStore, GameStoreConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn stats(attack: u32, strength: u32, defence: u32, bonus: i32) -> CombatStats {
        CombatStats {
            attack_level: attack,
            strength_level: strength,
            defence_level: defence,
            attack_bonus: bonus,
            strength_bonus: bonus,
            defence_bonus: bonus,
            current_hp: 10,
            max_hp: 10,
            name: "x".into(),
        }
    }

    #[test]
    fn rolls_are_positive_and_chance_clamped() {
        let weak = stats(1, 1, 1, 0);
        let strong = stats(99, 99, 99, 60);

        assert!(attack_roll(&weak) > 0.0);
        assert!(defence_roll(&weak) > 0.0);

        let chance = hit_chance(&strong, &weak);
        assert!((0.05..=0.95).contains(&chance));
        assert_eq!(hit_chance(&strong, &weak), 0.95);
        assert_eq!(hit_chance(&weak, &strong), 0.05);
    }

    #[test]
    fn max_hit_formula() {
        // strength 50, bonus 50: floor((50 * 114 + 320) / 640) = 9
        assert_eq!(max_hit(&stats(50, 50, 50, 50)), 9);
        // Minimum of 1 for the weakest stats.
        assert_eq!(max_hit(&stats(1, 1, 1, 0)), 1);
    }

    #[test]
    fn xp_awards() {
        assert_eq!(
            attacker_xp(6),
            vec![
                (SkillKind::Attack, 24),
                (SkillKind::Strength, 24),
                (SkillKind::Hitpoints, 8),
            ]
        );
        assert!(attacker_xp(0).is_empty());

        assert_eq!(defender_xp(false, 0), vec![(SkillKind::Defence, 4)]);
        assert_eq!(defender_xp(true, 0), vec![(SkillKind::Hitpoints, 1)]);
        assert_eq!(defender_xp(true, 9), vec![(SkillKind::Hitpoints, 3)]);
    }

    async fn world() -> (std::sync::Arc<GameStore>, EntityCatalog, PlayerId) {
        let durable = DurableStore::in_memory().await.unwrap();
        let record = durable
            .create_player(
                "alice",
                "hash",
                Role::Player,
                &MapId::from("field"),
                TilePos::new(5, 5),
                10,
            )
            .await
            .unwrap();
        let store = GameStore::open(durable, GameStoreConfig::default())
            .await
            .unwrap();
        store.register_online(record.id, "alice");
        (std::sync::Arc::new(store), EntityCatalog::new(), record.id)
    }

    fn spawn_goblin(store: &GameStore, catalog: &EntityCatalog) -> EntityInstanceId {
        let instance = catalog
            .instantiate(
                &MapId::from("field"),
                &EntitySpawn {
                    spawn_point_id: 0,
                    entity_id: "goblin".into(),
                    position: TilePos::new(5, 6),
                    wander_radius: None,
                    aggro_override: None,
                    disengage_override: None,
                },
            )
            .unwrap();
        let id = instance.id;
        store.insert_entity(instance);
        id
    }

    #[tokio::test]
    async fn player_kills_entity_within_bounded_attempts() {
        let (store, catalog, player) = world().await;
        let goblin = spawn_goblin(&store, &catalog);
        let rules = CombatRules::default();
        let mut rng = StdRng::seed_from_u64(1);

        // A seasoned fighter so the kill lands well inside the attempt bound.
        let mut sheet = store.skills(player).await.unwrap();
        for kind in [SkillKind::Attack, SkillKind::Strength] {
            sheet.set(
                kind,
                gridvale_store::state::SkillProgress {
                    level: 50,
                    xp: crate::skill::xp_for_level(50, 1.0),
                },
            );
        }
        store.set_skills(player, sheet);

        let mut died = false;
        for tick in 0..100u64 {
            match perform_attack(
                &store,
                &catalog,
                &rules,
                tick,
                Combatant::Player(player),
                Combatant::Entity(goblin),
                &mut rng,
            )
            .await
            {
                Ok(report) => {
                    if report.defender_died {
                        assert_eq!(report.defender_hp, 0);
                        died = true;
                        break;
                    }
                }
                Err(CombatError::TargetAlreadyDead) => unreachable!("we stop at the kill"),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(died, "goblin survived 100 attacks");

        // Death bookkeeping: dying, scheduled, and not attackable.
        let e = store.entity(goblin).unwrap();
        assert_eq!(e.state, EntityState::Dying);
        assert!(e.death_tick.is_some());
        assert!(e.respawn_at.is_some());
        assert!(!e.state.is_attackable());

        // Attacking a dying entity reports it as already dead.
        let err = perform_attack(
            &store,
            &catalog,
            &rules,
            200,
            Combatant::Player(player),
            Combatant::Entity(goblin),
            &mut rng,
        )
        .await;
        assert!(matches!(err, Err(CombatError::TargetAlreadyDead)));

        // The kill paid out XP.
        let sheet = store.skills(player).await.unwrap();
        assert!(sheet.get(SkillKind::Attack).xp > 0);
        assert!(sheet.get(SkillKind::Strength).xp > 0);
    }

    #[tokio::test]
    async fn entity_attack_triggers_auto_retaliation() {
        let (store, catalog, player) = world().await;
        let goblin = spawn_goblin(&store, &catalog);
        let rules = CombatRules::default();
        let mut rng = StdRng::seed_from_u64(3);

        assert!(store.combat_state(player).is_none());

        let report = perform_attack(
            &store,
            &catalog,
            &rules,
            50,
            Combatant::Entity(goblin),
            Combatant::Player(player),
            &mut rng,
        )
        .await
        .unwrap();

        // Hit or miss, the defender books a retaliation.
        let state = store.combat_state(player).expect("retaliation set");
        assert_eq!(state.target, CombatTarget::Entity(goblin));
        assert_eq!(state.last_attack_tick, 50);
        assert_eq!(state.attack_speed_secs, rules.base_attack_speed_secs);

        // Defender-side XP: defence for a dodge, hitpoints for a hit.
        let sheet = store.skills(player).await.unwrap();
        if report.hit {
            assert!(sheet.get(SkillKind::Hitpoints).xp >= 1);
        } else {
            assert_eq!(sheet.get(SkillKind::Defence).xp, 4);
        }
    }

    #[tokio::test]
    async fn auto_retaliation_respects_setting_and_existing_combat() {
        let (store, catalog, player) = world().await;
        let goblin = spawn_goblin(&store, &catalog);
        let rules = CombatRules::default();
        let mut rng = StdRng::seed_from_u64(4);

        store.set_auto_retaliate(player, false);
        perform_attack(
            &store,
            &catalog,
            &rules,
            10,
            Combatant::Entity(goblin),
            Combatant::Player(player),
            &mut rng,
        )
        .await
        .unwrap();
        assert!(store.combat_state(player).is_none());
    }
}
