//! The XP table and level math.
//!
//! Total XP to reach level `L` is
//! `floor(sum(i = 1..L-1) of floor(i + 300 * 2^(i/7)) / 4)`, precomputed once
//! as a prefix-sum table. Per-skill multipliers scale the thresholds, so a
//! skill with multiplier 2.0 needs twice the XP for the same level.

use std::sync::OnceLock;

pub const MAX_LEVEL: u32 = 99;

fn base_table() -> &'static [u64; MAX_LEVEL as usize] {
    static TABLE: OnceLock<[u64; MAX_LEVEL as usize]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u64; MAX_LEVEL as usize];
        let mut total = 0u64;
        for level in 1..MAX_LEVEL {
            total += (f64::from(level) + 300.0 * 2f64.powf(f64::from(level) / 7.0)) as u64;
            table[level as usize] = total / 4;
        }
        table
    })
}

/// Total XP required to reach `level`, scaled by `multiplier`. Level 1 is 0;
/// levels above [`MAX_LEVEL`] clamp.
pub fn xp_for_level(level: u32, multiplier: f64) -> u64 {
    if level <= 1 {
        return 0;
    }
    let level = level.min(MAX_LEVEL);
    (base_table()[(level - 1) as usize] as f64 * multiplier) as u64
}

/// The level an XP total corresponds to. Binary search over the scaled table.
pub fn level_for_xp(xp: u64, multiplier: f64) -> u32 {
    if xp == 0 {
        return 1;
    }

    let (mut low, mut high) = (1u32, MAX_LEVEL);
    while low < high {
        let mid = (low + high + 1) / 2;
        if xp >= xp_for_level(mid, multiplier) {
            low = mid;
        } else {
            high = mid - 1;
        }
    }
    low
}

/// XP remaining until the next level, or 0 at the cap.
pub fn xp_to_next_level(xp: u64, multiplier: f64) -> u64 {
    let level = level_for_xp(xp, multiplier);
    if level >= MAX_LEVEL {
        return 0;
    }
    xp_for_level(level + 1, multiplier).saturating_sub(xp)
}

/// Progress into the current level as a percentage in `0.0..=100.0`.
pub fn progress_to_next_level(xp: u64, multiplier: f64) -> f32 {
    let level = level_for_xp(xp, multiplier);
    if level >= MAX_LEVEL {
        return 100.0;
    }

    let current = xp_for_level(level, multiplier);
    let next = xp_for_level(level + 1, multiplier);
    let range = next.saturating_sub(current);
    if range == 0 {
        return 100.0;
    }

    let into = xp.saturating_sub(current) as f64 / range as f64 * 100.0;
    into.clamp(0.0, 100.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_thresholds() {
        // Classic table values.
        assert_eq!(xp_for_level(1, 1.0), 0);
        assert_eq!(xp_for_level(2, 1.0), 83);
        assert_eq!(xp_for_level(10, 1.0), 1154);
        assert_eq!(xp_for_level(99, 1.0), 13_034_431);
    }

    #[test]
    fn table_is_strictly_increasing() {
        for level in 2..=MAX_LEVEL {
            assert!(
                xp_for_level(level, 1.0) > xp_for_level(level - 1, 1.0),
                "level {level}"
            );
        }
    }

    #[test]
    fn level_lookup_inverts_thresholds() {
        for multiplier in [1.0, 0.5, 2.0] {
            for level in 2..=MAX_LEVEL {
                let threshold = xp_for_level(level, multiplier);
                assert_eq!(level_for_xp(threshold, multiplier), level);
                assert_eq!(level_for_xp(threshold - 1, multiplier), level - 1);
            }
        }
    }

    #[test]
    fn zero_xp_is_level_one() {
        assert_eq!(level_for_xp(0, 1.0), 1);
    }

    #[test]
    fn cap_behavior() {
        let above_cap = xp_for_level(MAX_LEVEL, 1.0) + 1_000_000;
        assert_eq!(level_for_xp(above_cap, 1.0), MAX_LEVEL);
        assert_eq!(xp_to_next_level(above_cap, 1.0), 0);
        assert_eq!(progress_to_next_level(above_cap, 1.0), 100.0);
        assert_eq!(xp_for_level(150, 1.0), xp_for_level(MAX_LEVEL, 1.0));
    }

    #[test]
    fn progress_interpolates() {
        let at_level = xp_for_level(40, 1.0);
        assert_eq!(progress_to_next_level(at_level, 1.0), 0.0);

        let halfway = at_level + (xp_for_level(41, 1.0) - at_level) / 2;
        let progress = progress_to_next_level(halfway, 1.0);
        assert!((49.0..=51.0).contains(&progress), "got {progress}");
    }

    #[test]
    fn multiplier_scales_thresholds() {
        assert_eq!(xp_for_level(50, 2.0), xp_for_level(50, 1.0) * 2);
        // Cheaper skills level faster for the same XP.
        let xp = xp_for_level(30, 1.0);
        assert!(level_for_xp(xp, 0.5) > level_for_xp(xp, 2.0));
    }
}
