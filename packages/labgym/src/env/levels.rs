// packages/labgym/src/env/levels.rs
//! Level catalogue
//!
//! DMLab-30 levels live under a path prefix inside the engine. Callers may
//! pass the bare name and have it resolved.

use std::borrow::Cow;

/// Prefix the engine expects for DMLab-30 levels
pub const DMLAB30_PREFIX: &str = "contributed/dmlab30/";

pub const CORE_LEVELS: [&str; 12] = [
    "lt_chasm",
    "lt_hallway_slope",
    "lt_horseshoe_color",
    "lt_space_bounce_hard",
    "nav_maze_random_goal_01",
    "nav_maze_random_goal_02",
    "nav_maze_random_goal_03",
    "nav_maze_static_01",
    "nav_maze_static_02",
    "nav_maze_static_03",
    "seekavoid_arena_01",
    "stairway_to_melon",
];

/// DMLab-30 plus the two skymaze levels, sorted
pub const DMLAB30_LEVELS: [&str; 32] = [
    "explore_goal_locations_large",
    "explore_goal_locations_small",
    "explore_object_locations_large",
    "explore_object_locations_small",
    "explore_object_rewards_few",
    "explore_object_rewards_many",
    "explore_obstructed_goals_large",
    "explore_obstructed_goals_small",
    "language_answer_quantitative_question",
    "language_execute_random_task",
    "language_select_described_object",
    "language_select_located_object",
    "lasertag_one_opponent_large",
    "lasertag_one_opponent_small",
    "lasertag_three_opponents_large",
    "lasertag_three_opponents_small",
    "natlab_fixed_large_map",
    "natlab_varying_map_randomized",
    "natlab_varying_map_regrowth",
    "psychlab_arbitrary_visuomotor_mapping",
    "psychlab_continuous_recognition",
    "psychlab_sequential_comparison",
    "psychlab_visual_search",
    "rooms_collect_good_objects_test",
    "rooms_collect_good_objects_train",
    "rooms_exploit_deferred_effects_test",
    "rooms_exploit_deferred_effects_train",
    "rooms_keys_doors_puzzle",
    "rooms_select_nonmatching_object",
    "rooms_watermaze",
    "skymaze_irreversible_path_hard",
    "skymaze_irreversible_path_varied",
];

/// Core levels followed by DMLab-30 levels
pub fn all_levels() -> Vec<&'static str> {
    CORE_LEVELS.iter().chain(DMLAB30_LEVELS.iter()).copied().collect()
}

/// Map a bare level name to the path the engine loads.
///
/// Names containing `/` are already paths and pass through unchanged.
pub fn resolve_level(level_name: &str) -> Cow<'_, str> {
    if level_name.contains('/') {
        return Cow::Borrowed(level_name);
    }
    if DMLAB30_LEVELS.contains(&level_name) {
        return Cow::Owned(format!("{}{}", DMLAB30_PREFIX, level_name));
    }
    Cow::Borrowed(level_name)
}

/// Whether a (possibly resolved) level name is in the catalogue
pub fn is_known_level(level: &str) -> bool {
    match level.strip_prefix(DMLAB30_PREFIX) {
        Some(bare) => DMLAB30_LEVELS.contains(&bare),
        None => CORE_LEVELS.contains(&level),
    }
}
