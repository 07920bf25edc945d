// packages/labgym/src/registry.rs
//! Environment registry
//!
//! Maps string ids such as `labgym/lt_chasm-v0` to factories. The registry
//! is process-local: a worker launched from a registered id re-registers the
//! same id with the factory it was handed before building it.

use crate::env::lab::LAB_ENV_ENTRY_POINT;
use crate::env::Environment;
use crate::runtime::factory::{EntryPoints, EnvFactory, Kwargs};
use crate::runtime::supervisor::SubprocessEnv;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

pub(crate) static REGISTRY: Lazy<RwLock<HashMap<String, EnvFactory>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Id under which [`register`] files a level
pub fn env_id(level_name: &str, version: u32) -> String {
    format!("labgym/{}-v{}", level_name, version)
}

/// Register a lab level. `kwargs` become the [`LabEnv`](crate::env::LabEnv)
/// defaults, with `level_name` filled in. Returns the id.
pub fn register(level_name: &str, version: u32, kwargs: Kwargs) -> String {
    let id = env_id(level_name, version);
    let mut merged = kwargs;
    merged.insert("level_name".to_string(), Value::String(level_name.to_string()));
    register_factory(&id, EnvFactory::new(LAB_ENV_ENTRY_POINT, merged));
    id
}

/// Register (or replace) an arbitrary factory under `id`
pub fn register_factory(id: &str, factory: EnvFactory) {
    debug!("Registering {} -> {}", id, factory);
    REGISTRY.write().insert(id.to_string(), factory);
}

/// Factory registered under `id`
pub fn spec(id: &str) -> Result<EnvFactory> {
    REGISTRY
        .read()
        .get(id)
        .cloned()
        .ok_or_else(|| EngineError::UnknownEnvironment(id.to_string()))
}

pub fn is_registered(id: &str) -> bool {
    REGISTRY.read().contains_key(id)
}

/// Sorted ids of everything registered in this process
pub fn registered_ids() -> Vec<String> {
    let mut ids: Vec<String> = REGISTRY.read().keys().cloned().collect();
    ids.sort();
    ids
}

/// Supervised handle for `id`, using the loaded supervisor configuration
pub fn make(id: &str) -> Result<SubprocessEnv> {
    let config = EngineConfig::load()?;
    SubprocessEnv::from_id(id, config.supervisor)
}

/// Build `id` directly in this process.
///
/// Subject to the engine's one-instance-per-process rule.
pub fn make_in_process(id: &str) -> Result<Box<dyn Environment>> {
    spec(id)?.build(&EntryPoints::builtin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    #[test]
    fn test_register_merges_level_name() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("renderer".to_string(), json!("software"));
        let id = register("nav_maze_static_01", 2, kwargs);

        assert_eq!(id, "labgym/nav_maze_static_01-v2");
        assert!(is_registered(&id));
        let factory = spec(&id).unwrap();
        assert_eq!(factory.entry_point, LAB_ENV_ENTRY_POINT);
        assert_eq!(factory.kwargs["level_name"], "nav_maze_static_01");
        assert_eq!(factory.kwargs["renderer"], "software");
        assert!(registered_ids().contains(&id));
    }

    #[test]
    fn test_unknown_id() {
        assert!(!is_registered("labgym/missing-v0"));
        assert!(matches!(
            spec("labgym/missing-v0"),
            Err(EngineError::UnknownEnvironment(_))
        ));
    }

    #[test]
    fn test_register_factory_replaces() {
        register_factory("custom/replace-v0", EnvFactory::lab("lt_chasm"));
        register_factory("custom/replace-v0", EnvFactory::lab("lt_hallway_slope"));
        assert_eq!(
            spec("custom/replace-v0").unwrap().kwargs["level_name"],
            "lt_hallway_slope"
        );
    }

    #[test]
    #[serial]
    fn test_make_in_process() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("width".to_string(), json!(8));
        kwargs.insert("height".to_string(), json!(6));
        let id = register("seekavoid_arena_01", 0, kwargs);

        let mut env = make_in_process(&id).unwrap();
        let (obs, _) = env.reset(Some(3), None).unwrap();
        assert_eq!(obs.as_array().unwrap().shape(), &[6, 8, 3]);
        env.close().unwrap();
    }
}
