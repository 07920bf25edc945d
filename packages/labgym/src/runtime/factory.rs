// packages/labgym/src/runtime/factory.rs
//! Serializable environment factories
//!
//! A factory is a pure value: an entry-point name plus keyword arguments.
//! It crosses the process boundary as JSON and is turned back into an
//! environment inside the worker by looking the entry point up in an
//! [`EntryPoints`] table.

use crate::env::lab::{LabEnv, LAB_ENV_ENTRY_POINT};
use crate::env::Environment;
use crate::runtime::protocol::DEFAULT_MAX_FRAME_BYTES;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Keyword arguments of a factory
pub type Kwargs = serde_json::Map<String, Value>;

/// Constructor registered under an entry-point name
pub type EntryPointFn = fn(&Kwargs) -> Result<Box<dyn Environment>>;

/// Recipe for building one environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvFactory {
    pub entry_point: String,
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl EnvFactory {
    pub fn new(entry_point: impl Into<String>, kwargs: Kwargs) -> Self {
        Self {
            entry_point: entry_point.into(),
            kwargs,
        }
    }

    /// Factory for a [`LabEnv`] on `level`
    pub fn lab(level: impl Into<String>) -> Self {
        let mut kwargs = Kwargs::new();
        kwargs.insert("level_name".to_string(), Value::String(level.into()));
        Self::new(LAB_ENV_ENTRY_POINT, kwargs)
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Invoke the factory. Only meaningful inside the process that will own
    /// the environment.
    pub fn build(&self, entry_points: &EntryPoints) -> Result<Box<dyn Environment>> {
        let constructor = entry_points.resolve(&self.entry_point)?;
        constructor(&self.kwargs)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| EngineError::Protocol(format!("failed to encode factory: {}", e)))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| EngineError::Protocol(format!("failed to decode factory: {}", e)))
    }
}

impl fmt::Display for EnvFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entry_point)?;
        if let Some(Value::String(level)) = self.kwargs.get("level_name") {
            write!(f, "({})", level)?;
        }
        Ok(())
    }
}

/// Entry-point name → constructor
#[derive(Clone, Default)]
pub struct EntryPoints {
    table: HashMap<String, EntryPointFn>,
}

impl EntryPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table containing the crate's own environments
    pub fn builtin() -> Self {
        let mut entry_points = Self::new();
        entry_points.insert(LAB_ENV_ENTRY_POINT, |kwargs| {
            Ok(Box::new(LabEnv::from_kwargs(kwargs)?) as Box<dyn Environment>)
        });
        entry_points
    }

    pub fn insert(&mut self, name: impl Into<String>, constructor: EntryPointFn) -> &mut Self {
        self.table.insert(name.into(), constructor);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Result<EntryPointFn> {
        self.table
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownEnvironment(format!("no entry point named '{}'", name)))
    }
}

impl fmt::Debug for EntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.table.keys().collect();
        names.sort();
        f.debug_struct("EntryPoints").field("names", &names).finish()
    }
}

/// Everything an exec'd worker needs to build its environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    /// Registered id the factory came from, re-registered in the worker
    pub env_id: Option<String>,
    pub factory: EnvFactory,
    /// Largest frame either side may send
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

impl WorkerBootstrap {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| EngineError::Protocol(format!("failed to encode bootstrap: {}", e)))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| EngineError::Protocol(format!("failed to decode bootstrap: {}", e)))
    }
}
