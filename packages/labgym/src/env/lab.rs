// packages/labgym/src/env/lab.rs
//! Adapter from an [`Engine`] to the [`Environment`] interface
//!
//! Builds the observation/action spaces from the engine's specs, tracks the
//! per-episode step count for truncation and repeats the last observation
//! once the engine reports the episode over.

use crate::engine::{Engine, EngineSettings, SimLab};
use crate::env::levels::resolve_level;
use crate::env::spaces::{Action, BoxSpace, Dtype, Observation, Space, Tensor};
use crate::env::{Environment, Info, Options, StepResult};
use crate::runtime::factory::Kwargs;
use crate::utils::errors::{EngineError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Entry-point name under which [`LabEnv::from_kwargs`] is registered
pub const LAB_ENV_ENTRY_POINT: &str = "labgym.env:LabEnv";

/// Construction parameters of a [`LabEnv`]
#[derive(Debug, Clone, PartialEq)]
pub struct LabConfig {
    /// Level to load, bare or resolved
    pub level_name: String,

    /// Observation names requested from the engine
    pub observations: Vec<String>,

    /// `software` or `hardware`
    pub renderer: String,

    pub width: u32,
    pub height: u32,
    pub fps: u32,

    /// Truncate after this many steps, 0 = unlimited
    pub max_num_steps: u64,

    /// Reserved for compatibility, unused
    pub render_mode: Option<String>,

    /// Extra engine config, forwarded as strings
    pub extra: BTreeMap<String, String>,
}

impl LabConfig {
    pub fn new(level_name: impl Into<String>) -> Self {
        Self {
            level_name: level_name.into(),
            observations: vec!["RGB_INTERLEAVED".to_string()],
            renderer: "software".to_string(),
            width: 240,
            height: 320,
            fps: 60,
            max_num_steps: 0,
            render_mode: None,
            extra: BTreeMap::new(),
        }
    }

    /// Parse keyword arguments. Unrecognised keys become extra engine config.
    pub fn from_kwargs(kwargs: &Kwargs) -> Result<Self> {
        let level_name = kwargs
            .get("level_name")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Config("missing string kwarg 'level_name'".to_string()))?;
        let mut config = Self::new(level_name);

        for (key, value) in kwargs {
            match key.as_str() {
                "level_name" => {}
                "observations" => config.observations = string_list(key, value)?,
                "renderer" => config.renderer = stringify(value),
                "width" => config.width = integer(key, value)?,
                "height" => config.height = integer(key, value)?,
                "fps" => config.fps = integer(key, value)?,
                "max_num_steps" => config.max_num_steps = integer(key, value)?,
                "render_mode" => {
                    config.render_mode = match value {
                        Value::Null => None,
                        other => Some(stringify(other)),
                    }
                }
                _ => {
                    config.extra.insert(key.clone(), stringify(value));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// At least one observation, each requested once
    pub fn validate(&self) -> Result<()> {
        if self.observations.is_empty() {
            return Err(EngineError::Config(
                "at least one observation must be requested".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for name in &self.observations {
            if !seen.insert(name.as_str()) {
                return Err(EngineError::Config(format!("observation '{}' requested twice", name)));
            }
        }
        Ok(())
    }

    /// String config map handed to the engine
    pub fn engine_settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::new();
        settings.insert("width".to_string(), self.width.to_string());
        settings.insert("height".to_string(), self.height.to_string());
        settings.insert("fps".to_string(), self.fps.to_string());
        settings.extend(self.extra.clone());
        settings
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn integer<T: TryFrom<u64>>(key: &str, value: &Value) -> Result<T> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| EngineError::Config(format!("kwarg '{}' must be a non-negative integer", key)))
}

fn string_list(key: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| EngineError::Config(format!("kwarg '{}' must list strings", key)))
            })
            .collect(),
        Value::String(single) => Ok(vec![single.clone()]),
        _ => Err(EngineError::Config(format!("kwarg '{}' must be a list of strings", key))),
    }
}

/// Gymnasium-style environment backed by an engine instance
pub struct LabEnv {
    engine: Box<dyn Engine>,
    config: LabConfig,
    observation_space: Space,
    action_space: Space,
    num_steps: u64,
    last_observation: Option<Observation>,
}

impl LabEnv {
    /// Construct on top of the software engine
    pub fn new(config: LabConfig) -> Result<Self> {
        config.validate()?;
        let level = resolve_level(&config.level_name).into_owned();
        let engine = SimLab::new(
            &level,
            &config.observations,
            &config.engine_settings(),
            &config.renderer,
        )?;
        Self::with_engine(config, Box::new(engine))
    }

    /// Entry point used by the factory table
    pub fn from_kwargs(kwargs: &Kwargs) -> Result<Self> {
        Self::new(LabConfig::from_kwargs(kwargs)?)
    }

    /// Wrap an already-loaded engine
    pub fn with_engine(config: LabConfig, engine: Box<dyn Engine>) -> Result<Self> {
        config.validate()?;
        let specs = engine.observation_spec();
        let mut spaces = BTreeMap::new();
        for name in &config.observations {
            let spec = specs
                .iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| EngineError::Engine(format!("engine has no observation '{}'", name)))?;
            let space = match spec.dtype {
                Dtype::U8 => BoxSpace::uniform(0.0, 255.0, spec.shape.clone(), Dtype::U8),
                _ => BoxSpace::uniform(f64::NEG_INFINITY, f64::INFINITY, spec.shape.clone(), Dtype::F64),
            };
            spaces.insert(name.clone(), Space::Box(space));
        }

        let observation_space = if config.observations.len() == 1 {
            spaces
                .remove(&config.observations[0])
                .ok_or_else(|| EngineError::Engine("observation space missing".to_string()))?
        } else {
            Space::Dict(spaces)
        };

        let actions = engine.action_spec();
        let action_space = Space::Box(BoxSpace::new(
            actions.iter().map(|a| a.min as f64).collect(),
            actions.iter().map(|a| a.max as f64).collect(),
            vec![actions.len()],
            Dtype::I32,
        )?);

        info!(
            "Created lab environment for {} ({} observations, {} action dims)",
            config.level_name,
            config.observations.len(),
            actions.len()
        );

        Ok(Self {
            engine,
            config,
            observation_space,
            action_space,
            num_steps: 0,
            last_observation: None,
        })
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    /// Steps taken in the current episode
    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }

    fn observe(&mut self) -> Result<Observation> {
        let mut raw = self.engine.observations()?;
        let observation = if self.config.observations.len() == 1 {
            let name = &self.config.observations[0];
            let tensor = raw
                .remove(name)
                .ok_or_else(|| EngineError::Engine(format!("engine did not produce '{}'", name)))?;
            Observation::Array(tensor)
        } else {
            let mut values = BTreeMap::new();
            for name in &self.config.observations {
                let tensor = raw
                    .remove(name)
                    .ok_or_else(|| EngineError::Engine(format!("engine did not produce '{}'", name)))?;
                values.insert(name.clone(), tensor);
            }
            Observation::Dict(values)
        };
        self.last_observation = Some(observation.clone());
        Ok(observation)
    }
}

fn action_values(action: &Action) -> Result<&[i32]> {
    match action {
        Action::Array(tensor) => tensor
            .as_i32()
            .ok_or_else(|| EngineError::InvalidAction(format!("expected i32 action, got {:?}", tensor.dtype()))),
        Action::Discrete(i) => Err(EngineError::InvalidAction(format!(
            "discrete action {} given to a box action space",
            i
        ))),
    }
}

impl Environment for LabEnv {
    fn observation_space(&self) -> &Space {
        &self.observation_space
    }

    fn action_space(&self) -> &Space {
        &self.action_space
    }

    fn reset(&mut self, seed: Option<i64>, _options: Option<Options>) -> Result<(Observation, Info)> {
        self.num_steps = 0;
        self.engine.reset(seed.unwrap_or(-1))?;
        Ok((self.observe()?, Info::new()))
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        let reward = self.engine.step(action_values(action)?, 1)?;
        self.num_steps += 1;

        let terminated = !self.engine.is_running();
        let truncated = !terminated
            && self.config.max_num_steps > 0
            && self.num_steps >= self.config.max_num_steps;

        let observation = if terminated {
            debug!("Episode terminated after {} steps", self.num_steps);
            self.last_observation
                .clone()
                .ok_or_else(|| EngineError::Engine("no observation recorded before termination".to_string()))?
        } else {
            self.observe()?
        };

        Ok(StepResult {
            observation,
            reward,
            terminated,
            truncated,
            info: Info::new(),
        })
    }

    fn close(&mut self) -> Result<()> {
        self.engine.close()
    }
}

/// Tensor helper for tests and callers that build observations by hand
pub fn zero_observation(space: &Space) -> Option<Observation> {
    match space {
        Space::Box(b) => Some(Observation::Array(Tensor::zeros(b.shape.clone(), b.dtype))),
        Space::Dict(spaces) => spaces
            .iter()
            .map(|(name, s)| s.as_box().map(|b| (name.clone(), Tensor::zeros(b.shape.clone(), b.dtype))))
            .collect::<Option<BTreeMap<_, _>>>()
            .map(Observation::Dict),
        Space::Discrete { .. } => None,
    }
}
