// packages/labgym/src/env/wrappers.rs
//! Observation and action reshaping wrappers
//!
//! Both wrappers are generic over any [`Environment`], so they compose over
//! an in-process [`LabEnv`](crate::env::LabEnv) and a supervised
//! [`SubprocessEnv`](crate::runtime::SubprocessEnv) alike.

use crate::env::spaces::{Action, Observation, Space, Tensor};
use crate::env::{Environment, Info, Options, StepResult};
use crate::utils::errors::{EngineError, Result};
use std::collections::BTreeMap;

/// IMPALA discrete action set on the 7-dim action vector.
///
/// Columns: look left/right, look down/up, strafe, move, fire, jump, crouch.
pub const DEFAULT_ACTION_TABLE: [[i32; 7]; 9] = [
    [0, 0, 0, 1, 0, 0, 0],   // forward
    [0, 0, 0, -1, 0, 0, 0],  // backward
    [0, 0, -1, 0, 0, 0, 0],  // strafe left
    [0, 0, 1, 0, 0, 0, 0],   // strafe right
    [-20, 0, 0, 0, 0, 0, 0], // look left
    [20, 0, 0, 0, 0, 0, 0],  // look right
    [-20, 0, 0, 1, 0, 0, 0], // forward + look left
    [20, 0, 0, 1, 0, 0, 0],  // forward + look right
    [0, 0, 0, 0, 1, 0, 0],   // fire
];

/// Splits a 4-channel RGBD observation into `"RGB"` and `"Depth"`
pub struct SplitRgbd<E> {
    env: E,
    observation_space: Space,
    channels_first: bool,
}

impl<E: Environment> SplitRgbd<E> {
    /// Fails unless the wrapped observation space is a 4-channel box.
    ///
    /// Layout is detected from the shape: `(4, H, W)` is channels-first,
    /// `(H, W, 4)` channels-last.
    pub fn new(env: E) -> Result<Self> {
        let space = env.observation_space().as_box().ok_or_else(|| {
            EngineError::Config("SplitRgbd requires a box observation space".to_string())
        })?;

        let channels_first = match (space.shape.first(), space.shape.last()) {
            (Some(4), _) => true,
            (_, Some(4)) => false,
            _ => {
                return Err(EngineError::Config(format!(
                    "SplitRgbd requires 4-channel observations, got shape {:?}",
                    space.shape
                )))
            }
        };

        let mut spaces = BTreeMap::new();
        spaces.insert(
            "RGB".to_string(),
            Space::Box(space.select_channels(channels_first, 0..3)?),
        );
        spaces.insert(
            "Depth".to_string(),
            Space::Box(space.select_channels(channels_first, 3..4)?),
        );

        Ok(Self {
            env,
            observation_space: Space::Dict(spaces),
            channels_first,
        })
    }

    pub fn channels_first(&self) -> bool {
        self.channels_first
    }

    pub fn inner(&self) -> &E {
        &self.env
    }

    pub fn into_inner(self) -> E {
        self.env
    }

    fn split(&self, observation: Observation) -> Result<Observation> {
        let tensor = match observation {
            Observation::Array(tensor) => tensor,
            Observation::Dict(_) => {
                return Err(EngineError::Engine(
                    "SplitRgbd received a dict observation".to_string(),
                ))
            }
        };
        let mut parts: BTreeMap<String, Tensor> = BTreeMap::new();
        parts.insert("RGB".to_string(), tensor.select_channels(self.channels_first, 0..3)?);
        parts.insert("Depth".to_string(), tensor.select_channels(self.channels_first, 3..4)?);
        Ok(Observation::Dict(parts))
    }
}

impl<E: Environment> Environment for SplitRgbd<E> {
    fn observation_space(&self) -> &Space {
        &self.observation_space
    }

    fn action_space(&self) -> &Space {
        self.env.action_space()
    }

    fn reset(&mut self, seed: Option<i64>, options: Option<Options>) -> Result<(Observation, Info)> {
        let (observation, info) = self.env.reset(seed, options)?;
        Ok((self.split(observation)?, info))
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        let mut result = self.env.step(action)?;
        result.observation = self.split(result.observation)?;
        Ok(result)
    }

    fn close(&mut self) -> Result<()> {
        self.env.close()
    }
}

/// Exposes a `Discrete(N)` action space over a table of action vectors
pub struct ActionDiscretize<E> {
    env: E,
    table: Vec<Vec<i32>>,
    action_space: Space,
}

impl<E: Environment> ActionDiscretize<E> {
    /// Use [`DEFAULT_ACTION_TABLE`]
    pub fn new(env: E) -> Result<Self> {
        let table = DEFAULT_ACTION_TABLE.iter().map(|row| row.to_vec()).collect();
        Self::with_table(env, table)
    }

    /// Rows must be non-empty, of equal length and members of the wrapped
    /// action space.
    pub fn with_table(env: E, table: Vec<Vec<i32>>) -> Result<Self> {
        let width = table
            .first()
            .map(Vec::len)
            .ok_or_else(|| EngineError::Config("action table must not be empty".to_string()))?;
        if width == 0 || table.iter().any(|row| row.len() != width) {
            return Err(EngineError::Config(
                "action table rows must be non-empty and of equal length".to_string(),
            ));
        }
        for (index, row) in table.iter().enumerate() {
            if !env.action_space().contains_action(&Action::from_i32(row.clone())) {
                return Err(EngineError::Config(format!(
                    "action table row {} is outside the wrapped action space",
                    index
                )));
            }
        }

        let action_space = Space::Discrete { n: table.len() as u64 };
        Ok(Self {
            env,
            table,
            action_space,
        })
    }

    pub fn table(&self) -> &[Vec<i32>] {
        &self.table
    }

    pub fn inner(&self) -> &E {
        &self.env
    }

    pub fn into_inner(self) -> E {
        self.env
    }

    /// Action vector for discrete index `action`
    pub fn action(&self, action: &Action) -> Result<Action> {
        match action {
            Action::Discrete(index) => self
                .table
                .get(*index as usize)
                .map(|row| Action::from_i32(row.clone()))
                .ok_or_else(|| {
                    EngineError::InvalidAction(format!(
                        "discrete action {} outside 0..{}",
                        index,
                        self.table.len()
                    ))
                }),
            Action::Array(_) => Err(EngineError::InvalidAction(
                "expected a discrete action".to_string(),
            )),
        }
    }
}

impl<E: Environment> Environment for ActionDiscretize<E> {
    fn observation_space(&self) -> &Space {
        self.env.observation_space()
    }

    fn action_space(&self) -> &Space {
        &self.action_space
    }

    fn reset(&mut self, seed: Option<i64>, options: Option<Options>) -> Result<(Observation, Info)> {
        self.env.reset(seed, options)
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        let mapped = self.action(action)?;
        self.env.step(&mapped)
    }

    fn close(&mut self) -> Result<()> {
        self.env.close()
    }
}
