// packages/labgym/src/env/mod.rs
//! Standard reinforcement-learning environment interface
//!
//! - **Environment**: reset/step/close plus the two space descriptors
//! - **Spaces**: tensors, observations, actions and their descriptors
//! - **LabEnv**: adapter from an [`Engine`](crate::engine::Engine) to `Environment`
//! - **Levels**: level catalogue and name resolution
//! - **Wrappers**: observation/action reshaping
//!
//! The trait is synchronous and object-safe. In-process environments, the
//! supervised [`SubprocessEnv`](crate::runtime::SubprocessEnv) and the
//! wrappers all implement it, so wrappers compose over either.

pub mod lab;
pub mod levels;
pub mod spaces;
pub mod wrappers;

use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use lab::{LabConfig, LabEnv};
pub use spaces::{Action, BoxSpace, Dtype, Observation, Space, Tensor, TensorData};
pub use wrappers::{ActionDiscretize, SplitRgbd};

/// Auxiliary diagnostics returned next to observations
pub type Info = BTreeMap<String, serde_json::Value>;

/// Extra reset parameters
pub type Options = BTreeMap<String, serde_json::Value>;

/// Outcome of a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub observation: Observation,
    pub reward: f64,
    /// Episode ended inside the environment
    pub terminated: bool,
    /// Episode was cut short from outside (step limit)
    pub truncated: bool,
    pub info: Info,
}

impl StepResult {
    pub fn is_done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Gymnasium-style environment
pub trait Environment: Send {
    fn observation_space(&self) -> &Space;

    fn action_space(&self) -> &Space;

    /// Start a new episode. `seed` makes the episode reproducible.
    fn reset(&mut self, seed: Option<i64>, options: Option<Options>) -> Result<(Observation, Info)>;

    fn step(&mut self, action: &Action) -> Result<StepResult>;

    /// Release engine resources. Further calls are undefined per environment.
    fn close(&mut self) -> Result<()>;
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn observation_space(&self) -> &Space {
        (**self).observation_space()
    }

    fn action_space(&self) -> &Space {
        (**self).action_space()
    }

    fn reset(&mut self, seed: Option<i64>, options: Option<Options>) -> Result<(Observation, Info)> {
        (**self).reset(seed, options)
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        (**self).step(action)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
