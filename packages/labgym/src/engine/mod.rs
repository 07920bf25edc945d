// packages/labgym/src/engine/mod.rs
//! Native engine boundary
//!
//! The engine is an opaque capability: given a level and a string config
//! map it renders observations and consumes action vectors. Real engines
//! keep process-global state, so at most one instance may be live in a
//! process. [`SimLab`] is a deterministic software engine with the same
//! contract and the same one-instance rule.

pub mod sim;

use crate::env::spaces::{Dtype, Tensor};
use crate::utils::errors::Result;
use std::collections::BTreeMap;

pub use sim::SimLab;

/// One observation the engine can produce
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

/// One dimension of the action vector
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub name: String,
    pub min: i32,
    pub max: i32,
}

/// Engine configuration: every value is a string
pub type EngineSettings = BTreeMap<String, String>;

pub trait Engine: Send {
    /// Specs for every observation the engine can produce
    fn observation_spec(&self) -> Vec<ObservationSpec>;

    fn action_spec(&self) -> Vec<ActionSpec>;

    /// Start an episode. A negative seed lets the engine pick one.
    fn reset(&mut self, seed: i64) -> Result<()>;

    /// Apply `action` for `num_steps` frames and return the summed reward
    fn step(&mut self, action: &[i32], num_steps: u32) -> Result<f64>;

    /// False once the episode has ended
    fn is_running(&self) -> bool;

    /// Current values of the observations requested at construction
    fn observations(&self) -> Result<BTreeMap<String, Tensor>>;

    fn close(&mut self) -> Result<()>;
}
