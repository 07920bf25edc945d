// packages/labgym/src/env/spaces.rs
//! Observation/action values and the spaces that describe them
//!
//! Values are flat row-major buffers with an explicit shape. Spaces are plain
//! serializable descriptors: the supervisor forwards them verbatim from the
//! worker's environment.

use crate::utils::errors::{EngineError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    U8,
    I32,
    F64,
}

impl Dtype {
    /// Smallest and largest representable value, as f64
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            Dtype::U8 => (0.0, 255.0),
            Dtype::I32 => (i32::MIN as f64, i32::MAX as f64),
            Dtype::F64 => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, Dtype::F64)
    }
}

/// Typed flat storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorData {
    U8(Vec<u8>),
    I32(Vec<i32>),
    F64(Vec<f64>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::U8(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            TensorData::U8(_) => Dtype::U8,
            TensorData::I32(_) => Dtype::I32,
            TensorData::F64(_) => Dtype::F64,
        }
    }

    /// Element `index` widened to f64
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        match self {
            TensorData::U8(v) => v.get(index).map(|x| *x as f64),
            TensorData::I32(v) => v.get(index).map(|x| *x as f64),
            TensorData::F64(v) => v.get(index).copied(),
        }
    }
}

/// N-dimensional array with a flat row-major buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Build a tensor, checking that the buffer matches the shape
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EngineError::Engine(format!(
                "tensor shape {:?} needs {} elements, buffer has {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn from_u8(shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        Self::new(shape, TensorData::U8(data))
    }

    pub fn from_i32(shape: Vec<usize>, data: Vec<i32>) -> Result<Self> {
        Self::new(shape, TensorData::I32(data))
    }

    pub fn from_f64(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        Self::new(shape, TensorData::F64(data))
    }

    /// One-dimensional `i32` tensor, the usual action payload
    pub fn vector_i32(data: Vec<i32>) -> Self {
        Self {
            shape: vec![data.len()],
            data: TensorData::I32(data),
        }
    }

    pub fn zeros(shape: Vec<usize>, dtype: Dtype) -> Self {
        let len: usize = shape.iter().product();
        let data = match dtype {
            Dtype::U8 => TensorData::U8(vec![0; len]),
            Dtype::I32 => TensorData::I32(vec![0; len]),
            Dtype::F64 => TensorData::F64(vec![0.0; len]),
        };
        Self { shape, data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::U8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            TensorData::F64(v) => Some(v),
            _ => None,
        }
    }

    /// Keep only channels `range` along the first axis (`channels_first`) or
    /// the last axis.
    pub fn select_channels(&self, channels_first: bool, range: Range<usize>) -> Result<Tensor> {
        let shape = channel_shape(&self.shape, channels_first, &range)?;
        let data = match &self.data {
            TensorData::U8(v) => TensorData::U8(gather_channels(v, &self.shape, channels_first, &range)),
            TensorData::I32(v) => TensorData::I32(gather_channels(v, &self.shape, channels_first, &range)),
            TensorData::F64(v) => TensorData::F64(gather_channels(v, &self.shape, channels_first, &range)),
        };
        Tensor::new(shape, data)
    }
}

fn channel_shape(shape: &[usize], channels_first: bool, range: &Range<usize>) -> Result<Vec<usize>> {
    let axis = if channels_first { 0 } else { shape.len().saturating_sub(1) };
    let channels = shape.get(axis).copied().ok_or_else(|| {
        EngineError::Engine("cannot select channels of a scalar tensor".to_string())
    })?;
    if range.start >= range.end || range.end > channels {
        return Err(EngineError::Engine(format!(
            "channel range {:?} out of bounds for {} channels",
            range, channels
        )));
    }
    let mut out = shape.to_vec();
    out[axis] = range.len();
    Ok(out)
}

fn gather_channels<T: Copy>(
    data: &[T],
    shape: &[usize],
    channels_first: bool,
    range: &Range<usize>,
) -> Vec<T> {
    if channels_first {
        let plane: usize = shape[1..].iter().product();
        data[range.start * plane..range.end * plane].to_vec()
    } else {
        let channels = shape[shape.len() - 1];
        data.chunks(channels)
            .flat_map(|pixel| pixel[range.clone()].iter().copied())
            .collect()
    }
}

/// Observation returned by `reset` and `step`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observation {
    Array(Tensor),
    Dict(BTreeMap<String, Tensor>),
}

impl Observation {
    pub fn as_array(&self) -> Option<&Tensor> {
        match self {
            Observation::Array(t) => Some(t),
            Observation::Dict(_) => None,
        }
    }

    /// Named component of a dict observation
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        match self {
            Observation::Array(_) => None,
            Observation::Dict(map) => map.get(name),
        }
    }
}

/// Action accepted by `step`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Array(Tensor),
    Discrete(u64),
}

impl Action {
    /// Vector action from raw `i32` components
    pub fn from_i32(values: Vec<i32>) -> Self {
        Action::Array(Tensor::vector_i32(values))
    }
}

/// Bounded n-dimensional box with per-element bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxSpace {
    pub low: Vec<f64>,
    pub high: Vec<f64>,
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

impl BoxSpace {
    pub fn new(low: Vec<f64>, high: Vec<f64>, shape: Vec<usize>, dtype: Dtype) -> Result<Self> {
        let len: usize = shape.iter().product();
        if low.len() != len || high.len() != len {
            return Err(EngineError::Engine(format!(
                "box bounds must have {} elements for shape {:?}",
                len, shape
            )));
        }
        if low.iter().zip(&high).any(|(lo, hi)| lo > hi) {
            return Err(EngineError::Engine("box low bound exceeds high bound".to_string()));
        }
        Ok(Self { low, high, shape, dtype })
    }

    /// Same scalar bounds for every element
    pub fn uniform(low: f64, high: f64, shape: Vec<usize>, dtype: Dtype) -> Self {
        let len: usize = shape.iter().product();
        Self {
            low: vec![low; len],
            high: vec![high; len],
            shape,
            dtype,
        }
    }

    pub fn contains(&self, tensor: &Tensor) -> bool {
        if tensor.shape() != self.shape.as_slice() || tensor.dtype() != self.dtype {
            return false;
        }
        (0..tensor.len()).all(|i| match tensor.data().get_f64(i) {
            Some(x) => x >= self.low[i] && x <= self.high[i],
            None => false,
        })
    }

    /// Draw a uniformly distributed member
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Tensor {
        let (dtype_lo, dtype_hi) = self.dtype.bounds();
        let mut values = Vec::with_capacity(self.low.len());
        for (lo, hi) in self.low.iter().zip(&self.high) {
            let lo = lo.max(dtype_lo);
            let hi = hi.min(dtype_hi);
            let value = if self.dtype.is_integer() {
                rng.gen_range(lo.ceil() as i64..=hi.floor() as i64) as f64
            } else {
                match (lo.is_finite(), hi.is_finite()) {
                    (true, true) if lo < hi => rng.gen_range(lo..hi),
                    (true, true) => lo,
                    (true, false) => lo - rng.gen::<f64>().max(f64::MIN_POSITIVE).ln(),
                    (false, true) => hi + rng.gen::<f64>().max(f64::MIN_POSITIVE).ln(),
                    (false, false) => rng.gen_range(-1.0..1.0),
                }
            };
            values.push(value);
        }

        let data = match self.dtype {
            Dtype::U8 => TensorData::U8(values.iter().map(|v| *v as u8).collect()),
            Dtype::I32 => TensorData::I32(values.iter().map(|v| *v as i32).collect()),
            Dtype::F64 => TensorData::F64(values),
        };
        Tensor {
            shape: self.shape.clone(),
            data,
        }
    }

    /// Sub-box covering channels `range`, see [`Tensor::select_channels`]
    pub fn select_channels(&self, channels_first: bool, range: Range<usize>) -> Result<BoxSpace> {
        let shape = channel_shape(&self.shape, channels_first, &range)?;
        let low = gather_channels(&self.low, &self.shape, channels_first, &range);
        let high = gather_channels(&self.high, &self.shape, channels_first, &range);
        BoxSpace::new(low, high, shape, self.dtype)
    }
}

/// Description of a set of valid observations or actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Space {
    Box(BoxSpace),
    Discrete { n: u64 },
    Dict(BTreeMap<String, Space>),
}

impl Space {
    /// Shape of a box space
    pub fn shape(&self) -> Option<&[usize]> {
        match self {
            Space::Box(b) => Some(&b.shape),
            _ => None,
        }
    }

    pub fn as_box(&self) -> Option<&BoxSpace> {
        match self {
            Space::Box(b) => Some(b),
            _ => None,
        }
    }

    pub fn contains_observation(&self, observation: &Observation) -> bool {
        match (self, observation) {
            (Space::Box(b), Observation::Array(t)) => b.contains(t),
            (Space::Dict(spaces), Observation::Dict(values)) => {
                spaces.len() == values.len()
                    && spaces.iter().all(|(name, space)| match (space, values.get(name)) {
                        (Space::Box(b), Some(t)) => b.contains(t),
                        _ => false,
                    })
            }
            _ => false,
        }
    }

    pub fn contains_action(&self, action: &Action) -> bool {
        match (self, action) {
            (Space::Box(b), Action::Array(t)) => b.contains(t),
            (Space::Discrete { n }, Action::Discrete(i)) => i < n,
            _ => false,
        }
    }

    /// Draw a random action from this space
    pub fn sample_action<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Action> {
        match self {
            Space::Box(b) => Ok(Action::Array(b.sample(rng))),
            Space::Discrete { n } if *n > 0 => Ok(Action::Discrete(rng.gen_range(0..*n))),
            Space::Discrete { .. } => Err(EngineError::Engine(
                "cannot sample from an empty discrete space".to_string(),
            )),
            Space::Dict(_) => Err(EngineError::Engine(
                "dict spaces do not describe actions".to_string(),
            )),
        }
    }

    /// All-zero action for a box space, index 0 for a discrete one
    pub fn zero_action(&self) -> Result<Action> {
        match self {
            Space::Box(b) => Ok(Action::Array(Tensor::zeros(b.shape.clone(), b.dtype))),
            Space::Discrete { .. } => Ok(Action::Discrete(0)),
            Space::Dict(_) => Err(EngineError::Engine(
                "dict spaces do not describe actions".to_string(),
            )),
        }
    }
}
