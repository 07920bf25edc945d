// packages/labgym/src/engine/sim.rs
//! Deterministic software engine
//!
//! Renders a first-person view of a square arena with a goal pillar using a
//! per-column ray cast. Walking into the goal pays a reward and respawns it.
//! Everything is derived from the level name and the reset seed, so equal
//! seeds and equal action sequences give bit-identical frames.
//!
//! Like the native engine it stands in for, only one instance may be live
//! per process; constructing a second one fails until the first is closed.

use crate::engine::{ActionSpec, Engine, EngineSettings, ObservationSpec};
use crate::env::levels::{is_known_level, resolve_level};
use crate::env::spaces::{Dtype, Tensor};
use crate::utils::errors::{EngineError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Process-global slot; set while an instance is live
static ENGINE_LIVE: AtomicBool = AtomicBool::new(false);

const ARENA_SIZE: f64 = 10.0;
const WALL_MARGIN: f64 = 0.3;
const FIELD_OF_VIEW: f64 = PI / 2.0;
const LOOK_SCALE: f64 = 0.002;
const MOVE_SPEED: f64 = 0.15;
const GOAL_RADIUS: f64 = 0.6;
const GOAL_REWARD: f64 = 10.0;
const MAX_DEPTH: f64 = ARENA_SIZE * 1.5;
const SKY: [u8; 3] = [110, 160, 220];
const FLOOR: [u8; 3] = [90, 80, 70];
const GOAL: [u8; 3] = [40, 220, 60];

pub const OBSERVATION_NAMES: [&str; 6] = [
    "RGB_INTERLEAVED",
    "RGBD_INTERLEAVED",
    "RGB",
    "RGBD",
    "DEBUG.POS.TRANS",
    "DEBUG.POS.ROT",
];

/// (name, min, max) for each action dimension
const ACTIONS: [(&str, i32, i32); 7] = [
    ("LOOK_LEFT_RIGHT_PIXELS_PER_FRAME", -512, 512),
    ("LOOK_DOWN_UP_PIXELS_PER_FRAME", -512, 512),
    ("STRAFE_LEFT_RIGHT", -1, 1),
    ("MOVE_BACK_FORWARD", -1, 1),
    ("FIRE", 0, 1),
    ("JUMP", 0, 1),
    ("CROUCH", 0, 1),
];

struct Episode {
    rng: StdRng,
    x: f64,
    y: f64,
    yaw: f64,
    pitch: f64,
    goal: (f64, f64),
    frame: u64,
}

/// Software stand-in for the native engine
pub struct SimLab {
    level: String,
    observation_names: Vec<String>,
    width: usize,
    height: usize,
    episode_frames: u64,
    level_hash: u64,
    palette: [[u8; 3]; 4],
    episode: Option<Episode>,
    holds_slot: bool,
}

impl SimLab {
    /// Load `level` and claim this process's engine slot
    pub fn new(
        level: &str,
        observations: &[String],
        settings: &EngineSettings,
        renderer: &str,
    ) -> Result<Self> {
        let level = resolve_level(level).into_owned();
        if !is_known_level(&level) {
            return Err(EngineError::Engine(format!("level '{}' not found", level)));
        }
        if renderer != "software" && renderer != "hardware" {
            return Err(EngineError::Engine(format!(
                "unknown renderer '{}', expected 'software' or 'hardware'",
                renderer
            )));
        }
        for name in observations {
            if !OBSERVATION_NAMES.contains(&name.as_str()) {
                return Err(EngineError::Engine(format!("unknown observation '{}'", name)));
            }
        }

        let width: usize = parse_setting(settings, "width", 320)?;
        let height: usize = parse_setting(settings, "height", 240)?;
        let fps: u64 = parse_setting(settings, "fps", 60)?;
        let episode_seconds: u64 = parse_setting(settings, "episodeLengthSeconds", 60)?;
        if width == 0 || height == 0 || fps == 0 {
            return Err(EngineError::Engine(
                "width, height and fps must be positive".to_string(),
            ));
        }
        let episode_frames = fps.checked_mul(episode_seconds).ok_or_else(|| {
            EngineError::Engine(format!(
                "episode of {} seconds at {} fps is too long",
                episode_seconds, fps
            ))
        })?;

        if ENGINE_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::Engine(
                "an engine instance is already live in this process".to_string(),
            ));
        }

        let level_hash = fnv1a(level.as_bytes());
        debug!("Loaded level {} ({}x{} @ {} fps)", level, width, height, fps);

        Ok(Self {
            palette: palette_for(level_hash),
            level,
            observation_names: observations.to_vec(),
            width,
            height,
            episode_frames,
            level_hash,
            episode: None,
            holds_slot: true,
        })
    }

    /// Whether any instance currently holds the process slot
    pub fn is_live_in_process() -> bool {
        ENGINE_LIVE.load(Ordering::SeqCst)
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    fn release(&mut self) {
        if self.holds_slot {
            self.holds_slot = false;
            self.episode = None;
            ENGINE_LIVE.store(false, Ordering::SeqCst);
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.holds_slot {
            Ok(())
        } else {
            Err(EngineError::Engine("engine is closed".to_string()))
        }
    }

    fn spawn_point(rng: &mut StdRng) -> (f64, f64) {
        (
            rng.gen_range(1.0..ARENA_SIZE - 1.0),
            rng.gen_range(1.0..ARENA_SIZE - 1.0),
        )
    }

    /// Per-pixel RGBD, row-major
    fn render(&self, episode: &Episode) -> Vec<[u8; 4]> {
        let (w, h) = (self.width, self.height);
        let mut pixels = vec![[0u8; 4]; w * h];
        let horizon = h as f64 / 2.0 + episode.pitch * h as f64 * 0.5;

        let (goal_dx, goal_dy) = (episode.goal.0 - episode.x, episode.goal.1 - episode.y);
        let goal_dist = goal_dx.hypot(goal_dy);
        let goal_bearing = goal_dy.atan2(goal_dx);
        let goal_half_width = (GOAL_RADIUS / goal_dist.max(1e-3)).atan();

        for col in 0..w {
            let rel = ((col as f64 + 0.5) / w as f64 - 0.5) * FIELD_OF_VIEW;
            let angle = episode.yaw + rel;
            let (mut dist, wall) = cast_ray(episode.x, episode.y, angle);
            let mut color = shade(self.palette[wall], dist);

            if wrap_angle(goal_bearing - angle).abs() < goal_half_width && goal_dist < dist {
                dist = goal_dist;
                color = shade(GOAL, dist);
            }

            let perpendicular = (dist * rel.cos()).max(0.05);
            let column_height = h as f64 / perpendicular;
            let top = horizon - column_height / 2.0;
            let bottom = horizon + column_height / 2.0;
            let depth = (255.0 * (1.0 - (dist / MAX_DEPTH).min(1.0))) as u8;

            for row in 0..h {
                let r = row as f64 + 0.5;
                let pixel = if r < top {
                    [SKY[0], SKY[1], SKY[2], 0]
                } else if r > bottom {
                    let below = ((r - horizon) / (h as f64 - horizon).max(1.0)).clamp(0.0, 1.0);
                    [FLOOR[0], FLOOR[1], FLOOR[2], (below * 255.0) as u8]
                } else {
                    [color[0], color[1], color[2], depth]
                };
                pixels[row * w + col] = pixel;
            }
        }
        pixels
    }

    fn observation(&self, name: &str, episode: &Episode, frame: &[[u8; 4]]) -> Result<Tensor> {
        let (w, h) = (self.width, self.height);
        match name {
            "RGB_INTERLEAVED" => Tensor::from_u8(
                vec![h, w, 3],
                frame.iter().flat_map(|p| [p[0], p[1], p[2]]).collect(),
            ),
            "RGBD_INTERLEAVED" => Tensor::from_u8(
                vec![h, w, 4],
                frame.iter().flat_map(|p| p.iter().copied()).collect(),
            ),
            "RGB" => Tensor::from_u8(vec![3, h, w], planar(frame, 3)),
            "RGBD" => Tensor::from_u8(vec![4, h, w], planar(frame, 4)),
            "DEBUG.POS.TRANS" => {
                Tensor::from_f64(vec![3], vec![episode.x * 100.0, episode.y * 100.0, 0.0])
            }
            "DEBUG.POS.ROT" => Tensor::from_f64(
                vec![3],
                vec![episode.pitch.to_degrees(), episode.yaw.to_degrees(), 0.0],
            ),
            other => Err(EngineError::Engine(format!("unknown observation '{}'", other))),
        }
    }
}

impl Engine for SimLab {
    fn observation_spec(&self) -> Vec<ObservationSpec> {
        let (w, h) = (self.width, self.height);
        OBSERVATION_NAMES
            .iter()
            .map(|name| {
                let (shape, dtype) = match *name {
                    "RGB_INTERLEAVED" => (vec![h, w, 3], Dtype::U8),
                    "RGBD_INTERLEAVED" => (vec![h, w, 4], Dtype::U8),
                    "RGB" => (vec![3, h, w], Dtype::U8),
                    "RGBD" => (vec![4, h, w], Dtype::U8),
                    _ => (vec![3], Dtype::F64),
                };
                ObservationSpec {
                    name: name.to_string(),
                    shape,
                    dtype,
                }
            })
            .collect()
    }

    fn action_spec(&self) -> Vec<ActionSpec> {
        ACTIONS
            .iter()
            .map(|(name, min, max)| ActionSpec {
                name: name.to_string(),
                min: *min,
                max: *max,
            })
            .collect()
    }

    fn reset(&mut self, seed: i64) -> Result<()> {
        self.check_open()?;
        let seed = if seed < 0 {
            rand::thread_rng().gen::<u64>()
        } else {
            seed as u64
        };

        let mut rng = StdRng::seed_from_u64(seed ^ self.level_hash);
        let (x, y) = Self::spawn_point(&mut rng);
        let yaw = rng.gen_range(0.0..2.0 * PI);
        let goal = Self::spawn_point(&mut rng);
        debug!("Reset {} with seed {}", self.level, seed);

        self.episode = Some(Episode {
            rng,
            x,
            y,
            yaw,
            pitch: 0.0,
            goal,
            frame: 0,
        });
        Ok(())
    }

    fn step(&mut self, action: &[i32], num_steps: u32) -> Result<f64> {
        self.check_open()?;
        if action.len() != ACTIONS.len() {
            return Err(EngineError::InvalidAction(format!(
                "expected {} action dimensions, got {}",
                ACTIONS.len(),
                action.len()
            )));
        }
        for (value, (name, min, max)) in action.iter().zip(ACTIONS.iter()) {
            if value < min || value > max {
                return Err(EngineError::InvalidAction(format!(
                    "{} = {} outside [{}, {}]",
                    name, value, min, max
                )));
            }
        }

        let episode_frames = self.episode_frames;
        let episode = self
            .episode
            .as_mut()
            .ok_or_else(|| EngineError::Engine("step called before reset".to_string()))?;

        let mut reward = 0.0;
        for _ in 0..num_steps {
            if episode.frame >= episode_frames {
                break;
            }
            episode.yaw = (episode.yaw + action[0] as f64 * LOOK_SCALE).rem_euclid(2.0 * PI);
            episode.pitch = (episode.pitch + action[1] as f64 * LOOK_SCALE).clamp(-0.8, 0.8);

            let forward = action[3] as f64 * MOVE_SPEED;
            let strafe = action[2] as f64 * MOVE_SPEED;
            let (sin, cos) = episode.yaw.sin_cos();
            episode.x = (episode.x + cos * forward - sin * strafe)
                .clamp(WALL_MARGIN, ARENA_SIZE - WALL_MARGIN);
            episode.y = (episode.y + sin * forward + cos * strafe)
                .clamp(WALL_MARGIN, ARENA_SIZE - WALL_MARGIN);

            let to_goal = (episode.goal.0 - episode.x).hypot(episode.goal.1 - episode.y);
            if to_goal < GOAL_RADIUS {
                reward += GOAL_REWARD;
                episode.goal = Self::spawn_point(&mut episode.rng);
            }
            episode.frame += 1;
        }
        Ok(reward)
    }

    fn is_running(&self) -> bool {
        self.episode
            .as_ref()
            .map(|e| self.holds_slot && e.frame < self.episode_frames)
            .unwrap_or(false)
    }

    fn observations(&self) -> Result<BTreeMap<String, Tensor>> {
        self.check_open()?;
        let episode = self
            .episode
            .as_ref()
            .ok_or_else(|| EngineError::Engine("observations requested before reset".to_string()))?;

        let needs_frame = self
            .observation_names
            .iter()
            .any(|name| !name.starts_with("DEBUG."));
        let frame = if needs_frame { self.render(episode) } else { Vec::new() };

        self.observation_names
            .iter()
            .map(|name| Ok((name.clone(), self.observation(name, episode, &frame)?)))
            .collect()
    }

    fn close(&mut self) -> Result<()> {
        debug!("Closing engine for level {}", self.level);
        self.release();
        Ok(())
    }
}

impl Drop for SimLab {
    fn drop(&mut self) {
        self.release();
    }
}

fn parse_setting<T: std::str::FromStr>(settings: &EngineSettings, key: &str, default: T) -> Result<T> {
    match settings.get(key) {
        Some(raw) => raw.parse().map_err(|_| {
            EngineError::Engine(format!("invalid value '{}' for config key '{}'", raw, key))
        }),
        None => Ok(default),
    }
}

/// Distance to the arena wall along `angle`, and which wall was hit
fn cast_ray(x: f64, y: f64, angle: f64) -> (f64, usize) {
    let (dy, dx) = angle.sin_cos();
    let mut best = (f64::INFINITY, 0);
    let candidates = [
        (dx > 1e-9, (ARENA_SIZE - x) / dx, 0),
        (dx < -1e-9, -x / dx, 1),
        (dy > 1e-9, (ARENA_SIZE - y) / dy, 2),
        (dy < -1e-9, -y / dy, 3),
    ];
    for (valid, t, wall) in candidates {
        if valid && t < best.0 {
            best = (t, wall);
        }
    }
    best
}

fn shade(color: [u8; 3], dist: f64) -> [u8; 3] {
    let factor = 1.0 / (1.0 + 0.15 * dist);
    [
        (color[0] as f64 * factor) as u8,
        (color[1] as f64 * factor) as u8,
        (color[2] as f64 * factor) as u8,
    ]
}

fn wrap_angle(angle: f64) -> f64 {
    (angle + PI).rem_euclid(2.0 * PI) - PI
}

fn planar(frame: &[[u8; 4]], channels: usize) -> Vec<u8> {
    (0..channels)
        .flat_map(|c| frame.iter().map(move |p| p[c]))
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ *b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

fn palette_for(hash: u64) -> [[u8; 3]; 4] {
    let mut rng = StdRng::seed_from_u64(hash);
    let mut palette = [[0u8; 3]; 4];
    for wall in palette.iter_mut() {
        for channel in wall.iter_mut() {
            *channel = rng.gen_range(60..=250);
        }
    }
    palette
}
