//! Per-frame lip-sync driver.
//!
//! Samples a viseme timeline against an audio-derived clock and writes
//! smoothed blend-shape weights to a mesh-agnostic sink.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use colloquy_core::types::ProcessedViseme;

use crate::viseme::BLEND_SHAPES;

/// ~60 Hz.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Fraction of the gap to the target weight closed each frame.
const SMOOTHING: f64 = 0.35;

/// Visemes shorter than this play proportionally faster.
const REFERENCE_DURATION: f64 = 0.12;
const MAX_SPEED_FACTOR: f64 = 2.0;

const WEIGHT_EPSILON: f64 = 1e-4;

/// Receives blend-shape weights, keyed by blend-shape name.
pub trait WeightSink: Send + Sync {
    fn set_weight(&self, blend_shape: &str, weight: f64);
}

/// Clock the timeline is sampled against, in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Finished,
}

pub struct AnimationDriver {
    timeline: Vec<ProcessedViseme>,
    start_time: Option<f64>,
    weights: HashMap<&'static str, f64>,
    generation: u64,
    sink: Arc<dyn WeightSink>,
}

fn ease_in_out(t: f64) -> f64 {
    if t < 0.5 {
        2.0 * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
    }
}

fn speed_factor(duration: f64) -> f64 {
    if duration <= 0.0 {
        return MAX_SPEED_FACTOR;
    }
    (REFERENCE_DURATION / duration).clamp(1.0, MAX_SPEED_FACTOR)
}

/// Target weight of a viseme at `elapsed` seconds into the utterance.
fn target_weight(viseme: &ProcessedViseme, elapsed: f64) -> f64 {
    if viseme.duration_seconds <= 0.0 {
        return 0.0;
    }
    let progress = ((elapsed - viseme.start_seconds) / viseme.duration_seconds
        * speed_factor(viseme.duration_seconds))
    .clamp(0.0, 1.0);
    (ease_in_out(progress) * PI).sin() * viseme.weight
}

impl AnimationDriver {
    pub fn new(sink: Arc<dyn WeightSink>) -> Self {
        Self {
            timeline: Vec::new(),
            start_time: None,
            weights: HashMap::new(),
            generation: 0,
            sink,
        }
    }

    /// Start a new timeline anchored at `now`, replacing any running one.
    ///
    /// Returns the generation the frame loop should run under.
    pub fn start(&mut self, timeline: Vec<ProcessedViseme>, now: f64) -> u64 {
        self.clear();
        debug!(visemes = timeline.len(), "Starting lip-sync timeline");
        self.timeline = timeline;
        self.start_time = Some(now);
        self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.start_time.is_some()
    }

    /// Advance one frame.
    pub fn animate(&mut self, now: f64) -> FrameOutcome {
        let Some(start) = self.start_time else {
            return FrameOutcome::Finished;
        };
        let elapsed = now - start;
        let end = self
            .timeline
            .last()
            .map(ProcessedViseme::end_seconds)
            .unwrap_or(0.0);

        if elapsed > end {
            trace!(elapsed, end, "Timeline finished");
            self.clear();
            return FrameOutcome::Finished;
        }

        let active = self
            .timeline
            .iter()
            .find(|v| elapsed >= v.start_seconds && elapsed < v.end_seconds());

        for shape in BLEND_SHAPES {
            let target = match active {
                Some(v) if v.blend_shape == shape => target_weight(v, elapsed),
                _ => 0.0,
            };
            let previous = self.weights.get(shape).copied().unwrap_or(0.0);
            let mut next = previous + (target - previous) * SMOOTHING;
            if next.abs() < WEIGHT_EPSILON {
                next = 0.0;
            }
            if next != previous {
                self.sink.set_weight(shape, next);
            }
            self.weights.insert(shape, next);
        }

        FrameOutcome::Continue
    }

    /// Zero every blend shape and drop the timeline.
    pub fn clear(&mut self) {
        for shape in BLEND_SHAPES {
            self.sink.set_weight(shape, 0.0);
        }
        self.weights.clear();
        self.timeline.clear();
        self.start_time = None;
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn weight(&self, blend_shape: &str) -> f64 {
        self.weights.get(blend_shape).copied().unwrap_or(0.0)
    }
}

/// Drive `driver` every frame until its timeline finishes, it is restarted,
/// or `cancel` fires.
pub fn spawn_frame_loop(
    driver: Arc<Mutex<AnimationDriver>>,
    generation: u64,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FRAME_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let mut driver = driver.lock().await;
                    if driver.generation() != generation {
                        break;
                    }
                    if driver.animate(clock.now()) == FrameOutcome::Finished {
                        break;
                    }
                }
            }
        }
    })
}
