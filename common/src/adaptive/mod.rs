//! Occupancy-learning setpoint engine.
//!
//! The engine is advanced once per second by its host. It learns a weekly
//! occupancy bias, debounces presence, looks ahead for preheating and
//! slews its published setpoint toward the computed target. Persistence is
//! split in two steps so the host can write blobs without holding the
//! engine lock: [`AdaptiveEngine::pending_writes`] snapshots dirty blobs,
//! [`AdaptiveEngine::mark_persisted`] clears a flag only if the blob did
//! not change in the meantime.

pub mod bias;
pub mod presence;

use crate::{
    config::ControlLimits,
    schedule::{DayOfWeek, LocalTime},
    storage::{load_f32, BlobStore, StoreError},
};

pub use bias::BiasGrid;
pub use presence::{PresenceTracker, PresenceTransition};

pub const NAMESPACE: &str = "at_model";
pub const DEFAULT_HEAT_RATE: f32 = 3.0;

const MAX_SETPOINT_STEP: f32 = 0.01;
/// Drift from the stored setpoint that makes it worth rewriting.
const SETPOINT_SAVE_DELTA: f32 = 0.01;
const LEARNING_INTERVAL_TICKS: u32 = 600;
const SAVE_INTERVAL_TICKS: u32 = 3_600;

const PREHEAT_LOOKAHEAD_HOURS: u32 = 3;
const PREHEAT_BIAS_THRESHOLD: f32 = 0.6;
const PREHEAT_BUFFER_MIN: i32 = 15;
const PREHEAT_BOOST_C: f32 = 0.5;
const PREHEAT_MIN_HEAT_RATE: f32 = 0.1;

const COLD_THRESHOLD_C: f32 = -5.0;
const COLD_GAIN: f32 = 0.16;
const COLD_MAX_CORRECTION: f32 = 0.8;
const MILD_THRESHOLD_C: f32 = 10.0;
const MILD_GAIN: f32 = -0.03;
const MILD_MAX_CORRECTION: f32 = -0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelBlob {
    Bias,
    ThermalModel,
    Setpoint,
}

impl ModelBlob {
    pub const ALL: [ModelBlob; 3] = [Self::Bias, Self::ThermalModel, Self::Setpoint];

    pub fn key(self) -> &'static str {
        match self {
            Self::Bias => "bias",
            Self::ThermalModel => "model",
            Self::Setpoint => "setpoint",
        }
    }

    pub fn size(self) -> usize {
        match self {
            Self::Bias => bias::ENCODED_SIZE,
            Self::ThermalModel | Self::Setpoint => 4,
        }
    }
}

/// Encoded snapshot of one blob, written by the host outside the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBlob {
    pub blob: ModelBlob,
    pub bytes: Vec<u8>,
}

impl PendingBlob {
    pub fn write(&self, store: &dyn BlobStore) -> Result<(), StoreError> {
        store.save_blob(NAMESPACE, self.blob.key(), &self.bytes)
    }
}

/// Latest readings pushed by the control loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveInputs {
    pub room_temp: f32,
    /// `None` when no fresh weather data is available.
    pub outside_temp: Option<f32>,
    pub presence: bool,
    pub time: LocalTime,
}

impl Default for AdaptiveInputs {
    fn default() -> Self {
        Self {
            room_temp: 20.0,
            outside_temp: None,
            presence: false,
            time: LocalTime::new(DayOfWeek::Sun, 0, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningStep {
    pub day: DayOfWeek,
    pub hour: u8,
    pub bias: f32,
}

/// What happened during one engine second, for the host to log and act on.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveTick {
    pub tick: u32,
    pub target: f32,
    pub setpoint: f32,
    pub presence: Option<PresenceTransition>,
    /// `Some` only when preheat switched on or off this tick.
    pub preheat: Option<bool>,
    pub learned: Option<LearningStep>,
    /// Periodic save point reached with at least one dirty blob.
    pub flush_due: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct DirtyFlags {
    bias: bool,
    model: bool,
    setpoint: bool,
}

impl DirtyFlags {
    fn get(&self, blob: ModelBlob) -> bool {
        match blob {
            ModelBlob::Bias => self.bias,
            ModelBlob::ThermalModel => self.model,
            ModelBlob::Setpoint => self.setpoint,
        }
    }

    fn clear(&mut self, blob: ModelBlob) {
        match blob {
            ModelBlob::Bias => self.bias = false,
            ModelBlob::ThermalModel => self.model = false,
            ModelBlob::Setpoint => self.setpoint = false,
        }
    }

    fn any(&self) -> bool {
        self.bias || self.model || self.setpoint
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveEngine {
    bias: BiasGrid,
    heat_rate: f32,
    setpoint: f32,
    persisted_setpoint: f32,
    presence: PresenceTracker,
    inputs: AdaptiveInputs,
    ticks: u32,
    preheat_active: bool,
    dirty: DirtyFlags,
}

impl AdaptiveEngine {
    pub fn new(limits: &ControlLimits) -> Self {
        Self {
            bias: BiasGrid::default(),
            heat_rate: DEFAULT_HEAT_RATE,
            setpoint: limits.room_min,
            persisted_setpoint: limits.room_min,
            presence: PresenceTracker::default(),
            inputs: AdaptiveInputs::default(),
            ticks: 0,
            preheat_active: false,
            dirty: DirtyFlags::default(),
        }
    }

    /// Builds an engine from persisted state, keeping defaults for any blob
    /// that is missing or unreadable. Load failures are returned for logging.
    pub fn load(store: &dyn BlobStore, limits: &ControlLimits) -> (Self, Vec<(ModelBlob, StoreError)>) {
        let mut engine = Self::new(limits);
        let mut failures = Vec::new();

        match store.load_blob(NAMESPACE, ModelBlob::Bias.key(), ModelBlob::Bias.size()) {
            Ok(bytes) => match BiasGrid::decode(&bytes) {
                Some(grid) => engine.bias = grid,
                None => failures.push((
                    ModelBlob::Bias,
                    StoreError::not_found(NAMESPACE, ModelBlob::Bias.key()),
                )),
            },
            Err(err) => failures.push((ModelBlob::Bias, err)),
        }

        match load_f32(store, NAMESPACE, ModelBlob::ThermalModel.key()) {
            Ok(rate) if rate.is_finite() && rate > 0.0 => engine.heat_rate = rate,
            Ok(_) => {}
            Err(err) => failures.push((ModelBlob::ThermalModel, err)),
        }

        match load_f32(store, NAMESPACE, ModelBlob::Setpoint.key()) {
            Ok(setpoint) if setpoint.is_finite() => {
                engine.setpoint = setpoint;
                engine.persisted_setpoint = setpoint;
            }
            Ok(_) => {}
            Err(err) => failures.push((ModelBlob::Setpoint, err)),
        }

        (engine, failures)
    }

    pub fn notify_sensor(&mut self, inputs: AdaptiveInputs) {
        self.inputs = inputs;
    }

    pub fn setpoint(&self) -> f32 {
        self.setpoint
    }

    pub fn heat_rate(&self) -> f32 {
        self.heat_rate
    }

    pub fn presence_valid(&self) -> bool {
        self.presence.is_valid()
    }

    pub fn preheat_active(&self) -> bool {
        self.preheat_active
    }

    /// Learned absence timeout before presence is dropped.
    pub fn absence_timeout_minutes(&self) -> u32 {
        self.presence.timeout_minutes()
    }

    /// Accepts positive finite rates only.
    pub fn set_heat_rate(&mut self, degrees_per_hour: f32) -> bool {
        if !degrees_per_hour.is_finite() || degrees_per_hour <= 0.0 {
            return false;
        }
        self.heat_rate = degrees_per_hour;
        self.dirty.model = true;
        true
    }

    pub fn tick(&mut self, limits: &ControlLimits) -> AdaptiveTick {
        self.ticks = self.ticks.wrapping_add(1);
        let now = self.inputs.time;
        let slot_bias = self.bias.get(now.day, now.hour);

        let presence = self
            .presence
            .update(self.inputs.presence, slot_bias, self.ticks);

        let was_preheating = self.preheat_active;
        self.preheat_active = self.preheat_needed(limits);
        let preheat = (was_preheating != self.preheat_active).then_some(self.preheat_active);

        let mut learned = None;
        if self.ticks % LEARNING_INTERVAL_TICKS == 0 {
            if let Some(bias) = self
                .bias
                .learn(now.day, now.hour, self.presence.is_valid())
            {
                self.dirty.bias = true;
                learned = Some(LearningStep {
                    day: now.day,
                    hour: now.hour,
                    bias,
                });
            }
        }

        let target = self.compute_target(limits);
        let step = (target - self.setpoint).clamp(-MAX_SETPOINT_STEP, MAX_SETPOINT_STEP);
        self.setpoint += step;
        if (self.setpoint - self.persisted_setpoint).abs() > SETPOINT_SAVE_DELTA {
            self.dirty.setpoint = true;
        }

        AdaptiveTick {
            tick: self.ticks,
            target,
            setpoint: self.setpoint,
            presence,
            preheat,
            learned,
            flush_due: self.ticks % SAVE_INTERVAL_TICKS == 0 && self.dirty.any(),
        }
    }

    pub fn compute_target(&self, limits: &ControlLimits) -> f32 {
        let now = self.inputs.time;
        let bias = self.bias.get(now.day, now.hour);
        let mut target = limits.room_min + (limits.room_max - limits.room_min) * bias;

        if let Some(outside) = self.inputs.outside_temp {
            target += weather_correction(outside);
        }
        if self.presence.is_valid() {
            target = target.max(limits.room_max);
        }
        if self.preheat_active {
            target = limits.room_max + PREHEAT_BOOST_C;
        }
        target.clamp(limits.room_min, limits.room_max + PREHEAT_BOOST_C)
    }

    /// The first lookahead hour likely to be occupied decides; later
    /// hours are not consulted.
    fn preheat_needed(&self, limits: &ControlLimits) -> bool {
        if self.presence.is_valid() || self.heat_rate <= PREHEAT_MIN_HEAT_RATE {
            return false;
        }
        let gain_needed = limits.room_max - self.inputs.room_temp;
        if gain_needed <= 0.0 {
            return false;
        }

        let now = self.inputs.time;
        let current_minute = u32::from(now.minute_of_day());
        let first_likely = (1..=PREHEAT_LOOKAHEAD_HOURS).find(|hours_ahead| {
            let future_minute = current_minute + hours_ahead * 60;
            let day = DayOfWeek::from_index(now.day.index() + (future_minute / (24 * 60)) as usize);
            let hour = ((future_minute / 60) % 24) as u8;
            self.bias.get(day, hour) > PREHEAT_BIAS_THRESHOLD
        });
        let Some(hours_ahead) = first_likely else {
            return false;
        };

        let lead_minutes = (gain_needed / self.heat_rate * 60.0) as i32 + PREHEAT_BUFFER_MIN;
        (hours_ahead * 60) as i32 <= lead_minutes
    }

    fn encode(&self, blob: ModelBlob) -> Vec<u8> {
        match blob {
            ModelBlob::Bias => self.bias.encode(),
            ModelBlob::ThermalModel => self.heat_rate.to_le_bytes().to_vec(),
            ModelBlob::Setpoint => self.setpoint.to_le_bytes().to_vec(),
        }
    }

    /// Snapshots the blobs to persist; `force` includes clean ones.
    pub fn pending_writes(&self, force: bool) -> Vec<PendingBlob> {
        ModelBlob::ALL
            .into_iter()
            .filter(|blob| force || self.dirty.get(*blob))
            .map(|blob| PendingBlob {
                blob,
                bytes: self.encode(blob),
            })
            .collect()
    }

    /// Clears the dirty flag after a successful write, unless the value
    /// changed since the snapshot was taken.
    pub fn mark_persisted(&mut self, written: &PendingBlob) -> bool {
        if self.encode(written.blob) != written.bytes {
            return false;
        }
        if written.blob == ModelBlob::Setpoint {
            self.persisted_setpoint = self.setpoint;
        }
        self.dirty.clear(written.blob);
        true
    }
}

fn weather_correction(outside: f32) -> f32 {
    if outside <= COLD_THRESHOLD_C {
        ((COLD_THRESHOLD_C - outside) * COLD_GAIN).clamp(0.0, COLD_MAX_CORRECTION)
    } else if outside >= MILD_THRESHOLD_C {
        // Both factors are non-positive, so the clamp pins this band at zero.
        ((MILD_THRESHOLD_C - outside) * MILD_GAIN).clamp(MILD_MAX_CORRECTION, 0.0)
    } else {
        0.0
    }
}
