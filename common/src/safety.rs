use thiserror::Error;

use crate::{
    config::{ControlLimits, SafetyConfig},
    types::SystemMode,
};

/// Margin above `rad_max` at which the radiator counts as overheated.
pub const OVERHEAT_MARGIN_C: f32 = 5.0;
/// Back-to-back checks closer than this never trip the spike rule.
const SPIKE_MIN_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SafetyError {
    #[error("room sensor reading out of range")]
    RoomSensorFail,
    #[error("radiator sensor reading out of range")]
    RadiatorSensorFail,
    #[error("room temperature changed too fast")]
    SensorSpike,
    #[error("radiator overheated")]
    RadiatorOverheat,
    #[error("weather data unavailable")]
    WeatherUnavailable,
}

impl SafetyError {
    /// Numeric code shown on the display; 0 is reserved for "no error".
    pub fn code(self) -> u8 {
        match self {
            Self::RoomSensorFail => 1,
            Self::RadiatorSensorFail => 2,
            Self::SensorSpike => 3,
            Self::RadiatorOverheat => 4,
            Self::WeatherUnavailable => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoomSensorFail => "ROOM_SENSOR_FAIL",
            Self::RadiatorSensorFail => "RADIATOR_SENSOR_FAIL",
            Self::SensorSpike => "SENSOR_SPIKE",
            Self::RadiatorOverheat => "RADIATOR_OVERHEAT",
            Self::WeatherUnavailable => "WEATHER_UNAVAILABLE",
        }
    }
}

pub fn error_code(error: Option<SafetyError>) -> u8 {
    error.map_or(0, SafetyError::code)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyReading {
    pub room_temp: f32,
    pub radiator_temp: f32,
    pub weather_available: bool,
}

#[derive(Debug, Clone, Copy)]
struct SpikeBaseline {
    room_temp: f32,
    at_ms: u64,
}

#[derive(Debug, Default)]
pub struct SafetyValidator {
    baseline: Option<SpikeBaseline>,
    active_error: Option<SafetyError>,
}

impl SafetyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Error from the most recent check, `None` once a check passes.
    pub fn active_error(&self) -> Option<SafetyError> {
        self.active_error
    }

    pub fn check(
        &mut self,
        reading: SafetyReading,
        limits: &ControlLimits,
        config: &SafetyConfig,
        mode: SystemMode,
        now_ms: u64,
    ) -> Result<(), SafetyError> {
        let result = self.evaluate(reading, limits, config, mode, now_ms);

        // The spike baseline follows every checked sample, pass or fail.
        self.baseline = Some(SpikeBaseline {
            room_temp: reading.room_temp,
            at_ms: now_ms,
        });
        self.active_error = result.err();
        result
    }

    fn evaluate(
        &self,
        reading: SafetyReading,
        limits: &ControlLimits,
        config: &SafetyConfig,
        mode: SystemMode,
        now_ms: u64,
    ) -> Result<(), SafetyError> {
        let valid_range = config.sensor_min_c..=config.sensor_max_c;
        if !valid_range.contains(&reading.room_temp) {
            return Err(SafetyError::RoomSensorFail);
        }
        if !valid_range.contains(&reading.radiator_temp) {
            return Err(SafetyError::RadiatorSensorFail);
        }
        if reading.radiator_temp >= limits.rad_max + OVERHEAT_MARGIN_C {
            return Err(SafetyError::RadiatorOverheat);
        }

        if let Some(baseline) = self.baseline {
            let elapsed_ms = now_ms.saturating_sub(baseline.at_ms);
            if elapsed_ms > SPIKE_MIN_INTERVAL_MS
                && (reading.room_temp - baseline.room_temp).abs() >= config.spike_threshold_c
            {
                return Err(SafetyError::SensorSpike);
            }
        }

        if !reading.weather_available && mode == SystemMode::Adaptive {
            return Err(SafetyError::WeatherUnavailable);
        }
        Ok(())
    }
}
