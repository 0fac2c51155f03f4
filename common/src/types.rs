use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMode {
    Boot,
    Off,
    Manual,
    Adaptive,
    Programmed,
    AntiFreeze,
    Emergency,
    ModeSelect,
}

impl SystemMode {
    /// Modes reachable from the mode-select preview, in cycling order.
    pub const SELECTABLE: [SystemMode; 4] = [
        Self::Manual,
        Self::Adaptive,
        Self::Programmed,
        Self::AntiFreeze,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::Off => "OFF",
            Self::Manual => "MANUAL",
            Self::Adaptive => "ADAPTIVE",
            Self::Programmed => "PROGRAMMED",
            Self::AntiFreeze => "ANTI_FREEZE",
            Self::Emergency => "EMERGENCY",
            Self::ModeSelect => "MODE_SELECT",
        }
    }

    /// Parses a mode an operator may request directly.
    ///
    /// `BOOT` and `EMERGENCY` are internal states and never parse.
    pub fn parse_requested(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "OFF" => Some(Self::Off),
            "MANUAL" => Some(Self::Manual),
            "ADAPTIVE" => Some(Self::Adaptive),
            "PROGRAMMED" => Some(Self::Programmed),
            "ANTI_FREEZE" | "ANTIFREEZE" => Some(Self::AntiFreeze),
            "MODE_SELECT" => Some(Self::ModeSelect),
            _ => None,
        }
    }
}

/// Latest filtered readings, as published by the acquisition side.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorSnapshot {
    pub room_temp_c: Option<f32>,
    pub radiator_temp_c: Option<f32>,
    pub outside_temp_c: Option<f32>,
    pub presence: bool,
    room_updated_ms: Option<u64>,
    radiator_updated_ms: Option<u64>,
    outside_updated_ms: Option<u64>,
}

impl SensorSnapshot {
    pub fn update_room(&mut self, temp_c: f32, now_ms: u64) {
        self.room_temp_c = Some(temp_c);
        self.room_updated_ms = Some(now_ms);
    }

    pub fn update_radiator(&mut self, temp_c: f32, now_ms: u64) {
        self.radiator_temp_c = Some(temp_c);
        self.radiator_updated_ms = Some(now_ms);
    }

    pub fn update_outside(&mut self, temp_c: f32, now_ms: u64) {
        self.outside_temp_c = Some(temp_c);
        self.outside_updated_ms = Some(now_ms);
    }

    pub fn set_presence(&mut self, presence: bool) {
        self.presence = presence;
    }

    /// True once both control sensors have reported at least once.
    pub fn has_control_readings(&self) -> bool {
        self.room_temp_c.is_some() && self.radiator_temp_c.is_some()
    }

    /// Room reading, or NaN when missing or older than `stale_ms`.
    ///
    /// NaN fails the validator's range check, so a silent sensor is
    /// handled as a sensor fault.
    pub fn room_or_nan(&self, now_ms: u64, stale_ms: u64) -> f32 {
        fresh(self.room_temp_c, self.room_updated_ms, now_ms, stale_ms).unwrap_or(f32::NAN)
    }

    pub fn radiator_or_nan(&self, now_ms: u64, stale_ms: u64) -> f32 {
        fresh(self.radiator_temp_c, self.radiator_updated_ms, now_ms, stale_ms)
            .unwrap_or(f32::NAN)
    }

    pub fn outside_if_fresh(&self, now_ms: u64, stale_ms: u64) -> Option<f32> {
        fresh(self.outside_temp_c, self.outside_updated_ms, now_ms, stale_ms)
    }
}

fn fresh(value: Option<f32>, updated_ms: Option<u64>, now_ms: u64, stale_ms: u64) -> Option<f32> {
    let updated = updated_ms?;
    if now_ms.saturating_sub(updated) > stale_ms {
        return None;
    }
    value
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub mode: &'static str,
    #[serde(rename = "previewMode")]
    pub preview_mode: Option<&'static str>,
    #[serde(rename = "roomTemp")]
    pub room_temp: Option<f32>,
    #[serde(rename = "radiatorTemp")]
    pub radiator_temp: Option<f32>,
    #[serde(rename = "outsideTemp")]
    pub outside_temp: Option<f32>,
    pub presence: bool,
    #[serde(rename = "relayOn")]
    pub relay_on: bool,
    pub setpoint: Option<f32>,
    #[serde(rename = "manualSetpoint")]
    pub manual_setpoint: f32,
    #[serde(rename = "adaptiveSetpoint")]
    pub adaptive_setpoint: f32,
    #[serde(rename = "heatRate")]
    pub heat_rate: Option<f32>,
    #[serde(rename = "presenceValid")]
    pub presence_valid: Option<bool>,
    #[serde(rename = "preheatActive")]
    pub preheat_active: Option<bool>,
    #[serde(rename = "absenceTimeoutMinutes")]
    pub absence_timeout_minutes: Option<u32>,
    #[serde(rename = "errorCode")]
    pub error_code: u8,
    pub error: Option<&'static str>,
    #[serde(rename = "nextScheduleEventEpoch")]
    pub next_schedule_event_epoch: Option<i64>,
    pub timezone: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_modes_exclude_internal_states() {
        assert_eq!(SystemMode::parse_requested("manual"), Some(SystemMode::Manual));
        assert_eq!(
            SystemMode::parse_requested(" anti_freeze "),
            Some(SystemMode::AntiFreeze)
        );
        assert_eq!(SystemMode::parse_requested("EMERGENCY"), None);
        assert_eq!(SystemMode::parse_requested("BOOT"), None);
    }

    #[test]
    fn stale_readings_become_nan() {
        let mut snapshot = SensorSnapshot::default();
        assert!(snapshot.room_or_nan(0, 1_000).is_nan());

        snapshot.update_room(21.5, 1_000);
        assert_eq!(snapshot.room_or_nan(1_500, 1_000), 21.5);
        assert!(snapshot.room_or_nan(2_001, 1_000).is_nan());
    }

    #[test]
    fn outside_reading_expires() {
        let mut snapshot = SensorSnapshot::default();
        snapshot.update_outside(-3.0, 0);
        assert_eq!(snapshot.outside_if_fresh(10, 100), Some(-3.0));
        assert_eq!(snapshot.outside_if_fresh(101, 100), None);
    }
}
