use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 10.0,
            ki: 0.1,
            kd: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlLimits {
    pub rad_max: f32,
    pub room_min: f32,
    pub room_max: f32,
}

impl Default for ControlLimits {
    fn default() -> Self {
        Self {
            rad_max: 60.0,
            room_min: 18.0,
            room_max: 22.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    pub pid: PidGains,
    pub limits: ControlLimits,
    pub pwm_cycle_s: i32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            pid: PidGains::default(),
            limits: ControlLimits::default(),
            pwm_cycle_s: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub sensor_min_c: f32,
    pub sensor_max_c: f32,
    pub spike_threshold_c: f32,
    pub sensor_stale_timeout_ms: u64,
    pub weather_stale_timeout_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            sensor_min_c: -40.0,
            sensor_max_c: 125.0,
            spike_threshold_c: 2.0,
            sensor_stale_timeout_ms: 30_000,
            weather_stale_timeout_ms: 7_200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub control: ControlConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            safety: SafetyConfig::default(),
            timezone: "Europe/Kyiv".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.control.sanitize();
        self.safety.sanitize();
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        let defaults = PidGains::default();
        if !self.pid.kp.is_finite() || self.pid.kp < 0.0 {
            self.pid.kp = defaults.kp;
        }
        if !self.pid.ki.is_finite() || self.pid.ki < 0.0 {
            self.pid.ki = defaults.ki;
        }
        if !self.pid.kd.is_finite() || self.pid.kd < 0.0 {
            self.pid.kd = defaults.kd;
        }

        let limits = &mut self.limits;
        if !limits.room_min.is_finite() {
            limits.room_min = ControlLimits::default().room_min;
        }
        if !limits.room_max.is_finite() {
            limits.room_max = ControlLimits::default().room_max;
        }
        if !limits.rad_max.is_finite() {
            limits.rad_max = ControlLimits::default().rad_max;
        }
        limits.room_min = limits.room_min.clamp(5.0, 30.0);
        limits.room_max = limits.room_max.clamp(limits.room_min + 0.5, 35.0);
        limits.rad_max = limits.rad_max.clamp(30.0, 90.0);

        // Non-positive cycles are tolerated here; the PWM manager falls back to 60 s.
        self.pwm_cycle_s = self.pwm_cycle_s.min(3_600);
    }
}

impl SafetyConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if !(self.sensor_min_c.is_finite() && self.sensor_max_c.is_finite())
            || self.sensor_min_c >= self.sensor_max_c
        {
            self.sensor_min_c = defaults.sensor_min_c;
            self.sensor_max_c = defaults.sensor_max_c;
        }
        if !self.spike_threshold_c.is_finite() || self.spike_threshold_c <= 0.0 {
            self.spike_threshold_c = defaults.spike_threshold_c;
        }
        self.sensor_stale_timeout_ms = self.sensor_stale_timeout_ms.max(1_000);
    }
}
