//! Clamped-integral PID controller.

use crate::config::PidGains;

/// Elapsed time substituted when the measured interval is unusable.
const FALLBACK_DT_S: f32 = 1.0;
const MAX_DT_S: f32 = 100.0;

#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    out_min: f32,
    out_max: f32,
    integral: f32,
    previous_error: f32,
    last_sample_ms: u64,
}

impl PidController {
    pub fn new(gains: PidGains, out_min: f32, out_max: f32, now_ms: u64) -> Self {
        Self {
            gains,
            out_min,
            out_max,
            integral: 0.0,
            previous_error: 0.0,
            last_sample_ms: now_ms,
        }
    }

    /// Runs one PID step and returns the clamped output.
    ///
    /// The integral accumulator is clamped to the output bounds rather than
    /// to a bound scaled by `ki`.
    pub fn compute(&mut self, setpoint: f32, measured: f32, now_ms: u64) -> f32 {
        let mut dt = now_ms.saturating_sub(self.last_sample_ms) as f32 / 1000.0;
        self.last_sample_ms = now_ms;
        if dt <= 0.0 || dt > MAX_DT_S {
            dt = FALLBACK_DT_S;
        }

        let error = setpoint - measured;
        let p_out = self.gains.kp * error;

        self.integral = (self.integral + error * dt).clamp(self.out_min, self.out_max);
        let i_out = self.gains.ki * self.integral;

        let d_out = self.gains.kd * (error - self.previous_error) / dt;

        self.previous_error = error;
        (p_out + i_out + d_out).clamp(self.out_min, self.out_max)
    }
}
