//! Time-proportioning output for the on/off heater relay.
//!
//! A window of `pwm_cycle_s` seconds is opened, the relay is held ON for
//! the leading share of the window proportional to the control output,
//! then OFF for the rest.

use crate::{
    config::ControlConfig,
    relay::{ActuatorError, HeaterActuator, RelayGate},
};

pub const DEFAULT_CYCLE_S: u32 = 60;
/// Radiator ceiling applied regardless of the configured maximum.
pub const RADIATOR_HARD_CAP_C: f32 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PwmDecision {
    /// Radiator at or above the safe limit; relay forced off.
    Cutoff { radiator_temp: f32, limit: f32 },
    Cycle {
        on: bool,
        on_duration_s: u32,
        cycle_s: u32,
        new_cycle: bool,
    },
}

#[derive(Debug)]
pub struct PwmManager<A> {
    relay: RelayGate<A>,
    cycle_start_ms: Option<u64>,
}

impl<A: HeaterActuator> PwmManager<A> {
    pub fn new(relay: RelayGate<A>) -> Self {
        Self {
            relay,
            cycle_start_ms: None,
        }
    }

    pub fn relay(&self) -> &RelayGate<A> {
        &self.relay
    }

    #[cfg(test)]
    pub(crate) fn relay_mut(&mut self) -> &mut RelayGate<A> {
        &mut self.relay
    }

    #[cfg(test)]
    pub(crate) fn cycle_start_ms(&self) -> Option<u64> {
        self.cycle_start_ms
    }

    pub fn update(
        &mut self,
        pid_output: f32,
        radiator_temp: f32,
        config: &ControlConfig,
        now_ms: u64,
    ) -> Result<PwmDecision, ActuatorError> {
        let limit = config.limits.rad_max.min(RADIATOR_HARD_CAP_C);
        if radiator_temp >= limit {
            self.relay.set_state(false)?;
            return Ok(PwmDecision::Cutoff {
                radiator_temp,
                limit,
            });
        }

        let cycle_s = if config.pwm_cycle_s <= 0 {
            DEFAULT_CYCLE_S
        } else {
            config.pwm_cycle_s as u32
        };

        let mut new_cycle = false;
        let start = match self.cycle_start_ms {
            Some(start) if elapsed_s(start, now_ms) < u64::from(cycle_s) => start,
            _ => {
                new_cycle = true;
                self.cycle_start_ms = Some(now_ms);
                now_ms
            }
        };

        let output = pid_output.clamp(0.0, 100.0);
        let on_duration_s = ((output / 100.0) * cycle_s as f32) as u32;
        let on = elapsed_s(start, now_ms) < u64::from(on_duration_s);

        self.relay.set_state(on)?;
        Ok(PwmDecision::Cycle {
            on,
            on_duration_s,
            cycle_s,
            new_cycle,
        })
    }

    /// Forces the relay off and discards the current window.
    pub fn reset(&mut self) -> Result<(), ActuatorError> {
        self.cycle_start_ms = None;
        self.relay.set_state(false).map(|_| ())
    }
}

fn elapsed_s(start_ms: u64, now_ms: u64) -> u64 {
    now_ms.saturating_sub(start_ms) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RecordingHeater;

    fn manager() -> PwmManager<RecordingHeater> {
        PwmManager::new(RelayGate::new(RecordingHeater::default()).unwrap())
    }

    #[test]
    fn half_output_is_on_for_first_half_of_window() {
        let mut pwm = manager();
        let config = ControlConfig::default();
        let start = 10_000;

        for second in 0..60u64 {
            let decision = pwm
                .update(50.0, 40.0, &config, start + second * 1_000)
                .unwrap();
            let expected_on = second < 30;
            assert_eq!(pwm.relay().state(), expected_on, "second {second}");
            if let PwmDecision::Cycle { on_duration_s, .. } = decision {
                assert_eq!(on_duration_s, 30);
            }
        }

        // Window elapsed: a fresh cycle starts ON again.
        let decision = pwm.update(50.0, 40.0, &config, start + 60_000).unwrap();
        assert!(matches!(
            decision,
            PwmDecision::Cycle {
                on: true,
                new_cycle: true,
                ..
            }
        ));
    }

    #[test]
    fn cutoff_overrides_output() {
        let config = ControlConfig::default();
        for output in [0.0, 25.0, 100.0, 250.0] {
            for radiator in [60.0, 65.0, 80.0] {
                let mut pwm = manager();
                pwm.update(100.0, 20.0, &config, 0).unwrap();
                assert!(pwm.relay().state());

                let decision = pwm.update(output, radiator, &config, 1_000).unwrap();
                assert!(matches!(decision, PwmDecision::Cutoff { .. }));
                assert!(!pwm.relay().state());
            }
        }
    }

    #[test]
    fn configured_maximum_is_capped_at_seventy() {
        let mut config = ControlConfig::default();
        config.limits.rad_max = 85.0;
        let mut pwm = manager();

        let decision = pwm.update(100.0, 70.0, &config, 0).unwrap();
        assert_eq!(
            decision,
            PwmDecision::Cutoff {
                radiator_temp: 70.0,
                limit: 70.0
            }
        );

        assert!(matches!(
            pwm.update(100.0, 69.9, &config, 0).unwrap(),
            PwmDecision::Cycle { on: true, .. }
        ));
    }

    #[test]
    fn non_positive_cycle_falls_back_to_default() {
        let mut config = ControlConfig::default();
        config.pwm_cycle_s = 0;
        let mut pwm = manager();

        let decision = pwm.update(10.0, 30.0, &config, 0).unwrap();
        assert!(matches!(
            decision,
            PwmDecision::Cycle {
                cycle_s: 60,
                on_duration_s: 6,
                ..
            }
        ));
    }

    #[test]
    fn output_is_clamped_before_scaling() {
        let config = ControlConfig::default();
        let mut pwm = manager();

        let low = pwm.update(-20.0, 30.0, &config, 0).unwrap();
        assert!(matches!(
            low,
            PwmDecision::Cycle {
                on: false,
                on_duration_s: 0,
                ..
            }
        ));

        let high = pwm.update(400.0, 30.0, &config, 59_000).unwrap();
        assert!(matches!(
            high,
            PwmDecision::Cycle {
                on: true,
                on_duration_s: 60,
                ..
            }
        ));
    }

    #[test]
    fn reset_forces_off_and_restarts_window() {
        let config = ControlConfig::default();
        let mut pwm = manager();
        pwm.update(50.0, 30.0, &config, 0).unwrap();
        pwm.update(50.0, 30.0, &config, 40_000).unwrap();
        assert!(!pwm.relay().state());

        pwm.reset().unwrap();
        assert_eq!(pwm.cycle_start_ms(), None);

        let decision = pwm.update(50.0, 30.0, &config, 41_000).unwrap();
        assert!(matches!(
            decision,
            PwmDecision::Cycle {
                on: true,
                new_cycle: true,
                ..
            }
        ));
        assert_eq!(pwm.cycle_start_ms(), Some(41_000));
    }
}
