//! Top-level operating-mode state machine.
//!
//! One `tick` per control period: the safety validator runs first and can
//! force Emergency; otherwise the active mode picks a setpoint, runs the
//! PID and feeds the PWM stage. Every state change resets the PWM window.

use crate::{
    config::{ControlConfig, RuntimeConfig},
    pid::PidController,
    pwm::{PwmDecision, PwmManager},
    relay::{ActuatorError, HeaterActuator, RelayGate},
    safety::{SafetyError, SafetyReading, SafetyValidator},
    schedule::{LocalTime, WeekSchedule},
    types::SystemMode,
};

pub const MODE_SELECT_DWELL_MS: u64 = 5_000;
pub const ANTI_FREEZE_SETPOINT_C: f32 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewDirection {
    Up,
    Down,
}

/// Readings and setpoint sources for one control tick.
#[derive(Debug, Clone, Copy)]
pub struct ControlInput<'a> {
    pub room_temp: f32,
    pub radiator_temp: f32,
    /// `None` when weather data is unavailable.
    pub outside_temp: Option<f32>,
    pub manual_setpoint: f32,
    pub adaptive_setpoint: f32,
    pub schedule: &'a WeekSchedule,
    pub local_time: LocalTime,
    pub now_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    ModeChanged { from: SystemMode, to: SystemMode },
    PreviewChanged(SystemMode),
    SafetyTrip(SafetyError),
    /// Weather data missing in a mode that does not depend on it.
    WeatherDegraded,
    Pwm(PwmDecision),
    ActuatorFailed(ActuatorError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub mode: SystemMode,
    pub safe: bool,
    pub setpoint: Option<f32>,
    pub pid_output: f32,
    pub events: Vec<ControlEvent>,
}

#[derive(Debug)]
pub struct ModeController<A> {
    mode: SystemMode,
    preview: SystemMode,
    mode_select_entered_ms: u64,
    pid: PidController,
    pwm: PwmManager<A>,
    safety: SafetyValidator,
    latched_error: Option<SafetyError>,
    last_setpoint: Option<f32>,
}

impl<A: HeaterActuator> ModeController<A> {
    /// The PID is built once here with a 0..100 output range; later gain
    /// changes need a restart.
    pub fn new(config: &ControlConfig, relay: RelayGate<A>, now_ms: u64) -> Self {
        Self {
            mode: SystemMode::Boot,
            preview: SystemMode::Manual,
            mode_select_entered_ms: now_ms,
            pid: PidController::new(config.pid, 0.0, 100.0, now_ms),
            pwm: PwmManager::new(relay),
            safety: SafetyValidator::new(),
            latched_error: None,
            last_setpoint: None,
        }
    }

    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    /// Previewed mode, only while the selection menu is open.
    pub fn preview(&self) -> Option<SystemMode> {
        (self.mode == SystemMode::ModeSelect).then_some(self.preview)
    }

    /// Error code kept for display until Emergency is left.
    pub fn latched_error(&self) -> Option<SafetyError> {
        self.latched_error
    }

    /// Result of the most recent safety check.
    pub fn active_error(&self) -> Option<SafetyError> {
        self.safety.active_error()
    }

    pub fn relay_on(&self) -> bool {
        self.pwm.relay().state()
    }

    pub fn last_setpoint(&self) -> Option<f32> {
        self.last_setpoint
    }

    /// Leaves Boot for Off.
    pub fn start(&mut self, now_ms: u64) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        if self.mode == SystemMode::Boot {
            self.transition(SystemMode::Off, now_ms, &mut events);
        }
        events
    }

    pub fn change_mode(&mut self, mode: SystemMode, now_ms: u64) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        self.transition(mode, now_ms, &mut events);
        events
    }

    pub fn acknowledge_emergency(&mut self, now_ms: u64) -> Vec<ControlEvent> {
        if self.mode != SystemMode::Emergency {
            return Vec::new();
        }
        self.change_mode(SystemMode::Off, now_ms)
    }

    pub fn cycle_preview(&mut self, direction: PreviewDirection, now_ms: u64) -> Option<ControlEvent> {
        if self.mode != SystemMode::ModeSelect {
            return None;
        }

        let options = SystemMode::SELECTABLE;
        let current = options
            .iter()
            .position(|mode| *mode == self.preview)
            .unwrap_or(0);
        let next = match direction {
            PreviewDirection::Up => (current + 1) % options.len(),
            PreviewDirection::Down => (current + options.len() - 1) % options.len(),
        };

        self.preview = options[next];
        self.mode_select_entered_ms = now_ms;
        Some(ControlEvent::PreviewChanged(self.preview))
    }

    pub fn tick(&mut self, input: &ControlInput<'_>, config: &RuntimeConfig) -> TickReport {
        let now_ms = input.now_ms;
        let mut events = Vec::new();

        let reading = SafetyReading {
            room_temp: input.room_temp,
            radiator_temp: input.radiator_temp,
            weather_available: input.outside_temp.is_some(),
        };
        if let Err(error) = self.safety.check(
            reading,
            &config.control.limits,
            &config.safety,
            self.mode,
            now_ms,
        ) {
            events.push(ControlEvent::SafetyTrip(error));
            if self.mode != SystemMode::Emergency {
                self.transition(SystemMode::Emergency, now_ms, &mut events);
            }
            self.reset_pwm(&mut events);
            self.latched_error = Some(error);
            self.last_setpoint = None;
            return self.report(false, 0.0, events);
        }
        if !reading.weather_available {
            events.push(ControlEvent::WeatherDegraded);
        }

        let (setpoint, output) = match self.mode {
            SystemMode::Boot => {
                self.transition(SystemMode::Off, now_ms, &mut events);
                (None, 0.0)
            }
            SystemMode::Off | SystemMode::Emergency => {
                self.reset_pwm(&mut events);
                (None, 0.0)
            }
            SystemMode::Manual => {
                self.drive(input.manual_setpoint, input, &config.control, &mut events)
            }
            SystemMode::Programmed => {
                let setpoint = input.schedule.setpoint_at(input.local_time);
                self.drive(setpoint, input, &config.control, &mut events)
            }
            SystemMode::Adaptive => {
                self.drive(input.adaptive_setpoint, input, &config.control, &mut events)
            }
            SystemMode::AntiFreeze => {
                if input.room_temp <= config.control.limits.room_min {
                    self.drive(ANTI_FREEZE_SETPOINT_C, input, &config.control, &mut events)
                } else {
                    self.update_pwm(0.0, input, &config.control, &mut events);
                    (None, 0.0)
                }
            }
            SystemMode::ModeSelect => {
                if now_ms.saturating_sub(self.mode_select_entered_ms) > MODE_SELECT_DWELL_MS {
                    self.transition(self.preview, now_ms, &mut events);
                }
                (None, 0.0)
            }
        };

        self.last_setpoint = setpoint;
        self.report(true, output, events)
    }

    fn drive(
        &mut self,
        setpoint: f32,
        input: &ControlInput<'_>,
        control: &ControlConfig,
        events: &mut Vec<ControlEvent>,
    ) -> (Option<f32>, f32) {
        let output = self.pid.compute(setpoint, input.room_temp, input.now_ms);
        self.update_pwm(output, input, control, events);
        (Some(setpoint), output)
    }

    fn update_pwm(
        &mut self,
        output: f32,
        input: &ControlInput<'_>,
        control: &ControlConfig,
        events: &mut Vec<ControlEvent>,
    ) {
        match self
            .pwm
            .update(output, input.radiator_temp, control, input.now_ms)
        {
            Ok(decision) => events.push(ControlEvent::Pwm(decision)),
            Err(err) => events.push(ControlEvent::ActuatorFailed(err)),
        }
    }

    fn reset_pwm(&mut self, events: &mut Vec<ControlEvent>) {
        if let Err(err) = self.pwm.reset() {
            events.push(ControlEvent::ActuatorFailed(err));
        }
    }

    fn transition(&mut self, to: SystemMode, now_ms: u64, events: &mut Vec<ControlEvent>) {
        if self.mode == to {
            return;
        }
        self.reset_pwm(events);

        let from = self.mode;
        if from == SystemMode::Emergency {
            self.latched_error = None;
        }
        self.mode = to;
        if to == SystemMode::ModeSelect {
            self.preview = SystemMode::Manual;
            self.mode_select_entered_ms = now_ms;
        }
        events.push(ControlEvent::ModeChanged { from, to });
    }

    fn report(&self, safe: bool, pid_output: f32, events: Vec<ControlEvent>) -> TickReport {
        TickReport {
            mode: self.mode,
            safe,
            setpoint: self.last_setpoint,
            pid_output,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{relay::RecordingHeater, schedule::DayOfWeek};

    fn booted() -> ModeController<RecordingHeater> {
        let relay = RelayGate::new(RecordingHeater::default()).unwrap();
        let mut controller = ModeController::new(&ControlConfig::default(), relay, 0);
        controller.start(0);
        controller
    }

    fn input(schedule: &WeekSchedule, room_temp: f32, now_ms: u64) -> ControlInput<'_> {
        ControlInput {
            room_temp,
            radiator_temp: 35.0,
            outside_temp: Some(0.0),
            manual_setpoint: 21.0,
            adaptive_setpoint: 20.0,
            schedule,
            local_time: LocalTime::new(DayOfWeek::Mon, 7, 0),
            now_ms,
        }
    }

    #[test]
    fn boots_into_off() {
        let relay = RelayGate::new(RecordingHeater::default()).unwrap();
        let mut controller = ModeController::new(&ControlConfig::default(), relay, 0);
        assert_eq!(controller.mode(), SystemMode::Boot);

        let events = controller.start(0);
        assert_eq!(
            events,
            vec![ControlEvent::ModeChanged {
                from: SystemMode::Boot,
                to: SystemMode::Off
            }]
        );
        assert!(controller.start(10).is_empty());
    }

    #[test]
    fn off_keeps_relay_off() {
        let schedule = WeekSchedule::default();
        let config = RuntimeConfig::default();
        let mut controller = booted();

        let report = controller.tick(&input(&schedule, 15.0, 1_000), &config);
        assert!(report.safe);
        assert_eq!(report.setpoint, None);
        assert!(!controller.relay_on());
    }

    #[test]
    fn manual_mode_drives_relay() {
        let schedule = WeekSchedule::default();
        let config = RuntimeConfig::default();
        let mut controller = booted();
        controller.change_mode(SystemMode::Manual, 0);

        let report = controller.tick(&input(&schedule, 19.0, 1_000), &config);
        assert_eq!(report.setpoint, Some(21.0));
        assert!(report.pid_output > 0.0);
        assert!(controller.relay_on());
    }

    #[test]
    fn programmed_mode_follows_schedule() {
        let schedule = WeekSchedule::default();
        let config = RuntimeConfig::default();
        let mut controller = booted();
        controller.change_mode(SystemMode::Programmed, 0);

        let report = controller.tick(&input(&schedule, 20.0, 1_000), &config);
        // Monday 07:00 in the default schedule.
        assert_eq!(report.setpoint, Some(21.0));
    }

    #[test]
    fn transition_restarts_pwm_window() {
        let schedule = WeekSchedule::default();
        let config = RuntimeConfig::default();
        let mut controller = booted();
        controller.change_mode(SystemMode::Manual, 0);

        controller.tick(&input(&schedule, 20.5, 1_000), &config);
        controller.tick(&input(&schedule, 20.5, 20_000), &config);
        assert_eq!(controller.pwm.cycle_start_ms(), Some(1_000));

        controller.change_mode(SystemMode::Adaptive, 25_000);
        assert_eq!(controller.pwm.cycle_start_ms(), None);
        assert!(!controller.relay_on());

        let report = controller.tick(&input(&schedule, 20.5, 26_000), &config);
        assert!(report.events.iter().any(|event| matches!(
            event,
            ControlEvent::Pwm(PwmDecision::Cycle {
                new_cycle: true,
                ..
            })
        )));
        assert_eq!(controller.pwm.cycle_start_ms(), Some(26_000));
    }

    #[test]
    fn invalid_room_reading_enters_emergency() {
        let schedule = WeekSchedule::default();
        let config = RuntimeConfig::default();

        for mode in [
            SystemMode::Off,
            SystemMode::Manual,
            SystemMode::Adaptive,
            SystemMode::AntiFreeze,
            SystemMode::ModeSelect,
        ] {
            let mut controller = booted();
            controller.change_mode(mode, 0);
            controller.tick(&input(&schedule, 19.0, 1_000), &config);

            let report = controller.tick(&input(&schedule, -200.0, 2_000), &config);
            assert!(!report.safe);
            assert_eq!(report.mode, SystemMode::Emergency);
            assert_eq!(
                controller.latched_error(),
                Some(SafetyError::RoomSensorFail)
            );
            assert!(!controller.relay_on());
            assert_eq!(controller.pwm.cycle_start_ms(), None);
        }
    }

    #[test]
    fn emergency_needs_acknowledgement() {
        let schedule = WeekSchedule::default();
        let config = RuntimeConfig::default();
        let mut controller = booted();
        controller.change_mode(SystemMode::Manual, 0);

        controller.tick(&input(&schedule, -200.0, 1_000), &config);
        assert_eq!(controller.mode(), SystemMode::Emergency);

        // Readings recover: still in Emergency, error stays latched. The
        // first good sample lands inside the spike window.
        controller.tick(&input(&schedule, 20.0, 1_400), &config);
        let report = controller.tick(&input(&schedule, 20.0, 3_000), &config);
        assert!(report.safe);
        assert_eq!(report.mode, SystemMode::Emergency);
        assert_eq!(controller.active_error(), None);
        assert_eq!(
            controller.latched_error(),
            Some(SafetyError::RoomSensorFail)
        );

        let events = controller.acknowledge_emergency(4_000);
        assert_eq!(
            events,
            vec![ControlEvent::ModeChanged {
                from: SystemMode::Emergency,
                to: SystemMode::Off
            }]
        );
        assert_eq!(controller.latched_error(), None);
        assert!(controller.acknowledge_emergency(5_000).is_empty());
    }

    #[test]
    fn missing_weather_is_fatal_only_in_adaptive() {
        let schedule = WeekSchedule::default();
        let config = RuntimeConfig::default();

        let mut manual = booted();
        manual.change_mode(SystemMode::Manual, 0);
        let mut reading = input(&schedule, 20.0, 1_000);
        reading.outside_temp = None;
        let report = manual.tick(&reading, &config);
        assert!(report.safe);
        assert!(report.events.contains(&ControlEvent::WeatherDegraded));

        let mut adaptive = booted();
        adaptive.change_mode(SystemMode::Adaptive, 0);
        let report = adaptive.tick(&reading, &config);
        assert!(!report.safe);
        assert_eq!(
            adaptive.latched_error(),
            Some(SafetyError::WeatherUnavailable)
        );
    }

    #[test]
    fn anti_freeze_heats_only_below_floor() {
        let schedule = WeekSchedule::default();
        let config = RuntimeConfig::default();
        let mut controller = booted();
        controller.change_mode(SystemMode::AntiFreeze, 0);

        let report = controller.tick(&input(&schedule, 20.0, 1_000), &config);
        assert_eq!(report.pid_output, 0.0);
        assert_eq!(report.setpoint, None);
        // PWM bookkeeping still runs with zero output.
        assert!(report.events.iter().any(|event| matches!(
            event,
            ControlEvent::Pwm(PwmDecision::Cycle { on: false, .. })
        )));

        let mut cold = booted();
        cold.change_mode(SystemMode::AntiFreeze, 0);
        let report = cold.tick(&input(&schedule, 5.0, 1_000), &config);
        assert_eq!(report.setpoint, Some(ANTI_FREEZE_SETPOINT_C));
        assert!(report.pid_output > 0.0);
        assert!(cold.relay_on());
    }

    #[test]
    fn mode_select_commits_preview_after_dwell() {
        let schedule = WeekSchedule::default();
        let config = RuntimeConfig::default();
        let mut controller = booted();

        assert_eq!(controller.cycle_preview(PreviewDirection::Up, 0), None);

        controller.change_mode(SystemMode::ModeSelect, 1_000);
        assert_eq!(controller.preview(), Some(SystemMode::Manual));

        assert_eq!(
            controller.cycle_preview(PreviewDirection::Down, 3_000),
            Some(ControlEvent::PreviewChanged(SystemMode::AntiFreeze))
        );
        assert_eq!(
            controller.cycle_preview(PreviewDirection::Up, 4_000),
            Some(ControlEvent::PreviewChanged(SystemMode::Manual))
        );
        controller.cycle_preview(PreviewDirection::Up, 4_000);
        assert_eq!(controller.preview(), Some(SystemMode::Adaptive));

        controller.tick(&input(&schedule, 20.0, 9_000), &config);
        assert_eq!(controller.mode(), SystemMode::ModeSelect);

        let report = controller.tick(&input(&schedule, 20.0, 9_001), &config);
        assert_eq!(report.mode, SystemMode::Adaptive);
        assert_eq!(controller.preview(), None);
    }

    #[test]
    fn actuator_failure_is_reported_and_retried() {
        let schedule = WeekSchedule::default();
        let config = RuntimeConfig::default();
        let mut controller = booted();
        controller.change_mode(SystemMode::Manual, 0);
        controller.pwm.relay_mut().actuator_mut().reject = true;

        let report = controller.tick(&input(&schedule, 19.0, 1_000), &config);
        assert!(report
            .events
            .iter()
            .any(|event| matches!(event, ControlEvent::ActuatorFailed(_))));
        assert!(!controller.relay_on());

        controller.pwm.relay_mut().actuator_mut().reject = false;
        controller.tick(&input(&schedule, 19.0, 2_000), &config);
        assert!(controller.relay_on());
    }
}
