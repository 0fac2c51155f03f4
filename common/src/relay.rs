use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorError {
    #[error("heater command rejected: {0}")]
    Rejected(String),
}

/// Output stage that physically switches the heater.
pub trait HeaterActuator {
    fn set_heater(&mut self, on: bool) -> Result<(), ActuatorError>;
}

/// Deduplicates heater commands.
///
/// The remembered state only changes once the actuator accepted the
/// command, so a failed switch is retried on the next call.
#[derive(Debug)]
pub struct RelayGate<A> {
    actuator: A,
    state: bool,
}

impl<A: HeaterActuator> RelayGate<A> {
    pub fn new(mut actuator: A) -> Result<Self, ActuatorError> {
        actuator.set_heater(false)?;
        Ok(Self {
            actuator,
            state: false,
        })
    }

    /// Returns `true` when a command was actually sent.
    pub fn set_state(&mut self, on: bool) -> Result<bool, ActuatorError> {
        if self.state == on {
            return Ok(false);
        }
        self.actuator.set_heater(on)?;
        self.state = on;
        Ok(true)
    }

    pub fn state(&self) -> bool {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn actuator_mut(&mut self) -> &mut A {
        &mut self.actuator
    }
}

/// Records every command it receives; optionally rejects them.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingHeater {
    pub commands: Vec<bool>,
    pub reject: bool,
}

#[cfg(test)]
impl HeaterActuator for RecordingHeater {
    fn set_heater(&mut self, on: bool) -> Result<(), ActuatorError> {
        if self.reject {
            return Err(ActuatorError::Rejected("test actuator offline".to_string()));
        }
        self.commands.push(on);
        Ok(())
    }
}
