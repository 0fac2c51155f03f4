pub mod acquisition;
pub mod adaptive;
pub mod config;
pub mod input;
pub mod manual;
pub mod mode;
pub mod pid;
pub mod pwm;
pub mod relay;
pub mod safety;
pub mod schedule;
pub mod storage;
pub mod topics;
pub mod types;

pub use adaptive::{AdaptiveEngine, AdaptiveInputs, AdaptiveTick, ModelBlob, PendingBlob};
pub use config::{ControlConfig, ControlLimits, PidGains, RuntimeConfig, SafetyConfig};
pub use manual::ManualSetpoint;
pub use mode::{ControlEvent, ControlInput, ModeController, PreviewDirection, TickReport};
pub use pid::PidController;
pub use pwm::{PwmDecision, PwmManager};
pub use relay::{ActuatorError, HeaterActuator, RelayGate};
pub use safety::{SafetyError, SafetyReading, SafetyValidator};
pub use schedule::{DayOfWeek, LocalTime, SchedulePoint, WeekSchedule};
pub use storage::{BlobStore, MemoryStore, StoreError};
pub use topics::*;
pub use types::{ControllerStatus, SensorSnapshot, SystemMode};
