use crate::storage::{load_f32, save_f32, BlobStore, StoreError};

pub const NAMESPACE: &str = "settings";
pub const KEY: &str = "setpoint_temp";
pub const DEFAULT_SETPOINT_C: f32 = 21.0;
pub const STEP_C: f32 = 0.25;
pub const MIN_SETPOINT_C: f32 = 5.0;
pub const MAX_SETPOINT_C: f32 = 35.0;

/// Operator-chosen temperature for Manual mode, persisted on every change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManualSetpoint {
    value: f32,
}

impl Default for ManualSetpoint {
    fn default() -> Self {
        Self {
            value: DEFAULT_SETPOINT_C,
        }
    }
}

impl ManualSetpoint {
    /// Loads the stored value. A missing value is replaced by the default,
    /// which is written back; any other failure keeps the default in memory
    /// and is returned alongside it.
    pub fn load(store: &dyn BlobStore) -> (Self, Option<StoreError>) {
        match load_f32(store, NAMESPACE, KEY) {
            Ok(value) if value.is_finite() => (
                Self {
                    value: value.clamp(MIN_SETPOINT_C, MAX_SETPOINT_C),
                },
                None,
            ),
            Ok(_) => (Self::default(), None),
            Err(err) if err.is_not_found() => {
                let setpoint = Self::default();
                (setpoint, setpoint.persist(store).err())
            }
            Err(err) => (Self::default(), Some(err)),
        }
    }

    pub fn get(&self) -> f32 {
        self.value
    }

    /// Clamps, stores in memory, then persists. The in-memory value is kept
    /// even if the write fails.
    pub fn set(&mut self, value: f32, store: &dyn BlobStore) -> Result<f32, StoreError> {
        if value.is_finite() {
            self.value = value.clamp(MIN_SETPOINT_C, MAX_SETPOINT_C);
        }
        self.persist(store)?;
        Ok(self.value)
    }

    pub fn step(&mut self, steps: i8, store: &dyn BlobStore) -> Result<f32, StoreError> {
        self.set(self.value + f32::from(steps) * STEP_C, store)
    }

    fn persist(&self, store: &dyn BlobStore) -> Result<(), StoreError> {
        save_f32(store, NAMESPACE, KEY, self.value)
    }
}
