//! Two-stage filtering for temperature channels: an oversampled average of
//! the valid samples, then an exponential moving average.

pub const OVERSAMPLING_COUNT: usize = 32;
pub const EMA_ALPHA: f32 = 0.1;

/// Hardware side of the sensor board. Failed reads return NaN.
pub trait SensorSource {
    fn read_room_temperature(&mut self) -> f32;
    fn read_radiator_temperature(&mut self) -> f32;
    fn read_outside_temperature(&mut self) -> f32;
    fn read_presence(&mut self) -> bool;
}

/// Mean of the non-NaN samples, `None` when every sample failed.
pub fn average_valid(samples: impl IntoIterator<Item = f32>) -> Option<f32> {
    let (sum, count) = samples
        .into_iter()
        .filter(|sample| !sample.is_nan())
        .fold((0.0f32, 0u32), |(sum, count), sample| (sum + sample, count + 1));
    (count > 0).then(|| sum / count as f32)
}

#[derive(Debug, Clone)]
pub struct EmaFilter {
    alpha: f32,
    value: Option<f32>,
}

impl Default for EmaFilter {
    fn default() -> Self {
        Self::new(EMA_ALPHA)
    }
}

impl EmaFilter {
    pub fn new(alpha: f32) -> Self {
        Self { alpha, value: None }
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }

    /// The first sample seeds the filter unchanged.
    pub fn update(&mut self, sample: f32) -> f32 {
        let next = match self.value {
            Some(previous) => self.alpha * sample + (1.0 - self.alpha) * previous,
            None => sample,
        };
        self.value = Some(next);
        next
    }
}

/// One filtered temperature channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    ema: EmaFilter,
}

impl ChannelFilter {
    /// Takes `OVERSAMPLING_COUNT` readings and folds their average into the
    /// EMA. Returns `None`, leaving the filter untouched, if all reads failed.
    pub fn sample(&mut self, mut read: impl FnMut() -> f32) -> Option<f32> {
        let average = average_valid((0..OVERSAMPLING_COUNT).map(|_| read()))?;
        Some(self.ema.update(average))
    }

    pub fn value(&self) -> Option<f32> {
        self.ema.value()
    }
}
