use crate::{
    schedule::DayOfWeek,
    storage::{decode_f32s, encode_f32s},
};

pub const HOURS_PER_DAY: usize = 24;
pub const ENCODED_SIZE: usize = 7 * HOURS_PER_DAY * 4;

const LEARNING_RATE_POSITIVE: f32 = 0.14;
const LEARNING_RATE_NEGATIVE: f32 = 0.06;
const MIN_LEARNING_CHANGE: f32 = 0.001;

/// Weekly occupancy likelihood, one cell per (weekday, hour) in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasGrid {
    cells: [[f32; HOURS_PER_DAY]; 7],
}

impl Default for BiasGrid {
    fn default() -> Self {
        Self {
            cells: [[0.0; HOURS_PER_DAY]; 7],
        }
    }
}

impl BiasGrid {
    pub fn get(&self, day: DayOfWeek, hour: u8) -> f32 {
        self.cells[day.index()][usize::from(hour) % HOURS_PER_DAY]
    }

    pub fn set(&mut self, day: DayOfWeek, hour: u8, value: f32) {
        self.cells[day.index()][usize::from(hour) % HOURS_PER_DAY] = value.clamp(0.0, 1.0);
    }

    /// Nudges one cell toward or away from "occupied".
    ///
    /// Returns the new value when the cell actually moved.
    pub fn learn(&mut self, day: DayOfWeek, hour: u8, occupied: bool) -> Option<f32> {
        let current = self.get(day, hour);
        let next = if occupied {
            current + LEARNING_RATE_POSITIVE
        } else {
            current - LEARNING_RATE_NEGATIVE
        }
        .clamp(0.0, 1.0);

        if (next - current).abs() > MIN_LEARNING_CHANGE {
            self.set(day, hour, next);
            Some(next)
        } else {
            None
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_f32s(self.cells.iter().flatten().copied())
    }

    /// Decodes a grid; `None` on size mismatch or any non-finite cell.
    /// Finite cells outside `[0, 1]` are clamped.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ENCODED_SIZE {
            return None;
        }
        let mut grid = Self::default();
        for (slot, value) in grid.cells.iter_mut().flatten().zip(decode_f32s(bytes)) {
            if !value.is_finite() {
                return None;
            }
            *slot = value.clamp(0.0, 1.0);
        }
        Some(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learning_steps_are_asymmetric_and_clamped() {
        let mut grid = BiasGrid::default();

        assert_eq!(grid.learn(DayOfWeek::Mon, 8, true), Some(0.14));
        assert_eq!(grid.learn(DayOfWeek::Mon, 8, false), Some(0.14 - 0.06));

        // Already at zero: nothing to unlearn.
        assert_eq!(grid.learn(DayOfWeek::Tue, 8, false), None);

        for _ in 0..10 {
            grid.learn(DayOfWeek::Wed, 20, true);
        }
        assert_eq!(grid.get(DayOfWeek::Wed, 20), 1.0);
        assert_eq!(grid.learn(DayOfWeek::Wed, 20, true), None);
    }

    #[test]
    fn encoded_grid_is_bit_exact() {
        let mut grid = BiasGrid::default();
        grid.set(DayOfWeek::Sun, 0, 0.123_456_79);
        grid.set(DayOfWeek::Sat, 23, 0.987_654_3);
        grid.set(DayOfWeek::Thu, 12, 1.0 / 3.0);

        let bytes = grid.encode();
        assert_eq!(bytes.len(), ENCODED_SIZE);

        let decoded = BiasGrid::decode(&bytes).unwrap();
        for day in 0..7 {
            for hour in 0..24u8 {
                let day = DayOfWeek::from_index(day);
                assert_eq!(
                    decoded.get(day, hour).to_bits(),
                    grid.get(day, hour).to_bits()
                );
            }
        }
    }

    #[test]
    fn layout_is_day_major_from_sunday() {
        let mut grid = BiasGrid::default();
        grid.set(DayOfWeek::Mon, 1, 0.5);
        let bytes = grid.encode();

        let offset = (HOURS_PER_DAY + 1) * 4;
        assert_eq!(&bytes[offset..offset + 4], &0.5f32.to_le_bytes());
        assert!(BiasGrid::decode(&bytes[..ENCODED_SIZE - 4]).is_none());
    }

    #[test]
    fn corrupt_cells_are_rejected_or_clamped() {
        let mut bytes = BiasGrid::default().encode();
        bytes[8..12].copy_from_slice(&f32::NAN.to_le_bytes());
        assert!(BiasGrid::decode(&bytes).is_none());

        bytes[8..12].copy_from_slice(&f32::INFINITY.to_le_bytes());
        assert!(BiasGrid::decode(&bytes).is_none());

        bytes[8..12].copy_from_slice(&1.7f32.to_le_bytes());
        bytes[12..16].copy_from_slice(&(-0.4f32).to_le_bytes());
        let grid = BiasGrid::decode(&bytes).unwrap();
        assert_eq!(grid.get(DayOfWeek::Sun, 2), 1.0);
        assert_eq!(grid.get(DayOfWeek::Sun, 3), 0.0);
    }
}
