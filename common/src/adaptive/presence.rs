//! Presence debouncing with a self-tuning absence timeout.

const PROMOTE_AFTER_S: u32 = 20;
pub const BASE_TIMEOUT_MIN: u32 = 15;
const MIN_TIMEOUT_MIN: f32 = 6.0;
const MAX_TIMEOUT_MIN: f32 = 35.0;
/// Occupied slots get a longer grace period before presence is dropped.
const BUSY_SLOT_BIAS: f32 = 0.75;
const BUSY_SLOT_FACTOR: f32 = 1.5;
/// Stays shorter than this do not retune the timeout.
const MIN_TUNING_STAY_S: u32 = PROMOTE_AFTER_S + 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    Validated,
    Expired {
        stay_s: u32,
        timeout_minutes: u32,
    },
}

#[derive(Debug, Clone)]
pub struct PresenceTracker {
    true_seconds: u32,
    false_seconds: u32,
    valid: bool,
    timeout_minutes: u32,
    validated_at_tick: u32,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self {
            true_seconds: 0,
            false_seconds: 0,
            valid: false,
            timeout_minutes: BASE_TIMEOUT_MIN,
            validated_at_tick: 0,
        }
    }
}

impl PresenceTracker {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn timeout_minutes(&self) -> u32 {
        self.timeout_minutes
    }

    /// Advances the tracker by one second.
    pub fn update(&mut self, present: bool, slot_bias: f32, tick: u32) -> Option<PresenceTransition> {
        if present {
            self.true_seconds += 1;
            self.false_seconds = 0;
            if self.true_seconds >= PROMOTE_AFTER_S && !self.valid {
                self.valid = true;
                self.validated_at_tick = tick;
                return Some(PresenceTransition::Validated);
            }
            return None;
        }

        self.true_seconds = 0;
        if !self.valid {
            return None;
        }

        self.false_seconds += 1;
        let timeout_minutes = if slot_bias > BUSY_SLOT_BIAS {
            (self.timeout_minutes as f32 * BUSY_SLOT_FACTOR) as u32
        } else {
            self.timeout_minutes
        };
        if self.false_seconds < timeout_minutes * 60 {
            return None;
        }

        self.valid = false;
        let stay_s = tick.saturating_sub(self.validated_at_tick);
        if stay_s > MIN_TUNING_STAY_S {
            let stay_minutes = (stay_s / 60) as f32;
            let tuned = self.timeout_minutes as f32 * 0.9 + stay_minutes * 0.05;
            self.timeout_minutes = tuned.clamp(MIN_TIMEOUT_MIN, MAX_TIMEOUT_MIN) as u32;
        }
        Some(PresenceTransition::Expired {
            stay_s,
            timeout_minutes: self.timeout_minutes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(tracker: &mut PresenceTracker, present: bool, seconds: u32, tick: &mut u32) {
        for _ in 0..seconds {
            *tick += 1;
            tracker.update(present, 0.0, *tick);
        }
    }

    #[test]
    fn validates_exactly_on_twentieth_second() {
        let mut tracker = PresenceTracker::default();
        for tick in 1..20 {
            assert_eq!(tracker.update(true, 0.0, tick), None);
            assert!(!tracker.is_valid(), "valid too early at {tick}");
        }
        assert_eq!(
            tracker.update(true, 0.0, 20),
            Some(PresenceTransition::Validated)
        );
        assert!(tracker.is_valid());
        assert_eq!(tracker.true_seconds, 20);
    }

    #[test]
    fn interrupted_presence_restarts_count() {
        let mut tracker = PresenceTracker::default();
        let mut tick = 0;
        run(&mut tracker, true, 19, &mut tick);
        run(&mut tracker, false, 1, &mut tick);
        run(&mut tracker, true, 19, &mut tick);
        assert!(!tracker.is_valid());
    }

    #[test]
    fn expires_after_timeout_and_retunes() {
        let mut tracker = PresenceTracker::default();
        let mut tick = 0;
        run(&mut tracker, true, 20, &mut tick);
        // Stay for an hour in total.
        run(&mut tracker, true, 3_580, &mut tick);

        run(&mut tracker, false, 15 * 60 - 1, &mut tick);
        assert!(tracker.is_valid());

        tick += 1;
        let transition = tracker.update(false, 0.0, tick);
        // 74 min stay: 15 * 0.9 + 74 * 0.05 = 17.2 -> 17.
        assert_eq!(
            transition,
            Some(PresenceTransition::Expired {
                stay_s: 4_480,
                timeout_minutes: 17
            })
        );
        assert!(!tracker.is_valid());
    }

    #[test]
    fn busy_slot_extends_timeout() {
        let mut tracker = PresenceTracker::default();
        let mut tick = 0;
        run(&mut tracker, true, 20, &mut tick);

        for _ in 0..15 * 60 {
            tick += 1;
            tracker.update(false, 0.9, tick);
        }
        assert!(tracker.is_valid());

        for _ in 0..(22 * 60 - 15 * 60) {
            tick += 1;
            tracker.update(false, 0.9, tick);
        }
        assert!(!tracker.is_valid());
    }

    #[test]
    fn unattended_expiry_shrinks_timeout() {
        let mut tracker = PresenceTracker::default();
        let mut tick = 0;
        run(&mut tracker, true, 20, &mut tick);
        run(&mut tracker, false, 15 * 60, &mut tick);
        assert!(!tracker.is_valid());
        // 15 min stay: 15 * 0.9 + 15 * 0.05 = 14.25 -> 14.
        assert_eq!(tracker.timeout_minutes(), 14);
    }
}
