use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{BlobStore, StoreError};

pub const NAMESPACE: &str = "schedule";
pub const KEY: &str = "week";
pub const MAX_POINTS_PER_DAY: usize = 4;
/// Setpoint used when neither today nor yesterday has a point in effect.
pub const FALLBACK_SETPOINT_C: f32 = 18.0;

const POINT_SIZE: usize = 6;
const DAY_SIZE: usize = MAX_POINTS_PER_DAY * POINT_SIZE + 1;
pub const ENCODED_SIZE: usize = 7 * DAY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl DayOfWeek {
    /// Week index with Sunday as 0.
    pub fn index(self) -> usize {
        match self {
            Self::Sun => 0,
            Self::Mon => 1,
            Self::Tue => 2,
            Self::Wed => 3,
            Self::Thu => 4,
            Self::Fri => 5,
            Self::Sat => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index % 7 {
            0 => Self::Sun,
            1 => Self::Mon,
            2 => Self::Tue,
            3 => Self::Wed,
            4 => Self::Thu,
            5 => Self::Fri,
            _ => Self::Sat,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }

    pub fn previous(self) -> Self {
        Self::from_index(self.index() + 6)
    }
}

/// Wall-clock position within the week, in the configured timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub day: DayOfWeek,
    pub hour: u8,
    pub minute: u8,
}

impl LocalTime {
    pub fn new(day: DayOfWeek, hour: u8, minute: u8) -> Self {
        Self { day, hour, minute }
    }

    pub fn from_datetime<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        Self {
            day: DayOfWeek::from_chrono(now.weekday()),
            hour: now.hour() as u8,
            minute: now.minute() as u8,
        }
    }

    pub fn minute_of_day(self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulePoint {
    pub hour: u8,
    pub minute: u8,
    pub temperature: f32,
}

impl SchedulePoint {
    pub const fn new(hour: u8, minute: u8, temperature: f32) -> Self {
        Self {
            hour,
            minute,
            temperature,
        }
    }

    pub fn minute_of_day(&self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }
}

/// Points are evaluated in stored order; callers keep them chronological.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub points: Vec<SchedulePoint>,
}

impl DaySchedule {
    fn from_points(points: &[SchedulePoint]) -> Self {
        Self {
            points: points.to_vec(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("{day:?} has {count} points, at most 4 are allowed")]
    TooManyPoints { day: DayOfWeek, count: usize },
    #[error("{day:?} point {index} has an invalid time {hour:02}:{minute:02}")]
    InvalidTime {
        day: DayOfWeek,
        index: usize,
        hour: u8,
        minute: u8,
    },
    #[error("{day:?} point {index} has an invalid temperature {temperature}")]
    InvalidTemperature {
        day: DayOfWeek,
        index: usize,
        temperature: f32,
    },
    #[error("encoded schedule is {0} bytes, expected 175")]
    InvalidLength(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekSchedule {
    /// Indexed by [`DayOfWeek::index`], Sunday first.
    pub days: [DaySchedule; 7],
}

impl Default for WeekSchedule {
    fn default() -> Self {
        const WEEKDAY: [SchedulePoint; 4] = [
            SchedulePoint::new(6, 30, 21.0),
            SchedulePoint::new(9, 0, 18.0),
            SchedulePoint::new(18, 0, 21.5),
            SchedulePoint::new(23, 0, 22.0),
        ];
        const WEEKEND: [SchedulePoint; 2] = [
            SchedulePoint::new(8, 0, 21.0),
            SchedulePoint::new(23, 30, 22.0),
        ];

        let days = std::array::from_fn(|index| match DayOfWeek::from_index(index) {
            DayOfWeek::Sat | DayOfWeek::Sun => DaySchedule::from_points(&WEEKEND),
            _ => DaySchedule::from_points(&WEEKDAY),
        });
        Self { days }
    }
}

impl WeekSchedule {
    pub fn day(&self, day: DayOfWeek) -> &DaySchedule {
        &self.days[day.index()]
    }

    /// Temperature of the most recent point at or before `now`.
    ///
    /// Before today's first point, yesterday's last point stays in effect.
    pub fn setpoint_at(&self, now: LocalTime) -> f32 {
        let mut setpoint = self
            .day(now.day.previous())
            .points
            .last()
            .map_or(FALLBACK_SETPOINT_C, |point| point.temperature);

        let minute = now.minute_of_day();
        for point in &self.day(now.day).points {
            if point.minute_of_day() <= minute {
                setpoint = point.temperature;
            }
        }
        setpoint
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        for (day_index, day_schedule) in self.days.iter().enumerate() {
            let day = DayOfWeek::from_index(day_index);
            if day_schedule.points.len() > MAX_POINTS_PER_DAY {
                return Err(ScheduleError::TooManyPoints {
                    day,
                    count: day_schedule.points.len(),
                });
            }
            for (index, point) in day_schedule.points.iter().enumerate() {
                if point.hour > 23 || point.minute > 59 {
                    return Err(ScheduleError::InvalidTime {
                        day,
                        index,
                        hour: point.hour,
                        minute: point.minute,
                    });
                }
                if !(5.0..=35.0).contains(&point.temperature) {
                    return Err(ScheduleError::InvalidTemperature {
                        day,
                        index,
                        temperature: point.temperature,
                    });
                }
            }
        }
        Ok(())
    }

    /// Fixed-size blob: per day, four `(hour, minute, f32 LE)` slots then
    /// the point count.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENCODED_SIZE);
        for day in &self.days {
            for slot in 0..MAX_POINTS_PER_DAY {
                let point = day
                    .points
                    .get(slot)
                    .copied()
                    .unwrap_or(SchedulePoint::new(0, 0, 0.0));
                bytes.push(point.hour);
                bytes.push(point.minute);
                bytes.extend_from_slice(&point.temperature.to_le_bytes());
            }
            bytes.push(day.points.len().min(MAX_POINTS_PER_DAY) as u8);
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ScheduleError> {
        if bytes.len() != ENCODED_SIZE {
            return Err(ScheduleError::InvalidLength(bytes.len()));
        }

        let mut schedule = Self {
            days: Default::default(),
        };
        for (day_index, chunk) in bytes.chunks_exact(DAY_SIZE).enumerate() {
            let count = usize::from(chunk[DAY_SIZE - 1]);
            if count > MAX_POINTS_PER_DAY {
                return Err(ScheduleError::TooManyPoints {
                    day: DayOfWeek::from_index(day_index),
                    count,
                });
            }
            schedule.days[day_index].points = chunk[..count * POINT_SIZE]
                .chunks_exact(POINT_SIZE)
                .map(|raw| SchedulePoint {
                    hour: raw[0],
                    minute: raw[1],
                    temperature: f32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
                })
                .collect();
        }
        Ok(schedule)
    }

    /// Epoch seconds of the next point strictly after `now`, within a week.
    pub fn next_change_epoch<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<i64> {
        let today = DayOfWeek::from_chrono(now.weekday());
        let now_minute = LocalTime::from_datetime(now).minute_of_day();
        let timezone = now.timezone();

        let mut best: Option<DateTime<Tz>> = None;
        for day_offset in 0..=7i64 {
            let day = DayOfWeek::from_index(today.index() + day_offset as usize);
            for point in &self.day(day).points {
                if day_offset == 0 && point.minute_of_day() <= now_minute {
                    continue;
                }

                let date = now.date_naive() + Duration::days(day_offset);
                let Some(naive) = date.and_hms_opt(u32::from(point.hour), u32::from(point.minute), 0)
                else {
                    continue;
                };
                let Some(candidate) = timezone.from_local_datetime(&naive).earliest() else {
                    continue;
                };

                if best.as_ref().map_or(true, |current| candidate < *current) {
                    best = Some(candidate);
                }
            }
        }

        best.map(|dt| dt.timestamp())
    }

    /// Loads the stored schedule. A missing or unreadable blob is replaced
    /// by the default schedule, which is written back.
    pub fn load(store: &dyn BlobStore) -> (Self, Option<StoreError>) {
        match store.load_blob(NAMESPACE, KEY, ENCODED_SIZE) {
            Ok(bytes) => match Self::decode(&bytes) {
                Ok(schedule) if schedule.validate().is_ok() => (schedule, None),
                _ => Self::restore_default(store),
            },
            Err(err) if err.is_not_found() => Self::restore_default(store),
            Err(err) => (Self::default(), Some(err)),
        }
    }

    pub fn persist(&self, store: &dyn BlobStore) -> Result<(), StoreError> {
        store.save_blob(NAMESPACE, KEY, &self.encode())
    }

    fn restore_default(store: &dyn BlobStore) -> (Self, Option<StoreError>) {
        let schedule = Self::default();
        let err = schedule.persist(store).err();
        (schedule, err)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, Utc};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::MemoryStore;

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn weekday_morning_uses_first_point() {
        let schedule = WeekSchedule::default();
        let tuesday = LocalTime::new(DayOfWeek::Tue, 7, 0);
        assert_eq!(schedule.setpoint_at(tuesday), 21.0);
    }

    #[test]
    fn early_morning_carries_previous_day() {
        let schedule = WeekSchedule::default();

        // Monday 05:00: Sunday ended at 22.0.
        assert_eq!(schedule.setpoint_at(LocalTime::new(DayOfWeek::Mon, 5, 0)), 22.0);
        // Wednesday 05:00: Tuesday ended at 22.0.
        assert_eq!(schedule.setpoint_at(LocalTime::new(DayOfWeek::Wed, 5, 0)), 22.0);
    }

    #[test]
    fn points_apply_at_their_exact_minute() {
        let schedule = WeekSchedule::default();
        assert_eq!(schedule.setpoint_at(LocalTime::new(DayOfWeek::Fri, 8, 59)), 21.0);
        assert_eq!(schedule.setpoint_at(LocalTime::new(DayOfWeek::Fri, 9, 0)), 18.0);
        assert_eq!(schedule.setpoint_at(LocalTime::new(DayOfWeek::Sat, 23, 30)), 22.0);
    }

    #[test]
    fn empty_previous_day_falls_back() {
        let mut schedule = WeekSchedule::default();
        schedule.days[DayOfWeek::Sun.index()].points.clear();

        assert_eq!(
            schedule.setpoint_at(LocalTime::new(DayOfWeek::Mon, 5, 0)),
            FALLBACK_SETPOINT_C
        );
    }

    #[test]
    fn encoded_schedule_round_trips() {
        let mut schedule = WeekSchedule::default();
        schedule.days[DayOfWeek::Wed.index()].points = vec![SchedulePoint::new(12, 15, 19.75)];
        schedule.days[DayOfWeek::Thu.index()].points.clear();

        let bytes = schedule.encode();
        assert_eq!(bytes.len(), ENCODED_SIZE);
        assert_eq!(WeekSchedule::decode(&bytes).unwrap(), schedule);
    }

    #[test]
    fn decode_rejects_bad_counts() {
        let mut bytes = WeekSchedule::default().encode();
        bytes[DAY_SIZE - 1] = 9;
        assert_eq!(
            WeekSchedule::decode(&bytes),
            Err(ScheduleError::TooManyPoints {
                day: DayOfWeek::Sun,
                count: 9
            })
        );
        assert_eq!(
            WeekSchedule::decode(&bytes[..10]),
            Err(ScheduleError::InvalidLength(10))
        );
    }

    #[test]
    fn validate_limits_points_per_day() {
        let mut schedule = WeekSchedule::default();
        schedule.days[DayOfWeek::Mon.index()]
            .points
            .push(SchedulePoint::new(23, 30, 20.0));

        assert_eq!(
            schedule.validate(),
            Err(ScheduleError::TooManyPoints {
                day: DayOfWeek::Mon,
                count: 5
            })
        );
    }

    #[test]
    fn validate_rejects_out_of_range_points() {
        let mut schedule = WeekSchedule::default();
        schedule.days[DayOfWeek::Tue.index()].points[1].minute = 60;
        assert!(matches!(
            schedule.validate(),
            Err(ScheduleError::InvalidTime { index: 1, .. })
        ));

        let mut schedule = WeekSchedule::default();
        schedule.days[DayOfWeek::Tue.index()].points[0].temperature = f32::NAN;
        assert!(matches!(
            schedule.validate(),
            Err(ScheduleError::InvalidTemperature { index: 0, .. })
        ));
    }

    #[test]
    fn finds_next_change_later_today() {
        let schedule = WeekSchedule::default();
        // Jan 5, 2026 is a Monday.
        let now = fixed_time(5, 9, 1);
        let next = schedule.next_change_epoch(&now).unwrap();

        assert_eq!(next, fixed_time(5, 18, 0).timestamp());
    }

    #[test]
    fn next_change_wraps_to_following_day() {
        let schedule = WeekSchedule::default();
        // Friday 23:10 -> Saturday 08:00.
        let now = fixed_time(9, 23, 10);
        let next = schedule.next_change_epoch(&now).unwrap();

        assert_eq!(next, fixed_time(10, 8, 0).timestamp());
    }

    #[test]
    fn empty_schedule_has_no_next_change() {
        let schedule = WeekSchedule {
            days: Default::default(),
        };
        assert_eq!(schedule.next_change_epoch(&Utc::now()), None);
    }

    #[test]
    fn local_time_uses_sunday_first_index() {
        // Jan 4, 2026 is a Sunday.
        let now = fixed_time(4, 13, 45);
        let local = LocalTime::from_datetime(&now);

        assert_eq!(local, LocalTime::new(DayOfWeek::Sun, 13, 45));
        assert_eq!(local.day.index(), 0);
    }

    #[test]
    fn missing_schedule_is_seeded_with_default() {
        let store = MemoryStore::new();
        let (schedule, err) = WeekSchedule::load(&store);

        assert!(err.is_none());
        assert_eq!(schedule, WeekSchedule::default());
        assert!(store.load_blob(NAMESPACE, KEY, ENCODED_SIZE).is_ok());
    }

    #[test]
    fn persisted_schedule_is_loaded() {
        let store = MemoryStore::new();
        let mut schedule = WeekSchedule::default();
        schedule.days[DayOfWeek::Wed.index()].points = vec![SchedulePoint::new(5, 15, 23.5)];
        schedule.persist(&store).unwrap();

        let (loaded, err) = WeekSchedule::load(&store);
        assert!(err.is_none());
        assert_eq!(loaded, schedule);
    }

    #[test]
    fn corrupt_schedule_falls_back_to_default() {
        let store = MemoryStore::new();
        let mut raw = WeekSchedule::default().encode();
        raw[2] = 0xff;
        raw[3] = 0xff;
        raw[4] = 0xff;
        raw[5] = 0xff;
        store.save_blob(NAMESPACE, KEY, &raw).unwrap();

        let (loaded, err) = WeekSchedule::load(&store);
        assert!(err.is_none());
        assert_eq!(loaded, WeekSchedule::default());
    }
}
