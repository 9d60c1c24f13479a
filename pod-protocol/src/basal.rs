//! Daily basal schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One segment of a basal schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BasalScheduleEntry {
    /// Delivery rate in units per hour.
    pub rate: f64,
    /// Offset from midnight at which this rate begins.
    pub start_time: Duration,
}

/// Why a basal schedule failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BasalScheduleError {
    /// A schedule needs at least one entry.
    #[error("basal schedule has no entries")]
    Empty,
    /// The first entry must cover the start of the day.
    #[error("basal schedule must start at midnight")]
    DoesNotStartAtMidnight,
    /// Entries must be strictly ordered by start time.
    #[error("basal schedule entries out of order")]
    Unordered,
}

/// A 24-hour basal program: a rate for every moment of the day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasalSchedule {
    entries: Vec<BasalScheduleEntry>,
}

impl BasalSchedule {
    /// Validate and build a schedule.
    pub fn new(entries: Vec<BasalScheduleEntry>) -> Result<BasalSchedule, BasalScheduleError> {
        match entries.first() {
            None => return Err(BasalScheduleError::Empty),
            Some(first) if !first.start_time.is_zero() => {
                return Err(BasalScheduleError::DoesNotStartAtMidnight)
            }
            _ => {}
        }
        if entries
            .windows(2)
            .any(|pair| pair[0].start_time >= pair[1].start_time)
        {
            return Err(BasalScheduleError::Unordered);
        }
        Ok(BasalSchedule { entries })
    }

    /// Single-segment schedule delivering `rate` all day.
    pub fn flat(rate: f64) -> BasalSchedule {
        BasalSchedule {
            entries: vec![BasalScheduleEntry {
                rate,
                start_time: Duration::ZERO,
            }],
        }
    }

    /// The segments, ordered by start time.
    pub fn entries(&self) -> &[BasalScheduleEntry] {
        &self.entries
    }

    /// Rate in effect at `offset` past midnight.
    pub fn rate_at(&self, offset: Duration) -> f64 {
        let mut rate = 0.0;
        for entry in &self.entries {
            if entry.start_time <= offset {
                rate = entry.rate;
            } else {
                break;
            }
        }
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hours(n: u64) -> Duration {
        Duration::from_secs(n * 60 * 60)
    }

    #[test]
    fn rejects_empty_schedule() {
        assert_eq!(BasalSchedule::new(vec![]), Err(BasalScheduleError::Empty));
    }

    #[test]
    fn rejects_schedule_not_starting_at_midnight() {
        let entries = vec![BasalScheduleEntry {
            rate: 1.0,
            start_time: hours(6),
        }];
        assert_eq!(
            BasalSchedule::new(entries),
            Err(BasalScheduleError::DoesNotStartAtMidnight)
        );
    }

    #[test]
    fn rejects_unordered_entries() {
        let entries = vec![
            BasalScheduleEntry {
                rate: 1.0,
                start_time: Duration::ZERO,
            },
            BasalScheduleEntry {
                rate: 2.0,
                start_time: hours(12),
            },
            BasalScheduleEntry {
                rate: 1.5,
                start_time: hours(12),
            },
        ];
        assert_eq!(BasalSchedule::new(entries), Err(BasalScheduleError::Unordered));
    }

    #[test]
    fn rate_at_picks_covering_segment() {
        let schedule = BasalSchedule::new(vec![
            BasalScheduleEntry {
                rate: 0.5,
                start_time: Duration::ZERO,
            },
            BasalScheduleEntry {
                rate: 1.2,
                start_time: hours(8),
            },
            BasalScheduleEntry {
                rate: 0.8,
                start_time: hours(20),
            },
        ])
        .unwrap();

        assert_eq!(schedule.rate_at(Duration::ZERO), 0.5);
        assert_eq!(schedule.rate_at(hours(7)), 0.5);
        assert_eq!(schedule.rate_at(hours(8)), 1.2);
        assert_eq!(schedule.rate_at(hours(19)), 1.2);
        assert_eq!(schedule.rate_at(hours(23)), 0.8);
    }

    #[test]
    fn flat_schedule_covers_whole_day() {
        let schedule = BasalSchedule::flat(1.05);
        assert_eq!(schedule.rate_at(Duration::ZERO), 1.05);
        assert_eq!(schedule.rate_at(hours(23)), 1.05);
    }
}
