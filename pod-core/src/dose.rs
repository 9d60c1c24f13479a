use std::time::{Duration, SystemTime};

use pod_protocol::constants::{BOLUS_DELIVERY_RATE, PULSES_PER_UNIT};
use serde::{Deserialize, Serialize};

const SECONDS_PER_HOUR: f64 = 3600.0;

fn hours(duration: Duration) -> f64 {
    duration.as_secs_f64() / SECONDS_PER_HOUR
}

/// What kind of delivery an [`UnfinalizedDose`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoseType {
    /// A one-shot bolus.
    Bolus,
    /// A temporary basal rate.
    TempBasal,
    /// Delivery stopped.
    Suspend,
    /// Delivery restarted on the programmed schedule.
    Resume,
}

/// Whether the pod is known to have scheduled a dose.
///
/// A dose starts `Certain` when the pod acknowledged the command that
/// created it. Doses reconstructed while giving up on an unacknowledged
/// command are `Uncertain`; they keep that mark into history so the upper
/// layer can annotate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduledCertainty {
    /// The pod confirmed the dose was scheduled.
    Certain,
    /// The confirmation was lost; the dose is assumed.
    Uncertain,
}

/// A dose in progress, or finished but not yet handed to history storage.
///
/// `units` always reflects the best current estimate of delivered volume.
/// When a dose is cut short, the original request is preserved in
/// `scheduled_units` (and `scheduled_temp_rate` for temp basals) and
/// `units` drops to what actually went in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfinalizedDose {
    /// What kind of delivery this records.
    pub dose_type: DoseType,
    /// Estimated delivered volume in units (zero for suspend/resume).
    pub units: f64,
    /// Originally requested volume, set when the dose is cancelled early.
    pub scheduled_units: Option<f64>,
    /// Originally requested temp rate, set when the dose is cancelled
    /// early; `units` is then discretized to whole pump pulses, which
    /// changes the effective rate.
    pub scheduled_temp_rate: Option<f64>,
    /// When delivery started.
    pub start_time: SystemTime,
    /// Expected (or actual, once cancelled) delivery length. `None` for
    /// an open-ended suspend or resume.
    pub duration: Option<Duration>,
    /// Whether the pod confirmed scheduling this dose.
    pub scheduled_certainty: ScheduledCertainty,
    /// For temp basals, whether the rate exceeds the scheduled basal.
    /// Decides which way an unconfirmed cancellation is resolved.
    pub is_high_temp: bool,
}

impl UnfinalizedDose {
    /// A bolus of `units`, with duration derived from the fixed pulse
    /// delivery rate.
    pub fn bolus(units: f64, start_time: SystemTime, certainty: ScheduledCertainty) -> Self {
        UnfinalizedDose {
            dose_type: DoseType::Bolus,
            units,
            scheduled_units: None,
            scheduled_temp_rate: None,
            start_time,
            duration: Some(
                Duration::try_from_secs_f64(units / BOLUS_DELIVERY_RATE)
                    .unwrap_or(Duration::ZERO),
            ),
            scheduled_certainty: certainty,
            is_high_temp: false,
        }
    }

    /// A temp basal at `units_per_hour` for `duration`.
    pub fn temp_basal(
        units_per_hour: f64,
        start_time: SystemTime,
        duration: Duration,
        is_high_temp: bool,
        certainty: ScheduledCertainty,
    ) -> Self {
        UnfinalizedDose {
            dose_type: DoseType::TempBasal,
            units: units_per_hour * hours(duration),
            scheduled_units: None,
            scheduled_temp_rate: None,
            start_time,
            duration: Some(duration),
            scheduled_certainty: certainty,
            is_high_temp,
        }
    }

    /// A suspension of delivery starting at `start_time`.
    pub fn suspend(start_time: SystemTime, certainty: ScheduledCertainty) -> Self {
        UnfinalizedDose {
            dose_type: DoseType::Suspend,
            units: 0.0,
            scheduled_units: None,
            scheduled_temp_rate: None,
            start_time,
            duration: None,
            scheduled_certainty: certainty,
            is_high_temp: false,
        }
    }

    /// A return to scheduled delivery starting at `start_time`.
    pub fn resume(start_time: SystemTime, certainty: ScheduledCertainty) -> Self {
        UnfinalizedDose {
            dose_type: DoseType::Resume,
            units: 0.0,
            scheduled_units: None,
            scheduled_temp_rate: None,
            start_time,
            duration: None,
            scheduled_certainty: certainty,
            is_high_temp: false,
        }
    }

    /// When delivery is (or was) expected to end.
    pub fn finish_time(&self) -> Option<SystemTime> {
        self.duration.map(|duration| self.start_time + duration)
    }

    /// Moves the end of delivery to `at`. Clamps to a zero-length dose if
    /// `at` precedes the start, which can happen when clocks change.
    pub fn set_finish_time(&mut self, at: SystemTime) {
        self.duration = Some(
            at.duration_since(self.start_time)
                .unwrap_or(Duration::ZERO),
        );
    }

    /// Fraction of the dose delivered by `at`, in `0.0..=1.0`.
    pub fn progress(&self, at: SystemTime) -> f64 {
        let Some(duration) = self.duration else {
            return 0.0;
        };
        let elapsed = at
            .duration_since(self.start_time)
            .unwrap_or(Duration::ZERO);
        (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0)
    }

    /// Whether delivery has run to completion by `at`.
    pub fn is_finished(&self, at: SystemTime) -> bool {
        self.progress(at) >= 1.0
    }

    /// Delivery rate in units per hour, zero for open-ended doses.
    pub fn rate(&self) -> f64 {
        match self.duration {
            Some(duration) => self.units / hours(duration),
            None => 0.0,
        }
    }

    /// Cuts the dose short at `at`, preserving the originally scheduled
    /// amount and recomputing `units` to the delivered volume.
    ///
    /// For a bolus, `remaining` (the pod's own units-not-delivered figure)
    /// gives the exact truncation; without it delivery is assumed to have
    /// run at the nominal rate until `at`. A cancelled temp basal is
    /// rounded down to whole pump pulses. No-op once the dose finished.
    pub fn cancel(&mut self, at: SystemTime, remaining: Option<f64>) {
        match self.finish_time() {
            Some(finish) if at < finish => {}
            _ => return,
        }

        self.scheduled_units = Some(self.units);
        let new_duration = at
            .duration_since(self.start_time)
            .unwrap_or(Duration::ZERO);

        match self.dose_type {
            DoseType::Bolus => {
                let old_rate = self.rate();
                self.units = match remaining {
                    Some(remaining) => self.units - remaining,
                    None => old_rate * hours(new_duration),
                };
            }
            DoseType::TempBasal => {
                let rate = self.rate();
                self.scheduled_temp_rate = Some(rate);
                self.units = (rate * hours(new_duration) * PULSES_PER_UNIT).floor()
                    / PULSES_PER_UNIT;
            }
            DoseType::Suspend | DoseType::Resume => {}
        }
        self.duration = Some(new_duration);
    }
}

/// Last known insulin accounting reported by the pod.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PodInsulinMeasurements {
    /// When the reading was taken.
    pub valid_time: SystemTime,
    /// Cumulative units delivered since setup completed. Never decreases
    /// across readings.
    pub delivered_units: f64,
    /// Reservoir reading; `None` while above the measurement floor.
    pub reservoir_level: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn start() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn bolus_duration_comes_from_delivery_rate() {
        let bolus = UnfinalizedDose::bolus(2.5, start(), ScheduledCertainty::Certain);
        // 2.5 U at 0.05 U per 2-second pulse is 100 seconds.
        assert_eq!(bolus.duration, Some(Duration::from_secs(100)));
        assert_eq!(bolus.finish_time(), Some(start() + Duration::from_secs(100)));
    }

    #[test]
    fn temp_basal_units_cover_the_whole_duration() {
        let temp = UnfinalizedDose::temp_basal(
            1.5,
            start(),
            Duration::from_secs(30 * 60),
            true,
            ScheduledCertainty::Certain,
        );
        assert!((temp.units - 0.75).abs() < 1e-9);
        assert!((temp.rate() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn progress_runs_from_zero_to_one() {
        let bolus = UnfinalizedDose::bolus(2.5, start(), ScheduledCertainty::Certain);
        assert_eq!(bolus.progress(start()), 0.0);
        assert!((bolus.progress(start() + Duration::from_secs(50)) - 0.5).abs() < 1e-9);
        assert!(bolus.is_finished(start() + Duration::from_secs(100)));
        assert!(bolus.is_finished(start() + Duration::from_secs(500)));
        assert!(!bolus.is_finished(start() + Duration::from_secs(99)));
    }

    #[test]
    fn cancel_bolus_uses_pod_reported_remainder() {
        let mut bolus = UnfinalizedDose::bolus(2.5, start(), ScheduledCertainty::Certain);
        bolus.cancel(start() + Duration::from_secs(40), Some(1.6));
        assert!((bolus.units - 0.9).abs() < 1e-9);
        assert_eq!(bolus.scheduled_units, Some(2.5));
        assert_eq!(bolus.duration, Some(Duration::from_secs(40)));
    }

    #[test]
    fn cancel_bolus_without_remainder_assumes_nominal_rate() {
        let mut bolus = UnfinalizedDose::bolus(2.5, start(), ScheduledCertainty::Certain);
        bolus.cancel(start() + Duration::from_secs(40), None);
        // 40 s at 0.025 U/s.
        assert!((bolus.units - 1.0).abs() < 1e-9);
        assert_eq!(bolus.scheduled_units, Some(2.5));
    }

    #[test]
    fn cancel_temp_basal_rounds_down_to_whole_pulses() {
        let mut temp = UnfinalizedDose::temp_basal(
            1.0,
            start(),
            Duration::from_secs(30 * 60),
            false,
            ScheduledCertainty::Certain,
        );
        temp.cancel(start() + Duration::from_secs(10 * 60), None);
        // 10 minutes at 1 U/h is 0.1667 U, floored to 3 pulses of 0.05 U.
        assert!((temp.units - 0.15).abs() < 1e-9);
        assert_eq!(temp.scheduled_temp_rate, Some(1.0));
        assert_eq!(temp.scheduled_units, Some(0.5));
        assert_eq!(temp.duration, Some(Duration::from_secs(600)));
    }

    #[test]
    fn cancel_after_finish_is_a_no_op() {
        let mut bolus = UnfinalizedDose::bolus(1.0, start(), ScheduledCertainty::Certain);
        let before = bolus.clone();
        bolus.cancel(start() + Duration::from_secs(3600), None);
        assert_eq!(bolus, before);
    }

    #[test]
    fn finish_time_can_be_pulled_earlier() {
        let mut bolus = UnfinalizedDose::bolus(2.5, start(), ScheduledCertainty::Certain);
        bolus.set_finish_time(start() + Duration::from_secs(30));
        assert_eq!(bolus.duration, Some(Duration::from_secs(30)));
        assert!(bolus.is_finished(start() + Duration::from_secs(30)));
    }

    #[test]
    fn suspend_and_resume_are_open_ended() {
        let suspend = UnfinalizedDose::suspend(start(), ScheduledCertainty::Certain);
        assert_eq!(suspend.finish_time(), None);
        assert_eq!(suspend.rate(), 0.0);
        assert!(!suspend.is_finished(start() + Duration::from_secs(86400)));

        let resume = UnfinalizedDose::resume(start(), ScheduledCertainty::Uncertain);
        assert_eq!(resume.units, 0.0);
        assert_eq!(resume.scheduled_certainty, ScheduledCertainty::Uncertain);
    }
}
