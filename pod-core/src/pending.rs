use std::time::{Duration, SystemTime};

use pod_protocol::{BasalSchedule, DeliveryType};
use serde::{Deserialize, Serialize};

use crate::dose::{ScheduledCertainty, UnfinalizedDose};

/// A delivery-starting program, kept alongside its in-flight command so
/// the dose can be reconstructed if the acknowledgement is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StartProgram {
    /// Immediate bolus.
    Bolus {
        /// Requested volume in units.
        units: f64,
    },
    /// Temporary basal rate overriding the schedule.
    TempBasal {
        /// Requested rate.
        units_per_hour: f64,
        /// How long the rate should run.
        duration: Duration,
        /// Whether the rate exceeds the scheduled basal.
        is_high_temp: bool,
    },
    /// (Re)start of the programmed basal schedule.
    BasalProgram {
        /// The schedule being programmed.
        schedule: BasalSchedule,
    },
}

impl StartProgram {
    /// The dose record this program produces if the pod executed it.
    /// A basal program shows up in history as a resume.
    pub fn unfinalized_dose(
        &self,
        at: SystemTime,
        certainty: ScheduledCertainty,
    ) -> UnfinalizedDose {
        match self {
            StartProgram::Bolus { units } => UnfinalizedDose::bolus(*units, at, certainty),
            StartProgram::TempBasal {
                units_per_hour,
                duration,
                is_high_temp,
            } => UnfinalizedDose::temp_basal(*units_per_hour, at, *duration, *is_high_temp, certainty),
            StartProgram::BasalProgram { .. } => UnfinalizedDose::resume(at, certainty),
        }
    }
}

/// A delivery-changing command whose outcome is not yet confirmed.
///
/// Recorded immediately before the command goes out and cleared when the
/// response settles the outcome. If no response ever arrives, the record
/// carries everything needed to reconcile against a later status poll
/// (sequence number match) or to resolve pessimistically when the pod is
/// abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PendingCommand {
    /// A command that starts delivery.
    Program {
        /// What was asked for.
        program: StartProgram,
        /// Message sequence number the command went out with.
        sequence: u8,
        /// When the command was issued.
        command_date: SystemTime,
        /// True only while the exchange carrying it is still running.
        in_flight: bool,
    },
    /// A command that stops one or more kinds of delivery.
    StopProgram {
        /// Which deliveries the command cancels.
        delivery: DeliveryType,
        /// Message sequence number the command went out with.
        sequence: u8,
        /// When the command was issued.
        command_date: SystemTime,
        /// True only while the exchange carrying it is still running.
        in_flight: bool,
    },
}

impl PendingCommand {
    /// When the command was issued.
    pub fn command_date(&self) -> SystemTime {
        match self {
            PendingCommand::Program { command_date, .. }
            | PendingCommand::StopProgram { command_date, .. } => *command_date,
        }
    }

    /// The message sequence number the command went out with.
    pub fn sequence(&self) -> u8 {
        match self {
            PendingCommand::Program { sequence, .. }
            | PendingCommand::StopProgram { sequence, .. } => *sequence,
        }
    }

    /// True while the exchange carrying the command is still running.
    pub fn is_in_flight(&self) -> bool {
        match self {
            PendingCommand::Program { in_flight, .. }
            | PendingCommand::StopProgram { in_flight, .. } => *in_flight,
        }
    }

    /// The same command with the in-flight grace period ended.
    pub fn comms_finished(mut self) -> PendingCommand {
        match &mut self {
            PendingCommand::Program { in_flight, .. }
            | PendingCommand::StopProgram { in_flight, .. } => *in_flight = false,
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dose::DoseType;
    use std::time::UNIX_EPOCH;

    fn at() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn comms_finished_ends_the_grace_period() {
        let pending = PendingCommand::Program {
            program: StartProgram::Bolus { units: 1.0 },
            sequence: 7,
            command_date: at(),
            in_flight: true,
        };
        assert!(pending.is_in_flight());
        let finished = pending.comms_finished();
        assert!(!finished.is_in_flight());
        assert_eq!(finished.sequence(), 7);
        assert_eq!(finished.command_date(), at());
    }

    #[test]
    fn bolus_program_maps_to_bolus_dose() {
        let program = StartProgram::Bolus { units: 3.0 };
        let dose = program.unfinalized_dose(at(), ScheduledCertainty::Uncertain);
        assert_eq!(dose.dose_type, DoseType::Bolus);
        assert_eq!(dose.units, 3.0);
        assert_eq!(dose.scheduled_certainty, ScheduledCertainty::Uncertain);
    }

    #[test]
    fn temp_basal_program_keeps_rate_and_height() {
        let program = StartProgram::TempBasal {
            units_per_hour: 2.0,
            duration: Duration::from_secs(1800),
            is_high_temp: true,
        };
        let dose = program.unfinalized_dose(at(), ScheduledCertainty::Certain);
        assert_eq!(dose.dose_type, DoseType::TempBasal);
        assert!(dose.is_high_temp);
        assert!((dose.rate() - 2.0).abs() < 1e-9);
        assert_eq!(dose.duration, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn basal_program_maps_to_resume() {
        let program = StartProgram::BasalProgram {
            schedule: BasalSchedule::flat(0.8),
        };
        let dose = program.unfinalized_dose(at(), ScheduledCertainty::Certain);
        assert_eq!(dose.dose_type, DoseType::Resume);
        assert_eq!(dose.units, 0.0);
    }
}
