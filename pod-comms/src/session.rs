//! One locked conversation with a pod.
//!
//! A [`PodCommsSession`] borrows the pod state and a transport for the
//! duration of one session and exposes every command the pod understands:
//! the setup sequence, insulin programs, cancellation, alerts, status
//! queries, and deactivation. All delivery bookkeeping happens here, at
//! the moment the response (or its absence) settles what the pod did.
//!
//! Delivery-changing commands never return a plain `Result`: a radio
//! exchange can die after the pod acted, so their outcome is three-valued
//! ([`DeliveryCommandResult`]), and an unacknowledged command stays
//! recorded in the pod state until a later status poll settles it.

use std::time::{Duration, SystemTime};

use thiserror::Error;

use pod_core::{
    DoseType, PendingCommand, PodState, ScheduledCertainty, SetupProgress, StartProgram,
    SuspendState, UnfinalizedDose,
};
use pod_protocol::constants::{
    CANNULA_INSERTION_UNITS, CANNULA_INSERTION_UNITS_EXTRA, END_OF_SERVICE_IMMINENT_WINDOW,
    EXPIRATION_ADVISORY_WINDOW, NOMINAL_POD_LIFE, PRIME_DELIVERY_RATE, PRIME_UNITS,
    SECONDS_PER_BOLUS_PULSE, SECONDS_PER_PRIME_PULSE, SERVICE_DURATION,
};
use pod_protocol::{
    AcknowledgeAlertsCommand, AlertSet, BasalSchedule, BeepConfigCommand, BeepType,
    CancelDeliveryCommand, ConfigureAlertsCommand, DeactivatePodCommand, DeliverySchedule,
    DeliveryStatus, DeliveryType, DetailedStatus, ErrorResponse, ExpectedResponse,
    FaultConfigCommand, GetStatusCommand, Message, MessageBlock, MessageBlockType, PodAlert,
    PodInfoResponse, PodInfoType, PodProgressStatus, SetInsulinScheduleCommand, StatusResponse,
};

use crate::transport::{MessageTransport, TransportError};

/// Errors surfaced by pod sessions and pairing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PodCommsError {
    /// No pod is attached.
    #[error("no pod is paired")]
    PodNotPaired,

    /// Pairing was attempted while a fully set up pod is attached.
    #[error("a pod is already paired")]
    PodAlreadyPaired,

    /// The pod answered with a message carrying no blocks.
    #[error("empty response from pod")]
    EmptyResponse,

    /// The pod answered with a block the operation cannot use.
    #[error("unexpected response from pod: {block_type}")]
    UnexpectedResponse {
        /// Kind of block the pod sent.
        block_type: MessageBlockType,
    },

    /// A pairing response came back for a different address.
    #[error("pod accepted address 0x{address:08X}, expected 0x{expected_address:08X}")]
    InvalidAddress {
        /// Address in the response.
        address: u32,
        /// Address pairing asked for.
        expected_address: u32,
    },

    /// Both nonce resynchronization attempts were rejected.
    #[error("nonce resynchronization failed")]
    NonceResyncFailed,

    /// The pod rejected the command for a reason a resend cannot fix.
    #[error("pod rejected command with error code {error_code:#04x}")]
    RejectedMessage {
        /// Raw rejection code.
        error_code: u8,
    },

    /// The pod has latched a fault and stopped all delivery.
    #[error("pod fault: {}", .fault.fault_event_code)]
    PodFault {
        /// The fault record the pod reported.
        fault: Box<DetailedStatus>,
    },

    /// Setup was not finished within the firmware's activation window.
    #[error("activation time exceeded")]
    ActivationTimeExceeded,

    /// Pairing signal too weak to trust.
    #[error("pod signal strength too low")]
    RssiTooLow,

    /// Pairing signal implausibly strong, usually a pod sitting right on
    /// top of the radio.
    #[error("pod signal strength too high")]
    RssiTooHigh,

    /// A pod other than the attached one answered.
    #[error("a different pod responded")]
    PodChange,

    /// The pod reports delivery constants this controller was not built
    /// for.
    #[error("pod reported incompatible delivery constants")]
    PodIncompatible,

    /// The pod answered pairing but never reached the paired stage.
    #[error("pod did not complete pairing")]
    PairingIncomplete,

    /// A previous delivery command is still awaiting acknowledgement.
    #[error("a previous command is awaiting acknowledgement")]
    UnacknowledgedCommandPending,

    /// A bolus is still running.
    #[error("a bolus is still running")]
    UnfinalizedBolus,

    /// The operation needs a fully set up pod.
    #[error("pod setup is not complete")]
    SetupNotComplete,

    /// The exchange failed in the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Outcome of a command that starts delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryCommandResult {
    /// The pod confirmed the program.
    Success {
        /// Status returned with the confirmation.
        status: StatusResponse,
    },
    /// The command never reached the pod.
    CertainFailure {
        /// Why it failed.
        error: PodCommsError,
    },
    /// The command reached the pod but the response was lost; whether
    /// the program runs is unknown until a status poll settles it.
    Unacknowledged {
        /// The transport failure that lost the response.
        error: PodCommsError,
    },
}

/// Outcome of a command that stops delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelDeliveryResult {
    /// The pod confirmed the cancellation.
    Success {
        /// Status returned with the confirmation.
        status: StatusResponse,
        /// The interrupted dose, if one was running.
        canceled_dose: Option<UnfinalizedDose>,
    },
    /// The command never reached the pod.
    CertainFailure {
        /// Why it failed.
        error: PodCommsError,
    },
    /// The command reached the pod but the response was lost.
    Unacknowledged {
        /// The transport failure that lost the response.
        error: PodCommsError,
    },
}

/// One conversation with a pod.
///
/// Holds exclusive borrows of the pod state and the transport, so every
/// state transition it makes is observed by whoever runs the session.
pub struct PodCommsSession<'a> {
    pod_state: &'a mut PodState,
    transport: &'a mut dyn MessageTransport,
    pub(crate) mock_current_date: Option<SystemTime>,
}

impl<'a> PodCommsSession<'a> {
    /// Start a session over `transport` against `pod_state`.
    pub fn new(
        pod_state: &'a mut PodState,
        transport: &'a mut dyn MessageTransport,
    ) -> PodCommsSession<'a> {
        PodCommsSession {
            pod_state,
            transport,
            mock_current_date: None,
        }
    }

    /// The pod state as this session currently sees it.
    pub fn pod_state(&self) -> &PodState {
        self.pod_state
    }

    fn current_date(&self) -> SystemTime {
        self.mock_current_date.unwrap_or_else(SystemTime::now)
    }

    /// Run one command exchange and extract the expected response kind.
    ///
    /// A nonce rejection is repaired in place: the nonce generator is
    /// resynchronized from the pod's sync word, every nonce-bearing block
    /// is rewritten, and the message is resent once under the same
    /// sequence number. Anything else (a fault record, a non-retryable
    /// rejection, an unexpected block) maps to an error here so callers
    /// only ever see the response type they asked for.
    pub fn send<R: ExpectedResponse>(
        &mut self,
        blocks: Vec<MessageBlock>,
        beep_block: Option<MessageBlock>,
        expect_follow_on_message: bool,
    ) -> Result<R, PodCommsError> {
        let mut blocks_to_send = blocks;
        if let Some(beep_block) = beep_block {
            // A faulted pod rejects beeps appended to other commands.
            if !self.pod_state.is_faulted() {
                blocks_to_send.push(beep_block);
            }
        }

        // Blocks were built with the current nonce; consume it up front
        // so a rewrite after resync starts from a clean generator.
        if blocks_to_send.iter().any(|block| block.nonce().is_some()) {
            self.pod_state.advance_to_next_nonce();
        }

        let message_number = self.transport.message_number();
        let mut tries_remaining = 2;

        while tries_remaining > 0 {
            tries_remaining -= 1;
            let sent_nonce = blocks_to_send.iter().find_map(MessageBlock::nonce);

            let mut message = Message::new(
                self.pod_state.address(),
                blocks_to_send.clone(),
                message_number,
            );
            message.expect_follow_on_message = expect_follow_on_message;

            // If this exchange dies after the pod acted, a stale cached
            // status must not short-circuit the next delivery pre-check.
            self.pod_state.last_delivery_status_received = None;

            tracing::debug!(
                sequence = message_number,
                blocks = blocks_to_send.len(),
                "sending message to pod"
            );
            let exchange = self.transport.send_message(&message);
            self.pod_state.message_transport_state = self.transport.state();
            let response = exchange?;

            let Some(first) = response.message_blocks.into_iter().next() else {
                return Err(PodCommsError::EmptyResponse);
            };

            // The expected kind wins even on a faulted pod; a detailed
            // status query receives the fault record as its answer.
            let first = match R::extract(first) {
                Ok(payload) => return Ok(payload),
                Err(block) => block,
            };

            if let MessageBlock::PodInfoResponse(info) = &first {
                if let Some(fault) = info.detailed_status() {
                    if fault.is_faulted() {
                        let fault = fault.clone();
                        return Err(self.pod_fault_error(fault));
                    }
                }
            }

            let block_type = first.block_type();
            let MessageBlock::ErrorResponse(error_response) = first else {
                tracing::error!(%block_type, "unexpected response from pod");
                return Err(PodCommsError::UnexpectedResponse { block_type });
            };

            match error_response {
                ErrorResponse::BadNonce { nonce_resync_key } => {
                    let Some(sent_nonce) = sent_nonce else {
                        // A nonce rejection of a nonce-free message cannot
                        // be repaired.
                        break;
                    };
                    self.pod_state
                        .resync_nonce(nonce_resync_key, sent_nonce, message_number);
                    let nonce = self.pod_state.current_nonce();
                    tracing::info!(nonce, "pod rejected nonce, resynchronized");
                    for block in &mut blocks_to_send {
                        block.set_nonce(nonce);
                    }
                    self.pod_state.advance_to_next_nonce();
                }
                ErrorResponse::Nonretryable {
                    code,
                    fault_event_code,
                    pod_progress,
                } => {
                    tracing::error!(code, %fault_event_code, %pod_progress, "pod rejected command");
                    return Err(PodCommsError::RejectedMessage { error_code: code });
                }
            }
        }

        Err(PodCommsError::NonceResyncFailed)
    }

    // =========================================================
    // Fault handling
    // =========================================================

    /// Latch a newly reported fault into the pod state.
    ///
    /// Delivery stopped at the fault moment, so tracked doses are
    /// cancelled there, the pending command (if any) is reconciled
    /// against the fault's own accounting, and the status embedded in
    /// the record is applied. Only the first fault ever latches.
    fn handle_pod_fault(&mut self, fault: &DetailedStatus) {
        if self.pod_state.fault.is_some() {
            return;
        }
        let now = self.current_date();
        let fault_moment = match (
            self.pod_state.activated_at,
            fault.fault_event_time_since_activation,
        ) {
            (Some(activated_at), Some(elapsed)) => activated_at + elapsed,
            _ => now,
        };
        self.pod_state.fault = Some(fault.clone());
        self.pod_state.active_time = match self.pod_state.activated_at {
            Some(activated_at) => fault_moment.duration_since(activated_at).ok(),
            None => fault.fault_event_time_since_activation,
        };
        self.handle_cancel_dosing(DeliveryType::ALL, fault.bolus_not_delivered, fault_moment);
        let derived = fault.to_status_response();
        if self.pod_state.unacknowledged_command.is_some() {
            self.recover_unacknowledged_command(&derived);
        }
        self.pod_state.update_from_status_response(&derived, fault_moment);
    }

    fn pod_fault_error(&mut self, fault: DetailedStatus) -> PodCommsError {
        tracing::error!(
            code = %fault.fault_event_code,
            progress = %fault.pod_progress_status,
            "pod fault"
        );
        self.handle_pod_fault(&fault);
        if fault.pod_progress_status == PodProgressStatus::ActivationTimeExceeded {
            PodCommsError::ActivationTimeExceeded
        } else {
            PodCommsError::PodFault {
                fault: Box::new(fault),
            }
        }
    }

    // =========================================================
    // Setup sequence
    // =========================================================

    /// Start the prime bolus, returning how long until it finishes.
    ///
    /// Resumable: called again after a lost response, it checks status
    /// first and does not double-prime a pod that is already priming.
    pub fn prime(&mut self) -> Result<Duration, PodCommsError> {
        let prime_duration =
            Duration::from_secs_f64(PRIME_UNITS / PRIME_DELIVERY_RATE) + Duration::from_secs(3);

        if self.pod_state.setup_progress.priming_never_attempted() {
            // Disable the $6x fault window before the first prime, and
            // arm the one-hour finish-setup reminder.
            let fault_config = MessageBlock::FaultConfig(FaultConfigCommand {
                nonce: self.pod_state.current_nonce(),
                tab5_sub16: 0,
                tab5_sub17: 0,
            });
            let _: StatusResponse = self.send(vec![fault_config], None, false)?;
            self.configure_alerts(vec![PodAlert::FinishSetupReminder], false, None)?;
        } else {
            let status = self.get_status()?;
            if matches!(
                status.pod_progress_status,
                PodProgressStatus::Priming | PodProgressStatus::PrimingCompleted
            ) {
                self.pod_state.setup_progress = SetupProgress::Priming;
                let now = self.current_date();
                let remaining = self
                    .pod_state
                    .prime_finish_time
                    .and_then(|finish| finish.duration_since(now).ok())
                    .unwrap_or(prime_duration);
                return Ok(remaining);
            }
        }

        let now = self.current_date();
        let prime_finish_time = now + prime_duration;
        self.pod_state.prime_finish_time = Some(prime_finish_time);
        self.pod_state.setup_progress = SetupProgress::StartingPrime;

        let command = MessageBlock::SetInsulinSchedule(SetInsulinScheduleCommand {
            nonce: self.pod_state.current_nonce(),
            schedule: DeliverySchedule::Bolus {
                units: PRIME_UNITS,
                time_between_pulses: Duration::from_secs_f64(SECONDS_PER_PRIME_PULSE),
            },
        });
        let status: StatusResponse = self.send(vec![command], None, false)?;
        let at = self.current_date();
        self.pod_state.update_from_status_response(&status, at);
        self.pod_state.setup_progress = SetupProgress::Priming;
        tracing::info!("prime bolus started");
        Ok(prime_finish_time.duration_since(at).unwrap_or(Duration::ZERO))
    }

    /// Program the first basal schedule of the pod's life.
    ///
    /// Resumable like [`PodCommsSession::prime`]: a repeat call checks
    /// whether the pod already took the schedule before resending it.
    pub fn program_initial_basal_schedule(
        &mut self,
        schedule: BasalSchedule,
        schedule_offset: Duration,
    ) -> Result<(), PodCommsError> {
        if self.pod_state.setup_progress == SetupProgress::SettingInitialBasalSchedule {
            let status = self.get_status()?;
            if status.pod_progress_status == PodProgressStatus::BasalInitialized {
                self.pod_state.setup_progress = SetupProgress::InitialBasalScheduleSet;
                let now = self.current_date();
                self.pod_state
                    .finalized_doses
                    .push(UnfinalizedDose::resume(now, ScheduledCertainty::Certain));
                return Ok(());
            }
        }

        self.pod_state.setup_progress = SetupProgress::SettingInitialBasalSchedule;
        self.set_basal_schedule(schedule, schedule_offset)?;
        self.pod_state.setup_progress = SetupProgress::InitialBasalScheduleSet;
        let now = self.current_date();
        self.pod_state
            .finalized_doses
            .push(UnfinalizedDose::resume(now, ScheduledCertainty::Certain));
        Ok(())
    }

    /// Start cannula insertion, returning how long until it finishes.
    ///
    /// On the first attempt this also programs the pod's lifecycle
    /// alerts (expiration advisory and shutdown warning), plus any user
    /// alerts supplied by the caller.
    pub fn insert_cannula(
        &mut self,
        optional_alerts: Vec<PodAlert>,
        silent: bool,
    ) -> Result<Duration, PodCommsError> {
        let insertion_units = CANNULA_INSERTION_UNITS + CANNULA_INSERTION_UNITS_EXTRA;

        if self.pod_state.activated_at.is_none() {
            return Err(PodCommsError::PodNotPaired);
        }

        if matches!(
            self.pod_state.setup_progress,
            SetupProgress::StartingInsertCannula | SetupProgress::CannulaInserting
        ) {
            // Insertion may already be running from an attempt whose
            // response was lost; ask the pod before re-bolusing.
            let status: StatusResponse = self.send(
                vec![MessageBlock::GetStatus(GetStatusCommand::default())],
                None,
                false,
            )?;
            let now = self.current_date();
            if status.pod_progress_status == PodProgressStatus::InsertingCannula {
                self.pod_state.setup_progress = SetupProgress::CannulaInserting;
                self.pod_state.update_from_status_response(&status, now);
                let wait = Duration::try_from_secs_f64(
                    status.bolus_not_delivered / PRIME_DELIVERY_RATE,
                )
                .unwrap_or(Duration::ZERO);
                return Ok(wait + Duration::from_secs(1));
            }
            if status.pod_progress_status.ready_for_delivery() {
                self.mark_setup_progress_completed(&status);
                self.pod_state.update_from_status_response(&status, now);
                return Ok(Duration::ZERO);
            }
            self.pod_state.update_from_status_response(&status, now);
        } else {
            let now = self.current_date();
            let elapsed = self
                .pod_state
                .pod_time_updated
                .and_then(|updated| now.duration_since(updated).ok())
                .unwrap_or(Duration::ZERO);
            let pod_time = self.pod_state.pod_time + elapsed;

            let expiration_advisory = PodAlert::Expired {
                offset: pod_time,
                alert_time: NOMINAL_POD_LIFE,
                duration: EXPIRATION_ADVISORY_WINDOW,
                silent,
            };
            let shutdown_imminent = PodAlert::ShutdownImminent {
                offset: pod_time,
                alert_time: SERVICE_DURATION - END_OF_SERVICE_IMMINENT_WINDOW,
                silent,
            };
            let mut alerts = vec![expiration_advisory, shutdown_imminent];
            alerts.extend(optional_alerts);
            self.configure_alerts(alerts, false, None)?;
        }

        self.pod_state.setup_progress = SetupProgress::StartingInsertCannula;
        let command = MessageBlock::SetInsulinSchedule(SetInsulinScheduleCommand {
            nonce: self.pod_state.current_nonce(),
            schedule: DeliverySchedule::Bolus {
                units: insertion_units,
                time_between_pulses: Duration::from_secs_f64(SECONDS_PER_PRIME_PULSE),
            },
        });
        let status: StatusResponse = self.send(vec![command], None, false)?;
        let at = self.current_date();
        self.pod_state.update_from_status_response(&status, at);
        self.pod_state.setup_progress = SetupProgress::CannulaInserting;
        tracing::info!("cannula insertion started");
        Ok(
            Duration::try_from_secs_f64(status.bolus_not_delivered / PRIME_DELIVERY_RATE)
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Poll whether cannula insertion has finished, and if so mark the
    /// pod's setup as complete.
    pub fn check_insertion_completed(&mut self) -> Result<(), PodCommsError> {
        if self.pod_state.setup_progress == SetupProgress::CannulaInserting {
            let status: StatusResponse = self.send(
                vec![MessageBlock::GetStatus(GetStatusCommand::default())],
                None,
                false,
            )?;
            if status.pod_progress_status.ready_for_delivery() {
                self.mark_setup_progress_completed(&status);
            }
            let now = self.current_date();
            self.pod_state.update_from_status_response(&status, now);
        }
        Ok(())
    }

    /// Setup is done; everything delivered so far was setup insulin.
    fn mark_setup_progress_completed(&mut self, status: &StatusResponse) {
        if self.pod_state.setup_progress != SetupProgress::Completed {
            self.pod_state.setup_progress = SetupProgress::Completed;
            self.pod_state.setup_units_delivered = Some(status.insulin_delivered);
            tracing::info!(setup_units = status.insulin_delivered, "pod setup completed");
        }
    }

    // =========================================================
    // Delivery commands
    // =========================================================

    /// Start an immediate bolus.
    pub fn bolus(&mut self, units: f64) -> DeliveryCommandResult {
        if self.pod_state.unacknowledged_command.is_some() {
            return DeliveryCommandResult::CertainFailure {
                error: PodCommsError::UnacknowledgedCommandPending,
            };
        }

        // Verify the pod is not already bolusing whenever local tracking
        // says so, is stale, or is missing entirely.
        let needs_check = self.pod_state.unfinalized_bolus.is_some()
            || match self.pod_state.last_delivery_status_received {
                Some(status) => status.bolusing(),
                None => true,
            };
        if needs_check {
            let status: StatusResponse = match self.send(
                vec![MessageBlock::GetStatus(GetStatusCommand::default())],
                None,
                false,
            ) {
                Ok(status) => status,
                Err(error) => {
                    tracing::warn!("could not verify the pod is idle before bolusing");
                    return DeliveryCommandResult::CertainFailure { error };
                }
            };
            let now = self.current_date();
            self.pod_state.update_from_status_response(&status, now);
            if self.pod_state.unfinalized_bolus.is_some() {
                tracing::info!("bolus refused, the pod is still bolusing");
                return DeliveryCommandResult::CertainFailure {
                    error: PodCommsError::UnfinalizedBolus,
                };
            }
        }

        let command = MessageBlock::SetInsulinSchedule(SetInsulinScheduleCommand {
            nonce: self.pod_state.current_nonce(),
            schedule: DeliverySchedule::Bolus {
                units,
                time_between_pulses: Duration::from_secs_f64(SECONDS_PER_BOLUS_PULSE),
            },
        });

        let command_date = self.current_date();
        self.pod_state.unacknowledged_command = Some(PendingCommand::Program {
            program: StartProgram::Bolus { units },
            sequence: self.transport.message_number(),
            command_date,
            in_flight: true,
        });
        match self.send::<StatusResponse>(vec![command], None, false) {
            Ok(status) => {
                self.pod_state.unacknowledged_command = None;
                self.pod_state.unfinalized_bolus = Some(UnfinalizedDose::bolus(
                    units,
                    command_date,
                    ScheduledCertainty::Certain,
                ));
                let now = self.current_date();
                self.pod_state.update_from_status_response(&status, now);
                tracing::info!(units, "bolus started");
                DeliveryCommandResult::Success { status }
            }
            Err(error) => {
                if self.command_outcome_unknown(&error) {
                    DeliveryCommandResult::Unacknowledged { error }
                } else {
                    DeliveryCommandResult::CertainFailure { error }
                }
            }
        }
    }

    /// Run a flat temp basal rate in place of the schedule.
    pub fn set_temp_basal(
        &mut self,
        units_per_hour: f64,
        duration: Duration,
        is_high_temp: bool,
    ) -> DeliveryCommandResult {
        if self.pod_state.unacknowledged_command.is_some() {
            return DeliveryCommandResult::CertainFailure {
                error: PodCommsError::UnacknowledgedCommandPending,
            };
        }
        if let Some(bolus) = &self.pod_state.unfinalized_bolus {
            if !bolus.is_finished(self.current_date()) {
                return DeliveryCommandResult::CertainFailure {
                    error: PodCommsError::UnfinalizedBolus,
                };
            }
        }

        let command = MessageBlock::SetInsulinSchedule(SetInsulinScheduleCommand {
            nonce: self.pod_state.current_nonce(),
            schedule: DeliverySchedule::TempBasal {
                units_per_hour,
                duration,
            },
        });

        let command_date = self.current_date();
        self.pod_state.unacknowledged_command = Some(PendingCommand::Program {
            program: StartProgram::TempBasal {
                units_per_hour,
                duration,
                is_high_temp,
            },
            sequence: self.transport.message_number(),
            command_date,
            in_flight: true,
        });
        match self.send::<StatusResponse>(vec![command], None, false) {
            Ok(status) => {
                self.pod_state.unacknowledged_command = None;
                self.pod_state.unfinalized_temp_basal = Some(UnfinalizedDose::temp_basal(
                    units_per_hour,
                    command_date,
                    duration,
                    is_high_temp,
                    ScheduledCertainty::Certain,
                ));
                let now = self.current_date();
                self.pod_state.update_from_status_response(&status, now);
                tracing::info!(units_per_hour, "temp basal started");
                DeliveryCommandResult::Success { status }
            }
            Err(error) => {
                if self.command_outcome_unknown(&error) {
                    DeliveryCommandResult::Unacknowledged { error }
                } else {
                    DeliveryCommandResult::CertainFailure { error }
                }
            }
        }
    }

    /// Stop all delivery, optionally arming suspend reminder alerts.
    ///
    /// `suspend_reminder` of zero asks for periodic reminders of an
    /// untimed suspend; a value over five minutes arms both the periodic
    /// reminder and the suspend-time-expired alarm for a timed one.
    pub fn suspend_delivery(
        &mut self,
        suspend_reminder: Option<Duration>,
        silent: bool,
    ) -> CancelDeliveryResult {
        if self.pod_state.unacknowledged_command.is_some() {
            return CancelDeliveryResult::CertainFailure {
                error: PodCommsError::UnacknowledgedCommandPending,
            };
        }
        if self.pod_state.setup_progress != SetupProgress::Completed {
            return CancelDeliveryResult::CertainFailure {
                error: PodCommsError::SetupNotComplete,
            };
        }

        let suspend_time = suspend_reminder.unwrap_or(Duration::ZERO);
        let now = self.current_date();
        let elapsed = self
            .pod_state
            .pod_time_updated
            .and_then(|updated| now.duration_since(updated).ok())
            .unwrap_or(Duration::ZERO);
        let pod_time = self.pod_state.pod_time + elapsed;

        let mut created_alerts: Vec<PodAlert> = Vec::new();
        if suspend_reminder.is_some()
            && (suspend_time.is_zero() || suspend_time > Duration::from_secs(5 * 60))
        {
            created_alerts.push(PodAlert::PodSuspendedReminder {
                active: true,
                offset: pod_time,
                suspend_time,
                time_passed: Duration::ZERO,
                silent,
            });
        }
        if !suspend_time.is_zero() {
            created_alerts.push(PodAlert::SuspendTimeExpired {
                offset: pod_time,
                suspend_time,
                silent,
            });
        }

        let mut blocks = vec![MessageBlock::CancelDelivery(CancelDeliveryCommand {
            nonce: self.pod_state.current_nonce(),
            delivery_type: DeliveryType::ALL,
            beep_type: BeepType::NoBeepCancel,
        })];
        if !created_alerts.is_empty() {
            blocks.push(MessageBlock::ConfigureAlerts(ConfigureAlertsCommand {
                nonce: self.pod_state.current_nonce(),
                configurations: created_alerts.iter().map(PodAlert::configuration).collect(),
            }));
        }

        self.pod_state.unacknowledged_command = Some(PendingCommand::StopProgram {
            delivery: DeliveryType::ALL,
            sequence: self.transport.message_number(),
            command_date: now,
            in_flight: true,
        });
        match self.send::<StatusResponse>(blocks, None, false) {
            Ok(status) => {
                self.pod_state.unacknowledged_command = None;
                let at = self.current_date();
                let canceled_dose =
                    self.handle_cancel_dosing(DeliveryType::ALL, status.bolus_not_delivered, at);
                self.pod_state.update_from_status_response(&status, at);
                for alert in created_alerts {
                    self.pod_state.register_configured_alert(alert.slot(), alert);
                }
                tracing::info!("delivery suspended");
                CancelDeliveryResult::Success {
                    status,
                    canceled_dose,
                }
            }
            Err(error) => {
                if self.command_outcome_unknown(&error) {
                    CancelDeliveryResult::Unacknowledged { error }
                } else {
                    CancelDeliveryResult::CertainFailure { error }
                }
            }
        }
    }

    /// Stop one or more kinds of delivery.
    pub fn cancel_delivery(
        &mut self,
        delivery_type: DeliveryType,
        beep_type: BeepType,
    ) -> CancelDeliveryResult {
        if self.pod_state.unacknowledged_command.is_some() {
            return CancelDeliveryResult::CertainFailure {
                error: PodCommsError::UnacknowledgedCommandPending,
            };
        }
        if self.pod_state.setup_progress != SetupProgress::Completed {
            return CancelDeliveryResult::CertainFailure {
                error: PodCommsError::SetupNotComplete,
            };
        }

        let now = self.current_date();
        self.pod_state.unacknowledged_command = Some(PendingCommand::StopProgram {
            delivery: delivery_type,
            sequence: self.transport.message_number(),
            command_date: now,
            in_flight: true,
        });
        let command = MessageBlock::CancelDelivery(CancelDeliveryCommand {
            nonce: self.pod_state.current_nonce(),
            delivery_type,
            beep_type,
        });
        match self.send::<StatusResponse>(vec![command], None, false) {
            Ok(status) => {
                self.pod_state.unacknowledged_command = None;
                let at = self.current_date();
                let canceled_dose =
                    self.handle_cancel_dosing(delivery_type, status.bolus_not_delivered, at);
                self.pod_state.update_from_status_response(&status, at);
                tracing::info!(delivery_type = ?delivery_type, "delivery canceled");
                CancelDeliveryResult::Success {
                    status,
                    canceled_dose,
                }
            }
            Err(error) => {
                if self.command_outcome_unknown(&error) {
                    CancelDeliveryResult::Unacknowledged { error }
                } else {
                    CancelDeliveryResult::CertainFailure { error }
                }
            }
        }
    }

    /// An authenticated no-op cancel, used as a safe status probe.
    pub fn cancel_none(&mut self) -> Result<StatusResponse, PodCommsError> {
        let status = match self.cancel_delivery(DeliveryType::NONE, BeepType::NoBeepCancel) {
            CancelDeliveryResult::Success { status, .. } => status,
            CancelDeliveryResult::CertainFailure { error }
            | CancelDeliveryResult::Unacknowledged { error } => return Err(error),
        };
        let now = self.current_date();
        self.pod_state.update_from_status_response(&status, now);
        Ok(status)
    }

    /// Program the daily basal schedule, resuming scheduled delivery.
    ///
    /// Unless the pod is known to be suspended, a cancel-all goes out
    /// first: programming a running pod faults it. A failure after the
    /// schedule command is recorded as an uncertain resume, since the
    /// pod may be delivering on the new schedule without us knowing.
    pub fn set_basal_schedule(
        &mut self,
        schedule: BasalSchedule,
        schedule_offset: Duration,
    ) -> Result<StatusResponse, PodCommsError> {
        if self.pod_state.unacknowledged_command.is_some() {
            return Err(PodCommsError::UnacknowledgedCommandPending);
        }

        let verified_suspended = self.pod_state.is_suspended()
            && self
                .pod_state
                .last_delivery_status_received
                .is_some_and(DeliveryStatus::suspended);
        if !verified_suspended && self.pod_state.is_setup_complete() {
            let cancel_all = MessageBlock::CancelDelivery(CancelDeliveryCommand {
                nonce: self.pod_state.current_nonce(),
                delivery_type: DeliveryType::ALL,
                beep_type: BeepType::NoBeepCancel,
            });
            let _: StatusResponse = self.send(vec![cancel_all], None, false)?;
        }

        let command = MessageBlock::SetInsulinSchedule(SetInsulinScheduleCommand {
            nonce: self.pod_state.current_nonce(),
            schedule: DeliverySchedule::BasalSchedule {
                schedule,
                schedule_offset,
            },
        });
        let now = self.current_date();
        let mut status = match self.send::<StatusResponse>(vec![command], None, false) {
            Ok(status) => status,
            Err(
                error @ (PodCommsError::NonceResyncFailed | PodCommsError::RejectedMessage { .. }),
            ) => return Err(error),
            Err(error) => {
                // The pod may be running the new schedule without our
                // having heard the confirmation.
                self.pod_state.unfinalized_resume = Some(UnfinalizedDose::resume(
                    now,
                    ScheduledCertainty::Uncertain,
                ));
                return Err(error);
            }
        };
        self.pod_state.suspend_state = SuspendState::Resumed(now);
        self.pod_state.unfinalized_resume =
            Some(UnfinalizedDose::resume(now, ScheduledCertainty::Certain));

        if self.pod_state.has_active_suspend_alert() {
            // Best effort; a leftover suspend alert beeping after resume
            // is annoying but harmless.
            if let Ok(cancel_status) = self.cancel_suspend_alerts() {
                status = cancel_status;
            }
        }

        let at = self.current_date();
        self.pod_state.update_from_status_response(&status, at);
        tracing::info!("basal schedule programmed");
        Ok(status)
    }

    /// Resume scheduled delivery after a suspend.
    pub fn resume_basal(
        &mut self,
        schedule: BasalSchedule,
        schedule_offset: Duration,
    ) -> Result<StatusResponse, PodCommsError> {
        if self.pod_state.unacknowledged_command.is_some() {
            return Err(PodCommsError::UnacknowledgedCommandPending);
        }
        let status = self.set_basal_schedule(schedule, schedule_offset)?;
        let now = self.current_date();
        self.pod_state.suspend_state = SuspendState::Resumed(now);
        Ok(status)
    }

    /// Record what a confirmed cancellation stopped, at `at`.
    ///
    /// Returns the interrupted dose, if one was actually running.
    fn handle_cancel_dosing(
        &mut self,
        delivery_type: DeliveryType,
        bolus_not_delivered: f64,
        at: SystemTime,
    ) -> Option<UnfinalizedDose> {
        let mut canceled_dose = None;

        if delivery_type.contains(DeliveryType::BASAL) {
            self.pod_state.unfinalized_suspend =
                Some(UnfinalizedDose::suspend(at, ScheduledCertainty::Certain));
            self.pod_state.suspend_state = SuspendState::Suspended(at);
        }

        if delivery_type.contains(DeliveryType::TEMP_BASAL) {
            if let Some(temp_basal) = self.pod_state.unfinalized_temp_basal.as_mut() {
                if temp_basal.finish_time().is_some_and(|finish| finish > at) {
                    temp_basal.cancel(at, None);
                    if !delivery_type.contains(DeliveryType::BASAL) {
                        self.pod_state.suspend_state = SuspendState::Resumed(at);
                    }
                    tracing::info!(dose = ?temp_basal, "temp basal interrupted");
                    canceled_dose = Some(temp_basal.clone());
                }
            }
        }

        if delivery_type.contains(DeliveryType::BOLUS) {
            if let Some(bolus) = self.pod_state.unfinalized_bolus.as_mut() {
                if bolus.finish_time().is_some_and(|finish| finish > at) {
                    bolus.cancel(at, Some(bolus_not_delivered));
                    tracing::info!(dose = ?bolus, "bolus interrupted");
                    canceled_dose = Some(bolus.clone());
                }
            }
        }

        canceled_dose
    }

    /// Settle pending-command bookkeeping after a failed delivery
    /// command. True when the outcome is unknown rather than certain.
    fn command_outcome_unknown(&mut self, error: &PodCommsError) -> bool {
        if let PodCommsError::Transport(TransportError::DeliveredUnconfirmed { sequence }) = error {
            tracing::error!(sequence, "command delivered but unconfirmed");
            self.pod_state.unacknowledged_command = self
                .pod_state
                .unacknowledged_command
                .take()
                .map(PendingCommand::comms_finished);
            true
        } else {
            self.pod_state.unacknowledged_command = None;
            false
        }
    }

    // =========================================================
    // Pending-command recovery
    // =========================================================

    /// Settle a pending command against a fresh status response.
    ///
    /// The pod reports the sequence number of the last programming
    /// command it accepted; a match means ours got through.
    fn recover_unacknowledged_command(&mut self, status: &StatusResponse) {
        let Some(pending) = self.pod_state.unacknowledged_command.take() else {
            return;
        };
        if status.last_programming_message_seq_num == pending.sequence() {
            tracing::info!(
                sequence = pending.sequence(),
                "pending command was received by the pod"
            );
            self.unacknowledged_command_was_received(&pending, status);
        } else {
            tracing::info!(
                sequence = pending.sequence(),
                pod_sequence = status.last_programming_message_seq_num,
                "pending command was not received by the pod"
            );
        }
    }

    fn unacknowledged_command_was_received(
        &mut self,
        pending: &PendingCommand,
        status: &StatusResponse,
    ) {
        match pending {
            PendingCommand::Program {
                program,
                command_date,
                ..
            } => {
                let dose = program.unfinalized_dose(*command_date, ScheduledCertainty::Certain);
                match dose.dose_type {
                    DoseType::Bolus => self.pod_state.unfinalized_bolus = Some(dose),
                    DoseType::TempBasal => self.pod_state.unfinalized_temp_basal = Some(dose),
                    DoseType::Resume => {
                        self.pod_state.suspend_state = SuspendState::Resumed(*command_date);
                    }
                    DoseType::Suspend => {}
                }
            }
            PendingCommand::StopProgram {
                delivery,
                command_date,
                ..
            } => {
                let at = *command_date;
                if delivery.contains(DeliveryType::BOLUS) {
                    if let Some(bolus) = self.pod_state.unfinalized_bolus.as_mut() {
                        if !bolus.is_finished(at) {
                            bolus.cancel(at, Some(status.bolus_not_delivered));
                        }
                    }
                }
                if delivery.contains(DeliveryType::TEMP_BASAL) {
                    if let Some(temp_basal) = self.pod_state.unfinalized_temp_basal.as_mut() {
                        if !temp_basal.is_finished(at) {
                            temp_basal.cancel(at, None);
                        }
                    }
                }
                if delivery.contains(DeliveryType::BASAL) {
                    self.pod_state
                        .finalized_doses
                        .push(UnfinalizedDose::suspend(at, ScheduledCertainty::Certain));
                    self.pod_state.suspend_state = SuspendState::Suspended(at);
                }
            }
        }
    }

    // =========================================================
    // Alerts
    // =========================================================

    /// Program alert slots, optionally clearing every fired alert first.
    pub fn configure_alerts(
        &mut self,
        alerts: Vec<PodAlert>,
        acknowledge_all: bool,
        beep_block: Option<MessageBlock>,
    ) -> Result<StatusResponse, PodCommsError> {
        let configure = MessageBlock::ConfigureAlerts(ConfigureAlertsCommand {
            nonce: self.pod_state.current_nonce(),
            configurations: alerts.iter().map(PodAlert::configuration).collect(),
        });
        // Nonce commands sharing one message carry the same value.
        let blocks = if acknowledge_all {
            vec![
                MessageBlock::AcknowledgeAlerts(AcknowledgeAlertsCommand {
                    nonce: self.pod_state.current_nonce(),
                    alerts: AlertSet::new(0xFF),
                }),
                configure,
            ]
        } else {
            vec![configure]
        };

        let status: StatusResponse = self.send(blocks, beep_block, false)?;
        for alert in alerts {
            self.pod_state.register_configured_alert(alert.slot(), alert);
        }
        let now = self.current_date();
        self.pod_state.update_from_status_response(&status, now);
        Ok(status)
    }

    /// Clear fired alert slots, returning the slots still active after.
    pub fn acknowledge_alerts(&mut self, alerts: AlertSet) -> Result<AlertSet, PodCommsError> {
        let command = MessageBlock::AcknowledgeAlerts(AcknowledgeAlertsCommand {
            nonce: self.pod_state.current_nonce(),
            alerts,
        });
        let status: StatusResponse = self.send(vec![command], None, false)?;
        let now = self.current_date();
        self.pod_state.update_from_status_response(&status, now);
        Ok(self.pod_state.active_alert_slots)
    }

    /// Disarm the suspend reminder and suspend-time-expired slots.
    fn cancel_suspend_alerts(&mut self) -> Result<StatusResponse, PodCommsError> {
        let reminder = PodAlert::PodSuspendedReminder {
            active: false,
            offset: Duration::ZERO,
            suspend_time: Duration::ZERO,
            time_passed: Duration::ZERO,
            silent: false,
        };
        let expired = PodAlert::SuspendTimeExpired {
            offset: Duration::ZERO,
            suspend_time: Duration::ZERO,
            silent: false,
        };
        self.configure_alerts(vec![reminder, expired], false, None)
    }

    /// Write the pod's confirmation beep preferences.
    pub fn beep_config(
        &mut self,
        beep_type: BeepType,
        basal_completion_beep: bool,
        temp_basal_completion_beep: bool,
        bolus_completion_beep: bool,
    ) -> Result<StatusResponse, PodCommsError> {
        if let Some(fault) = &self.pod_state.fault {
            tracing::info!("skipping beep config on a faulted pod");
            return Err(PodCommsError::PodFault {
                fault: Box::new(fault.clone()),
            });
        }

        let command = MessageBlock::BeepConfig(BeepConfigCommand {
            beep_type,
            basal_completion_beep,
            temp_basal_completion_beep,
            bolus_completion_beep,
        });
        let status: StatusResponse = self.send(vec![command], None, false)?;
        let now = self.current_date();
        self.pod_state.update_from_status_response(&status, now);
        Ok(status)
    }

    // =========================================================
    // Status
    // =========================================================

    /// Poll the regular status report and fold it into the pod state.
    ///
    /// Also the recovery point for an unacknowledged command: the report
    /// settles whether the pod ran it.
    pub fn get_status(&mut self) -> Result<StatusResponse, PodCommsError> {
        let status: StatusResponse = self.send(
            vec![MessageBlock::GetStatus(GetStatusCommand::default())],
            None,
            false,
        )?;
        if self.pod_state.unacknowledged_command.is_some() {
            self.recover_unacknowledged_command(&status);
        }
        let now = self.current_date();
        self.pod_state.update_from_status_response(&status, now);
        Ok(status)
    }

    /// Fetch the detailed status record.
    ///
    /// A fault first seen here is latched into the pod state, but the
    /// record is still returned rather than raised as an error; the
    /// caller asked to see it.
    pub fn get_detailed_status(&mut self) -> Result<DetailedStatus, PodCommsError> {
        let response: PodInfoResponse = self.send(
            vec![MessageBlock::GetStatus(GetStatusCommand {
                pod_info_type: PodInfoType::DetailedStatus,
            })],
            None,
            false,
        )?;
        let PodInfoResponse::DetailedStatus(detailed) = response else {
            return Err(PodCommsError::UnexpectedResponse {
                block_type: MessageBlockType::PodInfoResponse,
            });
        };

        if detailed.is_faulted() && self.pod_state.fault.is_none() {
            self.handle_pod_fault(&detailed);
        } else {
            let derived = detailed.to_status_response();
            if self.pod_state.unacknowledged_command.is_some() {
                self.recover_unacknowledged_command(&derived);
            }
            let now = self.current_date();
            self.pod_state.update_from_status_response(&derived, now);
        }
        Ok(detailed)
    }

    /// Fetch one of the extended pod-info records.
    pub fn read_pod_info(
        &mut self,
        pod_info_type: PodInfoType,
    ) -> Result<PodInfoResponse, PodCommsError> {
        self.send(
            vec![MessageBlock::GetStatus(GetStatusCommand { pod_info_type })],
            None,
            false,
        )
    }

    // =========================================================
    // Deactivation and storage
    // =========================================================

    /// Permanently retire the pod.
    ///
    /// Pulse logs are read first for post-mortem analysis; their loss
    /// does not matter. A fault raised by the deactivate command itself
    /// is tolerated, since a faulted pod is already as stopped as a
    /// deactivated one.
    pub fn deactivate_pod(&mut self) -> Result<(), PodCommsError> {
        // A cancel before setup completes gets no response or faults the
        // pod outright.
        if self.pod_state.setup_progress == SetupProgress::Completed
            && self.pod_state.fault.is_none()
            && !self.pod_state.is_suspended()
        {
            match self.cancel_delivery(DeliveryType::ALL, BeepType::NoBeepCancel) {
                CancelDeliveryResult::Success { .. } => {}
                CancelDeliveryResult::CertainFailure { error }
                | CancelDeliveryResult::Unacknowledged { error } => return Err(error),
            }
        }

        let _ = self.read_pod_info(PodInfoType::PulseLogRecent);
        if self.pod_state.fault.is_some() {
            let _ = self.read_pod_info(PodInfoType::PulseLogPrevious);
        }

        let command = MessageBlock::DeactivatePod(DeactivatePodCommand {
            nonce: self.pod_state.current_nonce(),
        });
        match self.send::<StatusResponse>(vec![command], None, false) {
            Ok(status) => {
                if self.pod_state.unacknowledged_command.is_some() {
                    self.recover_unacknowledged_command(&status);
                }
                let now = self.current_date();
                self.pod_state.update_from_status_response(&status, now);
                if self.pod_state.active_time.is_none() {
                    if let Some(activated_at) = self.pod_state.activated_at {
                        self.pod_state.active_time = now.duration_since(activated_at).ok();
                    }
                }
                tracing::info!("pod deactivated");
                Ok(())
            }
            Err(
                PodCommsError::PodFault { .. }
                | PodCommsError::ActivationTimeExceeded
                | PodCommsError::UnexpectedResponse { .. },
            ) => {
                tracing::info!("pod already shut down at deactivation");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Hand every stored and live dose to `storage_handler`.
    ///
    /// When the handler reports the doses as safely persisted, the
    /// finalized ones are dropped from the pod state; live doses stay
    /// until their delivery settles.
    pub fn doses_for_storage<F>(&mut self, storage_handler: F)
    where
        F: FnOnce(Vec<UnfinalizedDose>) -> bool,
    {
        let doses = self.pod_state.doses_to_store();
        let count = doses.len();
        if storage_handler(doses) {
            tracing::debug!(count, "doses handed off to storage");
            self.pod_state.finalized_doses.clear();
        }
    }
}
