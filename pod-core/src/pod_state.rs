use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use pod_protocol::constants::{
    CANNULA_INSERTION_UNITS, CANNULA_INSERTION_UNITS_EXTRA, NOMINAL_POD_LIFE, PRIME_UNITS,
};
use pod_protocol::{
    AlertSet, AlertSlot, DeliveryStatus, DeliveryType, DetailedStatus, MessageTransportState,
    PodAlert, PodProgressStatus, StatusResponse, CRC16_TABLE,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::dose::{DoseType, PodInsulinMeasurements, ScheduledCertainty, UnfinalizedDose};
use crate::nonce::NonceState;
use crate::pending::PendingCommand;

/// Version tag written into every serialized [`PodState`].
pub const SCHEMA_VERSION: u64 = 1;

/// A recomputed expiry is accepted only when it moves earlier or by more
/// than this much later, so response timing does not make the displayed
/// time oscillate.
const EXPIRATION_RECOMPUTE_SLACK: Duration = Duration::from_secs(60);

/// Errors raised when restoring a [`PodState`] from its serialized form.
#[derive(Debug, Error)]
pub enum PodStateError {
    /// The serialized value is not a key/value object.
    #[error("pod state must be a JSON object")]
    NotAnObject,

    /// The stored schema version is one this build cannot read.
    #[error("unsupported pod state schema version {0}")]
    UnsupportedSchemaVersion(u64),

    /// A field required for a usable pod identity is missing or malformed.
    #[error("missing or invalid required field `{0}`")]
    MissingField(&'static str),

    /// The persisted nonce table failed validation.
    #[error("invalid nonce state: {0}")]
    InvalidNonceState(&'static str),
}

/// Ordered lifecycle stage of pod setup.
///
/// Stages advance monotonically through pairing, priming, and cannula
/// insertion. The two failure stages are terminal and compare above
/// `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SetupProgress {
    /// The pod accepted a radio address.
    AddressAssigned,
    /// The pod accepted the setup-pod command.
    PodPaired,
    /// The prime command was sent; no confirmation yet.
    StartingPrime,
    /// The prime bolus is running.
    Priming,
    /// The initial basal schedule was sent; no confirmation yet.
    SettingInitialBasalSchedule,
    /// The pod accepted the initial basal schedule.
    InitialBasalScheduleSet,
    /// The insert-cannula command was sent; no confirmation yet.
    StartingInsertCannula,
    /// The cannula insertion bolus is running.
    CannulaInserting,
    /// Setup finished; the pod is delivering.
    Completed,
    /// The pod shut itself down before setup finished.
    ActivationTimeout,
    /// The pod reported hardware constants this controller cannot use.
    PodIncompatible,
}

impl SetupProgress {
    /// True once the pod has accepted the setup-pod command.
    pub fn is_paired(self) -> bool {
        self >= SetupProgress::PodPaired
    }

    /// True while no prime command has ever been issued.
    pub fn priming_never_attempted(self) -> bool {
        self < SetupProgress::StartingPrime
    }

    /// True while the prime bolus still needs to be issued.
    pub fn priming_needed(self) -> bool {
        self < SetupProgress::Priming
    }

    /// True while the initial basal schedule has not been accepted.
    pub fn needs_initial_basal_schedule(self) -> bool {
        self < SetupProgress::InitialBasalScheduleSet
    }

    /// True while cannula insertion has not finished.
    pub fn needs_cannula_insertion(self) -> bool {
        self < SetupProgress::Completed
    }

    /// True once the insert-cannula command has been accepted.
    pub fn cannula_insertion_successfully_started(self) -> bool {
        self > SetupProgress::StartingInsertCannula
    }
}

/// Whether insulin delivery is suspended, and since when.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SuspendState {
    /// Delivery stopped at the contained time.
    Suspended(SystemTime),
    /// Delivery running since the contained time.
    Resumed(SystemTime),
}

/// Everything a controller keeps about one physical pod.
///
/// One value exists per pod identity, created when the pod accepts an
/// address during pairing and kept until the pod is discarded. All
/// protocol-driven mutation goes through the methods here so the nonce
/// table, dose records, and derived times stay consistent; the session
/// layer holds `&mut PodState` for the duration of a unit of work.
///
/// Serialize with [`PodState::to_raw`] and restore with
/// [`PodState::from_raw`]; `last_delivery_status_received` is the one
/// field deliberately not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PodState {
    address: u32,
    nonce_state: NonceState,
    pm_version: String,
    pi_version: String,
    lot: u32,
    tid: u32,

    /// When the pod was activated, derived from its reported elapsed time.
    pub activated_at: Option<SystemTime>,
    /// Nominal end of life; recomputed with hysteresis as the pod clock
    /// and system clock drift apart.
    pub expires_at: Option<SystemTime>,
    /// Pod-reported total active time, kept after deactivation or a fault.
    pub active_time: Option<Duration>,
    /// Whole-minute pod clock from the last response.
    pub pod_time: Duration,
    /// When `pod_time` was last read.
    pub pod_time_updated: Option<SystemTime>,
    /// Units consumed by priming and cannula insertion, stashed when setup
    /// completes; subtracted from the pod's lifetime-delivered counter.
    pub setup_units_delivered: Option<f64>,
    /// Current setup lifecycle stage.
    pub setup_progress: SetupProgress,
    /// Expected end of the prime bolus.
    pub prime_finish_time: Option<SystemTime>,
    /// What each hardware alert slot is programmed with.
    pub configured_alerts: BTreeMap<AlertSlot, PodAlert>,
    /// Alert slots currently firing, from the last response.
    pub active_alert_slots: AlertSet,
    /// Whether delivery is suspended.
    pub suspend_state: SuspendState,
    /// The dose-changing command whose outcome is not yet known, if any.
    /// At most one exists; a second is never issued while this is set.
    pub unacknowledged_command: Option<PendingCommand>,
    /// Bolus in progress or awaiting finalization.
    pub unfinalized_bolus: Option<UnfinalizedDose>,
    /// Temp basal in progress or awaiting finalization.
    pub unfinalized_temp_basal: Option<UnfinalizedDose>,
    /// Suspend awaiting its matching resume.
    pub unfinalized_suspend: Option<UnfinalizedDose>,
    /// Resume awaiting finalization with its matching suspend.
    pub unfinalized_resume: Option<UnfinalizedDose>,
    /// Closed-out doses awaiting history storage; append-only until the
    /// storage collaborator accepts them.
    pub finalized_doses: Vec<UnfinalizedDose>,
    /// Last known delivered-insulin total and reservoir reading.
    pub last_insulin_measurements: Option<PodInsulinMeasurements>,
    /// Latched fault record. Set at most once, never cleared.
    pub fault: Option<DetailedStatus>,
    /// Rolling packet and message counters, persisted so a restart resumes
    /// the radio conversation where it left off.
    pub message_transport_state: MessageTransportState,
    /// Delivery state from the last response this session. Not persisted;
    /// used to skip redundant pre-checks within a live session.
    pub last_delivery_status_received: Option<DeliveryStatus>,
}

impl PodState {
    /// State for a pod that just accepted `address`, identified by the
    /// version response fields from address assignment.
    pub fn new(
        address: u32,
        pm_version: String,
        pi_version: String,
        lot: u32,
        tid: u32,
        transport_state: MessageTransportState,
        now: SystemTime,
    ) -> Self {
        PodState {
            address,
            nonce_state: NonceState::new(lot, tid, 0),
            pm_version,
            pi_version,
            lot,
            tid,
            activated_at: None,
            expires_at: None,
            active_time: None,
            pod_time: Duration::ZERO,
            pod_time_updated: None,
            setup_units_delivered: None,
            setup_progress: SetupProgress::AddressAssigned,
            prime_finish_time: None,
            configured_alerts: BTreeMap::from([(
                AlertSlot::Expired,
                PodAlert::WaitingForPairingReminder,
            )]),
            active_alert_slots: AlertSet::NONE,
            suspend_state: SuspendState::Resumed(now),
            unacknowledged_command: None,
            unfinalized_bolus: None,
            unfinalized_temp_basal: None,
            unfinalized_suspend: None,
            unfinalized_resume: None,
            finalized_doses: Vec::new(),
            last_insulin_measurements: None,
            fault: None,
            message_transport_state: transport_state,
            last_delivery_status_received: None,
        }
    }

    /// The radio address assigned to this pod.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Manufacturing lot number.
    pub fn lot(&self) -> u32 {
        self.lot
    }

    /// Manufacturing serial (TID).
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// PM firmware version string.
    pub fn pm_version(&self) -> &str {
        &self.pm_version
    }

    /// PI firmware version string.
    pub fn pi_version(&self) -> &str {
        &self.pi_version
    }

    /// True until setup reaches `Completed`.
    pub fn unfinished_setup(&self) -> bool {
        self.setup_progress != SetupProgress::Completed
    }

    /// True once priming is done and the prime bolus has had time to run.
    pub fn ready_for_cannula_insertion(&self, at: SystemTime) -> bool {
        match self.prime_finish_time {
            Some(finish) => !self.setup_progress.priming_needed() && finish < at,
            None => false,
        }
    }

    /// Set up and not faulted.
    pub fn is_active(&self) -> bool {
        self.setup_progress == SetupProgress::Completed && self.fault.is_none()
    }

    /// Set up, faulted or not.
    pub fn is_setup_complete(&self) -> bool {
        self.setup_progress == SetupProgress::Completed
    }

    /// A fault latched, or setup ended in a terminal failure stage.
    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
            || self.setup_progress == SetupProgress::ActivationTimeout
            || self.setup_progress == SetupProgress::PodIncompatible
    }

    /// Whether delivery is currently suspended.
    pub fn is_suspended(&self) -> bool {
        matches!(self.suspend_state, SuspendState::Suspended(_))
    }

    /// A command outcome is unresolved and its sending exchange is over,
    /// so the next contact must start with recovery.
    pub fn needs_comms_recovery(&self) -> bool {
        match &self.unacknowledged_command {
            Some(pending) => !pending.is_in_flight(),
            None => false,
        }
    }

    /// Whether a suspend-related alert slot is programmed active.
    pub fn has_active_suspend_alert(&self) -> bool {
        self.configured_alerts.iter().any(|(slot, alert)| {
            matches!(
                slot,
                AlertSlot::SuspendedReminder | AlertSlot::SuspendTimeExpired
            ) && alert.configuration().active
        })
    }

    /// The nonce the next authenticated command must carry.
    pub fn current_nonce(&self) -> u32 {
        self.nonce_state.current_nonce()
    }

    /// Consumes the current nonce.
    pub fn advance_to_next_nonce(&mut self) {
        self.nonce_state.advance_to_next_nonce();
    }

    /// Rebuilds the nonce table after the pod rejected a nonce.
    ///
    /// The pod's rejection carries `sync_word`; combining it with the
    /// nonce we sent, the CRC of the message sequence number, and the pod
    /// identity reproduces the seed the pod derived on its side, so both
    /// ends land on the same fresh table.
    pub fn resync_nonce(&mut self, sync_word: u16, sent_nonce: u32, message_sequence_num: u8) {
        let sum = (sent_nonce & 0xFFFF)
            .wrapping_add(u32::from(CRC16_TABLE[usize::from(message_sequence_num)]))
            .wrapping_add(self.lot & 0xFFFF)
            .wrapping_add(self.tid & 0xFFFF);
        let seed = (sum & 0xFFFF) as u16 ^ sync_word;
        self.nonce_state = NonceState::new(self.lot, self.tid, seed);
    }

    /// Folds a status response into the model: elapsed-time bookkeeping,
    /// delivery reconciliation, insulin accounting, and firing alerts.
    pub fn update_from_status_response(&mut self, response: &StatusResponse, at: SystemTime) {
        self.update_pod_times(response.time_active, at);
        self.update_delivery_status(
            response.delivery_status,
            response.pod_progress_status,
            response.bolus_not_delivered,
            at,
        );

        let setup_units = self
            .setup_units_delivered
            .unwrap_or(PRIME_UNITS + CANNULA_INSERTION_UNITS + CANNULA_INSERTION_UNITS_EXTRA);

        // Negative until setup completes, or after a pod reset fault. The
        // running total must never decrease, so clamp to the high-water
        // mark either way.
        let calc_delivered = response.insulin_delivered - setup_units;
        let prev_delivered = self
            .last_insulin_measurements
            .map_or(0.0, |measurements| measurements.delivered_units);
        let delivered_units = calc_delivered.max(prev_delivered);

        self.last_insulin_measurements = Some(PodInsulinMeasurements {
            valid_time: at,
            delivered_units,
            reservoir_level: response.reservoir_level,
        });

        self.active_alert_slots = response.alerts;
    }

    /// Records what a hardware alert slot is now programmed with.
    pub fn register_configured_alert(&mut self, slot: AlertSlot, alert: PodAlert) {
        self.configured_alerts.insert(slot, alert);
    }

    /// Closes out any live bolus and temp basal into the finalized list.
    pub fn finalize_all_doses(&mut self) {
        if let Some(bolus) = self.unfinalized_bolus.take() {
            self.finalized_doses.push(bolus);
        }
        if let Some(temp_basal) = self.unfinalized_temp_basal.take() {
            self.finalized_doses.push(temp_basal);
        }
    }

    /// Everything history storage should see: finalized doses plus any
    /// live temp basal, suspend, and bolus.
    pub fn doses_to_store(&self) -> Vec<UnfinalizedDose> {
        self.finalized_doses
            .iter()
            .chain(self.unfinalized_temp_basal.iter())
            .chain(self.unfinalized_suspend.iter())
            .chain(self.unfinalized_bolus.iter())
            .cloned()
            .collect()
    }

    /// Resolves a still-unconfirmed command when giving up on the pod.
    ///
    /// The outcome is assumed in whichever direction means more insulin
    /// was delivered: starts of boluses and high temps are taken as
    /// executed, a start of a low temp as failed, and stops as failed,
    /// except stopping a low temp, which is taken as executed since that
    /// restores the higher scheduled rate.
    pub fn resolve_any_pending_command_with_uncertainty(&mut self, at: SystemTime) {
        let Some(pending) = self.unacknowledged_command.take() else {
            return;
        };

        match pending {
            PendingCommand::Program {
                program,
                command_date,
                ..
            } => {
                let dose = program.unfinalized_dose(command_date, ScheduledCertainty::Uncertain);
                match dose.dose_type {
                    DoseType::Bolus => {
                        if dose.is_finished(at) {
                            self.finalized_doses.push(dose);
                        } else {
                            self.unfinalized_bolus = Some(dose);
                        }
                    }
                    DoseType::TempBasal => {
                        if dose.is_high_temp {
                            if dose.is_finished(at) {
                                self.finalized_doses.push(dose);
                            } else {
                                self.unfinalized_temp_basal = Some(dose);
                            }
                        }
                    }
                    DoseType::Resume => self.finalized_doses.push(dose),
                    // A start program is never a suspend.
                    DoseType::Suspend => {}
                }
            }
            PendingCommand::StopProgram {
                delivery,
                command_date,
                ..
            } => {
                if delivery.contains(DeliveryType::TEMP_BASAL) {
                    if let Some(temp_basal) = self.unfinalized_temp_basal.as_mut() {
                        if !temp_basal.is_high_temp && !temp_basal.is_finished(command_date) {
                            temp_basal.cancel(command_date, None);
                        }
                    }
                }
            }
        }
    }

    /// Saves the pod clock and keeps the derived activation and expiry
    /// times stable against clock drift.
    fn update_pod_times(&mut self, time_active: Duration, now: SystemTime) {
        if time_active < self.pod_time {
            // The pod's active time went backwards, an apparent reset
            // fault. Leave the derived times alone so the displayed
            // expiry does not jump.
            return;
        }

        self.pod_time = time_active;
        self.pod_time_updated = Some(now);

        let Some(activated_at_computed) = now.checked_sub(time_active) else {
            return;
        };
        if self.activated_at.is_none() {
            self.activated_at = Some(activated_at_computed);
        }
        let expires_at_computed = activated_at_computed + NOMINAL_POD_LIFE;
        match self.expires_at {
            None => self.expires_at = Some(expires_at_computed),
            Some(expires_at)
                if expires_at_computed < expires_at
                    || expires_at_computed > expires_at + EXPIRATION_RECOMPUTE_SLACK =>
            {
                self.expires_at = Some(expires_at_computed);
            }
            Some(_) => {}
        }
    }

    /// Reconciles the pod's reported delivery state with the local dose
    /// records, synthesizing or closing doses as needed.
    fn update_delivery_status(
        &mut self,
        delivery_status: DeliveryStatus,
        pod_progress_status: PodProgressStatus,
        bolus_not_delivered: f64,
        at: SystemTime,
    ) {
        // Saved for delivery-command pre-checks within this session.
        self.last_delivery_status_received = Some(delivery_status);

        if delivery_status.bolusing()
            && self.unfinalized_bolus.is_none()
            && pod_progress_status.ready_for_delivery()
        {
            // An active bolus this controller is not tracking. Capture the
            // remainder so history is not silently short.
            self.unfinalized_bolus = Some(UnfinalizedDose::bolus(
                bolus_not_delivered,
                at,
                ScheduledCertainty::Certain,
            ));
        }

        if delivery_status != DeliveryStatus::Suspended && self.is_suspended() {
            // Basal is running even though the local model says suspended.
            self.suspend_state = SuspendState::Resumed(at);
            self.unfinalized_resume =
                Some(UnfinalizedDose::resume(at, ScheduledCertainty::Certain));
        }

        if !delivery_status.bolusing() {
            if let Some(mut bolus) = self.unfinalized_bolus.take() {
                // Boluses can finish earlier than expected from clock
                // drift or comms delays.
                if !bolus.is_finished(at) {
                    bolus.set_finish_time(at);
                }
                self.finalized_doses.push(bolus);
            }
        }

        if !delivery_status.temp_basal_running() {
            if let Some(mut temp_basal) = self.unfinalized_temp_basal.take() {
                if !temp_basal.is_finished(at) {
                    temp_basal.set_finish_time(at);
                }
                self.finalized_doses.push(temp_basal);
            }
        }

        if let (Some(suspend), Some(resume)) = (
            self.unfinalized_suspend.clone(),
            self.unfinalized_resume.clone(),
        ) {
            if suspend.start_time < resume.start_time {
                self.finalized_doses.push(suspend);
                self.finalized_doses.push(resume);
                self.unfinalized_suspend = None;
                self.unfinalized_resume = None;
            }
        }
    }

    /// Serializes into the versioned key/value form described by
    /// [`from_raw`](PodState::from_raw).
    pub fn to_raw(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("schema_version".to_string(), SCHEMA_VERSION.into());
        obj.insert("address".to_string(), self.address.into());
        obj.insert("nonce_state".to_string(), raw(&self.nonce_state));
        obj.insert("pm_version".to_string(), self.pm_version.clone().into());
        obj.insert("pi_version".to_string(), self.pi_version.clone().into());
        obj.insert("lot".to_string(), self.lot.into());
        obj.insert("tid".to_string(), self.tid.into());
        obj.insert("suspend_state".to_string(), raw(&self.suspend_state));
        obj.insert("activated_at".to_string(), raw(&self.activated_at));
        obj.insert("expires_at".to_string(), raw(&self.expires_at));
        obj.insert("active_time".to_string(), raw(&self.active_time));
        obj.insert("pod_time".to_string(), raw(&self.pod_time));
        obj.insert("pod_time_updated".to_string(), raw(&self.pod_time_updated));
        obj.insert(
            "setup_units_delivered".to_string(),
            raw(&self.setup_units_delivered),
        );
        obj.insert("setup_progress".to_string(), raw(&self.setup_progress));
        obj.insert(
            "prime_finish_time".to_string(),
            raw(&self.prime_finish_time),
        );
        obj.insert(
            "configured_alerts".to_string(),
            raw(&self.configured_alerts),
        );
        obj.insert(
            "active_alert_slots".to_string(),
            raw(&self.active_alert_slots),
        );
        obj.insert(
            "unacknowledged_command".to_string(),
            raw(&self.unacknowledged_command),
        );
        obj.insert(
            "unfinalized_bolus".to_string(),
            raw(&self.unfinalized_bolus),
        );
        obj.insert(
            "unfinalized_temp_basal".to_string(),
            raw(&self.unfinalized_temp_basal),
        );
        obj.insert(
            "unfinalized_suspend".to_string(),
            raw(&self.unfinalized_suspend),
        );
        obj.insert(
            "unfinalized_resume".to_string(),
            raw(&self.unfinalized_resume),
        );
        obj.insert("finalized_doses".to_string(), raw(&self.finalized_doses));
        obj.insert(
            "last_insulin_measurements".to_string(),
            raw(&self.last_insulin_measurements),
        );
        obj.insert("fault".to_string(), raw(&self.fault));
        obj.insert(
            "message_transport_state".to_string(),
            raw(&self.message_transport_state),
        );
        Value::Object(obj)
    }

    /// Restores a state serialized by [`to_raw`](PodState::to_raw).
    ///
    /// Identity fields and the nonce table are required; everything else
    /// falls back to a documented default so states written by older
    /// builds load cleanly. Unknown keys are ignored.
    pub fn from_raw(value: &Value) -> Result<PodState, PodStateError> {
        let obj = value.as_object().ok_or(PodStateError::NotAnObject)?;

        let version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if version != SCHEMA_VERSION {
            return Err(PodStateError::UnsupportedSchemaVersion(version));
        }

        let nonce_state: NonceState = require(obj, "nonce_state")?;
        if !nonce_state.index_in_range() {
            return Err(PodStateError::InvalidNonceState("index out of range"));
        }

        let activated_at: Option<SystemTime> = field(obj, "activated_at");
        let expires_at = field(obj, "expires_at")
            .or_else(|| activated_at.map(|activated| activated + NOMINAL_POD_LIFE));

        // The whole-minute pod clock and its read time only mean anything
        // together.
        let (pod_time, pod_time_updated) =
            match (field(obj, "pod_time"), field(obj, "pod_time_updated")) {
                (Some(pod_time), Some(updated)) => (pod_time, Some(updated)),
                _ => (Duration::ZERO, None),
            };

        Ok(PodState {
            address: require(obj, "address")?,
            nonce_state,
            pm_version: require(obj, "pm_version")?,
            pi_version: require(obj, "pi_version")?,
            lot: require(obj, "lot")?,
            tid: require(obj, "tid")?,
            suspend_state: require(obj, "suspend_state")?,
            activated_at,
            expires_at,
            active_time: field(obj, "active_time"),
            pod_time,
            pod_time_updated,
            setup_units_delivered: field(obj, "setup_units_delivered"),
            // States written before versioning were only persisted after
            // setup finished.
            setup_progress: field(obj, "setup_progress").unwrap_or(SetupProgress::Completed),
            prime_finish_time: field(obj, "prime_finish_time"),
            configured_alerts: field(obj, "configured_alerts")
                .unwrap_or_else(default_configured_alerts),
            active_alert_slots: field(obj, "active_alert_slots").unwrap_or(AlertSet::NONE),
            // A reload proves the exchange that carried the command is
            // over; the in-flight grace period must not survive a crash.
            unacknowledged_command: field::<PendingCommand>(obj, "unacknowledged_command")
                .map(PendingCommand::comms_finished),
            unfinalized_bolus: field(obj, "unfinalized_bolus"),
            unfinalized_temp_basal: field(obj, "unfinalized_temp_basal"),
            unfinalized_suspend: field(obj, "unfinalized_suspend"),
            unfinalized_resume: field(obj, "unfinalized_resume"),
            finalized_doses: field(obj, "finalized_doses").unwrap_or_default(),
            last_insulin_measurements: field(obj, "last_insulin_measurements"),
            // A stored no-fault record carries no information.
            fault: field::<DetailedStatus>(obj, "fault").filter(DetailedStatus::is_faulted),
            message_transport_state: field(obj, "message_transport_state").unwrap_or_default(),
            last_delivery_status_received: None,
        })
    }
}

/// The alert set a pod normally runs with, used when a persisted state
/// predates alert tracking. All slots inactive until reconfigured.
fn default_configured_alerts() -> BTreeMap<AlertSlot, PodAlert> {
    BTreeMap::from([
        (
            AlertSlot::ShutdownImminent,
            PodAlert::ShutdownImminent {
                offset: Duration::ZERO,
                alert_time: Duration::ZERO,
                silent: false,
            },
        ),
        (
            AlertSlot::ExpirationReminder,
            PodAlert::ExpirationReminder {
                offset: Duration::ZERO,
                alert_time: Duration::ZERO,
                duration: Duration::ZERO,
                silent: false,
            },
        ),
        (
            AlertSlot::LowReservoir,
            PodAlert::LowReservoir {
                units: 0.0,
                silent: false,
            },
        ),
        (
            AlertSlot::SuspendedReminder,
            PodAlert::PodSuspendedReminder {
                active: false,
                offset: Duration::ZERO,
                suspend_time: Duration::ZERO,
                time_passed: Duration::ZERO,
                silent: false,
            },
        ),
        (
            AlertSlot::SuspendTimeExpired,
            PodAlert::SuspendTimeExpired {
                offset: Duration::ZERO,
                suspend_time: Duration::ZERO,
                silent: false,
            },
        ),
        (
            AlertSlot::Expired,
            PodAlert::Expired {
                offset: Duration::ZERO,
                alert_time: Duration::ZERO,
                duration: Duration::ZERO,
                silent: false,
            },
        ),
    ])
}

fn raw<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn field<T: DeserializeOwned>(obj: &Map<String, Value>, key: &str) -> Option<T> {
    obj.get(key)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

fn require<T: DeserializeOwned>(
    obj: &Map<String, Value>,
    key: &'static str,
) -> Result<T, PodStateError> {
    field(obj, key).ok_or(PodStateError::MissingField(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::StartProgram;
    use pod_protocol::FaultEventCode;
    use std::time::UNIX_EPOCH;

    const LOT: u32 = 43620;
    const TID: u32 = 560313;

    fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn test_pod() -> PodState {
        PodState::new(
            0x1F0B_3554,
            "2.7.0".to_string(),
            "2.7.0".to_string(),
            LOT,
            TID,
            MessageTransportState::default(),
            t(0),
        )
    }

    fn running_status(
        delivery_status: DeliveryStatus,
        time_active: Duration,
        insulin_delivered: f64,
    ) -> StatusResponse {
        StatusResponse {
            delivery_status,
            pod_progress_status: PodProgressStatus::AboveFiftyUnits,
            time_active,
            reservoir_level: None,
            insulin_delivered,
            bolus_not_delivered: 0.0,
            last_programming_message_seq_num: 0,
            alerts: AlertSet::NONE,
        }
    }

    #[test]
    fn fresh_pod_awaits_pairing() {
        let pod_state = test_pod();
        assert_eq!(pod_state.setup_progress, SetupProgress::AddressAssigned);
        assert!(pod_state.unfinished_setup());
        assert!(!pod_state.is_active());
        assert!(!pod_state.is_faulted());
        assert_eq!(
            pod_state.configured_alerts.get(&AlertSlot::Expired),
            Some(&PodAlert::WaitingForPairingReminder)
        );
        assert_eq!(pod_state.current_nonce(), 3922233355);
    }

    #[test]
    fn setup_progress_predicates_follow_stage_order() {
        assert!(SetupProgress::PodPaired.is_paired());
        assert!(!SetupProgress::AddressAssigned.is_paired());
        assert!(SetupProgress::PodPaired.priming_never_attempted());
        assert!(!SetupProgress::Priming.priming_needed());
        assert!(SetupProgress::Priming.needs_initial_basal_schedule());
        assert!(SetupProgress::CannulaInserting.cannula_insertion_successfully_started());
        assert!(!SetupProgress::Completed.needs_cannula_insertion());
        assert!(SetupProgress::ActivationTimeout.is_paired());
    }

    #[test]
    fn nonce_resync_matches_device_formula() {
        let mut pod_state = test_pod();
        pod_state.resync_nonce(0xA9E4, 2232447658, 5);
        assert_eq!(pod_state.current_nonce(), 1521036535);
        pod_state.advance_to_next_nonce();
        assert_eq!(pod_state.current_nonce(), 545302454);
    }

    #[test]
    fn status_update_derives_activation_and_expiry() {
        let mut pod_state = test_pod();
        let status = running_status(
            DeliveryStatus::ScheduledBasal,
            Duration::from_secs(600),
            3.1,
        );
        pod_state.update_from_status_response(&status, t(600));

        assert_eq!(pod_state.activated_at, Some(t(0)));
        assert_eq!(pod_state.expires_at, Some(t(0) + NOMINAL_POD_LIFE));
        assert_eq!(pod_state.pod_time, Duration::from_secs(600));
        assert_eq!(pod_state.pod_time_updated, Some(t(600)));
    }

    #[test]
    fn expiry_recompute_has_hysteresis() {
        let mut pod_state = test_pod();
        let ten_minutes = Duration::from_secs(600);
        let expires = t(0) + NOMINAL_POD_LIFE;

        pod_state.update_from_status_response(
            &running_status(DeliveryStatus::ScheduledBasal, ten_minutes, 3.1),
            t(600),
        );
        assert_eq!(pod_state.expires_at, Some(expires));

        // 30 seconds later within the same pod minute: the recomputed
        // expiry is 30 s later, inside the slack, so it must not move.
        pod_state.update_from_status_response(
            &running_status(DeliveryStatus::ScheduledBasal, ten_minutes, 3.1),
            t(630),
        );
        assert_eq!(pod_state.expires_at, Some(expires));

        // 100 seconds later: outside the slack, so it follows the drift.
        pod_state.update_from_status_response(
            &running_status(DeliveryStatus::ScheduledBasal, ten_minutes, 3.1),
            t(700),
        );
        assert_eq!(pod_state.expires_at, Some(expires + Duration::from_secs(100)));

        // An earlier recomputed expiry is always taken.
        pod_state.update_from_status_response(
            &running_status(
                DeliveryStatus::ScheduledBasal,
                Duration::from_secs(720),
                3.1,
            ),
            t(720),
        );
        assert_eq!(pod_state.expires_at, Some(expires));
    }

    #[test]
    fn pod_clock_regression_leaves_times_alone() {
        let mut pod_state = test_pod();
        pod_state.update_from_status_response(
            &running_status(
                DeliveryStatus::ScheduledBasal,
                Duration::from_secs(600),
                3.1,
            ),
            t(600),
        );
        let activated = pod_state.activated_at;
        let expires = pod_state.expires_at;

        pod_state.update_from_status_response(
            &running_status(
                DeliveryStatus::ScheduledBasal,
                Duration::from_secs(300),
                3.1,
            ),
            t(900),
        );
        assert_eq!(pod_state.pod_time, Duration::from_secs(600));
        assert_eq!(pod_state.activated_at, activated);
        assert_eq!(pod_state.expires_at, expires);
        // The rest of the update still applies.
        assert!(pod_state.last_insulin_measurements.is_some());
    }

    #[test]
    fn delivered_insulin_never_decreases() {
        let mut pod_state = test_pod();

        // 5.2 U lifetime minus the 3.1 U default setup baseline.
        pod_state.update_from_status_response(
            &running_status(
                DeliveryStatus::ScheduledBasal,
                Duration::from_secs(600),
                5.2,
            ),
            t(600),
        );
        let first = pod_state.last_insulin_measurements.unwrap();
        assert!((first.delivered_units - 2.1).abs() < 1e-9);

        // A lower lifetime reading must not drag the total backwards.
        pod_state.update_from_status_response(
            &running_status(
                DeliveryStatus::ScheduledBasal,
                Duration::from_secs(660),
                4.8,
            ),
            t(660),
        );
        let second = pod_state.last_insulin_measurements.unwrap();
        assert!((second.delivered_units - 2.1).abs() < 1e-9);

        pod_state.update_from_status_response(
            &running_status(
                DeliveryStatus::ScheduledBasal,
                Duration::from_secs(720),
                6.0,
            ),
            t(720),
        );
        let third = pod_state.last_insulin_measurements.unwrap();
        assert!((third.delivered_units - 2.9).abs() < 1e-9);
    }

    #[test]
    fn untracked_bolus_is_synthesized_from_remainder() {
        let mut pod_state = test_pod();
        let mut status = running_status(
            DeliveryStatus::BolusInProgress,
            Duration::from_secs(600),
            5.0,
        );
        status.bolus_not_delivered = 1.3;
        pod_state.update_from_status_response(&status, t(600));

        let bolus = pod_state.unfinalized_bolus.as_ref().unwrap();
        assert_eq!(bolus.units, 1.3);
        assert_eq!(bolus.start_time, t(600));
        assert_eq!(bolus.scheduled_certainty, ScheduledCertainty::Certain);
    }

    #[test]
    fn no_bolus_synthesized_outside_delivery_stages() {
        let mut pod_state = test_pod();
        let mut status = running_status(
            DeliveryStatus::Priming,
            Duration::from_secs(60),
            0.0,
        );
        status.pod_progress_status = PodProgressStatus::Priming;
        status.bolus_not_delivered = 2.6;
        pod_state.update_from_status_response(&status, t(60));
        assert!(pod_state.unfinalized_bolus.is_none());
    }

    #[test]
    fn finished_bolus_is_closed_out_at_poll_time() {
        let mut pod_state = test_pod();
        pod_state.unfinalized_bolus = Some(UnfinalizedDose::bolus(
            2.5,
            t(0),
            ScheduledCertainty::Certain,
        ));

        // The pod reports the bolus over after 50 of the expected 100
        // seconds; the record is truncated to the poll time.
        pod_state.update_from_status_response(
            &running_status(
                DeliveryStatus::ScheduledBasal,
                Duration::from_secs(60),
                3.1,
            ),
            t(50),
        );
        assert!(pod_state.unfinalized_bolus.is_none());
        assert_eq!(pod_state.finalized_doses.len(), 1);
        assert_eq!(
            pod_state.finalized_doses[0].duration,
            Some(Duration::from_secs(50))
        );
    }

    #[test]
    fn suspend_and_resume_finalize_as_a_pair() {
        let mut pod_state = test_pod();
        pod_state.suspend_state = SuspendState::Suspended(t(0));
        pod_state.unfinalized_suspend = Some(UnfinalizedDose::suspend(
            t(0),
            ScheduledCertainty::Certain,
        ));

        pod_state.update_from_status_response(
            &running_status(
                DeliveryStatus::ScheduledBasal,
                Duration::from_secs(900),
                3.1,
            ),
            t(300),
        );

        assert!(!pod_state.is_suspended());
        assert_eq!(pod_state.suspend_state, SuspendState::Resumed(t(300)));
        assert!(pod_state.unfinalized_suspend.is_none());
        assert!(pod_state.unfinalized_resume.is_none());
        let kinds: Vec<DoseType> = pod_state
            .finalized_doses
            .iter()
            .map(|dose| dose.dose_type)
            .collect();
        assert_eq!(kinds, vec![DoseType::Suspend, DoseType::Resume]);
    }

    #[test]
    fn resolution_assumes_bolus_ran() {
        let mut pod_state = test_pod();
        pod_state.unacknowledged_command = Some(PendingCommand::Program {
            program: StartProgram::Bolus { units: 2.0 },
            sequence: 3,
            command_date: t(0),
            in_flight: false,
        });

        // Still mid-bolus when resolved: stays live, marked uncertain.
        pod_state.resolve_any_pending_command_with_uncertainty(t(10));
        assert!(pod_state.unacknowledged_command.is_none());
        let bolus = pod_state.unfinalized_bolus.as_ref().unwrap();
        assert_eq!(bolus.scheduled_certainty, ScheduledCertainty::Uncertain);
        assert_eq!(bolus.units, 2.0);
    }

    #[test]
    fn resolution_finalizes_a_bolus_that_would_have_finished() {
        let mut pod_state = test_pod();
        pod_state.unacknowledged_command = Some(PendingCommand::Program {
            program: StartProgram::Bolus { units: 2.0 },
            sequence: 3,
            command_date: t(0),
            in_flight: false,
        });

        pod_state.resolve_any_pending_command_with_uncertainty(t(600));
        assert!(pod_state.unfinalized_bolus.is_none());
        assert_eq!(pod_state.finalized_doses.len(), 1);
        assert_eq!(
            pod_state.finalized_doses[0].scheduled_certainty,
            ScheduledCertainty::Uncertain
        );
    }

    #[test]
    fn resolution_assumes_high_temp_ran_and_low_temp_did_not() {
        let mut pod_state = test_pod();
        pod_state.unacknowledged_command = Some(PendingCommand::Program {
            program: StartProgram::TempBasal {
                units_per_hour: 3.0,
                duration: Duration::from_secs(1800),
                is_high_temp: true,
            },
            sequence: 4,
            command_date: t(0),
            in_flight: false,
        });
        pod_state.resolve_any_pending_command_with_uncertainty(t(60));
        assert!(pod_state.unfinalized_temp_basal.is_some());

        let mut other = test_pod();
        other.unacknowledged_command = Some(PendingCommand::Program {
            program: StartProgram::TempBasal {
                units_per_hour: 0.1,
                duration: Duration::from_secs(1800),
                is_high_temp: false,
            },
            sequence: 5,
            command_date: t(0),
            in_flight: false,
        });
        other.resolve_any_pending_command_with_uncertainty(t(60));
        assert!(other.unfinalized_temp_basal.is_none());
        assert!(other.finalized_doses.is_empty());
    }

    #[test]
    fn resolution_assumes_stopping_a_low_temp_worked() {
        let mut pod_state = test_pod();
        pod_state.unfinalized_temp_basal = Some(UnfinalizedDose::temp_basal(
            1.0,
            t(0),
            Duration::from_secs(1800),
            false,
            ScheduledCertainty::Certain,
        ));
        pod_state.unacknowledged_command = Some(PendingCommand::StopProgram {
            delivery: DeliveryType::ALL,
            sequence: 6,
            command_date: t(600),
            in_flight: false,
        });

        pod_state.resolve_any_pending_command_with_uncertainty(t(700));
        let temp_basal = pod_state.unfinalized_temp_basal.as_ref().unwrap();
        assert_eq!(temp_basal.duration, Some(Duration::from_secs(600)));
        assert_eq!(temp_basal.scheduled_units, Some(0.5));
        assert!((temp_basal.units - 0.15).abs() < 1e-9);
    }

    #[test]
    fn resolution_leaves_a_high_temp_running_on_stop() {
        let mut pod_state = test_pod();
        pod_state.unfinalized_temp_basal = Some(UnfinalizedDose::temp_basal(
            3.0,
            t(0),
            Duration::from_secs(1800),
            true,
            ScheduledCertainty::Certain,
        ));
        let before = pod_state.unfinalized_temp_basal.clone();
        pod_state.unacknowledged_command = Some(PendingCommand::StopProgram {
            delivery: DeliveryType::ALL,
            sequence: 6,
            command_date: t(600),
            in_flight: false,
        });

        pod_state.resolve_any_pending_command_with_uncertainty(t(700));
        assert_eq!(pod_state.unfinalized_temp_basal, before);
        assert!(pod_state.unacknowledged_command.is_none());
    }

    #[test]
    fn suspend_alert_predicate_checks_slots_five_and_six() {
        let mut pod_state = test_pod();
        assert!(!pod_state.has_active_suspend_alert());

        pod_state.register_configured_alert(
            AlertSlot::SuspendTimeExpired,
            PodAlert::SuspendTimeExpired {
                offset: Duration::from_secs(600),
                suspend_time: Duration::from_secs(1800),
                silent: false,
            },
        );
        assert!(pod_state.has_active_suspend_alert());
    }

    #[test]
    fn doses_to_store_includes_live_records() {
        let mut pod_state = test_pod();
        pod_state.finalized_doses.push(UnfinalizedDose::resume(
            t(0),
            ScheduledCertainty::Certain,
        ));
        pod_state.unfinalized_bolus = Some(UnfinalizedDose::bolus(
            1.0,
            t(10),
            ScheduledCertainty::Certain,
        ));
        let stored = pod_state.doses_to_store();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].dose_type, DoseType::Resume);
        assert_eq!(stored[1].dose_type, DoseType::Bolus);
    }

    #[test]
    fn raw_round_trip_is_lossless() {
        let mut pod_state = test_pod();
        pod_state.setup_progress = SetupProgress::Completed;
        pod_state.setup_units_delivered = Some(3.05);
        pod_state.update_from_status_response(
            &running_status(
                DeliveryStatus::ScheduledBasal,
                Duration::from_secs(600),
                5.2,
            ),
            t(600),
        );
        pod_state.unfinalized_temp_basal = Some(UnfinalizedDose::temp_basal(
            2.0,
            t(700),
            Duration::from_secs(1800),
            true,
            ScheduledCertainty::Certain,
        ));
        pod_state.unacknowledged_command = Some(PendingCommand::Program {
            program: StartProgram::Bolus { units: 1.5 },
            sequence: 9,
            command_date: t(800),
            in_flight: false,
        });
        pod_state.advance_to_next_nonce();
        // The one field that intentionally does not survive a reload.
        pod_state.last_delivery_status_received = None;

        let restored = PodState::from_raw(&pod_state.to_raw()).unwrap();
        assert_eq!(restored, pod_state);
        assert_eq!(restored.current_nonce(), pod_state.current_nonce());
    }

    #[test]
    fn load_forces_pending_command_out_of_flight() {
        let mut pod_state = test_pod();
        pod_state.unacknowledged_command = Some(PendingCommand::Program {
            program: StartProgram::Bolus { units: 1.5 },
            sequence: 9,
            command_date: t(800),
            in_flight: true,
        });

        let restored = PodState::from_raw(&pod_state.to_raw()).unwrap();
        let pending = restored.unacknowledged_command.as_ref().unwrap();
        assert!(!pending.is_in_flight());
        assert!(restored.needs_comms_recovery());
    }

    #[test]
    fn load_applies_documented_defaults() {
        let raw = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "address": 0x1F0B_3554u32,
            "nonce_state": serde_json::to_value(NonceState::new(LOT, TID, 0)).unwrap(),
            "pm_version": "2.7.0",
            "pi_version": "2.7.0",
            "lot": LOT,
            "tid": TID,
            "suspend_state": serde_json::to_value(SuspendState::Resumed(t(0))).unwrap(),
            "an_unknown_future_key": true,
        });

        let pod_state = PodState::from_raw(&raw).unwrap();
        assert_eq!(pod_state.setup_progress, SetupProgress::Completed);
        assert_eq!(
            pod_state.message_transport_state,
            MessageTransportState::default()
        );
        assert_eq!(pod_state.configured_alerts.len(), 6);
        assert!(!pod_state.has_active_suspend_alert());
        assert_eq!(pod_state.pod_time, Duration::ZERO);
        assert!(pod_state.finalized_doses.is_empty());
        assert!(pod_state.fault.is_none());
        assert!(pod_state.active_alert_slots.is_empty());
    }

    #[test]
    fn load_requires_identity_fields() {
        let mut raw = test_pod().to_raw();
        raw.as_object_mut().unwrap().remove("lot");
        assert!(matches!(
            PodState::from_raw(&raw),
            Err(PodStateError::MissingField("lot"))
        ));
    }

    #[test]
    fn load_rejects_unknown_schema_version() {
        let mut raw = test_pod().to_raw();
        raw.as_object_mut()
            .unwrap()
            .insert("schema_version".to_string(), 2u64.into());
        assert!(matches!(
            PodState::from_raw(&raw),
            Err(PodStateError::UnsupportedSchemaVersion(2))
        ));
    }

    #[test]
    fn load_rejects_corrupt_nonce_index() {
        let mut raw = test_pod().to_raw();
        raw["nonce_state"]["idx"] = 99u64.into();
        assert!(matches!(
            PodState::from_raw(&raw),
            Err(PodStateError::InvalidNonceState(_))
        ));
    }

    #[test]
    fn load_drops_a_no_fault_record() {
        let mut pod_state = test_pod();
        pod_state.fault = Some(DetailedStatus {
            pod_progress_status: PodProgressStatus::AboveFiftyUnits,
            delivery_status: DeliveryStatus::ScheduledBasal,
            bolus_not_delivered: 0.0,
            last_programming_message_seq_num: 2,
            total_insulin_delivered: 10.0,
            fault_event_code: FaultEventCode::NO_FAULTS,
            fault_event_time_since_activation: None,
            reservoir_level: None,
            time_active: Duration::from_secs(3600),
            unacknowledged_alerts: AlertSet::NONE,
            fault_accessing_tables: false,
            error_event_info: None,
            receiver_low_gain: 0,
            radio_rssi: 0,
            previous_pod_progress_status: None,
        });

        let restored = PodState::from_raw(&pod_state.to_raw()).unwrap();
        assert!(restored.fault.is_none());

        pod_state.fault.as_mut().unwrap().fault_event_code = FaultEventCode::OCCLUDED;
        let restored = PodState::from_raw(&pod_state.to_raw()).unwrap();
        assert!(restored.fault.is_some());
    }

    #[test]
    fn load_derives_expiry_from_activation() {
        let mut pod_state = test_pod();
        pod_state.activated_at = Some(t(0));
        let mut raw = pod_state.to_raw();
        raw.as_object_mut().unwrap().remove("expires_at");

        let restored = PodState::from_raw(&raw).unwrap();
        assert_eq!(restored.expires_at, Some(t(0) + NOMINAL_POD_LIFE));
    }

    #[test]
    fn load_zeroes_an_unpaired_pod_clock() {
        let mut pod_state = test_pod();
        pod_state.pod_time = Duration::from_secs(600);
        // No pod_time_updated recorded: the clock value alone is useless.
        let restored = PodState::from_raw(&pod_state.to_raw()).unwrap();
        assert_eq!(restored.pod_time, Duration::ZERO);
        assert_eq!(restored.pod_time_updated, None);
    }
}
