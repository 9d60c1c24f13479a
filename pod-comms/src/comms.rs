//! Ownership of the one pod attachment and the sessions against it.
//!
//! [`PodComms`] holds the attachment slot behind a mutex: either nothing
//! (plus the packet number the next pairing must start from) or the full
//! [`PodState`] of an attached pod. Pairing and every later command run
//! through here so that exactly one session can touch the pod state and
//! the radio counters at a time, and so that a registered delegate sees
//! every state change after the lock is released.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use pod_core::{PodState, SetupProgress};
use pod_protocol::constants::PAIRING_ADDRESS;
use pod_protocol::{
    AssignAddressCommand, Message, MessageBlock, MessageTransportState, PodProgressStatus,
    SetupPodCommand, VersionResponse,
};

use crate::session::{PodCommsError, PodCommsSession};
use crate::transport::{MessageTransport, TransportError};

/// Weakest acceptable pairing signal; below this the pod is too far away
/// to trust through setup.
const MIN_PAIRING_RSSI: u8 = 30;
/// Strongest plausible pairing signal; above this the response is
/// usually from a pod still in its packaging on top of the radio.
const MAX_PAIRING_RSSI: u8 = 59;

/// What occupies the single pod slot.
#[derive(Debug, Clone, PartialEq)]
pub enum PodAttachment {
    /// No pod. `starting_packet_number` carries the radio packet counter
    /// across discarded pairing attempts, since a factory-fresh pod
    /// remembers the sequence it last heard.
    Vacant {
        /// Packet number the next pairing attempt must start from.
        starting_packet_number: u8,
    },
    /// A pod is attached; pairing may still be mid-flight.
    Occupied(Box<PodState>),
}

/// Observer of pod state changes.
pub trait PodCommsDelegate {
    /// The attached pod's state changed. `None` means the pod was
    /// detached.
    fn pod_state_did_change(&self, pod_state: Option<&PodState>);
}

/// Owner of the pod attachment and gatekeeper of its sessions.
pub struct PodComms {
    attachment: Mutex<PodAttachment>,
    delegate: Option<Box<dyn PodCommsDelegate + Send + Sync>>,
}

impl PodComms {
    /// Start from a restored attachment (or a vacant one for first use).
    pub fn new(attachment: PodAttachment) -> Self {
        PodComms {
            attachment: Mutex::new(attachment),
            delegate: None,
        }
    }

    /// Register the observer notified after every pod state change.
    pub fn set_delegate(&mut self, delegate: Box<dyn PodCommsDelegate + Send + Sync>) {
        self.delegate = Some(delegate);
    }

    /// A snapshot of the current attachment.
    pub fn attachment(&self) -> PodAttachment {
        self.lock_attachment().clone()
    }

    fn lock_attachment(&self) -> MutexGuard<'_, PodAttachment> {
        // Continue with whatever state a panicking holder left; the pod
        // itself is the source of truth at the next status poll.
        self.attachment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, pod_state: Option<&PodState>) {
        if let Some(delegate) = &self.delegate {
            delegate.pod_state_did_change(pod_state);
        }
    }

    /// Pair a pod on `address` (the assign-address and setup-pod steps,
    /// each skipped if a previous attempt already got through), then run
    /// `f` in a session against it.
    ///
    /// Both pairing commands go to the catch-all pairing address the
    /// factory-fresh pod listens on. The whole flow is resumable: called
    /// again after a partial failure it picks up wherever the pod
    /// actually is, and it refuses only a pod that finished setup.
    pub fn assign_address_and_setup_pod<R, F>(
        &self,
        transport: &mut dyn MessageTransport,
        address: u32,
        now: SystemTime,
        f: F,
    ) -> Result<R, PodCommsError>
    where
        F: FnOnce(&mut PodCommsSession<'_>) -> R,
    {
        let mut attachment = self.lock_attachment();

        if let PodAttachment::Occupied(pod_state) = &*attachment {
            if pod_state.is_setup_complete() {
                return Err(PodCommsError::PodAlreadyPaired);
            }
        }
        let before = occupied_snapshot(&attachment);

        match &*attachment {
            PodAttachment::Vacant {
                starting_packet_number,
            } => {
                transport.restore_state(MessageTransportState::new(*starting_packet_number, 0));
            }
            PodAttachment::Occupied(pod_state) => {
                transport.restore_state(pod_state.message_transport_state);
            }
        }

        let result = pair_and_run(&mut attachment, transport, address, now, f);

        // Pairing can move the state and still fail partway; the
        // delegate hears about whatever actually happened.
        let snapshot = occupied_snapshot(&attachment);
        let changed = snapshot != before;
        drop(attachment);
        if changed {
            self.notify(snapshot.as_ref());
        }
        result
    }

    /// Run `f` in a session against the attached pod.
    ///
    /// The persisted radio counters are restored into the transport
    /// first and saved back after, and the delegate is notified once the
    /// lock is released if the session changed anything.
    pub fn run_session<R, F>(
        &self,
        name: &str,
        transport: &mut dyn MessageTransport,
        f: F,
    ) -> Result<R, PodCommsError>
    where
        F: FnOnce(&mut PodCommsSession<'_>) -> R,
    {
        let mut attachment = self.lock_attachment();
        let PodAttachment::Occupied(pod_state) = &mut *attachment else {
            return Err(PodCommsError::PodNotPaired);
        };
        let before = (**pod_state).clone();

        transport.restore_state(pod_state.message_transport_state);
        tracing::debug!(name, "pod session started");
        let result = {
            let mut session = PodCommsSession::new(pod_state, transport);
            f(&mut session)
        };
        pod_state.message_transport_state = transport.state();

        let changed = **pod_state != before;
        let snapshot = if changed {
            Some((**pod_state).clone())
        } else {
            None
        };
        drop(attachment);
        if let Some(snapshot) = &snapshot {
            self.notify(Some(snapshot));
        }
        Ok(result)
    }

    /// Close the pod's books ahead of discarding it: any pending command
    /// is resolved as uncertain and every live dose is finalized, so one
    /// last storage pass can drain complete records.
    pub fn forget_pod(&self, now: SystemTime) {
        let mut attachment = self.lock_attachment();
        let PodAttachment::Occupied(pod_state) = &mut *attachment else {
            return;
        };
        let before = (**pod_state).clone();
        pod_state.resolve_any_pending_command_with_uncertainty(now);
        pod_state.finalize_all_doses();
        tracing::info!("pod forgotten, dose records closed");

        let changed = **pod_state != before;
        let snapshot = if changed {
            Some((**pod_state).clone())
        } else {
            None
        };
        drop(attachment);
        if let Some(snapshot) = &snapshot {
            self.notify(Some(snapshot));
        }
    }

    /// Drop the attachment entirely. The next pairing starts from packet
    /// number zero.
    pub fn detach_pod(&self) {
        let mut attachment = self.lock_attachment();
        let was_occupied = matches!(&*attachment, PodAttachment::Occupied(_));
        *attachment = PodAttachment::Vacant {
            starting_packet_number: 0,
        };
        drop(attachment);
        if was_occupied {
            tracing::info!("pod detached");
            self.notify(None);
        }
    }
}

fn occupied_snapshot(attachment: &PodAttachment) -> Option<PodState> {
    match attachment {
        PodAttachment::Occupied(pod_state) => Some((**pod_state).clone()),
        PodAttachment::Vacant { .. } => None,
    }
}

fn pair_and_run<R, F>(
    attachment: &mut PodAttachment,
    transport: &mut dyn MessageTransport,
    address: u32,
    now: SystemTime,
    f: F,
) -> Result<R, PodCommsError>
where
    F: FnOnce(&mut PodCommsSession<'_>) -> R,
{
    if matches!(attachment, PodAttachment::Vacant { .. }) {
        let assign = Message::new(
            PAIRING_ADDRESS,
            vec![MessageBlock::AssignAddress(AssignAddressCommand { address })],
            transport.message_number(),
        );
        send_pair_message(attachment, transport, address, &assign, now)?;
    }

    // Setup-pod commits the pod to the assigned address and starts its
    // activation clock.
    let identity = match &*attachment {
        PodAttachment::Occupied(pod_state) if !pod_state.setup_progress.is_paired() => {
            Some((pod_state.lot(), pod_state.tid()))
        }
        PodAttachment::Occupied(_) => None,
        PodAttachment::Vacant { .. } => return Err(PodCommsError::PodNotPaired),
    };
    if let Some((lot, tid)) = identity {
        let setup = Message::new(
            PAIRING_ADDRESS,
            vec![MessageBlock::SetupPod(SetupPodCommand {
                address,
                activation_date: now,
                lot,
                tid,
            })],
            transport.message_number(),
        );
        match send_pair_message(attachment, transport, address, &setup, now) {
            Ok(version) => {
                if !version.is_setup_pod_response() {
                    return Err(PodCommsError::UnexpectedResponse {
                        block_type: pod_protocol::MessageBlockType::VersionResponse,
                    });
                }
            }
            Err(PodCommsError::Transport(TransportError::AckedWithoutResponse)) => {
                // The pod moves on as soon as it accepts setup; the ack
                // alone proves the command took.
                tracing::info!("setup-pod acknowledged without a version response");
                if let PodAttachment::Occupied(pod_state) = &mut *attachment {
                    if !pod_state.setup_progress.is_paired() {
                        pod_state.setup_progress = SetupProgress::PodPaired;
                    }
                }
            }
            Err(error) => return Err(error),
        }
    }

    let PodAttachment::Occupied(pod_state) = &mut *attachment else {
        return Err(PodCommsError::PodNotPaired);
    };
    if !pod_state.setup_progress.is_paired() {
        return Err(PodCommsError::PairingIncomplete);
    }

    let result = {
        let mut session = PodCommsSession::new(pod_state, transport);
        f(&mut session)
    };
    pod_state.message_transport_state = transport.state();
    Ok(result)
}

/// One pairing exchange: send `message`, validate the version response,
/// and fold the reported pod identity into the attachment.
fn send_pair_message(
    attachment: &mut PodAttachment,
    transport: &mut dyn MessageTransport,
    address: u32,
    message: &Message,
    now: SystemTime,
) -> Result<VersionResponse, PodCommsError> {
    let result = exchange_pair_message(attachment, transport, address, message, now);
    // Counters advance even on a failed exchange; keep them for the
    // next attempt.
    match &mut *attachment {
        PodAttachment::Occupied(pod_state) => {
            pod_state.message_transport_state = transport.state();
        }
        PodAttachment::Vacant {
            starting_packet_number,
        } => {
            *starting_packet_number = transport.state().packet_number;
        }
    }
    result
}

fn exchange_pair_message(
    attachment: &mut PodAttachment,
    transport: &mut dyn MessageTransport,
    address: u32,
    message: &Message,
    now: SystemTime,
) -> Result<VersionResponse, PodCommsError> {
    let mut did_retry = false;
    let mut rssi_retries = 2;
    loop {
        let response = match transport.send_message(message) {
            Ok(response) => response,
            Err(error @ (TransportError::AckedWithoutResponse | TransportError::NoResponse))
                if !did_retry =>
            {
                // Losing the response late in a pairing exchange is
                // common; one resend with the advanced packet number
                // usually clears it.
                did_retry = true;
                tracing::info!(%error, "pairing exchange failed, retrying");
                continue;
            }
            Err(error) => return Err(error.into()),
        };

        if let Some(fault) = response.fault() {
            tracing::error!(code = %fault.fault_event_code, "pod fault during pairing");
            let fault = fault.clone();
            if let PodAttachment::Occupied(pod_state) = &mut *attachment {
                if pod_state.fault.is_none() {
                    pod_state.fault = Some(fault.clone());
                }
            }
            return Err(PodCommsError::PodFault {
                fault: Box::new(fault),
            });
        }

        let Some(first) = response.message_blocks.into_iter().next() else {
            return Err(PodCommsError::EmptyResponse);
        };
        let block_type = first.block_type();
        let MessageBlock::VersionResponse(config) = first else {
            tracing::error!(%block_type, "unexpected pairing response");
            return Err(PodCommsError::UnexpectedResponse { block_type });
        };

        if config.address != address {
            return Err(PodCommsError::InvalidAddress {
                address: config.address,
                expected_address: address,
            });
        }
        if let PodAttachment::Occupied(pod_state) = &*attachment {
            // A pod answering with the wrong identity is a swapped pod,
            // or a neighbor's pod in its pairing window.
            if pod_state.lot() != config.lot || pod_state.tid() != config.tid {
                tracing::error!(
                    lot = config.lot,
                    tid = config.tid,
                    "pairing response from a different pod"
                );
                return Err(PodCommsError::PodChange);
            }
        }

        if let Some(signal) = config.signal_quality {
            tracing::info!(rssi = signal.rssi, gain = signal.gain, "pairing signal quality");
            rssi_retries -= 1;
            if signal.rssi < MIN_PAIRING_RSSI {
                if rssi_retries > 0 {
                    continue;
                }
                return Err(PodCommsError::RssiTooLow);
            }
            if signal.rssi > MAX_PAIRING_RSSI {
                if rssi_retries > 0 {
                    continue;
                }
                return Err(PodCommsError::RssiTooHigh);
            }
        }

        if matches!(attachment, PodAttachment::Vacant { .. }) {
            tracing::info!(
                lot = config.lot,
                tid = config.tid,
                "pod accepted address assignment"
            );
            *attachment = PodAttachment::Occupied(Box::new(PodState::new(
                config.address,
                config.pm_version.to_string(),
                config.pi_version.to_string(),
                config.lot,
                config.tid,
                transport.state(),
                now,
            )));
        }
        let PodAttachment::Occupied(pod_state) = &mut *attachment else {
            return Err(PodCommsError::PodNotPaired);
        };

        if config.pod_progress_status == PodProgressStatus::ActivationTimeExceeded {
            pod_state.setup_progress = SetupProgress::ActivationTimeout;
            return Err(PodCommsError::ActivationTimeExceeded);
        }
        if let Some(pod_constants) = &config.pod_constants {
            if !pod_constants.is_nominal() {
                tracing::error!(?pod_constants, "pod reports unexpected delivery constants");
                pod_state.setup_progress = SetupProgress::PodIncompatible;
                return Err(PodCommsError::PodIncompatible);
            }
        }
        if config.pod_progress_status == PodProgressStatus::PairingCompleted
            && !pod_state.setup_progress.is_paired()
        {
            tracing::info!("pod paired");
            pod_state.setup_progress = SetupProgress::PodPaired;
        }

        return Ok(config);
    }
}

/// A fresh candidate radio address in this controller's address space:
/// the fixed `0x1F` prefix over 20 random bits.
pub fn generate_candidate_address<R: rand::Rng>(rng: &mut R) -> u32 {
    0x1F00_0000 | (rng.gen::<u32>() & 0x000F_FFFF)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use pod_core::{PendingCommand, ScheduledCertainty, StartProgram, UnfinalizedDose};
    use pod_protocol::{
        AlertSet, DeliveryStatus, FirmwareVersion, PodConstants, SignalQuality, StatusResponse,
    };

    use crate::transport::MockTransport;

    use super::*;

    const LOT: u32 = 43620;
    const TID: u32 = 560313;
    const ADDRESS: u32 = 0x1F0B_3554;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn version_response(
        progress: PodProgressStatus,
        signal_quality: Option<SignalQuality>,
        pod_constants: Option<PodConstants>,
    ) -> MessageBlock {
        MessageBlock::VersionResponse(VersionResponse {
            pm_version: FirmwareVersion::new(2, 7, 0),
            pi_version: FirmwareVersion::new(2, 7, 0),
            product_id: 0x02,
            lot: LOT,
            tid: TID,
            address: ADDRESS,
            pod_progress_status: progress,
            signal_quality,
            pod_constants,
        })
    }

    fn assign_response(rssi: u8) -> MessageBlock {
        version_response(
            PodProgressStatus::ReminderInitialized,
            Some(SignalQuality { gain: 2, rssi }),
            None,
        )
    }

    fn setup_response() -> MessageBlock {
        version_response(
            PodProgressStatus::PairingCompleted,
            None,
            Some(PodConstants::NOMINAL),
        )
    }

    fn status_block() -> MessageBlock {
        MessageBlock::StatusResponse(StatusResponse {
            delivery_status: DeliveryStatus::ScheduledBasal,
            pod_progress_status: PodProgressStatus::AboveFiftyUnits,
            time_active: Duration::from_secs(3600),
            reservoir_level: None,
            insulin_delivered: 5.0,
            bolus_not_delivered: 0.0,
            last_programming_message_seq_num: 0,
            alerts: AlertSet::NONE,
        })
    }

    fn attached_pod() -> PodState {
        PodState::new(
            ADDRESS,
            "2.7.0".to_string(),
            "2.7.0".to_string(),
            LOT,
            TID,
            MessageTransportState::default(),
            t(0),
        )
    }

    #[derive(Clone, Default)]
    struct RecordingDelegate {
        notifications: Arc<Mutex<Vec<Option<PodState>>>>,
    }

    impl RecordingDelegate {
        fn notifications(&self) -> Vec<Option<PodState>> {
            self.notifications.lock().unwrap().clone()
        }
    }

    impl PodCommsDelegate for RecordingDelegate {
        fn pod_state_did_change(&self, pod_state: Option<&PodState>) {
            self.notifications.lock().unwrap().push(pod_state.cloned());
        }
    }

    // ===========================================
    // Pairing
    // ===========================================

    #[test]
    fn pairing_assigns_an_address_and_sets_up_the_pod() {
        init_tracing();
        let mut comms = PodComms::new(PodAttachment::Vacant {
            starting_packet_number: 0,
        });
        let delegate = RecordingDelegate::default();
        comms.set_delegate(Box::new(delegate.clone()));

        let mock = MockTransport::new();
        mock.queue_response(assign_response(45));
        mock.queue_response(setup_response());
        let mut transport = mock.clone();

        let progress = comms
            .assign_address_and_setup_pod(&mut transport, ADDRESS, t(0), |session| {
                session.pod_state().setup_progress
            })
            .unwrap();
        assert_eq!(progress, SetupProgress::PodPaired);

        let sent = mock.sent_messages();
        assert_eq!(sent.len(), 2);
        // Both pairing commands go to the catch-all pairing address.
        assert_eq!(sent[0].address, PAIRING_ADDRESS);
        assert_eq!(sent[1].address, PAIRING_ADDRESS);
        assert!(matches!(
            sent[0].message_blocks[0],
            MessageBlock::AssignAddress(AssignAddressCommand { address: ADDRESS })
        ));
        let MessageBlock::SetupPod(setup) = &sent[1].message_blocks[0] else {
            panic!("expected a setup-pod command");
        };
        assert_eq!((setup.lot, setup.tid), (LOT, TID));
        assert_eq!(setup.activation_date, t(0));

        let PodAttachment::Occupied(pod_state) = comms.attachment() else {
            panic!("expected an attached pod");
        };
        assert_eq!(pod_state.address(), ADDRESS);
        assert_eq!((pod_state.lot(), pod_state.tid()), (LOT, TID));
        assert!(pod_state.setup_progress.is_paired());
        // Counters continued across both exchanges.
        assert_eq!(pod_state.message_transport_state, transport.state());

        let notifications = delegate.notifications();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].is_some());
    }

    #[test]
    fn pairing_rejects_a_weak_signal_after_retries() {
        let comms = PodComms::new(PodAttachment::Vacant {
            starting_packet_number: 0,
        });

        let mock = MockTransport::new();
        mock.queue_response(assign_response(10));
        mock.queue_response(assign_response(12));
        let mut transport = mock.clone();

        let error = comms
            .assign_address_and_setup_pod(&mut transport, ADDRESS, t(0), |_session| ())
            .unwrap_err();

        assert_eq!(error, PodCommsError::RssiTooLow);
        assert_eq!(mock.sent_messages().len(), 2);
        // Still vacant, but the packet counter carries over so the next
        // attempt stays in sequence with the pod.
        assert_eq!(
            comms.attachment(),
            PodAttachment::Vacant {
                starting_packet_number: 4
            }
        );
    }

    #[test]
    fn pairing_detects_a_different_pod_responding() {
        // Attached pod remembers lot 999 / tid 888; the response carries
        // the identity of some other pod.
        let pod_state = PodState::new(
            ADDRESS,
            "2.7.0".to_string(),
            "2.7.0".to_string(),
            999,
            888,
            MessageTransportState::default(),
            t(0),
        );
        let comms = PodComms::new(PodAttachment::Occupied(Box::new(pod_state)));

        let mock = MockTransport::new();
        mock.queue_response(setup_response());
        let mut transport = mock.clone();

        let error = comms
            .assign_address_and_setup_pod(&mut transport, ADDRESS, t(0), |_session| ())
            .unwrap_err();

        assert_eq!(error, PodCommsError::PodChange);
        let PodAttachment::Occupied(pod_state) = comms.attachment() else {
            panic!("expected the original pod to stay attached");
        };
        assert_eq!(pod_state.setup_progress, SetupProgress::AddressAssigned);
    }

    #[test]
    fn pairing_flags_incompatible_delivery_constants() {
        let comms = PodComms::new(PodAttachment::Occupied(Box::new(attached_pod())));

        let mock = MockTransport::new();
        mock.queue_response(version_response(
            PodProgressStatus::PairingCompleted,
            None,
            Some(PodConstants {
                pulse_size: 0.1,
                ..PodConstants::NOMINAL
            }),
        ));
        let mut transport = mock.clone();

        let error = comms
            .assign_address_and_setup_pod(&mut transport, ADDRESS, t(0), |_session| ())
            .unwrap_err();

        assert_eq!(error, PodCommsError::PodIncompatible);
        let PodAttachment::Occupied(pod_state) = comms.attachment() else {
            panic!("expected an attached pod");
        };
        assert_eq!(pod_state.setup_progress, SetupProgress::PodIncompatible);
    }

    #[test]
    fn pairing_reports_an_activation_timeout() {
        let comms = PodComms::new(PodAttachment::Occupied(Box::new(attached_pod())));

        let mock = MockTransport::new();
        mock.queue_response(version_response(
            PodProgressStatus::ActivationTimeExceeded,
            None,
            None,
        ));
        let mut transport = mock.clone();

        let error = comms
            .assign_address_and_setup_pod(&mut transport, ADDRESS, t(0), |_session| ())
            .unwrap_err();

        assert_eq!(error, PodCommsError::ActivationTimeExceeded);
        let PodAttachment::Occupied(pod_state) = comms.attachment() else {
            panic!("expected an attached pod");
        };
        assert_eq!(pod_state.setup_progress, SetupProgress::ActivationTimeout);
    }

    #[test]
    fn pairing_retries_once_after_a_lost_response() {
        let comms = PodComms::new(PodAttachment::Vacant {
            starting_packet_number: 0,
        });

        let mock = MockTransport::new();
        mock.queue_error(TransportError::NoResponse);
        mock.queue_response(assign_response(45));
        mock.queue_response(setup_response());
        let mut transport = mock.clone();

        comms
            .assign_address_and_setup_pod(&mut transport, ADDRESS, t(0), |_session| ())
            .unwrap();

        // Assign was sent twice, setup once.
        let sent = mock.sent_messages();
        assert_eq!(sent.len(), 3);
        assert!(matches!(
            sent[1].message_blocks[0],
            MessageBlock::AssignAddress(_)
        ));
    }

    #[test]
    fn pairing_accepts_an_ack_for_setup_pod() {
        let comms = PodComms::new(PodAttachment::Occupied(Box::new(attached_pod())));

        let mock = MockTransport::new();
        mock.queue_error(TransportError::AckedWithoutResponse);
        mock.queue_error(TransportError::AckedWithoutResponse);
        let mut transport = mock.clone();

        comms
            .assign_address_and_setup_pod(&mut transport, ADDRESS, t(0), |_session| ())
            .unwrap();

        // One retry, then the ack is taken as proof the pod paired.
        assert_eq!(mock.sent_messages().len(), 2);
        let PodAttachment::Occupied(pod_state) = comms.attachment() else {
            panic!("expected an attached pod");
        };
        assert_eq!(pod_state.setup_progress, SetupProgress::PodPaired);
    }

    #[test]
    fn pairing_refuses_a_fully_set_up_pod() {
        let mut pod_state = attached_pod();
        pod_state.setup_progress = SetupProgress::Completed;
        let comms = PodComms::new(PodAttachment::Occupied(Box::new(pod_state)));

        let mock = MockTransport::new();
        let mut transport = mock.clone();
        let error = comms
            .assign_address_and_setup_pod(&mut transport, ADDRESS, t(0), |_session| ())
            .unwrap_err();

        assert_eq!(error, PodCommsError::PodAlreadyPaired);
        assert!(mock.sent_messages().is_empty());
    }

    // ===========================================
    // Sessions
    // ===========================================

    #[test]
    fn run_session_requires_an_attached_pod() {
        let comms = PodComms::new(PodAttachment::Vacant {
            starting_packet_number: 3,
        });
        let mock = MockTransport::new();
        let mut transport = mock.clone();

        let error = comms
            .run_session("status", &mut transport, |_session| ())
            .unwrap_err();
        assert_eq!(error, PodCommsError::PodNotPaired);
    }

    #[test]
    fn run_session_restores_and_saves_radio_counters() {
        init_tracing();
        let mut pod_state = attached_pod();
        pod_state.setup_progress = SetupProgress::Completed;
        pod_state.message_transport_state = MessageTransportState::new(5, 7);
        let comms = PodComms::new(PodAttachment::Occupied(Box::new(pod_state)));

        let mock = MockTransport::new();
        mock.queue_response(status_block());
        let mut transport = mock.clone();

        comms
            .run_session("status", &mut transport, |session| {
                session.mock_current_date = Some(t(4000));
                session.get_status()
            })
            .unwrap()
            .unwrap();

        // The message went out under the persisted sequence number.
        assert_eq!(mock.last_sent().unwrap().sequence_num, 7);
        let PodAttachment::Occupied(pod_state) = comms.attachment() else {
            panic!("expected an attached pod");
        };
        assert_eq!(
            pod_state.message_transport_state,
            MessageTransportState::new(7, 9)
        );
    }

    #[test]
    fn run_session_notifies_the_delegate_once_on_change() {
        let mut comms = PodComms::new(PodAttachment::Occupied(Box::new(attached_pod())));
        let delegate = RecordingDelegate::default();
        comms.set_delegate(Box::new(delegate.clone()));

        let mock = MockTransport::new();
        mock.queue_response(status_block());
        let mut transport = mock.clone();

        comms
            .run_session("status", &mut transport, |session| {
                session.mock_current_date = Some(t(4000));
                session.get_status()
            })
            .unwrap()
            .unwrap();

        let notifications = delegate.notifications();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].is_some());

        // A session that changes nothing stays silent.
        comms
            .run_session("noop", &mut transport, |_session| ())
            .unwrap();
        assert_eq!(delegate.notifications().len(), 1);
    }

    // ===========================================
    // Attachment lifecycle
    // ===========================================

    #[test]
    fn forget_pod_resolves_pending_commands_and_closes_doses() {
        let mut pod_state = attached_pod();
        pod_state.setup_progress = SetupProgress::Completed;
        pod_state.unacknowledged_command = Some(PendingCommand::Program {
            program: StartProgram::Bolus { units: 2.0 },
            sequence: 3,
            command_date: t(100),
            in_flight: false,
        });
        pod_state.unfinalized_temp_basal = Some(UnfinalizedDose::temp_basal(
            0.8,
            t(50),
            Duration::from_secs(1800),
            false,
            ScheduledCertainty::Certain,
        ));
        let mut comms = PodComms::new(PodAttachment::Occupied(Box::new(pod_state)));
        let delegate = RecordingDelegate::default();
        comms.set_delegate(Box::new(delegate.clone()));

        comms.forget_pod(t(300));

        let PodAttachment::Occupied(pod_state) = comms.attachment() else {
            panic!("expected an attached pod");
        };
        assert!(pod_state.unacknowledged_command.is_none());
        assert!(pod_state.unfinalized_temp_basal.is_none());
        // The never-confirmed bolus survives as an uncertain record.
        assert!(pod_state.finalized_doses.iter().any(|dose| {
            dose.scheduled_certainty == ScheduledCertainty::Uncertain && dose.units == 2.0
        }));
        assert_eq!(delegate.notifications().len(), 1);
    }

    #[test]
    fn detach_pod_empties_the_attachment() {
        let mut comms = PodComms::new(PodAttachment::Occupied(Box::new(attached_pod())));
        let delegate = RecordingDelegate::default();
        comms.set_delegate(Box::new(delegate.clone()));

        comms.detach_pod();

        assert_eq!(
            comms.attachment(),
            PodAttachment::Vacant {
                starting_packet_number: 0
            }
        );
        assert_eq!(delegate.notifications(), vec![None]);

        // Detaching again is a no-op.
        comms.detach_pod();
        assert_eq!(delegate.notifications().len(), 1);
    }

    #[test]
    fn candidate_addresses_stay_in_the_pod_address_space() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..64 {
            let address = generate_candidate_address(&mut rng);
            assert_eq!(address & !0x000F_FFFF, 0x1F00_0000);
        }
    }
}
