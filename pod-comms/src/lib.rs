//! # erospod-comms
//!
//! Pairing and command sessions for the Omnipod Eros radio link.
//!
//! This crate drives the conversation with a pod. [`PodComms`] owns the
//! one pod attachment and runs the two-phase pairing handshake;
//! [`PodCommsSession`] issues commands against a paired pod and keeps
//! its [`pod_core::PodState`] reconciled with every response, including
//! the ones that never arrive. The radio itself sits behind the
//! [`MessageTransport`] trait; [`MockTransport`] scripts exchanges for
//! tests.
//!
//! The crate's one load-bearing rule: a dose-changing command whose
//! response is lost is *unacknowledged*, not failed. Callers get the
//! three-way outcome through [`DeliveryCommandResult`] and the pod state
//! carries the pending command until a later status response settles it.
//!
//! ## Example
//!
//! ```ignore
//! use pod_comms::{generate_candidate_address, PodAttachment, PodComms};
//!
//! let comms = PodComms::new(PodAttachment::Vacant { starting_packet_number: 0 });
//! let address = generate_candidate_address(&mut rand::thread_rng());
//!
//! // Pair a factory-fresh pod and start the prime bolus.
//! let wait = comms
//!     .assign_address_and_setup_pod(&mut transport, address, SystemTime::now(), |session| {
//!         session.prime()
//!     })??;
//!
//! // Once set up, every command runs in a named session.
//! let result = comms.run_session("bolus", &mut transport, |session| session.bolus(2.5))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod comms;
pub mod session;
pub mod transport;

pub use comms::{generate_candidate_address, PodAttachment, PodComms, PodCommsDelegate};
pub use session::{CancelDeliveryResult, DeliveryCommandResult, PodCommsError, PodCommsSession};
pub use transport::{MessageTransport, MockTransport, TransportError};
