//! # erospod-core
//!
//! Lifecycle state for a paired Omnipod Eros pod (no I/O, instant tests).
//!
//! [`PodState`] is the single serializable record a controller keeps per
//! physical pod: identity, the rolling nonce table, setup progress,
//! configured alerts, and the dose bookkeeping that reconciles what we
//! asked for against what the pod reports having delivered. The session
//! layer in `erospod-comms` drives these transitions from live responses.
//!
//! ## Dose accounting
//!
//! The model errs on the side of counting insulin: an outcome that could
//! not be confirmed is resolved toward more delivery, never less.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod dose;
mod nonce;
mod pending;
mod pod_state;

pub use dose::{DoseType, PodInsulinMeasurements, ScheduledCertainty, UnfinalizedDose};
pub use nonce::NonceState;
pub use pending::{PendingCommand, StartProgram};
pub use pod_state::{PodState, PodStateError, SetupProgress, SuspendState, SCHEMA_VERSION};
