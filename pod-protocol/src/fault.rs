//! Pod fault codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A raw fault code from the pod firmware.
///
/// Kept as the raw byte so codes this crate does not know by name still
/// round-trip through persistence and logs unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultEventCode(u8);

impl FaultEventCode {
    /// No fault present.
    pub const NO_FAULTS: FaultEventCode = FaultEventCode(0x00);
    /// Occlusion detected.
    pub const OCCLUDED: FaultEventCode = FaultEventCode(0x14);
    /// Reservoir empty or maximum pulse delivery exceeded.
    pub const RESERVOIR_EMPTY: FaultEventCode = FaultEventCode(0x18);
    /// Pod ran past its maximum 80 hour life.
    pub const EXCEEDED_MAXIMUM_POD_LIFE: FaultEventCode = FaultEventCode(0x1C);
    /// A delivery command failed internal validation.
    pub const INSULIN_DELIVERY_COMMAND_ERROR: FaultEventCode = FaultEventCode(0x31);

    /// Wrap a raw fault byte.
    pub const fn new(raw: u8) -> FaultEventCode {
        FaultEventCode(raw)
    }

    /// The raw fault byte.
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Whether this code reports an actual fault.
    pub fn is_faulted(self) -> bool {
        self.0 != 0
    }

    /// Human-readable classification for logging.
    pub fn description(self) -> &'static str {
        match self.0 {
            0x00 => "no faults",
            0x01 => "flash erase failed",
            0x02 => "flash store failed",
            0x13 => "message length too long",
            0x14 => "occlusion detected",
            0x18 => "reservoir empty or exceeded maximum pulse delivery",
            0x1C => "exceeded maximum pod life of 80 hours",
            0x31 => "insulin delivery command error",
            0x0D..=0x12 => "processor reset fault",
            0x60..=0x6A => "occlusion detection fault",
            0x80..=0x97 => "delivery state machine fault",
            _ => "unclassified fault",
        }
    }
}

impl fmt::Display for FaultEventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.0, self.description())
    }
}

impl fmt::Debug for FaultEventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FaultEventCode(0x{:02X})", self.0)
    }
}
