//! Pod alert slots and configurations.
//!
//! The pod has eight hardware alert slots. Each can be armed with a
//! trigger (elapsed time or reservoir level), an optional auto-clear
//! duration, and a beep pattern. [`PodAlert`] enumerates the alerts this
//! controller actually programs and knows how to render each one into the
//! [`AlertConfiguration`] the pod expects.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const MINUTE: Duration = Duration::from_secs(60);

/// One of the eight hardware alert slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AlertSlot {
    /// Auto-off countdown (not programmed by this controller).
    AutoOff = 0,
    /// Unused by the protocol.
    NotUsed = 1,
    /// Shutdown warning near end of service.
    ShutdownImminent = 2,
    /// User-configurable reminder ahead of expiration.
    ExpirationReminder = 3,
    /// Reservoir at or below a configured level.
    LowReservoir = 4,
    /// Periodic reminder while delivery is suspended.
    SuspendedReminder = 5,
    /// Alarm when a timed suspend elapses without a resume.
    SuspendTimeExpired = 6,
    /// Pod expiration alarm, also used for the setup reminders.
    Expired = 7,
}

impl AlertSlot {
    /// All slots in index order.
    pub const ALL: [AlertSlot; 8] = [
        AlertSlot::AutoOff,
        AlertSlot::NotUsed,
        AlertSlot::ShutdownImminent,
        AlertSlot::ExpirationReminder,
        AlertSlot::LowReservoir,
        AlertSlot::SuspendedReminder,
        AlertSlot::SuspendTimeExpired,
        AlertSlot::Expired,
    ];

    /// Position of this slot in an [`AlertSet`] bitmask.
    pub fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// A set of alert slots, as reported in status responses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSet(u8);

impl AlertSet {
    /// The empty set.
    pub const NONE: AlertSet = AlertSet(0);

    /// Set from a raw 8-bit mask.
    pub fn new(raw: u8) -> AlertSet {
        AlertSet(raw)
    }

    /// Set containing exactly the given slots.
    pub fn from_slots(slots: &[AlertSlot]) -> AlertSet {
        AlertSet(slots.iter().fold(0, |mask, slot| mask | slot.bit()))
    }

    /// The raw 8-bit mask.
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Whether `slot` is in the set.
    pub fn contains(self, slot: AlertSlot) -> bool {
        self.0 & slot.bit() != 0
    }

    /// This set with every slot of `other` cleared.
    pub fn removing(self, other: AlertSet) -> AlertSet {
        AlertSet(self.0 & !other.0)
    }

    /// True when no slot is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Member slots in index order.
    pub fn slots(self) -> Vec<AlertSlot> {
        AlertSlot::ALL
            .iter()
            .copied()
            .filter(|slot| self.contains(*slot))
            .collect()
    }
}

impl fmt::Display for AlertSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let slots: Vec<String> = self
            .slots()
            .into_iter()
            .map(|slot| (slot as u8).to_string())
            .collect();
        write!(f, "slots [{}]", slots.join(", "))
    }
}

/// What arms an alert slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AlertTrigger {
    /// Fire when the reservoir falls to this many units.
    UnitsRemaining(f64),
    /// Fire once this much time has elapsed.
    TimeUntilAlert(Duration),
}

/// Firmware beep repetition patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum BeepRepeat {
    Once = 0,
    Every1MinuteFor3MinutesAndRepeatEvery60Minutes = 1,
    Every1MinuteFor15Minutes = 2,
    Every1MinuteFor3MinutesAndRepeatEvery15Minutes = 3,
    Every3MinutesFor60MinutesStartingAt2Minutes = 4,
    Every60Minutes = 5,
    Every15Minutes = 6,
    Every15MinutesFor60MinutesStartingAt14Minutes = 7,
    Every5Minutes = 8,
}

/// Firmware beep tones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum BeepType {
    NoBeepCancel = 0x0,
    BeepBeepBeepBeep = 0x1,
    BipBeepBipBeepBipBeepBipBeep = 0x2,
    BipBip = 0x3,
    Beep = 0x4,
    BeepBeepBeep = 0x5,
    Beeeeeep = 0x6,
    BipBipBipbipBipBip = 0x7,
    BeeepBeeep = 0x8,
    BeepBeep = 0x9,
    NoBeepNonCancel = 0xF,
}

/// Fully resolved slot programming, as sent in a configure-alerts command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertConfiguration {
    /// Slot being programmed.
    pub slot: AlertSlot,
    /// Whether the slot is armed at all.
    pub active: bool,
    /// How long the alert keeps firing once triggered (zero = untimed).
    pub duration: Duration,
    /// Arming condition.
    pub trigger: AlertTrigger,
    /// Beep repetition pattern.
    pub beep_repeat: BeepRepeat,
    /// Beep tone.
    pub beep_type: BeepType,
    /// Suppress beeps while keeping the alert state itself.
    pub silent: bool,
    /// Marks the auto-off slot's special countdown behavior.
    pub auto_off_modifier: bool,
}

/// The alerts this controller programs.
///
/// Time fields are measured on the pod's own clock: `alert_time` is an
/// absolute offset from activation, and `offset` is the pod clock at the
/// moment the alert is configured. The pod wants a relative trigger, so
/// [`PodAlert::configuration`] sends `alert_time - offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PodAlert {
    /// Shutdown warning near end of service (slot 2).
    ShutdownImminent {
        /// Pod clock when configured.
        offset: Duration,
        /// Pod clock at which the alert fires; zero disables the slot.
        alert_time: Duration,
        /// Program without beeps.
        silent: bool,
    },
    /// User-configurable reminder ahead of expiration (slot 3).
    ExpirationReminder {
        /// Pod clock when configured.
        offset: Duration,
        /// Pod clock at which the alert fires; zero disables the slot.
        alert_time: Duration,
        /// How long the alert repeats.
        duration: Duration,
        /// Program without beeps.
        silent: bool,
    },
    /// Reservoir at or below `units` (slot 4).
    LowReservoir {
        /// Threshold in units; zero disables the slot.
        units: f64,
        /// Program without beeps.
        silent: bool,
    },
    /// Periodic reminder while delivery is suspended (slot 5).
    PodSuspendedReminder {
        /// Whether the reminder is wanted at all.
        active: bool,
        /// Pod clock when configured.
        offset: Duration,
        /// Scheduled suspend length; zero means suspended until resumed.
        suspend_time: Duration,
        /// Time already spent suspended, for reconfiguration mid-suspend.
        time_passed: Duration,
        /// Program without beeps.
        silent: bool,
    },
    /// Alarm when a timed suspend elapses without a resume (slot 6).
    SuspendTimeExpired {
        /// Pod clock when configured.
        offset: Duration,
        /// Scheduled suspend length; zero disables the slot.
        suspend_time: Duration,
        /// Program without beeps.
        silent: bool,
    },
    /// Factory pairing window: beep until the pod is paired (slot 7).
    WaitingForPairingReminder,
    /// Setup must finish within the hour (slot 7).
    FinishSetupReminder,
    /// Pod expiration alarm (slot 7).
    Expired {
        /// Pod clock when configured.
        offset: Duration,
        /// Pod clock at which the alert fires; zero disables the slot.
        alert_time: Duration,
        /// How long the alert repeats.
        duration: Duration,
        /// Program without beeps.
        silent: bool,
    },
}

impl PodAlert {
    /// The hardware slot this alert occupies.
    pub fn slot(&self) -> AlertSlot {
        match self {
            PodAlert::ShutdownImminent { .. } => AlertSlot::ShutdownImminent,
            PodAlert::ExpirationReminder { .. } => AlertSlot::ExpirationReminder,
            PodAlert::LowReservoir { .. } => AlertSlot::LowReservoir,
            PodAlert::PodSuspendedReminder { .. } => AlertSlot::SuspendedReminder,
            PodAlert::SuspendTimeExpired { .. } => AlertSlot::SuspendTimeExpired,
            PodAlert::WaitingForPairingReminder
            | PodAlert::FinishSetupReminder
            | PodAlert::Expired { .. } => AlertSlot::Expired,
        }
    }

    /// Resolve into the slot programming the pod expects.
    pub fn configuration(&self) -> AlertConfiguration {
        match self {
            PodAlert::ShutdownImminent {
                offset,
                alert_time,
                silent,
            } => {
                let active = !alert_time.is_zero();
                let trigger_time = if active {
                    alert_time.saturating_sub(*offset)
                } else {
                    Duration::ZERO
                };
                AlertConfiguration {
                    slot: AlertSlot::ShutdownImminent,
                    active,
                    duration: Duration::ZERO,
                    trigger: AlertTrigger::TimeUntilAlert(trigger_time),
                    beep_repeat: BeepRepeat::Every15Minutes,
                    beep_type: BeepType::BipBeepBipBeepBipBeepBipBeep,
                    silent: *silent,
                    auto_off_modifier: false,
                }
            }

            PodAlert::ExpirationReminder {
                offset,
                alert_time,
                duration,
                silent,
            } => {
                let active = !alert_time.is_zero();
                let trigger_time = if active {
                    alert_time.saturating_sub(*offset)
                } else {
                    Duration::ZERO
                };
                AlertConfiguration {
                    slot: AlertSlot::ExpirationReminder,
                    active,
                    duration: *duration,
                    trigger: AlertTrigger::TimeUntilAlert(trigger_time),
                    beep_repeat: BeepRepeat::Every1MinuteFor3MinutesAndRepeatEvery15Minutes,
                    beep_type: BeepType::BipBeepBipBeepBipBeepBipBeep,
                    silent: *silent,
                    auto_off_modifier: false,
                }
            }

            PodAlert::LowReservoir { units, silent } => AlertConfiguration {
                slot: AlertSlot::LowReservoir,
                active: *units != 0.0,
                duration: Duration::ZERO,
                trigger: AlertTrigger::UnitsRemaining(*units),
                beep_repeat: BeepRepeat::Every1MinuteFor3MinutesAndRepeatEvery60Minutes,
                beep_type: BeepType::BipBeepBipBeepBipBeepBipBeep,
                silent: *silent,
                auto_off_modifier: false,
            },

            // A zero suspend time is an untimed suspend. For a timed
            // suspend the reminder is skipped entirely when not enough of
            // the suspend remains for even one beep.
            PodAlert::PodSuspendedReminder {
                active,
                offset: _,
                suspend_time,
                time_passed,
                silent,
            } => {
                let long_suspend =
                    suspend_time.is_zero() || *suspend_time >= Duration::from_secs(30 * 60);
                let (reminder_interval, mut beep_repeat) = if long_suspend {
                    (15 * MINUTE, BeepRepeat::Every15Minutes)
                } else {
                    (5 * MINUTE, BeepRepeat::Every5Minutes)
                };

                let suspend_time_remaining = suspend_time.saturating_sub(*time_passed);
                let mut is_active = *active;
                if !suspend_time.is_zero() && suspend_time_remaining <= reminder_interval {
                    is_active = false;
                }

                let (duration, trigger, beep_type);
                if is_active {
                    // Next upcoming reminder boundary within the suspend.
                    let interval_secs = reminder_interval.as_secs();
                    let trigger_time =
                        Duration::from_secs(interval_secs - time_passed.as_secs() % interval_secs);
                    duration = if suspend_time.is_zero() {
                        Duration::ZERO
                    } else {
                        suspend_time_remaining.saturating_sub(trigger_time)
                    };
                    trigger = AlertTrigger::TimeUntilAlert(trigger_time);
                    beep_type = BeepType::Beep;
                } else {
                    beep_repeat = BeepRepeat::Once;
                    duration = Duration::ZERO;
                    trigger = AlertTrigger::TimeUntilAlert(Duration::ZERO);
                    beep_type = BeepType::NoBeepCancel;
                }
                AlertConfiguration {
                    slot: AlertSlot::SuspendedReminder,
                    active: is_active,
                    duration,
                    trigger,
                    beep_repeat,
                    beep_type,
                    silent: *silent,
                    auto_off_modifier: false,
                }
            }

            PodAlert::SuspendTimeExpired {
                offset: _,
                suspend_time,
                silent,
            } => {
                let active = !suspend_time.is_zero();
                let (trigger, beep_repeat, beep_type) = if active {
                    (
                        AlertTrigger::TimeUntilAlert(*suspend_time),
                        BeepRepeat::Every15Minutes,
                        BeepType::BipBeepBipBeepBipBeepBipBeep,
                    )
                } else {
                    (
                        AlertTrigger::TimeUntilAlert(Duration::ZERO),
                        BeepRepeat::Once,
                        BeepType::NoBeepCancel,
                    )
                };
                AlertConfiguration {
                    slot: AlertSlot::SuspendTimeExpired,
                    active,
                    duration: Duration::ZERO,
                    trigger,
                    beep_repeat,
                    beep_type,
                    silent: *silent,
                    auto_off_modifier: false,
                }
            }

            // After power-on the pod beeps for up to 2 hours waiting for
            // pairing to start.
            PodAlert::WaitingForPairingReminder => AlertConfiguration {
                slot: AlertSlot::Expired,
                active: true,
                duration: 2 * 60 * MINUTE - 10 * MINUTE,
                trigger: AlertTrigger::TimeUntilAlert(10 * MINUTE),
                beep_repeat: BeepRepeat::Every5Minutes,
                beep_type: BeepType::BipBeepBipBeepBipBeepBipBeep,
                silent: false,
                auto_off_modifier: false,
            },

            // Once paired, setup has one hour to complete.
            PodAlert::FinishSetupReminder => AlertConfiguration {
                slot: AlertSlot::Expired,
                active: true,
                duration: 60 * MINUTE - 5 * MINUTE,
                trigger: AlertTrigger::TimeUntilAlert(5 * MINUTE),
                beep_repeat: BeepRepeat::Every5Minutes,
                beep_type: BeepType::BipBeepBipBeepBipBeepBipBeep,
                silent: false,
                auto_off_modifier: false,
            },

            PodAlert::Expired {
                offset,
                alert_time,
                duration,
                silent,
            } => {
                let active = !alert_time.is_zero();
                let trigger_time = if active {
                    alert_time.saturating_sub(*offset)
                } else {
                    Duration::ZERO
                };
                AlertConfiguration {
                    slot: AlertSlot::Expired,
                    active,
                    duration: *duration,
                    trigger: AlertTrigger::TimeUntilAlert(trigger_time),
                    beep_repeat: BeepRepeat::Every60Minutes,
                    beep_type: BeepType::BipBeepBipBeepBipBeepBipBeep,
                    silent: *silent,
                    auto_off_modifier: false,
                }
            }
        }
    }
}
