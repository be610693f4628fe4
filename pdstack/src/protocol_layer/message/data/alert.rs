//! Definitions of Alert data message content.
//!
//! See [6.4.6].
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

bitfield! {
    /// The Alert data object.
    ///
    /// A source raises it to report operating condition changes and faults;
    /// the partner typically follows up with Get_Status.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct AlertDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Extended alert event pending.
        pub extended_alert: bool @ 31,
        /// Operating voltage or current has changed.
        pub operating_condition_change: bool @ 30,
        /// The source has entered a current-limiting mode.
        pub source_input_change: bool @ 29,
        /// Over-current protection event.
        pub ocp: bool @ 28,
        /// Over-temperature protection event.
        pub otp: bool @ 27,
        /// Over-voltage protection event.
        pub ovp: bool @ 26,
        /// Battery status change.
        pub battery_status_change: bool @ 25,
        /// Hot-swappable battery slots.
        pub hot_swappable_batteries: u8 @ 20..=23,
        /// Fixed battery slots.
        pub fixed_batteries: u8 @ 16..=19,
        /// Extended alert event type.
        pub extended_alert_type: u8 @ 0..=3,
    }
}

#[allow(clippy::derivable_impls)]
impl Default for AlertDataObject {
    fn default() -> Self {
        Self(0)
    }
}

impl AlertDataObject {
    /// Serialize to a buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// Whether any protection fault bit is set.
    pub fn is_fault(&self) -> bool {
        self.ocp() || self.otp() || self.ovp()
    }
}
