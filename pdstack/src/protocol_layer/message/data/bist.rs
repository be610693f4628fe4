//! Definitions of BIST data message content.
//!
//! See [6.4.3].
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

/// BIST modes, encoded in the upper nibble of the BIST data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BistMode {
    /// Carrier mode: transmit a continuous BMC pattern for tBISTContMode.
    CarrierMode2,
    /// Test data mode: swallow all traffic until a hard reset.
    TestData,
    /// Shared-capacity test mode entry (PD 3.2).
    SharedTestModeEntry,
    /// Shared-capacity test mode exit (PD 3.2).
    SharedTestModeExit,
    /// A mode this stack does not implement.
    Unsupported(u8),
}

impl From<u8> for BistMode {
    fn from(value: u8) -> Self {
        match value {
            0b0101 => BistMode::CarrierMode2,
            0b1000 => BistMode::TestData,
            0b1001 => BistMode::SharedTestModeEntry,
            0b1010 => BistMode::SharedTestModeExit,
            other => BistMode::Unsupported(other),
        }
    }
}

impl From<BistMode> for u8 {
    fn from(value: BistMode) -> Self {
        match value {
            BistMode::CarrierMode2 => 0b0101,
            BistMode::TestData => 0b1000,
            BistMode::SharedTestModeEntry => 0b1001,
            BistMode::SharedTestModeExit => 0b1010,
            BistMode::Unsupported(other) => other,
        }
    }
}

bitfield! {
    /// The BIST data object.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BistDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The requested test mode.
        pub mode: u8 [BistMode] @ 28..=31,
    }
}

impl BistDataObject {
    /// Serialize to a buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }
}
