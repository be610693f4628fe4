//! Get_Manufacturer_Info and Manufacturer_Info message content.
//!
//! See [6.5.6] and [6.5.7]. The response is built from the port
//! configuration's VID, PID and manufacturer name.
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

/// Maximum length of the manufacturer string in the response.
pub const MAX_MANUFACTURER_STRING: usize = 22;

/// Targets of a Get_Manufacturer_Info request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InfoTarget {
    /// The port or cable plug itself.
    Port,
    /// A battery, selected by the reference field.
    Battery,
    /// A reserved target value.
    Reserved(u8),
}

impl From<u8> for InfoTarget {
    fn from(value: u8) -> Self {
        match value {
            0 => InfoTarget::Port,
            1 => InfoTarget::Battery,
            other => InfoTarget::Reserved(other),
        }
    }
}

/// Payload of a Get_Manufacturer_Info request.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GetManufacturerInfo {
    /// What the request targets.
    pub target: InfoTarget,
    /// Battery index for battery targets.
    pub reference: u8,
}

impl GetManufacturerInfo {
    /// Parse from the extended message payload.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            target: buf.first().copied().unwrap_or(0).into(),
            reference: buf.get(1).copied().unwrap_or(0),
        }
    }

    /// Serialize to a buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        buf[0] = match self.target {
            InfoTarget::Port => 0,
            InfoTarget::Battery => 1,
            InfoTarget::Reserved(other) => other,
        };
        buf[1] = self.reference;
        2
    }
}

/// Payload of a Manufacturer_Info response.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ManufacturerInfo {
    /// The manufacturer's USB vendor ID.
    pub vid: u16,
    /// The product ID.
    pub pid: u16,
    /// The manufacturer string, not null-terminated.
    pub string: Vec<u8, MAX_MANUFACTURER_STRING>,
}

impl ManufacturerInfo {
    /// Build a response from configuration fields.
    pub fn new(vid: u16, pid: u16, name: &[u8]) -> Self {
        let end = name.iter().position(|byte| *byte == 0).unwrap_or(name.len());
        Self {
            vid,
            pid,
            string: name[..end.min(MAX_MANUFACTURER_STRING)].iter().copied().collect(),
        }
    }

    /// Parse from the extended message payload.
    pub fn from_bytes(buf: &[u8]) -> Self {
        if buf.len() < 4 {
            return Self::default();
        }

        Self {
            vid: LittleEndian::read_u16(&buf[..2]),
            pid: LittleEndian::read_u16(&buf[2..4]),
            string: buf[4..].iter().take(MAX_MANUFACTURER_STRING).copied().collect(),
        }
    }

    /// Serialize to a buffer, returning the number of written bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(&mut buf[..2], self.vid);
        LittleEndian::write_u16(&mut buf[2..4], self.pid);
        buf[4..4 + self.string.len()].copy_from_slice(&self.string);
        4 + self.string.len()
    }

    /// The payload size on the wire.
    pub fn data_size(&self) -> u16 {
        4 + self.string.len() as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_round_trip() {
        let info = ManufacturerInfo::new(0x04B4, 0xF500, b"ACME Power Ltd\0\0\0\0\0\0\0\0");
        assert_eq!(info.string.len(), 14);

        let mut buf = [0u8; 32];
        let size = info.to_bytes(&mut buf);
        assert_eq!(size, 18);

        let parsed = ManufacturerInfo::from_bytes(&buf[..size]);
        assert_eq!(parsed.vid, 0x04B4);
        assert_eq!(parsed.pid, 0xF500);
        assert_eq!(&parsed.string[..], b"ACME Power Ltd");
    }

    #[test]
    fn oversized_names_are_truncated() {
        let info = ManufacturerInfo::new(1, 2, b"this manufacturer name is far too long");
        assert_eq!(info.string.len(), MAX_MANUFACTURER_STRING);
    }
}
