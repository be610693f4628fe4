//! Definitions and implementations of extended messages.
//!
//! See [6.5].

pub mod chunked;
pub mod extended_control;
pub mod manufacturer_info;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use proc_bitfield::bitfield;

use crate::protocol_layer::message::data::sink_capabilities::SinkPowerDataObject;
use crate::protocol_layer::message::data::source_capabilities::{self, MAX_PDOS, PowerDataObject};
use crate::protocol_layer::message::header::ExtendedMessageType;

/// Size of an extended capabilities (SCEDB/SKEDB) payload.
pub const EXTENDED_CAPS_SIZE: usize = 25;

/// Payloads of extended messages.
#[derive(Debug, Clone)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Extended {
    /// Extended control message payload.
    ExtendedControl(extended_control::ExtendedControl),
    /// EPR source capabilities list.
    EprSourceCapabilities(Vec<PowerDataObject, MAX_PDOS>),
    /// EPR sink capabilities list.
    EprSinkCapabilities(Vec<SinkPowerDataObject, 7>),
    /// Request for manufacturer information.
    GetManufacturerInfo(manufacturer_info::GetManufacturerInfo),
    /// Manufacturer information response.
    ManufacturerInfo(manufacturer_info::ManufacturerInfo),
    /// Extended source capabilities blob (SCEDB).
    SourceCapabilitiesExtended(Vec<u8, EXTENDED_CAPS_SIZE>),
    /// Extended sink capabilities blob (SKEDB).
    SinkCapabilitiesExtended(Vec<u8, EXTENDED_CAPS_SIZE>),
    /// Unknown payload type.
    Unknown,
}

impl Extended {
    /// Parse an assembled extended payload.
    pub fn parse(message_type: ExtendedMessageType, payload: &[u8]) -> Self {
        match message_type {
            ExtendedMessageType::ExtendedControl => {
                Self::ExtendedControl(extended_control::ExtendedControl::from_bytes(payload))
            }
            ExtendedMessageType::EprSourceCapabilities => Self::EprSourceCapabilities(
                payload
                    .chunks_exact(4)
                    .take(MAX_PDOS)
                    .map(|buf| source_capabilities::parse_raw_pdo(LittleEndian::read_u32(buf)))
                    .collect(),
            ),
            ExtendedMessageType::EprSinkCapabilities => Self::EprSinkCapabilities(
                payload
                    .chunks_exact(4)
                    .take(7)
                    .map(|buf| SinkPowerDataObject::from_raw(LittleEndian::read_u32(buf)))
                    .collect(),
            ),
            ExtendedMessageType::GetManufacturerInfo => {
                Self::GetManufacturerInfo(manufacturer_info::GetManufacturerInfo::from_bytes(payload))
            }
            ExtendedMessageType::ManufacturerInfo => {
                Self::ManufacturerInfo(manufacturer_info::ManufacturerInfo::from_bytes(payload))
            }
            ExtendedMessageType::SourceCapabilitiesExtended => {
                Self::SourceCapabilitiesExtended(payload.iter().take(EXTENDED_CAPS_SIZE).copied().collect())
            }
            ExtendedMessageType::SinkCapabilitiesExtended => {
                Self::SinkCapabilitiesExtended(payload.iter().take(EXTENDED_CAPS_SIZE).copied().collect())
            }
            _ => Self::Unknown,
        }
    }

    /// Size of the extended payload in bytes.
    pub fn data_size(&self) -> u16 {
        match self {
            Self::ExtendedControl(_payload) => 2,
            Self::EprSourceCapabilities(pdos) => (pdos.len() * core::mem::size_of::<u32>()) as u16,
            Self::EprSinkCapabilities(pdos) => (pdos.len() * core::mem::size_of::<u32>()) as u16,
            Self::GetManufacturerInfo(_) => 2,
            Self::ManufacturerInfo(info) => info.data_size(),
            Self::SourceCapabilitiesExtended(blob) | Self::SinkCapabilitiesExtended(blob) => blob.len() as u16,
            Self::Unknown => 0,
        }
    }

    /// Serialize message data to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, payload: &mut [u8]) -> usize {
        match self {
            Self::Unknown => 0,
            Self::ExtendedControl(control) => control.to_bytes(payload),
            Self::EprSourceCapabilities(pdos) => {
                let mut written = 0;
                for pdo in pdos {
                    LittleEndian::write_u32(&mut payload[written..written + 4], pdo.to_raw());
                    written += 4;
                }
                written
            }
            Self::EprSinkCapabilities(pdos) => {
                let mut written = 0;
                for pdo in pdos {
                    LittleEndian::write_u32(&mut payload[written..written + 4], pdo.to_raw());
                    written += 4;
                }
                written
            }
            Self::GetManufacturerInfo(request) => request.to_bytes(payload),
            Self::ManufacturerInfo(info) => info.to_bytes(payload),
            Self::SourceCapabilitiesExtended(blob) | Self::SinkCapabilitiesExtended(blob) => {
                payload[..blob.len()].copy_from_slice(blob);
                blob.len()
            }
        }
    }
}

bitfield! {
    /// Extended message header.
    ///
    /// Carried after the message header in every extended message.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ExtendedHeader(pub u16): Debug, FromStorage, IntoStorage {
        /// Payload size in bytes.
        pub data_size: u16 @ 0..=8,
        /// Request chunk flag.
        pub request_chunk: bool @ 10,
        /// Chunk number of this extended message.
        pub chunk_number: u8 @ 11..=14,
        /// Whether the message is chunked.
        pub chunked: bool @ 15,
    }
}

impl ExtendedHeader {
    /// Create a new, unchunked extended header for a given payload size.
    pub fn new(data_size: u16) -> Self {
        Self(0).with_data_size(data_size)
    }

    /// Serialize the extended header into the buffer, returning bytes written.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(buf, self.0);
        2
    }

    /// Parse an extended header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        assert!(buf.len() >= 2);
        Self(LittleEndian::read_u16(buf))
    }
}
