//! Definitions and implementations of data messages.
//!
//! See [6.4].
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::protocol_layer::message::Payload;
use crate::protocol_layer::message::header::DataMessageType;

pub mod alert;
pub mod bist;
pub mod epr_mode;
pub mod request;
pub mod sink_capabilities;
pub mod source_capabilities;
pub mod vendor_defined;

/// Lookup of the supply kind at a given object position.
///
/// Requests only carry an object position; resolving the position against the
/// last advertised capabilities determines how to decode the RDO fields.
pub trait PdoState {
    /// The supply kind at `position` (1-based), if known.
    fn pdo_at_object_position(&self, position: u8) -> Option<source_capabilities::Kind>;
}

impl PdoState for () {
    fn pdo_at_object_position(&self, _position: u8) -> Option<source_capabilities::Kind> {
        None
    }
}

/// Types of data messages.
#[derive(Debug, Clone)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Data {
    /// Source capabilities.
    SourceCapabilities(source_capabilities::SourceCapabilities),
    /// Sink capabilities.
    SinkCapabilities(sink_capabilities::SinkCapabilities),
    /// Request for a power level from the source.
    Request(request::PowerSource),
    /// Used to enter, acknowledge or exit EPR mode.
    EprMode(epr_mode::EprModeDataObject),
    /// Built-in self-test control.
    Bist(bist::BistDataObject),
    /// Source alert notification.
    Alert(alert::AlertDataObject),
    /// Vendor defined message.
    VendorDefined(vendor_defined::VdmPayload),
    /// Revision message data object, sent in response to Get_Revision.
    Revision(u32),
    /// Source_Info message data object, sent in response to Get_Source_Info.
    SourceInfo(u32),
    /// Unknown data type.
    Unknown,
}

impl Data {
    /// Parse a data message's payload into the message.
    pub fn parse_message<P: PdoState>(
        mut message: super::Message,
        message_type: DataMessageType,
        payload: &[u8],
        state: &P,
    ) -> Result<super::Message, super::ParseError> {
        let len = payload.len();
        message.payload = Some(Payload::Data(match message_type {
            DataMessageType::SourceCapabilities => Data::SourceCapabilities(source_capabilities::SourceCapabilities(
                payload
                    .chunks_exact(4)
                    .take(message.header.num_objects())
                    .map(|buf| source_capabilities::parse_raw_pdo(LittleEndian::read_u32(buf)))
                    .collect(),
            )),
            DataMessageType::SinkCapabilities => {
                let raw: Vec<u32, 7> = payload
                    .chunks_exact(4)
                    .take(message.header.num_objects())
                    .map(LittleEndian::read_u32)
                    .collect();
                Data::SinkCapabilities(sink_capabilities::SinkCapabilities::from_raw_pdos(&raw))
            }
            DataMessageType::Request => {
                if len != 4 {
                    Data::Unknown
                } else {
                    let raw = request::RawDataObject(LittleEndian::read_u32(payload));
                    if let Some(t) = state.pdo_at_object_position(raw.object_position()) {
                        Data::Request(match t {
                            source_capabilities::Kind::FixedSupply | source_capabilities::Kind::VariableSupply => {
                                request::PowerSource::FixedVariableSupply(request::FixedVariableSupply(raw.0))
                            }
                            source_capabilities::Kind::Battery => {
                                request::PowerSource::Battery(request::Battery(raw.0))
                            }
                            source_capabilities::Kind::Pps => request::PowerSource::Pps(request::Pps(raw.0)),
                            source_capabilities::Kind::Avs => request::PowerSource::Avs(request::Avs(raw.0)),
                        })
                    } else {
                        Data::Request(request::PowerSource::Unknown(raw))
                    }
                }
            }
            DataMessageType::EprRequest => {
                // An EPR request carries the RDO and a copy of the selected PDO.
                if len != 8 {
                    Data::Unknown
                } else {
                    Data::Request(request::PowerSource::EprRequest(request::EprRequest {
                        rdo: LittleEndian::read_u32(&payload[..4]),
                        pdo: source_capabilities::parse_raw_pdo(LittleEndian::read_u32(&payload[4..8])),
                    }))
                }
            }
            DataMessageType::EprMode => {
                if len != 4 {
                    Data::Unknown
                } else {
                    Data::EprMode(epr_mode::EprModeDataObject(LittleEndian::read_u32(payload)))
                }
            }
            DataMessageType::Bist => {
                if len < 4 {
                    Data::Unknown
                } else {
                    Data::Bist(bist::BistDataObject(LittleEndian::read_u32(payload)))
                }
            }
            DataMessageType::Alert => {
                if len != 4 {
                    Data::Unknown
                } else {
                    Data::Alert(alert::AlertDataObject(LittleEndian::read_u32(payload)))
                }
            }
            DataMessageType::Revision => {
                if len != 4 {
                    Data::Unknown
                } else {
                    Data::Revision(LittleEndian::read_u32(payload))
                }
            }
            DataMessageType::SourceInfo => {
                if len != 4 {
                    Data::Unknown
                } else {
                    Data::SourceInfo(LittleEndian::read_u32(payload))
                }
            }
            DataMessageType::VendorDefined => {
                if len < 4 {
                    Data::Unknown
                } else {
                    let num_obj = message.header.num_objects();
                    trace!("VDM RX: {:?} objects, {:?} bytes", num_obj, len);

                    let header = vendor_defined::VdmHeader::from(LittleEndian::read_u32(&payload[..4]));
                    let data = payload[4..]
                        .chunks_exact(4)
                        .take(7)
                        .map(LittleEndian::read_u32)
                        .collect::<Vec<u32, 7>>();

                    Data::VendorDefined((header, data))
                }
            }
            _ => {
                warn!("Unhandled data message type {:?}", message_type);
                Data::Unknown
            }
        }));

        Ok(message)
    }

    /// Serialize message data to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, payload: &mut [u8]) -> usize {
        match self {
            Self::Unknown => 0,
            Self::SourceCapabilities(capabilities) => capabilities.to_bytes(payload),
            Self::SinkCapabilities(capabilities) => capabilities.to_bytes(payload),
            Self::Request(request) => request.to_bytes(payload),
            Self::EprMode(data_object) => data_object.to_bytes(payload),
            Self::Bist(data_object) => data_object.to_bytes(payload),
            Self::Alert(data_object) => data_object.to_bytes(payload),
            Self::VendorDefined((header, data)) => {
                header.to_bytes(payload);
                let mut offset = 4;
                for word in data {
                    LittleEndian::write_u32(&mut payload[offset..offset + 4], *word);
                    offset += 4;
                }
                offset
            }
            Self::Revision(word) | Self::SourceInfo(word) => {
                LittleEndian::write_u32(payload, *word);
                4
            }
        }
    }

    /// The number of 32-bit data objects this payload occupies.
    pub fn num_objects(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::SourceCapabilities(capabilities) => capabilities.num_objects(),
            Self::SinkCapabilities(capabilities) => capabilities.num_objects(),
            Self::Request(request) => request.num_objects(),
            Self::EprMode(_) | Self::Bist(_) | Self::Alert(_) | Self::Revision(_) | Self::SourceInfo(_) => 1,
            Self::VendorDefined((_, data)) => 1 + data.len() as u8,
        }
    }
}
