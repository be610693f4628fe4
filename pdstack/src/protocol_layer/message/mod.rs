//! Definitions of message content.

pub mod data;
pub mod extended;
pub mod header;

use data::{Data, PdoState};
use extended::{Extended, ExtendedHeader};
use header::{DataMessageType, Header, MessageType};
use pdstack_traits::Sop;

/// Size of the message header in bytes.
pub(crate) const MSG_HEADER_SIZE: usize = 2;

/// Size of the extended message header in bytes.
pub(crate) const EXT_HEADER_SIZE: usize = 2;

/// A USB PD message.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    /// The SOP class the message was received on, or is destined for.
    pub sop: Sop,
    /// The message header.
    pub header: Header,
    /// Optional payload (data or extended messages).
    pub payload: Option<Payload>,
}

/// Message payloads beyond the header.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Payload {
    /// Payload of a data message.
    Data(Data),
    /// Payload of an extended message.
    Extended(Extended),
}

impl Message {
    /// Create a new message from a message header.
    pub fn new(header: Header) -> Self {
        Self {
            sop: Sop::Sop,
            header,
            payload: None,
        }
    }

    /// Create a new message from a message header and payload data.
    pub fn new_with_data(header: Header, data: Data) -> Self {
        Self {
            sop: Sop::Sop,
            header,
            payload: Some(Payload::Data(data)),
        }
    }

    /// Create a new extended message from a header and extended payload.
    pub fn new_with_extended(header: Header, extended: Extended) -> Self {
        Self {
            sop: Sop::Sop,
            header,
            payload: Some(Payload::Extended(extended)),
        }
    }

    /// Tag the message with an SOP class.
    pub fn with_sop(mut self, sop: Sop) -> Self {
        self.sop = sop;
        self
    }

    /// Serialize a message to a slice, returning the number of written bytes.
    ///
    /// Extended payloads are serialized in their single-chunk form; payloads
    /// longer than one chunk go through the protocol layer's chunk sender.
    pub fn to_bytes(&self, buffer: &mut [u8]) -> usize {
        let mut size = self.header.to_bytes(buffer);

        match self.payload.as_ref() {
            None => {}
            Some(Payload::Data(data)) => {
                size += data.to_bytes(&mut buffer[size..]);
            }
            Some(Payload::Extended(extended)) => {
                let data_size = extended.data_size();
                debug_assert!(data_size as usize <= extended::chunked::MAX_EXTENDED_MSG_CHUNK_LEN);

                let ext_header = ExtendedHeader::new(data_size).with_chunked(true);
                size += ext_header.to_bytes(&mut buffer[size..]);
                size += extended.to_bytes(&mut buffer[size..]);

                // Pad to the 4-byte data object boundary; the buffer is zeroed.
                while (size - MSG_HEADER_SIZE) % 4 != 0 {
                    size += 1;
                }
            }
        }

        size
    }

    /// Parse a message from a slice of bytes, with a PDO state.
    ///
    /// The PDO state resolves request object positions against the last
    /// advertised capabilities; pass `&()` when no capabilities are known.
    pub fn from_bytes_with_state<P: PdoState>(bytes: &[u8], state: &P) -> Result<Self, ParseError> {
        let header = Header::from_bytes(&bytes[..MSG_HEADER_SIZE.min(bytes.len())])?;
        let message = Self::new(header);
        let payload = &bytes[MSG_HEADER_SIZE..];

        match message.header.message_type() {
            MessageType::Control(_) => Ok(message),
            MessageType::Data(data_message_type) => {
                Data::parse_message(message, data_message_type, payload, state)
            }
            MessageType::Extended(extended_message_type) => {
                if payload.len() < EXT_HEADER_SIZE {
                    return Err(ParseError::InvalidLength {
                        expected: EXT_HEADER_SIZE,
                        found: payload.len(),
                    });
                }

                let ext_header = ExtendedHeader::from_bytes(&payload[..EXT_HEADER_SIZE]);
                if ext_header.chunked() && (ext_header.request_chunk() || ext_header.chunk_number() != 0) {
                    // Continuation frames cannot be parsed standalone.
                    return Err(ParseError::ChunkedExtendedMessage);
                }

                let data = &payload[EXT_HEADER_SIZE..];
                let data_size = (ext_header.data_size() as usize).min(data.len());

                let mut message = message;
                message.payload = Some(Payload::Extended(Extended::parse(
                    extended_message_type,
                    &data[..data_size],
                )));
                Ok(message)
            }
        }
    }

    /// Parse a message from a slice of bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Self::from_bytes_with_state(bytes, &())
    }

    /// Split a raw extended frame into its header, extended header and chunk
    /// payload, without assembling anything.
    pub fn parse_extended_chunk(bytes: &[u8]) -> Result<(Header, ExtendedHeader, &[u8]), ParseError> {
        if bytes.len() < MSG_HEADER_SIZE + EXT_HEADER_SIZE {
            return Err(ParseError::InvalidLength {
                expected: MSG_HEADER_SIZE + EXT_HEADER_SIZE,
                found: bytes.len(),
            });
        }

        let header = Header::from_bytes(&bytes[..MSG_HEADER_SIZE])?;
        let ext_header = ExtendedHeader::from_bytes(&bytes[MSG_HEADER_SIZE..MSG_HEADER_SIZE + EXT_HEADER_SIZE]);
        Ok((header, ext_header, &bytes[MSG_HEADER_SIZE + EXT_HEADER_SIZE..]))
    }

    /// Whether this message is a data message of the given type.
    pub fn is_data(&self, message_type: DataMessageType) -> bool {
        self.header.message_type() == MessageType::Data(message_type)
    }
}

/// Errors that can occur during message/header parsing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer has an invalid length.
    #[error("invalid input buffer length (expected {expected:?}, found {found:?})")]
    InvalidLength {
        /// The expected length.
        expected: usize,
        /// The actual length found.
        found: usize,
    },
    /// The specification revision field is not supported.
    #[error("unsupported specification revision `{0}`")]
    UnsupportedSpecificationRevision(u8),
    /// An unknown or reserved message type was encountered.
    #[error("unknown or reserved message type `{0}`")]
    InvalidMessageType(u8),
    /// An unknown or reserved data message type was encountered.
    #[error("unknown or reserved data message type `{0}`")]
    InvalidDataMessageType(u8),
    /// An unknown or reserved control message type was encountered.
    #[error("unknown or reserved control message type `{0}`")]
    InvalidControlMessageType(u8),
    /// A chunked continuation frame that cannot be parsed standalone.
    #[error("chunked extended message continuation")]
    ChunkedExtendedMessage,
    /// A new chunked message started while assembly was in progress.
    #[error("chunk assembler already in use")]
    ParserReuse,
    /// A chunk exceeded the maximum chunk size.
    #[error("chunk of `{0}` bytes exceeds the maximum of `{1}`")]
    ChunkOverflow(usize, usize),
    /// Other parsing error with a message.
    #[error("other parse error: {0}")]
    Other(&'static str),
}

#[cfg(test)]
mod tests {
    use uom::si::electric_current::milliampere;
    use uom::si::electric_potential::millivolt;

    use super::data::Data;
    use super::data::source_capabilities::SourceCapabilities;
    use super::*;
    use crate::dummy::{DUMMY_CAPABILITIES, get_dummy_source_capabilities};
    use crate::units;

    #[test]
    fn test_units() {
        use crate::_20millivolts_mod::_20millivolts;

        let current = units::ElectricCurrent::new::<milliampere>(123);
        let potential = units::ElectricPotential::new::<millivolt>(4560);

        assert_eq!(current.get::<milliampere>(), 123);
        assert_eq!(potential.get::<millivolt>(), 4560);
        assert_eq!(potential.get::<_20millivolts>(), 228);
    }

    #[test]
    fn parse_source_capabilities_frame() {
        let message = Message::from_bytes(&DUMMY_CAPABILITIES).unwrap();

        let Some(Payload::Data(Data::SourceCapabilities(SourceCapabilities(caps)))) = message.payload else {
            panic!("expected source capabilities");
        };

        for (cap, dummy_cap) in caps.iter().zip(get_dummy_source_capabilities()) {
            assert_eq!(*cap, dummy_cap);
        }
    }

    #[test]
    fn request_message_round_trip() {
        use super::data::request;
        use crate::counters::{Counter, CounterType};
        use crate::protocol_layer::message::header::SpecificationRevision;
        use crate::{DataRole, PowerRole};

        let caps = Message::from_bytes(&DUMMY_CAPABILITIES).unwrap();
        let Some(Payload::Data(Data::SourceCapabilities(caps))) = caps.payload else {
            panic!("expected source capabilities");
        };

        let request =
            request::PowerSource::new_fixed(request::CurrentRequest::Highest, request::VoltageRequest::Safe5V, &caps)
                .unwrap();

        let template = Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X);
        let header = Header::new_data(
            template,
            Counter::new_from_value(CounterType::MessageId, 2),
            DataMessageType::Request,
            request.num_objects(),
        );
        let message = Message::new_with_data(header, Data::Request(request));

        let mut buffer = [0u8; 64];
        let size = message.to_bytes(&mut buffer);
        assert_eq!(size, 6);

        // Decoding the byte stream yields a structurally equal message.
        let parsed = Message::from_bytes_with_state(&buffer[..size], &caps).unwrap();
        assert_eq!(parsed.header, message.header);
        let Some(Payload::Data(Data::Request(request::PowerSource::FixedVariableSupply(rdo)))) = parsed.payload else {
            panic!("expected fixed supply request");
        };
        assert_eq!(rdo.object_position(), 1);
        assert_eq!(rdo.raw_operating_current(), 300);
    }

    #[test]
    fn extended_control_round_trip() {
        use super::extended::extended_control::{ExtendedControl, ExtendedControlMessageType};
        use super::header::ExtendedMessageType;
        use crate::counters::{Counter, CounterType};
        use crate::protocol_layer::message::header::SpecificationRevision;
        use crate::{DataRole, PowerRole};

        let template = Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X);
        let header = Header::new_extended(
            template,
            Counter::new(CounterType::MessageId),
            ExtendedMessageType::ExtendedControl,
            1,
        );
        let message = Message::new_with_extended(
            header,
            Extended::ExtendedControl(
                ExtendedControl::default().with_message_type(ExtendedControlMessageType::EprKeepAlive),
            ),
        );

        let mut buffer = [0u8; 16];
        let size = message.to_bytes(&mut buffer);
        // Header, extended header, two payload bytes, padded to a data object.
        assert_eq!(size, 8);

        let parsed = Message::from_bytes(&buffer[..size]).unwrap();
        let Some(Payload::Extended(Extended::ExtendedControl(control))) = parsed.payload else {
            panic!("expected extended control payload");
        };
        assert_eq!(control.message_type(), ExtendedControlMessageType::EprKeepAlive);
    }

    #[test]
    fn continuation_chunks_are_not_parsed_standalone() {
        use super::header::ExtendedMessageType;
        use crate::counters::{Counter, CounterType};
        use crate::protocol_layer::message::header::SpecificationRevision;
        use crate::{DataRole, PowerRole};

        let template = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);
        let header = Header::new_extended(
            template,
            Counter::new(CounterType::MessageId),
            ExtendedMessageType::EprSourceCapabilities,
            7,
        );

        let mut buffer = [0u8; 32];
        let mut size = header.to_bytes(&mut buffer);
        size += ExtendedHeader::new(52)
            .with_chunked(true)
            .with_chunk_number(1)
            .to_bytes(&mut buffer[size..]);

        assert!(matches!(
            Message::from_bytes(&buffer[..size + 4]),
            Err(ParseError::ChunkedExtendedMessage)
        ));
    }
}
