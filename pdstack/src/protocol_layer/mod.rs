//! The protocol layer is controlled by the policy engine, and commands the PHY layer.
//!
//! Handles
//! - construction of messages,
//! - per-SOP message ID counters and retransmission filtering,
//! - the GoodCRC/retry discipline,
//! - chunked extended message assembly and transmission,
//! - reset operation,
//! - revision gating between PD 2.0 and 3.x.

pub mod message;

use core::future::Future;
use core::marker::PhantomData;

use embassy_futures::select::{Either, select};
use message::data::request;
use message::data::sink_capabilities::SinkCapabilities;
use message::data::source_capabilities::SourceCapabilities;
use message::data::{Data, epr_mode};
use message::extended::chunked::{
    ChunkResult, ChunkedMessageAssembler, ChunkedMessageSender, MAX_EXTENDED_MSG_CHUNK_LEN,
};
use message::extended::extended_control::{ExtendedControl, ExtendedControlMessageType};
use message::extended::manufacturer_info::ManufacturerInfo;
use message::extended::{Extended, ExtendedHeader};
use message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use message::{EXT_HEADER_SIZE, MSG_HEADER_SIZE, Message, ParseError, Payload};
use pdstack_traits::{Driver, DriverRxError, DriverTxError, Sop};

use crate::counters::{Counter, CounterType, Error as CounterError};
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PowerRole};

/// Maximum message size including headers and payload.
const MAX_MESSAGE_SIZE: usize = 272;

/// Errors that can occur in the protocol layer.
#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An error occured during data reception.
    #[error("RX error")]
    RxError(#[from] RxError),
    /// An error occured during data transmission.
    #[error("TX error")]
    TxError(#[from] TxError),
    /// Transmission failed after the maximum number of allowed retries.
    #[error("transmit retries (`{0}`) exceeded")]
    TransmitRetriesExceeded(u8),
    /// A chunked transmission was aborted by the receiver.
    #[error("chunk sequence error")]
    ChunkSequenceError,
    /// An unexpected message was received.
    #[error("unexpected message")]
    UnexpectedMessage,
}

/// Errors that can occur during reception of data.
#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxError {
    /// Port partner requested soft reset on the given SOP class.
    #[error("soft reset")]
    SoftReset(Sop),
    /// Driver reported a hard reset.
    #[error("hard reset")]
    HardReset,
    /// A timeout during message reception.
    #[error("receive timeout")]
    ReceiveTimeout,
    /// An unsupported message was received.
    #[error("unsupported message")]
    UnsupportedMessage,
    /// A message parsing error occured.
    #[error("parse error")]
    ParseError(#[from] ParseError),
    /// The received acknowledgement does not match the last transmitted message's ID.
    #[error("wrong tx id `{0}` acknowledged")]
    AcknowledgeMismatch(u8),
}

/// Errors that can occur during transmission of data.
#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxError {
    /// Driver reported a hard reset.
    #[error("hard reset")]
    HardReset,
    /// Unchunked extended messages are not supported by this stack.
    #[error("unchunked extended messages not supported")]
    UnchunkedExtendedMessagesNotSupported,
    /// AVS voltage LSB 2 bits must be zero per USB PD 3.2 Table 6.26.
    #[error("AVS voltage alignment invalid")]
    AvsVoltageAlignmentInvalid,
}

/// Message-ID state for one SOP class.
#[derive(Debug)]
struct SopCounters {
    tx_message: Counter,
    /// `None` until the first message after a reset was received.
    rx_message: Option<Counter>,
}

impl Default for SopCounters {
    fn default() -> Self {
        Self {
            tx_message: Counter::new(CounterType::MessageId),
            rx_message: None,
        }
    }
}

/// The USB PD protocol layer.
#[derive(Debug)]
pub(crate) struct ProtocolLayer<DRIVER: Driver, TIMER: Timer> {
    driver: DRIVER,
    /// Per-SOP message-ID state, indexed by [`Sop::index`].
    counters: [SopCounters; 3],
    retry: Counter,
    default_header: Header,
    assembler: ChunkedMessageAssembler,
    _timer: PhantomData<TIMER>,
}

impl<DRIVER: Driver, TIMER: Timer> ProtocolLayer<DRIVER, TIMER> {
    /// Create a new protocol layer from a driver and default header.
    pub fn new(driver: DRIVER, default_header: Header) -> Self {
        Self {
            driver,
            counters: Default::default(),
            retry: Counter::new(CounterType::Retry),
            default_header,
            assembler: ChunkedMessageAssembler::new(),
            _timer: PhantomData,
        }
    }

    /// Reset the protocol layer for all SOP classes, e.g. on hard reset.
    pub fn reset(&mut self) {
        self.counters = Default::default();
        self.retry.reset();
        self.assembler.reset();
    }

    /// Reset the message-ID state of a single SOP class, e.g. on soft reset.
    pub fn reset_sop(&mut self, sop: Sop) {
        self.counters[sop.index()] = Default::default();
    }

    /// The spec revision currently in use.
    pub fn revision(&self) -> SpecificationRevision {
        // The template always carries a valid revision.
        self.default_header.spec_revision().unwrap_or(SpecificationRevision::R3_X)
    }

    /// The sender-response timer for the revision currently in use.
    pub fn sender_response_timer(&self) -> TimerType {
        TimerType::sender_response(self.revision())
    }

    /// Update the header template after a role swap.
    pub fn update_roles(&mut self, power_role: PowerRole, data_role: DataRole) {
        self.default_header = self
            .default_header
            .with_port_power_role(power_role)
            .with_port_data_role(data_role);
    }

    /// Allows tests to access the driver directly.
    #[cfg(test)]
    pub fn driver(&mut self) -> &mut DRIVER {
        &mut self.driver
    }

    /// Allows tests to access the default header directly.
    #[cfg(test)]
    pub fn header(&self) -> &Header {
        &self.default_header
    }

    fn get_message_buffer() -> [u8; MAX_MESSAGE_SIZE] {
        [0u8; MAX_MESSAGE_SIZE]
    }

    /// Get a timer future for a given type.
    pub fn get_timer(timer_type: TimerType) -> impl Future<Output = ()> {
        TimerType::get_timer::<TIMER>(timer_type)
    }

    /// The header template for messages towards the given SOP target.
    ///
    /// On SOP'/SOP'' frames, the power-role bit is the cable-plug indicator
    /// and the data-role bit is reserved; both are zero for port-originated
    /// messages.
    fn header_template(&self, sop: Sop) -> Header {
        match sop {
            Sop::Sop => self.default_header,
            Sop::SopPrime | Sop::SopDoublePrime => self
                .default_header
                .with_port_power_role(PowerRole::Sink)
                .with_port_data_role(DataRole::Ufp),
        }
    }

    fn tx_counter(&self, sop: Sop) -> Counter {
        self.counters[sop.index()].tx_message
    }

    /// Receive a simple (non-chunked) message from the driver.
    ///
    /// Used by `wait_for_good_crc` to avoid recursion with chunked message
    /// handling.
    async fn receive_simple(&mut self) -> Result<Message, RxError> {
        loop {
            let mut buffer = Self::get_message_buffer();

            let (sop, length) = match self.driver.receive(&mut buffer).await {
                Ok(received) => received,
                Err(DriverRxError::Discarded) => continue,
                Err(DriverRxError::HardReset) => return Err(RxError::HardReset),
            };

            let message = Message::from_bytes(&buffer[..length])?.with_sop(sop);
            return Ok(message);
        }
    }

    /// Wait until a GoodCrc message is received on the given SOP class, or a
    /// timeout occurs.
    async fn wait_for_good_crc(&mut self, sop: Sop) -> Result<(), RxError> {
        trace!("Wait for GoodCrc");

        let expected_id = self.counters[sop.index()].tx_message.value();

        let timeout_fut = Self::get_timer(TimerType::CRCReceive);
        let receive_fut = async {
            let message = self.receive_simple().await?;

            if matches!(
                message.header.message_type(),
                MessageType::Control(ControlMessageType::GoodCRC)
            ) {
                trace!(
                    "Received GoodCrc, TX message count: {}, expected: {}",
                    message.header.message_id(),
                    expected_id
                );
                if message.sop == sop && message.header.message_id() == expected_id {
                    // See spec, [6.7.1.1]
                    self.retry.reset();
                    _ = self.counters[sop.index()].tx_message.increment();
                    Ok(())
                } else {
                    Err(RxError::AcknowledgeMismatch(message.header.message_id()))
                }
            } else if matches!(message.header.message_type(), MessageType::Control(_)) {
                Err(ParseError::InvalidControlMessageType(message.header.message_type_raw()).into())
            } else {
                Err(ParseError::InvalidMessageType(message.header.message_type_raw()).into())
            }
        };

        match select(timeout_fut, receive_fut).await {
            Either::First(_) => Err(RxError::ReceiveTimeout),
            Either::Second(receive_result) => receive_result,
        }
    }

    /// Validate an outgoing message for spec compliance.
    ///
    /// This catches common mistakes when constructing requests:
    /// - unchunked extended message support must not be announced,
    /// - AVS voltage LSB 2 bits must be zero (USB PD 3.2, [Table 6.26]).
    ///
    /// Only outgoing messages are validated, never received data.
    fn validate_outgoing_message(message: &Message) -> Result<(), TxError> {
        if let Some(Payload::Data(Data::Request(power_source))) = &message.payload {
            use message::data::request::PowerSource;
            match power_source {
                PowerSource::FixedVariableSupply(rdo) => {
                    if rdo.unchunked_extended_messages_supported() {
                        return Err(TxError::UnchunkedExtendedMessagesNotSupported);
                    }
                }
                PowerSource::Pps(rdo) => {
                    if rdo.unchunked_extended_messages_supported() {
                        return Err(TxError::UnchunkedExtendedMessagesNotSupported);
                    }
                }
                PowerSource::Avs(rdo) => {
                    if rdo.raw_output_voltage() & 0x3 != 0 {
                        return Err(TxError::AvsVoltageAlignmentInvalid);
                    }
                }
                PowerSource::EprRequest(epr) => {
                    let rdo_bits = epr.rdo;
                    if (rdo_bits >> 23) & 1 == 1 {
                        return Err(TxError::UnchunkedExtendedMessagesNotSupported);
                    }

                    // AVS requests keep the two voltage LSBs zero.
                    let is_avs = matches!(
                        epr.pdo,
                        message::data::source_capabilities::PowerDataObject::Augmented(
                            message::data::source_capabilities::Augmented::Epr(_)
                        )
                    );
                    if is_avs {
                        let voltage = (rdo_bits >> 9) & 0xFFF;
                        if (voltage as u16) & 0x3 != 0 {
                            return Err(TxError::AvsVoltageAlignmentInvalid);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn transmit_inner(&mut self, sop: Sop, buffer: &[u8]) -> Result<(), TxError> {
        loop {
            match self.driver.transmit(sop, buffer).await {
                Ok(_) => return Ok(()),
                Err(DriverTxError::HardReset) => return Err(TxError::HardReset),
                Err(DriverTxError::Discarded) => {
                    // Retry transmission.
                }
            }
        }
    }

    /// Transmit a raw frame and run the GoodCRC/retry discipline for it.
    async fn transmit_with_retry(&mut self, sop: Sop, buffer: &[u8]) -> Result<(), ProtocolError> {
        if DRIVER::HAS_AUTO_RETRY {
            // Hardware handles retries and verifies GoodCRC reception.
            // `Discarded` here means all hardware retries were exhausted, so
            // there is no point retrying in software.
            match self.driver.transmit(sop, buffer).await {
                Ok(()) => {
                    self.retry.reset();
                    _ = self.counters[sop.index()].tx_message.increment();
                    trace!("Transmit success (hardware retry)");
                    Ok(())
                }
                Err(DriverTxError::HardReset) => Err(TxError::HardReset.into()),
                Err(DriverTxError::Discarded) => Err(ProtocolError::TransmitRetriesExceeded(self.retry.max_value())),
            }
        } else {
            self.retry.reset();

            loop {
                match self.transmit_inner(sop, buffer).await {
                    Ok(_) => match self.wait_for_good_crc(sop).await {
                        Ok(()) => {
                            trace!("Transmit success");
                            return Ok(());
                        }
                        Err(RxError::ReceiveTimeout) => match self.retry.increment() {
                            Ok(_) => {
                                // Retry transmission, until the retry counter is exceeded.
                            }
                            Err(CounterError::Exceeded) => {
                                return Err(ProtocolError::TransmitRetriesExceeded(self.retry.max_value()));
                            }
                        },
                        Err(other) => return Err(other.into()),
                    },
                    Err(other) => return Err(other.into()),
                }
            }
        }
    }

    /// Transmit a message.
    ///
    // GoodCrc message transmission is handled separately.
    // See `transmit_good_crc()` instead.
    pub async fn transmit(&mut self, message: Message) -> Result<(), ProtocolError> {
        debug_assert!(
            message.header.message_type() != MessageType::Control(ControlMessageType::GoodCRC)
        );

        Self::validate_outgoing_message(&message)?;

        trace!("Transmit message: {:?}", message);

        let mut buffer = Self::get_message_buffer();
        let size = message.to_bytes(&mut buffer);

        self.transmit_with_retry(message.sop, &buffer[..size]).await
    }

    /// Send a GoodCrc message to the port partner.
    async fn transmit_good_crc(&mut self, sop: Sop) -> Result<(), ProtocolError> {
        // A message must have been received on this SOP class before.
        let rx_counter = self.counters[sop.index()].rx_message.unwrap();

        trace!("Transmit message GoodCrc for RX message count: {}", rx_counter.value());

        let mut buffer = Self::get_message_buffer();

        let size = Message::new(Header::new_control(
            self.header_template(sop),
            rx_counter,
            ControlMessageType::GoodCRC,
        ))
        .to_bytes(&mut buffer);

        Ok(self.transmit_inner(sop, &buffer[..size]).await?)
    }

    /// Handle acknowledgement and retransmission detection for a received message.
    ///
    /// Returns `Ok(true)` if this was a retransmission (caller should continue to next message),
    /// `Ok(false)` if this is a new message to process, or `Err` on failure.
    async fn handle_rx_ack(&mut self, message: &Message) -> Result<bool, RxError> {
        let is_good_crc = matches!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::GoodCRC)
        );

        let is_retransmission = if is_good_crc {
            false
        } else {
            self.update_rx_message_counter(message)
        };

        if !DRIVER::HAS_AUTO_GOOD_CRC && !is_good_crc {
            match self.transmit_good_crc(message.sop).await {
                Ok(()) => {}
                Err(ProtocolError::TxError(TxError::HardReset)) => return Err(RxError::HardReset),
                Err(_) => return Err(RxError::UnsupportedMessage),
            }
        }

        Ok(is_retransmission)
    }

    /// Receive a message, assembling chunked extended messages as needed.
    async fn receive_message_inner(&mut self) -> Result<Message, RxError> {
        loop {
            let mut buffer = Self::get_message_buffer();

            let (sop, length) = match self.driver.receive(&mut buffer).await {
                Ok(received) => received,
                Err(DriverRxError::Discarded) => continue,
                Err(DriverRxError::HardReset) => return Err(RxError::HardReset),
            };

            // Parse the header early to handle chunking.
            let header = Header::from_bytes(&buffer[..MSG_HEADER_SIZE])?;
            let message_type = header.message_type();

            // Update the specification revision, based on the received frame.
            self.default_header = self.default_header.with_spec_revision(header.spec_revision()?);

            if matches!(message_type, MessageType::Extended(_)) {
                let ext_header_end = MSG_HEADER_SIZE + EXT_HEADER_SIZE;
                let ext_header = ExtendedHeader::from_bytes(&buffer[MSG_HEADER_SIZE..ext_header_end]);

                if ext_header.chunked() {
                    let msg_type = match message_type {
                        MessageType::Extended(mt) => mt,
                        _ => unreachable!(),
                    };

                    // The final chunk is padded to a data object boundary;
                    // never feed more than a chunk's worth to the assembler.
                    let payload_end = length.min(ext_header_end + MAX_EXTENDED_MSG_CHUNK_LEN);
                    let payload = &buffer[ext_header_end..payload_end];

                    trace!(
                        "Received chunked extended message {:?}, chunk {}, size {}",
                        message_type,
                        ext_header.chunk_number(),
                        payload.len()
                    );

                    // Update RX counters and acknowledge before assembly.
                    let tmp_message = Message::new(header).with_sop(sop);
                    if self.handle_rx_ack(&tmp_message).await? {
                        continue; // Retransmission
                    }

                    match self.assembler.process_chunk(header, ext_header, payload) {
                        Ok(ChunkResult::Complete(data)) => {
                            let parsed = Extended::parse(msg_type, &data);
                            let mut message = Message::new(header).with_sop(sop);
                            message.payload = Some(Payload::Extended(parsed));

                            trace!("Received assembled extended message {:?}", message);
                            return Ok(message);
                        }
                        Ok(ChunkResult::NeedMoreChunks(next_chunk)) => {
                            // Request the next chunk per spec 6.12.2.1.2.4.
                            self.transmit_chunk_request(sop, msg_type, next_chunk).await?;
                            continue;
                        }
                        Ok(ChunkResult::ChunkRequested(_)) => {
                            // A chunk request outside of a transmission of ours.
                            return Err(RxError::UnsupportedMessage);
                        }
                        Err(_) => {
                            self.assembler.reset();
                            return Err(RxError::UnsupportedMessage);
                        }
                    }
                }
            }

            // Non-extended or unchunked extended messages.
            let message = Message::from_bytes(&buffer[..length])?.with_sop(sop);

            match message.header.message_type() {
                MessageType::Control(ControlMessageType::Reserved) | MessageType::Data(DataMessageType::Reserved) => {
                    trace!("Unsupported message type in header: {:?}", message.header);
                    return Err(RxError::UnsupportedMessage);
                }
                MessageType::Control(ControlMessageType::SoftReset) => {
                    // Acknowledge, then let the policy engine run its reset path.
                    _ = self.handle_rx_ack(&message).await?;
                    return Err(RxError::SoftReset(message.sop));
                }
                _ => (),
            }

            // Handle GoodCRC and retransmissions.
            if self.handle_rx_ack(&message).await? {
                continue; // Retransmission
            }

            // Revision gating: PD 3.x messages are not acceptable under 2.0.
            if self.revision() == SpecificationRevision::R2_0
                && !message.header.message_type().exists_in_r2_0()
                && !matches!(
                    message.header.message_type(),
                    MessageType::Control(ControlMessageType::GoodCRC)
                )
            {
                trace!("Rejecting PD 3.x message under revision 2.0: {:?}", message.header);
                return Err(RxError::UnsupportedMessage);
            }

            trace!("Received message {:?}", message);
            return Ok(message);
        }
    }

    /// Receive a message.
    pub async fn receive_message(&mut self) -> Result<Message, ProtocolError> {
        self.receive_message_inner().await.map_err(|err| err.into())
    }

    /// Updates the received message counter for the message's SOP class.
    ///
    /// If receiving the first message after protocol layer reset, copy its ID.
    /// Otherwise, compare the received ID with the stored ID. If they are equal, this is a retransmission.
    ///
    /// Returns `true`, if this was a retransmission.
    fn update_rx_message_counter(&mut self, rx_message: &Message) -> bool {
        let counters = &mut self.counters[rx_message.sop.index()];

        match counters.rx_message.as_mut() {
            None => {
                trace!(
                    "Received first message after protocol layer reset with RX counter value: {}",
                    rx_message.header.message_id()
                );
                counters.rx_message = Some(Counter::new_from_value(
                    CounterType::MessageId,
                    rx_message.header.message_id(),
                ));
                false
            }
            Some(counter) => {
                if rx_message.header.message_id() == counter.value() {
                    trace!("Received retransmission of RX counter value: {}", counter.value());
                    true
                } else {
                    counter.set(rx_message.header.message_id());
                    false
                }
            }
        }
    }

    /// Wait until a message of one of the chosen types is received, or a timeout occurs.
    pub async fn receive_message_type(
        &mut self,
        message_types: &[MessageType],
        timer_type: TimerType,
    ) -> Result<Message, ProtocolError> {
        // GoodCrc message reception is handled separately.
        // See `wait_for_good_crc()` instead.
        for message_type in message_types {
            debug_assert!(*message_type != MessageType::Control(ControlMessageType::GoodCRC));
        }

        let timeout_fut = Self::get_timer(timer_type);
        let receive_fut = async {
            loop {
                match self.receive_message_inner().await {
                    Ok(message) => {
                        if matches!(
                            message.header.message_type(),
                            MessageType::Control(ControlMessageType::GoodCRC)
                        ) {
                            continue;
                        }
                        return if message_types.contains(&message.header.message_type()) {
                            Ok(message)
                        } else {
                            Err(ProtocolError::UnexpectedMessage)
                        };
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        };

        match select(timeout_fut, receive_fut).await {
            Either::First(_) => Err(RxError::ReceiveTimeout.into()),
            Either::Second(receive_result) => receive_result,
        }
    }

    /// Perform a hard-reset procedure.
    ///
    // See spec, [6.7.1.1]
    pub async fn hard_reset(&mut self) -> Result<(), ProtocolError> {
        self.reset();

        loop {
            match self.driver.transmit_hard_reset().await {
                Ok(_) | Err(DriverTxError::HardReset) => break,
                Err(DriverTxError::Discarded) => (),
            }
        }

        trace!("Performed hard reset");
        Ok(())
    }

    /// Signal a fast role swap on the CC wire.
    pub async fn fast_role_swap_signal(&mut self) -> Result<(), ProtocolError> {
        match self.driver.transmit_fast_role_swap().await {
            Ok(()) => Ok(()),
            Err(DriverTxError::HardReset) => Err(TxError::HardReset.into()),
            Err(DriverTxError::Discarded) => Err(ProtocolError::TransmitRetriesExceeded(0)),
        }
    }

    /// Wait for VBUS to be available.
    pub async fn wait_for_vbus(&mut self) {
        self.driver.wait_for_vbus().await
    }

    /// Wait for VBUS to reach vSafe0V.
    pub async fn wait_for_vbus_off(&mut self) {
        self.driver.wait_for_vbus_off().await
    }

    /// The data role currently carried in the header template.
    pub fn data_role(&self) -> DataRole {
        self.default_header.port_data_role()
    }

    /// The power role currently carried in the header template.
    pub fn power_role(&self) -> PowerRole {
        self.default_header.port_power_role()
    }

    /// Wait for the source to provide its capabilities.
    pub async fn wait_for_source_capabilities(&mut self) -> Result<Message, ProtocolError> {
        self.receive_message_type(
            &[
                MessageType::Data(DataMessageType::SourceCapabilities),
                MessageType::Extended(ExtendedMessageType::EprSourceCapabilities),
            ],
            TimerType::SinkWaitCap,
        )
        .await
    }

    /// Transmit a control message of the provided type.
    pub async fn transmit_control_message(&mut self, message_type: ControlMessageType) -> Result<(), ProtocolError> {
        self.transmit_control_message_sop(Sop::Sop, message_type).await
    }

    /// Transmit a control message towards the given SOP target.
    pub async fn transmit_control_message_sop(
        &mut self,
        sop: Sop,
        message_type: ControlMessageType,
    ) -> Result<(), ProtocolError> {
        let message = Message::new(Header::new_control(
            self.header_template(sop),
            self.tx_counter(sop),
            message_type,
        ))
        .with_sop(sop);

        self.transmit(message).await
    }

    /// Transmit a data message of the provided type.
    pub async fn transmit_data_message(
        &mut self,
        message_type: DataMessageType,
        data: Data,
    ) -> Result<(), ProtocolError> {
        let header = Header::new_data(
            self.default_header,
            self.tx_counter(Sop::Sop),
            message_type,
            data.num_objects(),
        );

        self.transmit(Message::new_with_data(header, data)).await
    }

    /// Transmit an extended control message of the provided type.
    pub async fn transmit_extended_control_message(
        &mut self,
        message_type: ExtendedControlMessageType,
    ) -> Result<(), ProtocolError> {
        // Per USB PD spec 6.2.1.1.2, num_objects is non-zero for extended
        // messages: 2-byte extended header + 2 bytes of data = 1 data object.
        let mut message = Message::new(Header::new_extended(
            self.default_header,
            self.tx_counter(Sop::Sop),
            ExtendedMessageType::ExtendedControl,
            1,
        ));

        message.payload = Some(Payload::Extended(Extended::ExtendedControl(
            ExtendedControl::default().with_message_type(message_type),
        )));

        self.transmit(message).await
    }

    /// Transmit an EPR mode data message.
    pub async fn transmit_epr_mode(&mut self, action: epr_mode::Action, data: u8) -> Result<(), ProtocolError> {
        let mdo = epr_mode::EprModeDataObject::default().with_action(action).with_data(data);

        self.transmit_data_message(DataMessageType::EprMode, Data::EprMode(mdo)).await
    }

    /// Request a certain power level from the source.
    pub async fn request_power(&mut self, power_source_request: request::PowerSource) -> Result<(), ProtocolError> {
        // Only sinks can request from a supply.
        debug_assert!(matches!(self.default_header.port_power_role(), PowerRole::Sink));

        let message_type = power_source_request.message_type();
        self.transmit_data_message(message_type, Data::Request(power_source_request))
            .await
    }

    /// Transmit a chunk request message per USB PD spec 6.12.2.1.2.4.
    ///
    /// A chunk request is an extended message with:
    /// - The same message type as the chunked message being received
    /// - Extended header with: chunked=1, request_chunk=1, chunk_number=requested_chunk, data_size=0
    async fn transmit_chunk_request(
        &mut self,
        sop: Sop,
        message_type: ExtendedMessageType,
        chunk_number: u8,
    ) -> Result<(), RxError> {
        trace!("Transmit chunk request for {:?} chunk {}", message_type, chunk_number);

        let ext_header = ChunkedMessageAssembler::chunk_request_header(chunk_number);

        // One data object: the extended header word plus two padding bytes.
        let header = Header::new_extended(self.header_template(sop), self.tx_counter(sop), message_type, 1);

        let mut buffer = Self::get_message_buffer();
        let mut offset = header.to_bytes(&mut buffer);
        offset += ext_header.to_bytes(&mut buffer[offset..]);
        // Pad to the 4-byte data object boundary; the buffer is already zeroed.
        offset += 2;

        match self.transmit_with_retry(sop, &buffer[..offset]).await {
            Ok(()) => Ok(()),
            Err(ProtocolError::TxError(TxError::HardReset)) => Err(RxError::HardReset),
            Err(ProtocolError::RxError(err)) => Err(err),
            Err(_) => Err(RxError::ReceiveTimeout),
        }
    }

    /// Transmit an extended message, chunking the payload as necessary.
    ///
    /// After each chunk except the last, the receiver must request the next
    /// chunk within `ChunkSenderResponse`. A timeout or an out-of-order chunk
    /// request aborts the sequence.
    pub async fn transmit_extended_chunked(
        &mut self,
        message_type: ExtendedMessageType,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let sender = ChunkedMessageSender::new(payload);
        let total_chunks = sender.total_chunks();

        for (ext_header, chunk) in sender {
            // Frame size in data objects: extended header plus chunk data,
            // rounded up to the 4-byte boundary.
            let num_objects = (EXT_HEADER_SIZE + chunk.len()).div_ceil(4) as u8;
            let header = Header::new_extended(
                self.default_header,
                self.tx_counter(Sop::Sop),
                message_type,
                num_objects,
            );

            let mut buffer = Self::get_message_buffer();
            let mut offset = header.to_bytes(&mut buffer);
            offset += ext_header.to_bytes(&mut buffer[offset..]);
            buffer[offset..offset + chunk.len()].copy_from_slice(chunk);
            offset += chunk.len();
            // Pad to the data object boundary, buffer is zeroed.
            while (offset - MSG_HEADER_SIZE) % 4 != 0 {
                offset += 1;
            }

            self.transmit_with_retry(Sop::Sop, &buffer[..offset]).await?;

            let current_chunk = ext_header.chunk_number();
            if current_chunk + 1 == total_chunks {
                break;
            }

            // Wait for the receiver to request the following chunk.
            let request = self
                .receive_chunk_request(message_type, TimerType::ChunkSenderResponse)
                .await?;
            if request != current_chunk + 1 {
                warn!("Out-of-order chunk request: got {}, expected {}", request, current_chunk + 1);
                return Err(ProtocolError::ChunkSequenceError);
            }
        }

        Ok(())
    }

    /// Wait for a chunk request of the given message type, returning the
    /// requested chunk number.
    async fn receive_chunk_request(
        &mut self,
        message_type: ExtendedMessageType,
        timer_type: TimerType,
    ) -> Result<u8, ProtocolError> {
        let timeout_fut = Self::get_timer(timer_type);
        let receive_fut = async {
            loop {
                let mut buffer = Self::get_message_buffer();

                let (sop, length) = match self.driver.receive(&mut buffer).await {
                    Ok(received) => received,
                    Err(DriverRxError::Discarded) => continue,
                    Err(DriverRxError::HardReset) => return Err(ProtocolError::RxError(RxError::HardReset)),
                };

                let header = Header::from_bytes(&buffer[..MSG_HEADER_SIZE]).map_err(RxError::from)?;

                if matches!(
                    header.message_type(),
                    MessageType::Control(ControlMessageType::GoodCRC)
                ) {
                    continue;
                }

                if header.message_type() != MessageType::Extended(message_type) || length < 4 {
                    return Err(ProtocolError::ChunkSequenceError);
                }

                let ext_header = ExtendedHeader::from_bytes(&buffer[MSG_HEADER_SIZE..MSG_HEADER_SIZE + EXT_HEADER_SIZE]);

                // Acknowledge the chunk request frame.
                let message = Message::new(header).with_sop(sop);
                if self.handle_rx_ack(&message).await.map_err(ProtocolError::RxError)? {
                    continue;
                }

                if !ext_header.request_chunk() {
                    return Err(ProtocolError::ChunkSequenceError);
                }

                return Ok(ext_header.chunk_number());
            }
        };

        match select(timeout_fut, receive_fut).await {
            Either::First(_) => Err(RxError::ReceiveTimeout.into()),
            Either::Second(receive_result) => receive_result,
        }
    }

    /// Transmit source capabilities (SPR form).
    pub async fn transmit_source_capabilities(&mut self, capabilities: SourceCapabilities) -> Result<(), ProtocolError> {
        self.transmit_data_message(
            DataMessageType::SourceCapabilities,
            Data::SourceCapabilities(capabilities),
        )
        .await
    }

    /// Transmit EPR source capabilities as a chunked extended message.
    pub async fn transmit_epr_source_capabilities(
        &mut self,
        capabilities: SourceCapabilities,
    ) -> Result<(), ProtocolError> {
        let mut payload = [0u8; message::extended::chunked::MAX_EXTENDED_MSG_LEN];
        let size = capabilities.to_bytes(&mut payload);

        self.transmit_extended_chunked(ExtendedMessageType::EprSourceCapabilities, &payload[..size])
            .await
    }

    /// Transmit sink capabilities in response to Get_Sink_Cap.
    ///
    /// Per USB PD Spec R3.2 Section 6.4.1.6, sinks respond to Get_Sink_Cap messages
    /// with a Sink_Capabilities message containing PDOs describing what power levels
    /// the sink can operate at.
    pub async fn transmit_sink_capabilities(&mut self, capabilities: SinkCapabilities) -> Result<(), ProtocolError> {
        self.transmit_data_message(DataMessageType::SinkCapabilities, Data::SinkCapabilities(capabilities))
            .await
    }

    /// Transmit EPR sink capabilities in response to EPR_Get_Sink_Cap.
    ///
    /// Per USB PD Spec R3.2 Section 8.3.3.3.10, sinks respond to EPR_Get_Sink_Cap
    /// messages with an EPR_Sink_Capabilities message.
    pub async fn transmit_epr_sink_capabilities(&mut self, capabilities: SinkCapabilities) -> Result<(), ProtocolError> {
        let mut payload = [0u8; message::extended::chunked::MAX_EXTENDED_MSG_LEN];
        let size = capabilities.to_bytes(&mut payload);

        self.transmit_extended_chunked(ExtendedMessageType::EprSinkCapabilities, &payload[..size])
            .await
    }

    /// Transmit a Manufacturer_Info response, chunking as necessary.
    pub async fn transmit_manufacturer_info(&mut self, info: &ManufacturerInfo) -> Result<(), ProtocolError> {
        let mut payload = [0u8; message::extended::chunked::MAX_EXTENDED_MSG_LEN];
        let size = info.to_bytes(&mut payload);

        self.transmit_extended_chunked(ExtendedMessageType::ManufacturerInfo, &payload[..size])
            .await
    }

    /// Transmit a structured or unstructured VDM towards the given SOP target.
    pub async fn transmit_vdm(&mut self, sop: Sop, payload: message::data::vendor_defined::VdmPayload) -> Result<(), ProtocolError> {
        let data = Data::VendorDefined(payload);
        let header = Header::new_data(
            self.header_template(sop),
            self.tx_counter(sop),
            DataMessageType::VendorDefined,
            data.num_objects(),
        );

        self.transmit(Message::new_with_data(header, data).with_sop(sop)).await
    }
}
