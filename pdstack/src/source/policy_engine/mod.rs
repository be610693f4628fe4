//! Policy engine for the implementation of a source.
//!
//! Follows the same shape as the sink engine: an explicit `State` enum, one
//! `update_state` step per transition, and an error-mapping `run_step` that
//! implements the escalation ladder (retry, soft reset, hard reset).
use core::marker::PhantomData;

use embassy_futures::select::{Either3, select3};
use pdstack_traits::{Driver, Sop};

use super::device_policy_manager::{DevicePolicyManager, Event, RequestStatus};
use crate::config::{PortConfig, PortRole};
use crate::counters::{Counter, CounterType};
use crate::events::{AppEvent, ContractStatus, EventHandler};
use crate::protocol_layer::message::data::alert::AlertDataObject;
use crate::protocol_layer::message::data::bist::BistMode;
use crate::protocol_layer::message::data::epr_mode::{Action, DataEnterFailed};
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::source_capabilities::{PowerDataObject, SourceCapabilities};
use crate::protocol_layer::message::data::vendor_defined::{
    CableIdentity, VdmCommand, VdmCommandType, VdmHeader, VdmHeaderStructured, VdmPayload,
};
use crate::protocol_layer::message::data::{Data, request};
use crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType;
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload, extended};
use crate::protocol_layer::{ProtocolError, ProtocolLayer, RxError, TxError};
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PowerRole, SwapResponse};

#[cfg(test)]
mod tests;

/// Swap requests that share evaluation and send paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapKind {
    DataRole,
    PowerRole,
    Vconn,
}

impl SwapKind {
    fn message_type(self) -> ControlMessageType {
        match self {
            SwapKind::DataRole => ControlMessageType::DrSwap,
            SwapKind::PowerRole => ControlMessageType::PrSwap,
            SwapKind::Vconn => ControlMessageType::VconnSwap,
        }
    }
}

/// Verdict of the structural request validation.
enum RequestCheck {
    Valid,
    Invalid,
    /// The PDO copy in an EPR request does not mirror the advertised PDO.
    EprMismatch,
}

/// Source states.
#[derive(Debug, Clone)]
enum State {
    /// Default state at startup. `after_swap` delays capability advertising
    /// by tSwapSourceStart after a power role swap.
    Startup {
        after_swap: bool,
    },
    /// SOP' Discover_Identity towards the cable marker.
    CableDiscovery,
    SendCapabilities,
    /// No response to Source_Capabilities yet; wait before the next attempt.
    Discovery,
    /// The partner answered nothing after the final attempt; Type-C-only
    /// supply operation continues without PD.
    NonPd,
    NegotiateCapability(PowerSource),
    TransitionSupply(PowerSource),
    Ready,
    WaitNewCapabilities,
    SendNotSupported,
    SendSoftReset,
    SoftReset(Sop),
    HardReset,
    TransitionToDefault,
    GiveSinkCap,
    GiveSourceCapExtended,
    GiveManufacturerInfo,
    GiveRevision,
    GiveSourceInfo,
    HandleVdm(VdmPayload),
    SendVdm(Sop, VdmPayload),
    SendAlert(AlertDataObject),
    Bist(BistMode),
    EvaluateSwap(SwapKind),
    SendSwap(SwapKind),
    /// A power role swap was agreed; wind down the supply and hand over.
    PrSwapTransition,
    VconnSwapTransition,
    /// Fast role swap: signal, then run the message exchange.
    FrSwapSignal,
    /// Evaluate EPR mode entry, with the sink's operational PDP.
    EprEvaluateEntry(u8),
    /// DFP-initiated USB4 Data_Reset.
    SendDataReset,
    DataResetReceived,
}

/// The result of a completed policy engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// A power role swap completed; the port shall restart the engine in the
    /// sink role.
    PowerRoleSwap,
}

/// Errors that can occur in the source policy engine state machine.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The port partner is unresponsive.
    PortPartnerUnresponsive,
    /// A protocol error has occured.
    Protocol(ProtocolError),
}

impl From<ProtocolError> for Error {
    fn from(protocol_error: ProtocolError) -> Self {
        Error::Protocol(protocol_error)
    }
}

/// Implementation of the source policy engine.
/// See spec, [8.3.3.2]
#[derive(Debug)]
pub struct Source<'a, DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> {
    device_policy_manager: &'a mut DPM,
    pub(crate) protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    config: &'a PortConfig,
    pub(crate) state: State,
    hard_reset_counter: Counter,
    /// Bounds Source_Capabilities messages over the connection lifetime.
    caps_counter: Counter,
    /// Attempts towards a silent partner before giving up on PD.
    src_cap_try_counter: Counter,
    cable: Option<CableIdentity>,
    cable_discovered: bool,
    epr_mode: bool,
    /// The request the current explicit contract is based on.
    contract: Option<PowerSource>,
    /// Whether the last accepted request announced EPR capability.
    last_rdo_epr_capable: bool,
    pending_contract_status: Option<ContractStatus>,
    vconn_source: bool,
    _timer: PhantomData<TIMER>,
}

impl<'a, DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> Source<'a, DRIVER, TIMER, DPM> {
    fn new_protocol_layer(driver: DRIVER) -> ProtocolLayer<DRIVER, TIMER> {
        let header = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);
        ProtocolLayer::new(driver, header)
    }

    /// Create a new source policy engine with a given `driver`.
    pub fn new(driver: DRIVER, device_policy_manager: &'a mut DPM, config: &'a PortConfig) -> Self {
        Self {
            device_policy_manager,
            protocol_layer: Self::new_protocol_layer(driver),
            config,
            state: State::Startup { after_swap: false },
            hard_reset_counter: Counter::new(CounterType::HardReset),
            caps_counter: Counter::new(CounterType::Caps),
            src_cap_try_counter: Counter::new(CounterType::SourceCapTry),
            cable: None,
            cable_discovered: false,
            epr_mode: false,
            contract: None,
            last_rdo_epr_capable: false,
            pending_contract_status: None,
            vconn_source: true,
            _timer: PhantomData,
        }
    }

    /// Start the engine on the far side of a power role swap: the new source
    /// waits tSwapSourceStart, then advertises capabilities.
    pub fn start_after_swap(&mut self) {
        self.state = State::Startup { after_swap: true };
    }

    async fn notify(&mut self, event: AppEvent) {
        self.device_policy_manager.handle_event(event).await;
    }

    /// The capabilities currently advertised, depending on the EPR mode.
    fn advertised_capabilities(&self) -> SourceCapabilities {
        if self.epr_mode {
            self.config.epr_source_capabilities()
        } else {
            self.config.source_capabilities()
        }
    }

    /// Structural validation of a sink's request against the advertised
    /// capabilities.
    fn validate_request(&self, request: &PowerSource) -> RequestCheck {
        let advertised = self.advertised_capabilities();
        let position = request.object_position();

        let Some(pdo) = advertised.pdos().get(position.saturating_sub(1) as usize) else {
            return RequestCheck::Invalid;
        };
        if pdo.is_zero_padding() {
            return RequestCheck::Invalid;
        }

        match request {
            PowerSource::FixedVariableSupply(rdo) => {
                let max = match pdo {
                    PowerDataObject::FixedSupply(supply) => supply.raw_max_current(),
                    PowerDataObject::VariableSupply(supply) => supply.raw_max_current(),
                    _ => return RequestCheck::Invalid,
                };
                if rdo.raw_max_operating_current() > max && !rdo.giveback_flag() {
                    return RequestCheck::Invalid;
                }
                RequestCheck::Valid
            }
            PowerSource::Battery(rdo) => {
                let PowerDataObject::Battery(supply) = pdo else {
                    return RequestCheck::Invalid;
                };
                if rdo.raw_max_operating_power() > supply.raw_max_power() {
                    return RequestCheck::Invalid;
                }
                RequestCheck::Valid
            }
            PowerSource::Pps(rdo) => {
                let PowerDataObject::Augmented(crate::protocol_layer::message::data::source_capabilities::Augmented::Spr(
                    supply,
                )) = pdo
                else {
                    return RequestCheck::Invalid;
                };
                // The APDO voltage must lie within the programmable range.
                if rdo.output_voltage() < supply.min_voltage() || rdo.output_voltage() > supply.max_voltage() {
                    return RequestCheck::Invalid;
                }
                if rdo.raw_operating_current() as u8 > supply.raw_max_current() {
                    return RequestCheck::Invalid;
                }
                RequestCheck::Valid
            }
            PowerSource::EprRequest(epr) => {
                // Per spec 6.4.11, the copied PDO must mirror the advertised
                // one exactly; a mismatch demands a hard reset.
                if epr.pdo.to_raw() != pdo.to_raw() {
                    return RequestCheck::EprMismatch;
                }
                if !self.epr_mode && position > 7 {
                    return RequestCheck::Invalid;
                }
                RequestCheck::Valid
            }
            PowerSource::Avs(_) | PowerSource::Unknown(_) => RequestCheck::Invalid,
        }
    }

    /// The supply setting an accepted request translates to.
    fn supply_params(&self, request: &PowerSource) -> (crate::units::ElectricPotential, crate::units::ElectricCurrent) {
        use uom::si::electric_current::centiampere;
        use uom::si::electric_potential::millivolt;

        let advertised = self.advertised_capabilities();
        let pdo = advertised
            .pdos()
            .get(request.object_position().saturating_sub(1) as usize)
            .copied();

        match (request, pdo) {
            (PowerSource::FixedVariableSupply(rdo), Some(PowerDataObject::FixedSupply(supply))) => {
                (supply.voltage(), rdo.operating_current())
            }
            (PowerSource::Pps(rdo), _) => (rdo.output_voltage(), rdo.operating_current()),
            (PowerSource::EprRequest(epr), _) => match epr.pdo {
                PowerDataObject::FixedSupply(supply) => (
                    supply.voltage(),
                    crate::units::ElectricCurrent::new::<centiampere>(supply.raw_max_current().into()),
                ),
                _ => (
                    crate::units::ElectricPotential::new::<millivolt>(5000),
                    crate::units::ElectricCurrent::new::<centiampere>(300),
                ),
            },
            _ => (
                crate::units::ElectricPotential::new::<millivolt>(5000),
                crate::units::ElectricCurrent::new::<centiampere>(90),
            ),
        }
    }

    /// Run a single step in the policy engine state machine.
    pub(crate) async fn run_step(&mut self) -> Result<Option<Outcome>, Error> {
        let result = self.update_state().await;
        if let Ok(outcome) = result {
            return Ok(outcome);
        }

        if let Err(Error::Protocol(protocol_error)) = result {
            let state = self.state.clone();
            let new_state = match (&state, protocol_error) {
                // Hard reset signalling from the partner or the driver.
                (_, ProtocolError::RxError(RxError::HardReset) | ProtocolError::TxError(TxError::HardReset)) => {
                    self.notify(AppEvent::HardResetReceived).await;
                    Some(State::TransitionToDefault)
                }

                // Partner requested a soft reset.
                (_, ProtocolError::RxError(RxError::SoftReset(sop))) => Some(State::SoftReset(sop)),

                // Soft reset failure escalates to hard reset (spec 6.3.13).
                (State::SoftReset(_) | State::SendSoftReset, ProtocolError::TransmitRetriesExceeded(_)) => {
                    Some(State::HardReset)
                }

                // SenderResponse expired while waiting for the sink's Request.
                (State::SendCapabilities, ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                    self.notify(AppEvent::SenderResponseTimeout).await;
                    Some(State::HardReset)
                }

                // PS_RDY could not be delivered during the supply transition.
                (State::TransitionSupply(_), ProtocolError::TransmitRetriesExceeded(_)) => {
                    self.pending_contract_status = Some(ContractStatus::PsRdyNotSent);
                    Some(State::SendSoftReset)
                }

                // Unexpected messages demand a soft reset of the AMS.
                (_, ProtocolError::UnexpectedMessage) => Some(State::SendSoftReset),

                // Unsupported messages in Ready get Not_Supported.
                (State::Ready, ProtocolError::RxError(RxError::UnsupportedMessage)) => {
                    Some(State::SendNotSupported)
                }

                // Transmission failures outside dedicated states.
                (_, ProtocolError::TransmitRetriesExceeded(_) | ProtocolError::ChunkSequenceError) => {
                    Some(State::SendSoftReset)
                }

                (_, error) => {
                    error!("Protocol error {:?} in source state transition", error);
                    None
                }
            };

            if let Some(state) = new_state {
                self.state = state
            }

            Ok(None)
        } else {
            error!("Unrecoverable result {:?} in source state transition", result);
            result
        }
    }

    /// Run the source's state machine continuously.
    pub async fn run(&mut self) -> Result<Outcome, Error> {
        loop {
            if let Some(outcome) = self.run_step().await? {
                return Ok(outcome);
            }
        }
    }

    async fn update_state(&mut self) -> Result<Option<Outcome>, Error> {
        let state = self.state.clone();
        let new_state = match &state {
            State::Startup { after_swap } => {
                self.protocol_layer.reset();
                self.epr_mode = false;
                self.contract = None;
                self.caps_counter.reset();
                self.src_cap_try_counter.reset();

                // Apply vSafe5V before any PD signalling.
                self.device_policy_manager.enable_source(true).await;

                if *after_swap {
                    // Per spec 8.3.3.6.3.2, the new source waits
                    // tSwapSourceStart before its first Source_Capabilities.
                    TimerType::get_timer::<TIMER>(TimerType::SwapSourceStart).await;
                    State::SendCapabilities
                } else if self.config.cable_discovery && !self.cable_discovered {
                    State::CableDiscovery
                } else {
                    State::SendCapabilities
                }
            }
            State::CableDiscovery => {
                // The cable marker only answers while VConn is up.
                self.device_policy_manager.set_vconn(true).await;
                self.vconn_source = true;
                self.cable_discovered = true;

                // A cable soft reset brings the marker's message IDs in sync.
                self.protocol_layer.reset_sop(Sop::SopPrime);

                let mut attempts = Counter::new_with_max(self.config.cable_discovery_count.max(1));
                loop {
                    let vdm = VdmHeaderStructured::discover_identity(self.protocol_layer.revision());
                    let payload: VdmPayload = (VdmHeader::Structured(vdm), heapless::Vec::new());

                    let response = match self.protocol_layer.transmit_vdm(Sop::SopPrime, payload).await {
                        Ok(()) => {
                            self.protocol_layer
                                .receive_message_type(
                                    &[MessageType::Data(DataMessageType::VendorDefined)],
                                    TimerType::VDMResponse,
                                )
                                .await
                        }
                        Err(err) => Err(err),
                    };

                    match response {
                        Ok(message) if message.sop == Sop::SopPrime => {
                            if let Some(identity) = Self::parse_identity_ack(&message) {
                                self.cable = Some(identity);
                                self.notify(AppEvent::CableDetected(identity)).await;
                                break;
                            }
                        }
                        Ok(_) => {
                            // A message from the partner, not the cable;
                            // abort discovery and handle the partner.
                            break;
                        }
                        Err(ProtocolError::RxError(RxError::HardReset)) => {
                            return Err(ProtocolError::RxError(RxError::HardReset).into());
                        }
                        Err(_) => {}
                    }

                    if attempts.increment().is_err() {
                        self.notify(AppEvent::CableNotDetected).await;
                        break;
                    }

                    TimerType::get_timer::<TIMER>(TimerType::CableDiscovery).await;
                }

                if !self.config.vconn_retain && self.cable.is_none() {
                    self.device_policy_manager.set_vconn(false).await;
                    self.vconn_source = false;
                }

                State::SendCapabilities
            }
            State::SendCapabilities => {
                let capabilities = self.config.source_capabilities();

                match self.protocol_layer.transmit_source_capabilities(capabilities).await {
                    Ok(()) => {
                        // The sink acknowledged; a Request must follow within
                        // tSenderResponse.
                        _ = self.caps_counter.increment();
                        self.src_cap_try_counter.reset();
                        self.notify(AppEvent::SinkDeviceConnected).await;

                        let sender_response = self.protocol_layer.sender_response_timer();
                        let message = self
                            .protocol_layer
                            .receive_message_type(
                                &[
                                    MessageType::Data(DataMessageType::Request),
                                    MessageType::Data(DataMessageType::EprRequest),
                                ],
                                sender_response,
                            )
                            .await?;

                        match Self::parse_request(&message, &self.advertised_capabilities()) {
                            Some(request) => State::NegotiateCapability(request),
                            None => State::SendSoftReset,
                        }
                    }
                    Err(ProtocolError::TransmitRetriesExceeded(_)) => {
                        // No GoodCRC: the partner may not be PD capable.
                        if self.src_cap_try_counter.increment().is_err() {
                            self.notify(AppEvent::SourceCapsTriedWithNoResponse).await;
                            State::NonPd
                        } else {
                            State::Discovery
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            State::Discovery => {
                // Retry the capability advertisement after tTypeCSendSourceCap.
                TimerType::get_timer::<TIMER>(TimerType::SourceCapability).await;
                State::SendCapabilities
            }
            State::NonPd => {
                // Type-C-only operation: keep supplying, service only DPM
                // requests that still make sense without PD.
                match self.device_policy_manager.get_event().await {
                    Event::HardReset => State::HardReset,
                    Event::CapabilitiesChanged => {
                        self.src_cap_try_counter.reset();
                        State::SendCapabilities
                    }
                    _ => State::NonPd,
                }
            }
            State::NegotiateCapability(request) => {
                match self.validate_request(request) {
                    RequestCheck::EprMismatch => {
                        // Per spec 6.4.11: PDO mirror mismatch in an EPR
                        // request demands a hard reset.
                        State::HardReset
                    }
                    RequestCheck::Invalid => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Reject)
                            .await?;

                        self.pending_contract_status = Some(if self.contract.is_some() {
                            ContractStatus::RejectedContractValid
                        } else {
                            ContractStatus::RejectedNoContract
                        });

                        if self.contract.is_some() {
                            State::Ready
                        } else {
                            State::WaitNewCapabilities
                        }
                    }
                    RequestCheck::Valid => match self.device_policy_manager.evaluate_request(request).await {
                        RequestStatus::Accept => {
                            self.protocol_layer
                                .transmit_control_message(ControlMessageType::Accept)
                                .await?;
                            State::TransitionSupply(*request)
                        }
                        RequestStatus::Wait => {
                            self.protocol_layer
                                .transmit_control_message(ControlMessageType::Wait)
                                .await?;
                            if self.contract.is_some() {
                                State::Ready
                            } else {
                                State::WaitNewCapabilities
                            }
                        }
                        RequestStatus::Reject => {
                            self.protocol_layer
                                .transmit_control_message(ControlMessageType::Reject)
                                .await?;
                            self.pending_contract_status = Some(if self.contract.is_some() {
                                ContractStatus::RejectedContractValid
                            } else {
                                ContractStatus::RejectedNoContract
                            });
                            if self.contract.is_some() {
                                State::Ready
                            } else {
                                State::WaitNewCapabilities
                            }
                        }
                    },
                }
            }
            State::TransitionSupply(request) => {
                // The new level must be reached within tPSSrcTrans.
                let (voltage, current) = self.supply_params(request);
                self.device_policy_manager.set_supply(voltage, current).await;

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PsRdy)
                    .await?;

                self.contract = Some(*request);
                self.last_rdo_epr_capable = match request {
                    PowerSource::FixedVariableSupply(rdo) => rdo.epr_mode_capable(),
                    PowerSource::EprRequest(_) => true,
                    _ => false,
                };
                self.pending_contract_status = Some(ContractStatus::Successful);

                State::Ready
            }
            State::Ready => {
                if let Some(status) = self.pending_contract_status.take() {
                    let request = self.contract;
                    self.notify(AppEvent::ContractNegotiationComplete { status, request })
                        .await;
                }

                let receive_fut = self.protocol_layer.receive_message();
                let event_fut = self.device_policy_manager.get_event();
                // In EPR mode, the sink must keep the link alive; silence for
                // tSourceEPRKeepAlive forces an exit via hard reset.
                let keep_alive_supervision = async {
                    if self.epr_mode {
                        TimerType::get_timer::<TIMER>(TimerType::SourceEPRKeepAlive).await
                    } else {
                        core::future::pending().await
                    }
                };

                match select3(receive_fut, event_fut, keep_alive_supervision).await {
                    Either3::First(message) => {
                        let message = message?;

                        match message.header.message_type() {
                            MessageType::Data(DataMessageType::Request)
                            | MessageType::Data(DataMessageType::EprRequest) => {
                                match Self::parse_request(&message, &self.advertised_capabilities()) {
                                    Some(request) => State::NegotiateCapability(request),
                                    None => State::SendSoftReset,
                                }
                            }
                            MessageType::Control(ControlMessageType::GetSourceCap) => State::SendCapabilities,
                            MessageType::Control(ControlMessageType::GetSinkCap) => State::GiveSinkCap,
                            MessageType::Control(ControlMessageType::GetSourceCapExtended) => {
                                State::GiveSourceCapExtended
                            }
                            MessageType::Control(ControlMessageType::GetRevision) => State::GiveRevision,
                            MessageType::Control(ControlMessageType::GetSourceInfo) => State::GiveSourceInfo,
                            MessageType::Control(ControlMessageType::Ping) => State::Ready,
                            MessageType::Control(ControlMessageType::DrSwap) => {
                                State::EvaluateSwap(SwapKind::DataRole)
                            }
                            MessageType::Control(ControlMessageType::PrSwap) => {
                                State::EvaluateSwap(SwapKind::PowerRole)
                            }
                            MessageType::Control(ControlMessageType::VconnSwap) => {
                                State::EvaluateSwap(SwapKind::Vconn)
                            }
                            MessageType::Control(ControlMessageType::FrSwap) => {
                                // The sink answers our FRS signal; handled in
                                // the FrSwapSignal state. Out of sequence here.
                                State::SendNotSupported
                            }
                            MessageType::Control(ControlMessageType::DataReset) => State::DataResetReceived,
                            MessageType::Data(DataMessageType::EprMode) => {
                                if let Some(Payload::Data(Data::EprMode(epr))) = message.payload {
                                    match epr.action() {
                                        Action::Enter => {
                                            self.notify(AppEvent::EprModeEntryReceived).await;
                                            State::EprEvaluateEntry(epr.data())
                                        }
                                        Action::Exit => {
                                            self.epr_mode = false;
                                            self.notify(AppEvent::EprModeExited).await;
                                            State::SendCapabilities
                                        }
                                        _ => State::SendSoftReset,
                                    }
                                } else {
                                    State::SendSoftReset
                                }
                            }
                            MessageType::Data(DataMessageType::Bist) => {
                                if let Some(Payload::Data(Data::Bist(bist))) = message.payload {
                                    State::Bist(bist.mode())
                                } else {
                                    State::SendNotSupported
                                }
                            }
                            MessageType::Data(DataMessageType::VendorDefined) => {
                                if let Some(Payload::Data(Data::VendorDefined(payload))) = message.payload {
                                    State::HandleVdm(payload)
                                } else {
                                    State::SendNotSupported
                                }
                            }
                            MessageType::Data(DataMessageType::SinkCapabilities) => {
                                // Response to an earlier Get_Sink_Cap.
                                self.notify(AppEvent::PacketReceived).await;
                                State::Ready
                            }
                            MessageType::Extended(ExtendedMessageType::GetManufacturerInfo) => {
                                State::GiveManufacturerInfo
                            }
                            MessageType::Extended(ExtendedMessageType::ExtendedControl) => {
                                if let Some(Payload::Extended(extended::Extended::ExtendedControl(ctrl))) =
                                    &message.payload
                                {
                                    match ctrl.message_type() {
                                        ExtendedControlMessageType::EprKeepAlive => {
                                            self.protocol_layer
                                                .transmit_extended_control_message(
                                                    ExtendedControlMessageType::EprKeepAliveAck,
                                                )
                                                .await?;
                                            State::Ready
                                        }
                                        ExtendedControlMessageType::EprGetSourceCap => {
                                            let caps = self.config.epr_source_capabilities();
                                            self.protocol_layer.transmit_epr_source_capabilities(caps).await?;
                                            State::Ready
                                        }
                                        _ => State::SendNotSupported,
                                    }
                                } else {
                                    State::SendNotSupported
                                }
                            }
                            _ => State::SendNotSupported,
                        }
                    }
                    Either3::Second(event) => match event {
                        Event::CapabilitiesChanged => State::SendCapabilities,
                        Event::GetSinkCapabilities => {
                            self.protocol_layer
                                .transmit_control_message(ControlMessageType::GetSinkCap)
                                .await?;
                            let sender_response = self.protocol_layer.sender_response_timer();
                            let message = self
                                .protocol_layer
                                .receive_message_type(
                                    &[MessageType::Data(DataMessageType::SinkCapabilities)],
                                    sender_response,
                                )
                                .await?;
                            let _ = message;
                            self.notify(AppEvent::PacketReceived).await;
                            State::Ready
                        }
                        Event::HardReset => State::HardReset,
                        Event::SoftReset => State::SendSoftReset,
                        Event::DrSwap => State::SendSwap(SwapKind::DataRole),
                        Event::PrSwap => State::SendSwap(SwapKind::PowerRole),
                        Event::VconnSwap => State::SendSwap(SwapKind::Vconn),
                        Event::FrSwap => State::FrSwapSignal,
                        Event::DataReset => State::SendDataReset,
                        Event::SendAlert(alert) => State::SendAlert(alert),
                        Event::SendVdm { sop, payload } => State::SendVdm(sop, payload),
                        _ => State::Ready,
                    },
                    Either3::Third(_) => {
                        // Missed EPR keep-alive.
                        warn!("EPR keep-alive missed, forcing exit");
                        State::HardReset
                    }
                }
            }
            State::WaitNewCapabilities => {
                // Wait for new capabilities from the DPM, or a fresh request
                // from the sink.
                let receive_fut = self.protocol_layer.receive_message();
                let event_fut = self.device_policy_manager.get_event();

                match embassy_futures::select::select(receive_fut, event_fut).await {
                    embassy_futures::select::Either::First(message) => {
                        let message = message?;
                        match Self::parse_request(&message, &self.advertised_capabilities()) {
                            Some(request) => State::NegotiateCapability(request),
                            None => State::WaitNewCapabilities,
                        }
                    }
                    embassy_futures::select::Either::Second(Event::CapabilitiesChanged) => State::SendCapabilities,
                    embassy_futures::select::Either::Second(Event::HardReset) => State::HardReset,
                    embassy_futures::select::Either::Second(_) => State::WaitNewCapabilities,
                }
            }
            State::SendNotSupported => {
                let response = match self.protocol_layer.revision() {
                    SpecificationRevision::R3_X => ControlMessageType::NotSupported,
                    _ => ControlMessageType::Reject,
                };
                self.protocol_layer.transmit_control_message(response).await?;

                State::Ready
            }
            State::SendSoftReset => {
                self.protocol_layer.reset_sop(Sop::Sop);

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::SoftReset)
                    .await?;
                self.notify(AppEvent::SoftResetSent(Sop::Sop)).await;

                let sender_response = self.protocol_layer.sender_response_timer();
                self.protocol_layer
                    .receive_message_type(&[MessageType::Control(ControlMessageType::Accept)], sender_response)
                    .await?;

                State::SendCapabilities
            }
            State::SoftReset(sop) => {
                self.protocol_layer.reset_sop(*sop);

                self.protocol_layer
                    .transmit_control_message_sop(*sop, ControlMessageType::Accept)
                    .await?;

                match sop {
                    Sop::Sop => State::SendCapabilities,
                    // A cable marker reset does not restart the contract.
                    _ => State::Ready,
                }
            }
            State::HardReset => {
                if self.hard_reset_counter.increment().is_err() {
                    return Err(Error::PortPartnerUnresponsive);
                }

                self.protocol_layer.hard_reset().await?;
                self.notify(AppEvent::HardResetSent).await;

                State::TransitionToDefault
            }
            State::TransitionToDefault => {
                // Per spec 8.3.3.2.13/14: remove VBus, wait tSrcRecover
                // (tEPRSrcRecover in EPR mode), then re-apply vSafe5V.
                self.device_policy_manager.hard_reset().await;
                self.device_policy_manager.enable_source(false).await;
                self.device_policy_manager.discharge_vbus(true).await;

                let recover = if self.epr_mode {
                    TimerType::SourceRecoverEpr
                } else {
                    TimerType::SourceRecover
                };
                TimerType::get_timer::<TIMER>(recover).await;

                self.device_policy_manager.discharge_vbus(false).await;
                self.device_policy_manager.enable_source(true).await;

                self.protocol_layer.reset();
                self.epr_mode = false;
                self.contract = None;
                self.notify(AppEvent::HardResetComplete).await;

                State::Startup { after_swap: false }
            }
            State::GiveSinkCap => {
                // Only dual-role ports can report sink capabilities.
                if self.config.port_role == PortRole::DualRole {
                    let sink_caps = self.config.sink_capabilities();
                    self.protocol_layer.transmit_sink_capabilities(sink_caps).await?;
                    State::Ready
                } else {
                    State::SendNotSupported
                }
            }
            State::GiveSourceCapExtended => {
                // The SCEDB response comes straight out of the configuration.
                if self.config.ext_src_cap_enabled {
                    let blob = self.config.ext_src_cap;
                    self.protocol_layer
                        .transmit_extended_chunked(ExtendedMessageType::SourceCapabilitiesExtended, &blob)
                        .await?;
                    State::Ready
                } else {
                    State::SendNotSupported
                }
            }
            State::GiveManufacturerInfo => {
                let info = self.config.manufacturer_info();
                self.protocol_layer.transmit_manufacturer_info(&info).await?;
                State::Ready
            }
            State::GiveRevision => {
                self.protocol_layer
                    .transmit_data_message(DataMessageType::Revision, Data::Revision(self.config.pd_revision_response))
                    .await?;
                State::Ready
            }
            State::GiveSourceInfo => {
                self.protocol_layer
                    .transmit_data_message(
                        DataMessageType::SourceInfo,
                        Data::SourceInfo(self.config.source_info_response),
                    )
                    .await?;
                State::Ready
            }
            State::HandleVdm(payload) => match self.device_policy_manager.evaluate_vdm(payload).await {
                Some(response) => State::SendVdm(Sop::Sop, response),
                None => State::Ready,
            },
            State::SendVdm(sop, payload) => {
                self.protocol_layer.transmit_vdm(*sop, payload.clone()).await?;
                State::Ready
            }
            State::SendAlert(alert) => {
                self.protocol_layer
                    .transmit_data_message(DataMessageType::Alert, Data::Alert(*alert))
                    .await?;
                State::Ready
            }
            State::Bist(bist_mode) => match bist_mode {
                BistMode::CarrierMode2 => {
                    self.notify(AppEvent::BistCarrierMode).await;
                    TimerType::get_timer::<TIMER>(TimerType::BISTContMode).await;
                    State::Ready
                }
                BistMode::TestData => {
                    self.notify(AppEvent::BistTestData).await;
                    loop {
                        match self.protocol_layer.receive_message().await {
                            Ok(_) => continue,
                            Err(err) => return Err(Error::Protocol(err)),
                        }
                    }
                }
                BistMode::SharedTestModeEntry | BistMode::SharedTestModeExit if self.config.bist_stm_enabled => {
                    State::Ready
                }
                _ => State::SendNotSupported,
            },
            State::EvaluateSwap(kind) => {
                let response = match kind {
                    SwapKind::DataRole => self.device_policy_manager.evaluate_dr_swap().await,
                    SwapKind::Vconn => self.device_policy_manager.evaluate_vconn_swap().await,
                    SwapKind::PowerRole => {
                        if self.config.port_role == PortRole::DualRole {
                            self.device_policy_manager.evaluate_pr_swap().await
                        } else {
                            SwapResponse::NotSupported
                        }
                    }
                };

                match response {
                    SwapResponse::Accept => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Accept)
                            .await?;

                        match kind {
                            SwapKind::DataRole => {
                                let new_role = self.protocol_layer.data_role().flipped();
                                self.protocol_layer.update_roles(PowerRole::Source, new_role);
                                self.notify(AppEvent::DrSwapComplete).await;
                                State::Ready
                            }
                            SwapKind::Vconn => State::VconnSwapTransition,
                            SwapKind::PowerRole => State::PrSwapTransition,
                        }
                    }
                    SwapResponse::Wait => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Wait)
                            .await?;
                        State::Ready
                    }
                    SwapResponse::Reject => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Reject)
                            .await?;
                        State::Ready
                    }
                    SwapResponse::NotSupported => State::SendNotSupported,
                }
            }
            State::SendSwap(kind) => {
                self.protocol_layer.transmit_control_message(kind.message_type()).await?;

                let sender_response = self.protocol_layer.sender_response_timer();
                let response = self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Wait),
                            MessageType::Control(ControlMessageType::Reject),
                            MessageType::Control(ControlMessageType::NotSupported),
                        ],
                        sender_response,
                    )
                    .await?;

                match response.header.message_type() {
                    MessageType::Control(ControlMessageType::Accept) => match kind {
                        SwapKind::DataRole => {
                            let new_role = self.protocol_layer.data_role().flipped();
                            self.protocol_layer.update_roles(PowerRole::Source, new_role);
                            self.notify(AppEvent::DrSwapComplete).await;
                            State::Ready
                        }
                        SwapKind::Vconn => State::VconnSwapTransition,
                        SwapKind::PowerRole => State::PrSwapTransition,
                    },
                    _ => {
                        if *kind == SwapKind::Vconn {
                            self.notify(AppEvent::VconnSwapFailed).await;
                        }
                        State::Ready
                    }
                }
            }
            State::PrSwapTransition => {
                // Per spec 8.3.3.6.3.2: remove the supply, reach vSafe0V, and
                // signal PS_RDY so the partner may take over sourcing.
                self.device_policy_manager.enable_source(false).await;
                self.device_policy_manager.discharge_vbus(true).await;
                TimerType::get_timer::<TIMER>(TimerType::HardResetTx).await;
                self.device_policy_manager.discharge_vbus(false).await;

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PsRdy)
                    .await?;

                self.protocol_layer.update_roles(PowerRole::Sink, self.protocol_layer.data_role());

                return Ok(Some(Outcome::PowerRoleSwap));
            }
            State::VconnSwapTransition => {
                if self.vconn_source {
                    self.protocol_layer
                        .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::VCONNOn)
                        .await?;
                    self.device_policy_manager.set_vconn(false).await;
                    self.vconn_source = false;
                } else {
                    self.device_policy_manager.set_vconn(true).await;
                    TimerType::get_timer::<TIMER>(TimerType::VCONNOff).await;
                    self.vconn_source = true;
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::PsRdy)
                        .await?;
                }

                self.notify(AppEvent::VconnSwapComplete).await;
                State::Ready
            }
            State::FrSwapSignal => {
                // Announce the power loss on the CC wire; the sink responds
                // with an FR_Swap message which runs the accelerated swap.
                self.protocol_layer.fast_role_swap_signal().await?;

                self.protocol_layer
                    .receive_message_type(&[MessageType::Control(ControlMessageType::FrSwap)], TimerType::FRSwap)
                    .await?;

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::Accept)
                    .await?;

                // This port's supply is already gone; report it immediately.
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PsRdy)
                    .await?;

                // The new source signals PS_RDY once VBus is back up.
                self.protocol_layer
                    .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::PSSourceOn)
                    .await?;

                self.protocol_layer.update_roles(PowerRole::Sink, self.protocol_layer.data_role());
                self.notify(AppEvent::FrSwapComplete).await;

                return Ok(Some(Outcome::PowerRoleSwap));
            }
            State::EprEvaluateEntry(operational_pdp) => {
                // Per spec 8.3.3.25.2: all entry gates must pass, and any
                // failure is reported with its cause.
                let failure = if !self.config.epr_source_enabled() {
                    Some(DataEnterFailed::EprCapableBitNotSetInPdo)
                } else if !self.last_rdo_epr_capable {
                    Some(DataEnterFailed::EprCapableBitNotSetInRdo)
                } else if !self.vconn_source {
                    Some(DataEnterFailed::SourceFailedToBecomeVconnSource)
                } else if !self.cable.map(|cable| cable.epr_mode_capable()).unwrap_or(false) {
                    Some(DataEnterFailed::CableNotEprCapable)
                } else if !self.device_policy_manager.evaluate_epr_entry(*operational_pdp).await {
                    Some(DataEnterFailed::SourceUnableToEnterEprMode)
                } else {
                    None
                };

                if let Some(cause) = failure {
                    self.protocol_layer
                        .transmit_epr_mode(Action::EnterFailed, cause.into())
                        .await?;
                    self.notify(AppEvent::EprModeEntryFailed(cause)).await;
                    State::Ready
                } else {
                    self.protocol_layer.transmit_epr_mode(Action::EnterAcknowledged, 0).await?;

                    // Cable discovery already ran at startup; entry succeeds.
                    self.protocol_layer.transmit_epr_mode(Action::EnterSucceeded, 0).await?;
                    self.epr_mode = true;
                    self.notify(AppEvent::EprModeEntered).await;

                    // The sink expects EPR_Source_Capabilities right away.
                    let caps = self.config.epr_source_capabilities();
                    self.protocol_layer.transmit_epr_source_capabilities(caps).await?;

                    State::Ready
                }
            }
            State::SendDataReset => {
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::DataReset)
                    .await?;
                self.notify(AppEvent::DataResetSent).await;

                let sender_response = self.protocol_layer.sender_response_timer();
                self.protocol_layer
                    .receive_message_type(&[MessageType::Control(ControlMessageType::Accept)], sender_response)
                    .await?;

                // VConn bounce per the nine-step sequence, then the DFP
                // settles before completing.
                if self.vconn_source {
                    self.device_policy_manager.set_vconn(false).await;
                    TimerType::get_timer::<TIMER>(TimerType::VCONNOff).await;
                    self.device_policy_manager.set_vconn(true).await;
                }

                TimerType::get_timer::<TIMER>(TimerType::DataResetDfpDelay).await;

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::DataResetComplete)
                    .await?;
                self.notify(AppEvent::DataResetComplete).await;

                State::Ready
            }
            State::DataResetReceived => {
                self.notify(AppEvent::DataResetReceived).await;
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::Accept)
                    .await?;

                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::DataResetComplete)],
                        TimerType::DataResetComplete,
                    )
                    .await?;

                self.notify(AppEvent::DataResetComplete).await;
                State::Ready
            }
        };

        self.state = new_state;

        Ok(None)
    }

    /// Extract a typed request from a received message, resolving the object
    /// position against the advertised capabilities.
    fn parse_request(message: &Message, advertised: &SourceCapabilities) -> Option<PowerSource> {
        match &message.payload {
            Some(Payload::Data(Data::Request(request))) => match request {
                PowerSource::Unknown(raw) => {
                    // The generic parser could not resolve the position; try
                    // again against the currently advertised set. A position
                    // beyond the advertised PDOs stays unresolved, and the
                    // negotiation answers it with Reject.
                    use crate::protocol_layer::message::data::PdoState;
                    use crate::protocol_layer::message::data::source_capabilities::Kind;

                    Some(
                        match advertised.pdo_at_object_position(raw.object_position()) {
                            Some(Kind::FixedSupply) | Some(Kind::VariableSupply) => {
                                PowerSource::FixedVariableSupply(request::FixedVariableSupply(raw.0))
                            }
                            Some(Kind::Battery) => PowerSource::Battery(request::Battery(raw.0)),
                            Some(Kind::Pps) => PowerSource::Pps(request::Pps(raw.0)),
                            Some(Kind::Avs) => PowerSource::Avs(request::Avs(raw.0)),
                            None => PowerSource::Unknown(*raw),
                        },
                    )
                }
                other => Some(*other),
            },
            _ => None,
        }
    }

    /// Extract the cable identity from a Discover_Identity ACK.
    fn parse_identity_ack(message: &Message) -> Option<CableIdentity> {
        let Some(Payload::Data(Data::VendorDefined((header, vdos)))) = &message.payload else {
            return None;
        };

        let VdmHeader::Structured(structured) = header else {
            return None;
        };

        if structured.command() != VdmCommand::DiscoverIdentity
            || structured.command_type() != VdmCommandType::ResponderAck
        {
            return None;
        }

        CableIdentity::from_vdos(vdos)
    }
}
