//! Policy engine for the implementation of a sink.
use core::marker::PhantomData;

use embassy_futures::select::{Either, Either3, select, select3};
use pdstack_traits::{Driver, Sop};
use uom::si::power::watt;

use super::device_policy_manager::{DevicePolicyManager, Event};
use crate::config::{PortConfig, PortRole};
use crate::counters::Counter;
use crate::events::{AppEvent, ContractStatus, EventHandler};
use crate::protocol_layer::message::data::bist::BistMode;
use crate::protocol_layer::message::data::epr_mode::{self, Action};
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::data::vendor_defined::VdmPayload;
use crate::protocol_layer::message::data::{Data, request};
use crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType;
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Payload, extended};
use crate::protocol_layer::{ProtocolError, ProtocolLayer, RxError, TxError};
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PowerRole, SwapResponse, units};

#[cfg(test)]
mod tests;

/// Sink capability mode.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    /// The classic mode of PD operation where explicit contracts are negotiated using SPR (A)PDOs.
    Spr,
    /// A Power Delivery mode of operation where the maximum allowable voltage is 48 V.
    Epr,
}

#[derive(Debug, Clone, Copy, Default)]
enum Contract {
    #[default]
    Safe5V,
    TransitionToExplicit,
    Explicit,
}

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

/// Sink states.
#[derive(Debug, Clone)]
enum State {
    // States of the policy engine as given by the specification.
    /// Default state at startup.
    Startup,
    Discovery,
    WaitForCapabilities,
    EvaluateCapabilities(SourceCapabilities),
    SelectCapability(request::PowerSource),
    TransitionSink(request::PowerSource),
    /// Ready state. The bool indicates if we entered due to receiving a Wait message,
    /// which requires running SinkRequestTimer before allowing re-request.
    Ready(request::PowerSource, bool),
    SendNotSupported(request::PowerSource),
    SendSoftReset,
    SoftReset(Sop),
    HardReset,
    TransitionToDefault,
    /// Give sink capabilities. The Mode indicates whether to send Sink_Capabilities (Spr)
    /// or EPR_Sink_Capabilities (Epr) per spec 8.3.3.3.10.
    GiveSinkCap(Mode, request::PowerSource),
    GiveSinkCapExtended(request::PowerSource),
    GiveManufacturerInfo(request::PowerSource),
    GiveRevision(request::PowerSource),
    GetSourceCap(Mode, request::PowerSource),
    HandleVdm(VdmPayload, request::PowerSource),
    SendVdm(Sop, VdmPayload, request::PowerSource),
    Bist(BistMode, request::PowerSource),
    /// The partner requested a swap; evaluate through the DPM and respond.
    EvaluateSwap(SwapKind, request::PowerSource),
    /// This side initiates a swap.
    SendSwap(SwapKind, request::PowerSource),
    /// A power role swap was agreed; wait for the old source to shut down.
    PrSwapStandby(request::PowerSource),
    /// A VConn swap was agreed; drive the VConn handover.
    VconnSwapTransition(request::PowerSource),
    /// The DFP initiated a USB4 Data_Reset.
    DataResetReceived(request::PowerSource),

    // EPR states
    EprModeEntry(request::PowerSource, units::Power),
    EprEntryWaitForResponse(request::PowerSource),
    EprWaitForCapabilities(request::PowerSource),
    EprSendExit,
    EprExitReceived(request::PowerSource),
    EprKeepAlive(request::PowerSource),
}

/// The result of a completed policy engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// A power role swap completed; the port shall restart the engine in the
    /// source role.
    PowerRoleSwap,
}

/// Implementation of the sink policy engine.
/// See spec, [8.3.3.3]
#[derive(Debug)]
pub struct Sink<'a, DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> {
    device_policy_manager: &'a mut DPM,
    pub(crate) protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    config: &'a PortConfig,
    contract: Contract,
    hard_reset_counter: Counter,
    source_capabilities: Option<SourceCapabilities>,
    mode: Mode,
    pub(crate) state: State,
    /// Set while a contract negotiation is in flight, reported on Ready entry.
    pending_contract_status: Option<ContractStatus>,
    /// Tracks whether a Get_Source_Cap request is pending.
    /// Per USB PD Spec R3.2 Section 8.3.3.3.8, in EPR mode, receiving a
    /// Source_Capabilities message that was not requested via Get_Source_Cap
    /// shall trigger a Hard Reset.
    get_source_cap_pending: bool,
    /// Whether this port currently sources VConn.
    vconn_source: bool,

    _timer: PhantomData<TIMER>,
}

/// Errors that can occur in the sink policy engine state machine.
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

impl<'a, DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> Sink<'a, DRIVER, TIMER, DPM> {
    /// Create a fresh protocol layer with initial state.
    fn new_protocol_layer(driver: DRIVER) -> ProtocolLayer<DRIVER, TIMER> {
        let header = Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X);
        ProtocolLayer::new(driver, header)
    }

    /// Create a new sink policy engine with a given `driver`.
    pub fn new(driver: DRIVER, device_policy_manager: &'a mut DPM, config: &'a PortConfig) -> Self {
        Self {
            device_policy_manager,
            protocol_layer: Self::new_protocol_layer(driver),
            config,
            state: State::Discovery,
            contract: Default::default(),
            hard_reset_counter: Counter::new(crate::counters::CounterType::HardReset),
            source_capabilities: None,
            mode: Mode::Spr,
            pending_contract_status: None,
            get_source_cap_pending: false,
            vconn_source: false,
            _timer: PhantomData,
        }
    }

    async fn notify(&mut self, event: AppEvent) {
        self.device_policy_manager.handle_event(event).await;
    }

    /// Run a single step in the policy engine state machine.
    pub(crate) async fn run_step(&mut self) -> Result<Option<Outcome>, Error> {
        let result = self.update_state().await;
        if let Ok(outcome) = result {
            return Ok(outcome);
        }

        if let Err(Error::Protocol(protocol_error)) = result {
            let mode = self.mode;
            let state = self.state.clone();
            let new_state = match (&mode, &state, protocol_error) {
                // Handle when hard reset is signaled by the driver itself.
                (_, _, ProtocolError::RxError(RxError::HardReset) | ProtocolError::TxError(TxError::HardReset)) => {
                    self.notify(AppEvent::HardResetReceived).await;
                    Some(State::TransitionToDefault)
                }

                // Handle when soft reset is signaled by the driver itself.
                (_, _, ProtocolError::RxError(RxError::SoftReset(sop))) => Some(State::SoftReset(sop)),

                // Per spec 6.3.13: If the Soft_Reset Message fails, a Hard Reset shall be initiated.
                // This handles the case where we're trying to send/receive a soft reset and it fails.
                (_, State::SoftReset(_) | State::SendSoftReset, ProtocolError::TransmitRetriesExceeded(_)) => {
                    Some(State::HardReset)
                }

                // Per spec 8.3.3.3.3: SinkWaitCapTimer timeout triggers Hard Reset.
                (_, State::WaitForCapabilities, ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                    Some(State::HardReset)
                }

                // Per spec 8.3.3.3.5: SenderResponseTimer timeout triggers Hard Reset.
                (_, State::SelectCapability(_), ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                    self.notify(AppEvent::SenderResponseTimeout).await;
                    Some(State::HardReset)
                }

                // PS_RDY of the old source did not arrive during a power role
                // swap; per spec 8.3.3.6.3.3 this demands a Hard Reset.
                (_, State::PrSwapStandby(_), ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                    Some(State::HardReset)
                }

                // Per USB PD Spec R3.2 Section 8.3.3.3.6 and Table 6.72:
                // Any Protocol Error during power transition (PE_SNK_Transition_Sink state)
                // shall trigger a Hard Reset, not a Soft Reset.
                (_, State::TransitionSink(_), _) => {
                    self.pending_contract_status = Some(ContractStatus::PsRdyNotReceived);
                    Some(State::HardReset)
                }

                // Unexpected messages indicate a protocol error and demand a soft reset.
                // Per spec 6.8.1 Table 6.72 (for non-power-transitioning states).
                // Note: This must come AFTER the TransitionSink check above.
                (_, _, ProtocolError::UnexpectedMessage) => Some(State::SendSoftReset),

                // Per spec Table 6.72: Unsupported messages in Ready state get Not_Supported response.
                (_, State::Ready(power_source, _), ProtocolError::RxError(RxError::UnsupportedMessage)) => {
                    Some(State::SendNotSupported(*power_source))
                }

                // Per spec 6.6.9.1: Transmission failure (no GoodCRC after retries) triggers Soft Reset.
                // Note: If we're in SoftReset/SendSoftReset state, this is caught above and escalates to Hard Reset.
                (_, _, ProtocolError::TransmitRetriesExceeded(_) | ProtocolError::ChunkSequenceError) => {
                    Some(State::SendSoftReset)
                }

                // Unhandled protocol errors - log and continue.
                // Note: Unrequested Source_Capabilities in EPR mode is handled in Ready state
                // by checking get_source_cap_pending flag (per spec 8.3.3.3.8).
                (_, _, error) => {
                    error!("Protocol error {:?} in sink state transition", error);
                    None
                }
            };

            if let Some(state) = new_state {
                self.state = state
            }

            Ok(None)
        } else {
            error!("Unrecoverable result {:?} in sink state transition", result);
            result
        }
    }

    /// Run the sink's state machine continuously.
    ///
    /// The loop is only broken by role-change outcomes and unrecoverable
    /// errors, for example if the port partner is unresponsive.
    pub async fn run(&mut self) -> Result<Outcome, Error> {
        loop {
            if let Some(outcome) = self.run_step().await? {
                return Ok(outcome);
            }
        }
    }

    /// Wait for source capabilities message (either Source_Capabilities or EPR_Source_Capabilities).
    ///
    /// Per USB PD Spec R3.2 Section 8.3.3.3.3 (PE_SNK_Wait_for_Capabilities):
    /// - In SPR Mode: Source_Capabilities Message is received
    /// - In EPR Mode: EPR_Source_Capabilities Message is received
    ///
    /// EPR Mode persists through Soft Reset (unlike Hard Reset which exits EPR per spec 6.8.3.2).
    /// Per spec section 6.4.1.2.2, after a Soft Reset while in EPR Mode, the source sends
    /// EPR_Source_Capabilities. Therefore this function must handle both message types.
    async fn wait_for_source_capabilities(
        protocol_layer: &mut ProtocolLayer<DRIVER, TIMER>,
    ) -> Result<SourceCapabilities, Error> {
        let message = protocol_layer.wait_for_source_capabilities().await?;
        trace!("Source capabilities: {:?}", message);

        let capabilities = match message.payload {
            Some(Payload::Data(Data::SourceCapabilities(caps))) => caps,
            Some(Payload::Extended(extended::Extended::EprSourceCapabilities(pdos))) => SourceCapabilities::new(pdos),
            _ => unreachable!(),
        };

        Ok(capabilities)
    }

    async fn update_state(&mut self) -> Result<Option<Outcome>, Error> {
        let state = self.state.clone();
        let new_state = match &state {
            State::Startup => {
                self.contract = Default::default();
                self.protocol_layer.reset();
                self.mode = Mode::Spr;

                State::Discovery
            }
            State::Discovery => {
                self.protocol_layer.wait_for_vbus().await;
                self.source_capabilities = None;

                State::WaitForCapabilities
            }
            State::WaitForCapabilities => {
                State::EvaluateCapabilities(Self::wait_for_source_capabilities(&mut self.protocol_layer).await?)
            }
            State::EvaluateCapabilities(capabilities) => {
                // Sink now knows that it is attached.
                self.source_capabilities = Some(capabilities.clone());

                self.hard_reset_counter.reset();
                self.device_policy_manager.inform(capabilities).await;

                // In EPR mode, requests carry the PDO mirror and may select
                // object positions 8 and above.
                let request = match self.mode {
                    Mode::Epr => match request::PowerSource::new_epr_fixed(capabilities) {
                        Ok(request) => request,
                        Err(_) => {
                            self.device_policy_manager
                                .request(capabilities, self.config.pdo_selection)
                                .await
                        }
                    },
                    Mode::Spr => {
                        self.device_policy_manager
                            .request(capabilities, self.config.pdo_selection)
                            .await
                    }
                };

                State::SelectCapability(request)
            }
            State::SelectCapability(power_source) => {
                self.protocol_layer.request_power(*power_source).await?;

                let sender_response = self.protocol_layer.sender_response_timer();
                let message_type = self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Wait),
                            MessageType::Control(ControlMessageType::Reject),
                        ],
                        sender_response,
                    )
                    .await?
                    .header
                    .message_type();

                let MessageType::Control(control_message_type) = message_type else {
                    unreachable!()
                };

                match (self.contract, control_message_type) {
                    (_, ControlMessageType::Accept) => State::TransitionSink(*power_source),
                    (Contract::Safe5V, ControlMessageType::Wait | ControlMessageType::Reject) => {
                        self.pending_contract_status = Some(ContractStatus::RejectedByPartnerNoContract);
                        State::WaitForCapabilities
                    }
                    (Contract::Explicit, ControlMessageType::Reject) => {
                        self.pending_contract_status = Some(ContractStatus::RejectedByPartnerWithContract);
                        State::Ready(*power_source, false)
                    }
                    (Contract::Explicit, ControlMessageType::Wait) => {
                        // Per spec 8.3.3.3.7: On entry to Ready as result of Wait,
                        // initialize and run SinkRequestTimer.
                        State::Ready(*power_source, true)
                    }
                    _ => unreachable!(),
                }
            }
            State::TransitionSink(power_source) => {
                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::PsRdy)],
                        match self.mode {
                            Mode::Epr => TimerType::PSTransitionEpr,
                            Mode::Spr => TimerType::PSTransitionSpr,
                        },
                    )
                    .await?;

                self.contract = Contract::TransitionToExplicit;
                self.device_policy_manager.transition_power(power_source).await;

                let mismatch = matches!(
                    power_source,
                    PowerSource::FixedVariableSupply(rdo) if rdo.capability_mismatch()
                );
                self.pending_contract_status = Some(if mismatch {
                    ContractStatus::CapabilityMismatch
                } else {
                    ContractStatus::Successful
                });

                State::Ready(*power_source, false)
            }
            State::Ready(power_source, after_wait) => {
                self.contract = Contract::Explicit;

                if let Some(status) = self.pending_contract_status.take() {
                    self.notify(AppEvent::ContractNegotiationComplete {
                        status,
                        request: Some(*power_source),
                    })
                    .await;
                }

                // Timers serviced concurrently with reception and DPM events:
                // - SinkRequestTimer: per spec 8.3.3.3.7, after receiving Wait,
                //   wait tSinkRequest before allowing re-request.
                // - SinkPPSPeriodicTimer: re-request in SPR PPS mode.
                // - SinkEPRKeepAliveTimer: keep-alives in EPR mode.
                let receive_fut = self.protocol_layer.receive_message();
                let event_fut = self
                    .device_policy_manager
                    .get_event(self.source_capabilities.as_ref().unwrap());
                let pps_periodic_fut = async {
                    match power_source {
                        PowerSource::Pps(_) => TimerType::get_timer::<TIMER>(TimerType::SinkPPSPeriodic).await,
                        _ => core::future::pending().await,
                    }
                };
                let epr_keep_alive_fut = async {
                    match self.mode {
                        Mode::Epr => TimerType::get_timer::<TIMER>(TimerType::SinkEPRKeepAlive).await,
                        Mode::Spr => core::future::pending().await,
                    }
                };
                // Per spec 8.3.3.3.7: SinkRequestTimer runs concurrently when re-entering
                // Ready after a Wait response. On timeout, transition to SelectCapability.
                // Per spec 6.6.4.1: Ensures minimum tSinkRequest (100ms) delay before re-request.
                let sink_request_fut = async {
                    if *after_wait {
                        TimerType::get_timer::<TIMER>(TimerType::SinkRequest).await
                    } else {
                        core::future::pending().await
                    }
                };
                let timers_fut = async { select3(pps_periodic_fut, epr_keep_alive_fut, sink_request_fut).await };

                match select3(receive_fut, event_fut, timers_fut).await {
                    // A message was received.
                    Either3::First(message) => {
                        let message = message?;

                        match message.header.message_type() {
                            MessageType::Data(DataMessageType::SourceCapabilities) => {
                                // Per USB PD Spec R3.2 Section 8.3.3.3.8:
                                // In EPR Mode, if a Source_Capabilities Message is received that
                                // has not been requested using a Get_Source_Cap Message, trigger Hard Reset.
                                if self.mode == Mode::Epr && !self.get_source_cap_pending {
                                    State::HardReset
                                } else {
                                    let Some(Payload::Data(Data::SourceCapabilities(capabilities))) = message.payload
                                    else {
                                        unreachable!()
                                    };
                                    self.get_source_cap_pending = false;
                                    State::EvaluateCapabilities(capabilities)
                                }
                            }
                            MessageType::Extended(ExtendedMessageType::EprSourceCapabilities) => {
                                if let Some(Payload::Extended(extended::Extended::EprSourceCapabilities(pdos))) =
                                    message.payload
                                {
                                    self.get_source_cap_pending = false;
                                    let caps = SourceCapabilities::new(pdos);

                                    // Per spec 8.3.3.3.8: In EPR Mode, if EPR_Source_Capabilities
                                    // contains an EPR (A)PDO in positions 1-7 → Hard Reset
                                    if self.mode == Mode::Epr && caps.has_epr_pdo_in_spr_positions() {
                                        State::HardReset
                                    } else {
                                        State::EvaluateCapabilities(caps)
                                    }
                                } else {
                                    unreachable!()
                                }
                            }
                            MessageType::Data(DataMessageType::EprMode) => {
                                // Handle source exit notification.
                                State::EprExitReceived(*power_source)
                            }
                            // Per spec 8.3.3.3.7: Get_Sink_Cap → GiveSinkCap (send Sink_Capabilities)
                            MessageType::Control(ControlMessageType::GetSinkCap) => {
                                State::GiveSinkCap(Mode::Spr, *power_source)
                            }
                            MessageType::Control(ControlMessageType::GetSinkCapExtended) => {
                                State::GiveSinkCapExtended(*power_source)
                            }
                            MessageType::Control(ControlMessageType::GetRevision) => {
                                State::GiveRevision(*power_source)
                            }
                            MessageType::Control(ControlMessageType::Ping) => State::Ready(*power_source, false),
                            MessageType::Control(ControlMessageType::GotoMin) => {
                                // The source demands the minimum operating current.
                                State::TransitionSink(*power_source)
                            }
                            MessageType::Control(ControlMessageType::DrSwap) => {
                                State::EvaluateSwap(SwapKind::DataRole, *power_source)
                            }
                            MessageType::Control(ControlMessageType::PrSwap) => {
                                State::EvaluateSwap(SwapKind::PowerRole, *power_source)
                            }
                            MessageType::Control(ControlMessageType::VconnSwap) => {
                                State::EvaluateSwap(SwapKind::Vconn, *power_source)
                            }
                            MessageType::Control(ControlMessageType::DataReset) => {
                                State::DataResetReceived(*power_source)
                            }
                            MessageType::Data(DataMessageType::Alert) => {
                                if let Some(Payload::Data(Data::Alert(alert))) = message.payload {
                                    self.notify(AppEvent::AlertReceived(alert.0)).await;
                                }
                                State::Ready(*power_source, false)
                            }
                            MessageType::Data(DataMessageType::Bist) => {
                                if let Some(Payload::Data(Data::Bist(bist))) = message.payload {
                                    State::Bist(bist.mode(), *power_source)
                                } else {
                                    State::SendNotSupported(*power_source)
                                }
                            }
                            MessageType::Data(DataMessageType::VendorDefined) => {
                                if let Some(Payload::Data(Data::VendorDefined(payload))) = message.payload {
                                    State::HandleVdm(payload, *power_source)
                                } else {
                                    State::SendNotSupported(*power_source)
                                }
                            }
                            MessageType::Extended(ExtendedMessageType::GetManufacturerInfo) => {
                                State::GiveManufacturerInfo(*power_source)
                            }
                            // Per spec 8.3.3.3.7: EPR_Get_Sink_Cap → GiveSinkCap (send EPR_Sink_Capabilities)
                            MessageType::Extended(ExtendedMessageType::ExtendedControl) => {
                                if let Some(Payload::Extended(extended::Extended::ExtendedControl(ctrl))) =
                                    &message.payload
                                {
                                    if ctrl.message_type() == ExtendedControlMessageType::EprGetSinkCap {
                                        State::GiveSinkCap(Mode::Epr, *power_source)
                                    } else {
                                        State::SendNotSupported(*power_source)
                                    }
                                } else {
                                    State::SendNotSupported(*power_source)
                                }
                            }
                            _ => State::SendNotSupported(*power_source),
                        }
                    }
                    // Event from device policy manager.
                    Either3::Second(event) => match event {
                        Event::RequestSprSourceCapabilities => State::GetSourceCap(Mode::Spr, *power_source),
                        Event::RequestEprSourceCapabilities => State::GetSourceCap(Mode::Epr, *power_source),
                        Event::EnterEprMode(pdp) => State::EprModeEntry(*power_source, pdp),
                        Event::ExitEprMode => State::EprSendExit,
                        Event::RequestPower(power_source) => State::SelectCapability(power_source),
                        Event::HardReset => State::HardReset,
                        Event::SoftReset => State::SendSoftReset,
                        Event::DrSwap => State::SendSwap(SwapKind::DataRole, *power_source),
                        Event::PrSwap => State::SendSwap(SwapKind::PowerRole, *power_source),
                        Event::VconnSwap => State::SendSwap(SwapKind::Vconn, *power_source),
                        Event::SendVdm { sop, payload } => State::SendVdm(sop, payload, *power_source),
                        _ => State::Ready(*power_source, false),
                    },
                    // Timer timeout handling
                    Either3::Third(timeout_source) => match timeout_source {
                        // PPS periodic timeout -> select capability again as keep-alive.
                        Either3::First(_) => State::SelectCapability(*power_source),
                        // EPR keep-alive timeout
                        Either3::Second(_) => State::EprKeepAlive(*power_source),
                        // SinkRequest timeout -> re-request power after Wait response
                        Either3::Third(_) => State::SelectCapability(*power_source),
                    },
                }
            }
            State::SendNotSupported(power_source) => {
                // Not_Supported does not exist under PD 2.0; send Reject instead.
                let response = match self.protocol_layer.revision() {
                    SpecificationRevision::R3_X => ControlMessageType::NotSupported,
                    _ => ControlMessageType::Reject,
                };
                self.protocol_layer.transmit_control_message(response).await?;

                State::Ready(*power_source, false)
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

                State::WaitForCapabilities
            }
            State::SoftReset(sop) => {
                self.protocol_layer.reset_sop(*sop);

                self.protocol_layer
                    .transmit_control_message_sop(*sop, ControlMessageType::Accept)
                    .await?;

                State::WaitForCapabilities
            }
            State::HardReset => {
                // Per USB PD Spec R3.2 Section 8.3.3.3.8 (PE_SNK_Hard_Reset):
                // Entry conditions:
                // - PSTransitionTimer timeout (when HardResetCounter <= nHardResetCount)
                // - Hard reset request from Device Policy Manager
                // - EPR mode and EPR_Source_Capabilities message with EPR PDO in pos. 1..7
                // - Source_Capabilities message not requested by Get_Source_Cap
                // - SinkWaitCapTimer timeout (when HardResetCounter <= nHardResetCount)
                //
                // On entry: Request Hard Reset Signaling AND increment HardResetCounter

                // Increment counter first - returns Err when counter > nHardResetCount.
                // Per spec 8.3.3.3.8: If HardResetCounter > nHardResetCount (> 2),
                // the Sink shall assume that the Source is non-responsive.
                if self.hard_reset_counter.increment().is_err() {
                    return Err(Error::PortPartnerUnresponsive);
                }

                // Transmit Hard Reset Signaling
                self.protocol_layer.hard_reset().await?;
                self.notify(AppEvent::HardResetSent).await;

                State::TransitionToDefault
            }
            State::TransitionToDefault => {
                // Per USB PD Spec R3.2 Section 8.3.3.3.9 (PE_SNK_Transition_to_default):
                // Indicate the hard reset to the device, reset local hardware
                // to UFP/default power, then wait for the source to cycle VBus.
                self.device_policy_manager.hard_reset().await;

                // Reset protocol layer (per spec 6.8.3: "Protocol Layers shall be reset as for Soft Reset")
                self.protocol_layer.reset();

                // Hard Reset causes EPR Mode to be exited (spec 6.8.3.2).
                self.mode = Mode::Spr;
                self.contract = Contract::Safe5V;
                self.source_capabilities = None;

                // The source removes VBus within tSinkVBusTurnOff and restores
                // it within tSinkVBusTurnOn.
                if matches!(
                    select(
                        TimerType::get_timer::<TIMER>(TimerType::SinkVBusTurnOff),
                        self.protocol_layer.wait_for_vbus_off(),
                    )
                    .await,
                    Either::First(_)
                ) {
                    self.notify(AppEvent::UnexpectedVbusVoltage).await;
                }

                match select(
                    TimerType::get_timer::<TIMER>(TimerType::SinkVBusTurnOn),
                    self.protocol_layer.wait_for_vbus(),
                )
                .await
                {
                    Either::First(_) => return Err(Error::PortPartnerUnresponsive),
                    Either::Second(_) => {}
                }

                self.notify(AppEvent::HardResetComplete).await;

                State::Startup
            }
            State::GiveSinkCap(response_mode, power_source) => {
                // Per USB PD Spec R3.2 Section 8.3.3.3.10:
                // - Send Sink_Capabilities when Get_Sink_Cap was received
                // - Send EPR_Sink_Capabilities when EPR_Get_Sink_Cap was received
                let sink_caps = self.config.sink_capabilities();
                match response_mode {
                    Mode::Spr => {
                        self.protocol_layer.transmit_sink_capabilities(sink_caps).await?;
                    }
                    Mode::Epr => {
                        self.protocol_layer.transmit_epr_sink_capabilities(sink_caps).await?;
                    }
                }

                State::Ready(*power_source, false)
            }
            State::GiveSinkCapExtended(power_source) => {
                // The SKEDB response comes straight out of the configuration.
                if self.config.ext_snk_cap_enabled {
                    let blob = self.config.ext_snk_cap;
                    self.protocol_layer
                        .transmit_extended_chunked(ExtendedMessageType::SinkCapabilitiesExtended, &blob)
                        .await?;
                    State::Ready(*power_source, false)
                } else {
                    State::SendNotSupported(*power_source)
                }
            }
            State::GiveManufacturerInfo(power_source) => {
                let info = self.config.manufacturer_info();
                self.protocol_layer.transmit_manufacturer_info(&info).await?;

                State::Ready(*power_source, false)
            }
            State::GiveRevision(power_source) => {
                let revision = self.config.pd_revision_response;
                self.protocol_layer
                    .transmit_data_message(DataMessageType::Revision, Data::Revision(revision))
                    .await?;

                State::Ready(*power_source, false)
            }
            State::GetSourceCap(requested_mode, power_source) => {
                // Per USB PD Spec R3.2 Section 8.3.3.3.12 (PE_SNK_Get_Source_Cap):
                // - Send Get_Source_Cap (SPR) or EPR_Get_Source_Cap (EPR)
                // - Start SenderResponseTimer
                // - On timeout or mode mismatch → Ready
                // - On matching capabilities received → EvaluateCapabilities
                //
                // Set flag before sending to track that we requested source capabilities.
                // Per spec 8.3.3.3.8, in EPR mode, receiving an unrequested
                // Source_Capabilities message triggers a Hard Reset.
                self.get_source_cap_pending = true;

                match requested_mode {
                    Mode::Spr => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::GetSourceCap)
                            .await?;
                    }
                    Mode::Epr => {
                        self.protocol_layer
                            .transmit_extended_control_message(ExtendedControlMessageType::EprGetSourceCap)
                            .await?;
                    }
                };

                // Per spec 8.3.3.3.12: Use SenderResponseTimer (not SinkWaitCap)
                let sender_response = self.protocol_layer.sender_response_timer();
                let result = self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Data(DataMessageType::SourceCapabilities),
                            MessageType::Extended(ExtendedMessageType::EprSourceCapabilities),
                        ],
                        sender_response,
                    )
                    .await;

                self.get_source_cap_pending = false;

                // Per spec 8.3.3.3.12: On timeout, inform DPM and transition to Ready
                let message = match result {
                    Ok(msg) => msg,
                    Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        warn!("Get_Source_Cap timeout, returning to Ready");
                        self.notify(AppEvent::SenderResponseTimeout).await;
                        self.state = State::Ready(*power_source, false);
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                };

                // Per spec 8.3.3.3.12:
                // - In SPR mode + SPR caps requested + Source_Capabilities received → EvaluateCapabilities
                // - In EPR mode + EPR caps requested + EPR_Source_Capabilities received → EvaluateCapabilities
                // - Mode mismatch (e.g., EPR mode but SPR caps requested) → Ready
                let received_spr = matches!(
                    message.header.message_type(),
                    MessageType::Data(DataMessageType::SourceCapabilities)
                );
                let received_epr = matches!(
                    message.header.message_type(),
                    MessageType::Extended(ExtendedMessageType::EprSourceCapabilities)
                );

                let mode_matches = (*requested_mode == Mode::Spr && self.mode == Mode::Spr && received_spr)
                    || (*requested_mode == Mode::Epr && self.mode == Mode::Epr && received_epr);

                // Extract capabilities from the message
                let capabilities = match message.payload {
                    Some(Payload::Data(Data::SourceCapabilities(caps))) => caps,
                    Some(Payload::Extended(extended::Extended::EprSourceCapabilities(pdos))) => {
                        SourceCapabilities::new(pdos)
                    }
                    _ => unreachable!(),
                };

                self.device_policy_manager.inform(&capabilities).await;

                if mode_matches {
                    State::EvaluateCapabilities(capabilities)
                } else {
                    State::Ready(*power_source, false)
                }
            }
            State::HandleVdm(payload, power_source) => {
                // Alternate modes live in the application; the stack only
                // relays the exchange.
                match self.device_policy_manager.evaluate_vdm(payload).await {
                    Some(response) => State::SendVdm(Sop::Sop, response, *power_source),
                    None => State::Ready(*power_source, false),
                }
            }
            State::SendVdm(sop, payload, power_source) => {
                self.protocol_layer.transmit_vdm(*sop, payload.clone()).await?;
                State::Ready(*power_source, false)
            }
            State::Bist(bist_mode, power_source) => match bist_mode {
                BistMode::CarrierMode2 => {
                    // The PHY transmits the carrier pattern for tBISTContMode.
                    self.notify(AppEvent::BistCarrierMode).await;
                    TimerType::get_timer::<TIMER>(TimerType::BISTContMode).await;
                    State::Ready(*power_source, false)
                }
                BistMode::TestData => {
                    // Swallow all traffic until the partner hard resets.
                    self.notify(AppEvent::BistTestData).await;
                    loop {
                        match self.protocol_layer.receive_message().await {
                            Ok(_) => continue,
                            Err(err) => return Err(Error::Protocol(err)),
                        }
                    }
                }
                BistMode::SharedTestModeEntry | BistMode::SharedTestModeExit if self.config.bist_stm_enabled => {
                    // Shared-capacity test mode only changes billboard state;
                    // acknowledge by returning to Ready.
                    State::Ready(*power_source, false)
                }
                _ => State::SendNotSupported(*power_source),
            },
            State::EvaluateSwap(kind, power_source) => {
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
                                let new_role = self.data_role().flipped();
                                self.protocol_layer.update_roles(PowerRole::Sink, new_role);
                                self.notify(AppEvent::DrSwapComplete).await;
                                State::Ready(*power_source, false)
                            }
                            SwapKind::Vconn => State::VconnSwapTransition(*power_source),
                            SwapKind::PowerRole => State::PrSwapStandby(*power_source),
                        }
                    }
                    SwapResponse::Wait => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Wait)
                            .await?;
                        State::Ready(*power_source, false)
                    }
                    SwapResponse::Reject => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Reject)
                            .await?;
                        State::Ready(*power_source, false)
                    }
                    SwapResponse::NotSupported => State::SendNotSupported(*power_source),
                }
            }
            State::SendSwap(kind, power_source) => {
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
                            let new_role = self.data_role().flipped();
                            self.protocol_layer.update_roles(PowerRole::Sink, new_role);
                            self.notify(AppEvent::DrSwapComplete).await;
                            State::Ready(*power_source, false)
                        }
                        SwapKind::Vconn => State::VconnSwapTransition(*power_source),
                        SwapKind::PowerRole => State::PrSwapStandby(*power_source),
                    },
                    _ => {
                        if *kind == SwapKind::Vconn {
                            self.notify(AppEvent::VconnSwapFailed).await;
                        }
                        State::Ready(*power_source, false)
                    }
                }
            }
            State::PrSwapStandby(_power_source) => {
                // Per spec 8.3.3.6.3.2: the initial source sends PS_RDY once
                // VBus reaches vSafe0V; until then this side must not change
                // its own supply state.
                self.protocol_layer
                    .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::PSSourceOff)
                    .await?;

                self.device_policy_manager.enable_sink(false).await;
                self.protocol_layer.update_roles(PowerRole::Source, self.data_role());

                // The engine restarts in the source role; it applies VBus and
                // sends PS_RDY after tSwapSourceStart.
                return Ok(Some(Outcome::PowerRoleSwap));
            }
            State::VconnSwapTransition(power_source) => {
                if self.vconn_source {
                    // Hand over: the partner turns VConn on and sends PS_RDY.
                    self.protocol_layer
                        .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::VCONNOn)
                        .await?;
                    self.device_policy_manager.set_vconn(false).await;
                    self.vconn_source = false;
                } else {
                    // Take over: turn VConn on, then send PS_RDY.
                    self.device_policy_manager.set_vconn(true).await;
                    TimerType::get_timer::<TIMER>(TimerType::VCONNOff).await;
                    self.vconn_source = true;
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::PsRdy)
                        .await?;
                }

                self.notify(AppEvent::VconnSwapComplete).await;
                State::Ready(*power_source, false)
            }
            State::DataResetReceived(power_source) => {
                // Per spec 8.3.3.27.2: accept, bounce VConn as the VConn
                // source dictates, and wait for Data_Reset_Complete.
                self.notify(AppEvent::DataResetReceived).await;
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::Accept)
                    .await?;

                if self.vconn_source {
                    self.device_policy_manager.set_vconn(false).await;
                    TimerType::get_timer::<TIMER>(TimerType::VCONNOff).await;
                    self.device_policy_manager.set_vconn(true).await;
                }

                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::DataResetComplete)],
                        TimerType::DataResetComplete,
                    )
                    .await?;

                self.notify(AppEvent::DataResetComplete).await;
                State::Ready(*power_source, false)
            }
            State::EprModeEntry(power_source, operational_pdp) => {
                // Request entry into EPR mode.
                // Per spec 8.3.3.26.2.1 (PE_SNK_Send_EPR_Mode_Entry), sink sends EPR_Mode (Enter)
                // and starts SenderResponseTimer and SinkEPREnterTimer.
                //
                // Per spec 6.4.10, the Data field shall be set to the EPR Sink Operational PDP.
                if !self.config.epr_sink_enabled() {
                    self.device_policy_manager
                        .epr_mode_entry_failed(epr_mode::DataEnterFailed::UnknownCause)
                        .await;
                    self.state = State::Ready(*power_source, false);
                    return Ok(None);
                }

                if !self
                    .source_capabilities
                    .as_ref()
                    .map(SourceCapabilities::epr_mode_capable)
                    .unwrap_or(false)
                {
                    self.device_policy_manager
                        .epr_mode_entry_failed(epr_mode::DataEnterFailed::EprCapableBitNotSetInPdo)
                        .await;
                    self.state = State::Ready(*power_source, false);
                    return Ok(None);
                }

                let pdp_watts: u8 = operational_pdp.get::<watt>() as u8;
                self.protocol_layer.transmit_epr_mode(Action::Enter, pdp_watts).await?;

                // Wait for EnterAcknowledged with SenderResponseTimer (spec step 9-14)
                let sender_response = self.protocol_layer.sender_response_timer();
                let message = self
                    .protocol_layer
                    .receive_message_type(&[MessageType::Data(DataMessageType::EprMode)], sender_response)
                    .await?;

                let Some(Payload::Data(Data::EprMode(epr_mode_data))) = message.payload else {
                    unreachable!()
                };

                match epr_mode_data.action() {
                    Action::EnterAcknowledged => {
                        // Source acknowledged, now wait for EnterSucceeded
                        State::EprEntryWaitForResponse(*power_source)
                    }
                    Action::EnterSucceeded => {
                        // Source skipped EnterAcknowledged and went directly to EnterSucceeded
                        self.mode = Mode::Epr;
                        self.notify(AppEvent::EprModeEntered).await;
                        State::EprWaitForCapabilities(*power_source)
                    }
                    Action::Exit => State::EprExitReceived(*power_source),
                    Action::EnterFailed => {
                        // Per spec 8.3.3.26.2.1: EnterFailed → Soft Reset
                        // Notify DPM of the failure reason before soft reset
                        let reason = epr_mode::DataEnterFailed::from(epr_mode_data.data());
                        self.notify(AppEvent::EprModeEntryFailed(reason)).await;
                        self.device_policy_manager.epr_mode_entry_failed(reason).await;
                        State::SendSoftReset
                    }
                    // Per spec 8.3.3.26.2.1: any other EPR_Mode message → Soft Reset
                    _ => State::SendSoftReset,
                }
            }
            State::EprEntryWaitForResponse(power_source) => {
                // Wait for EnterSucceeded after receiving EnterAcknowledged.
                // Per spec 8.3.3.26.2.2 (PE_SNK_EPR_Mode_Wait_For_Response), use SinkEPREnterTimer
                // for the overall timeout while source performs cable discovery.
                let message = self
                    .protocol_layer
                    .receive_message_type(&[MessageType::Data(DataMessageType::EprMode)], TimerType::SinkEPREnter)
                    .await?;

                let Some(Payload::Data(Data::EprMode(epr_mode_data))) = message.payload else {
                    unreachable!()
                };

                match epr_mode_data.action() {
                    Action::EnterSucceeded => {
                        // EPR mode entry succeeded. Per spec Table 8.39 step 21-29,
                        // source will automatically send EPR_Source_Capabilities after this.
                        self.mode = Mode::Epr;
                        self.notify(AppEvent::EprModeEntered).await;
                        State::EprWaitForCapabilities(*power_source)
                    }
                    Action::Exit => State::EprExitReceived(*power_source),
                    Action::EnterFailed => {
                        // Per spec 8.3.3.26.2.2: EnterFailed → Soft Reset
                        // Notify DPM of the failure reason before soft reset
                        let reason = epr_mode::DataEnterFailed::from(epr_mode_data.data());
                        self.notify(AppEvent::EprModeEntryFailed(reason)).await;
                        self.device_policy_manager.epr_mode_entry_failed(reason).await;
                        State::SendSoftReset
                    }
                    // Per spec 8.3.3.26.2.2: any other EPR_Mode message → Soft Reset
                    _ => State::SendSoftReset,
                }
            }
            State::EprWaitForCapabilities(_power_source) => {
                // After successful EPR mode entry, source automatically sends EPR_Source_Capabilities.
                // This may be a chunked extended message that requires assembly.
                // Wait for the capabilities and evaluate them.
                let message = self.protocol_layer.wait_for_source_capabilities().await?;

                match message.payload {
                    Some(Payload::Data(Data::SourceCapabilities(capabilities))) => {
                        State::EvaluateCapabilities(capabilities)
                    }
                    Some(Payload::Extended(extended::Extended::EprSourceCapabilities(pdos))) => {
                        State::EvaluateCapabilities(SourceCapabilities::new(pdos))
                    }
                    _ => {
                        error!("Expected source capabilities after EPR mode entry");
                        State::HardReset
                    }
                }
            }
            State::EprSendExit => {
                // Inform partner we are exiting EPR.
                self.protocol_layer.transmit_epr_mode(Action::Exit, 0).await?;
                self.mode = Mode::Spr;
                self.notify(AppEvent::EprModeExited).await;
                State::WaitForCapabilities
            }
            State::EprExitReceived(power_source) => {
                // Per USB PD Spec R3.2 Section 8.3.3.26.4.2 (PE_SNK_EPR_Mode_Exit_Received):
                // - If in an Explicit Contract with an SPR (A)PDO → WaitForCapabilities
                // - If NOT in an Explicit Contract with an SPR (A)PDO → HardReset
                //
                // SPR PDOs are in object positions 1-7, EPR PDOs are in positions 8+.
                // In EPR mode, requests use EprRequest which contains the RDO with object position.
                self.mode = Mode::Spr;
                self.notify(AppEvent::EprModeExited).await;

                let is_epr_pdo_contract = match power_source {
                    PowerSource::EprRequest(epr) => epr.object_position() >= 8,
                    // Non-EprRequest variants are only used in SPR mode, so always SPR PDOs
                    _ => false,
                };

                if is_epr_pdo_contract {
                    State::HardReset
                } else {
                    State::WaitForCapabilities
                }
            }
            State::EprKeepAlive(power_source) => {
                // Per spec 8.3.3.3.11 (PE_SNK_EPR_Keep_Alive):
                // - Entry: Send EPR_KeepAlive message, start SenderResponseTimer
                // - On EPR_KeepAlive_Ack: transition to Ready (which restarts SinkEPRKeepAliveTimer)
                // - On timeout: transition to HardReset
                self.protocol_layer
                    .transmit_extended_control_message(ExtendedControlMessageType::EprKeepAlive)
                    .await?;

                let sender_response = self.protocol_layer.sender_response_timer();
                match self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Extended(ExtendedMessageType::ExtendedControl)],
                        sender_response,
                    )
                    .await
                {
                    Ok(message) => {
                        if let Some(Payload::Extended(extended::Extended::ExtendedControl(control))) = message.payload {
                            if control.message_type() == ExtendedControlMessageType::EprKeepAliveAck {
                                self.mode = Mode::Epr;
                                State::Ready(*power_source, false)
                            } else {
                                State::SendNotSupported(*power_source)
                            }
                        } else {
                            State::SendNotSupported(*power_source)
                        }
                    }
                    Err(_) => State::HardReset,
                }
            }
        };

        self.state = new_state;

        Ok(None)
    }

    fn data_role(&self) -> DataRole {
        self.protocol_layer.data_role()
    }
}
