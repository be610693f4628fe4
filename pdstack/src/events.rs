//! Events signalled to the application.
//!
//! The application event callback is the single observable channel of the
//! stack; everything the port does is reported through [`AppEvent`].
use pdstack_traits::{RpLevel, Sop};

use crate::PowerRole;
use crate::protocol_layer::message::data::epr_mode::DataEnterFailed;
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::vendor_defined::CableIdentity;

/// Outcome of a contract negotiation, reported with
/// [`AppEvent::ContractNegotiationComplete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ContractStatus {
    /// An explicit contract is in place.
    Successful,
    /// A contract is in place, but the sink flagged a capability mismatch.
    CapabilityMismatch,
    /// This port rejected the request; the previous contract remains valid.
    RejectedContractValid,
    /// This port rejected the request and the previous contract is void.
    RejectedContractNotValid,
    /// This port rejected the request and no contract existed before.
    RejectedNoContract,
    /// The partner rejected the request while an explicit contract existed.
    RejectedByPartnerWithContract,
    /// The partner rejected the request without an explicit contract.
    RejectedByPartnerNoContract,
    /// PS_RDY was not received after Accept.
    PsRdyNotReceived,
    /// PS_RDY could not be sent after Accept.
    PsRdyNotSent,
}

/// Hardware fault classes surfaced through the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FaultKind {
    /// VBus over-voltage.
    VbusOvp,
    /// VBus over-current.
    VbusOcp,
    /// VBus under-voltage.
    VbusUvp,
    /// VBus short-circuit.
    VbusScp,
    /// VBus reverse current.
    VbusRcp,
    /// VConn over-current.
    VconnOcp,
    /// Over-voltage on a CC line.
    CcOvp,
    /// Over-voltage on an SBU line.
    SbuOvp,
    /// Over-temperature.
    OverTemperature,
}

/// Result reported for a port command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandResult {
    /// The sequence was aborted, e.g. by detach or hard reset.
    Aborted,
    /// The command failed to transmit.
    Failed,
    /// No response arrived in time.
    Timeout,
    /// The command was sent; no response is expected.
    Sent,
    /// The expected response arrived.
    ResponseReceived,
}

/// Receiver of stack events.
///
/// Implemented by the application alongside the role-specific
/// `DevicePolicyManager` traits; the default discards all events.
pub trait EventHandler {
    /// Handle an event from the stack.
    fn handle_event(&mut self, event: AppEvent) -> impl core::future::Future<Output = ()> {
        let _ = event;
        async {}
    }
}

/// Events that are signalled to the application.
#[derive(Debug, Clone)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AppEvent {
    /// Unexpected high voltage seen on VBus.
    UnexpectedVbusVoltage,
    /// Type-C error recovery initiated.
    ErrorRecovery,
    /// Type-C AttachWait state entered.
    AttachWait,
    /// Type-C transition from AttachWait back to Unattached.
    AttachWaitToUnattached,
    /// Type-C attach detected, before PD negotiation.
    Attach {
        /// The power role established by the attach.
        power_role: PowerRole,
    },
    /// A connection (attach, possibly PD contract) is established.
    Connect,
    /// Type-C detach detected.
    Disconnect,
    /// Cable (EMCA) discovery finished successfully.
    CableDetected(CableIdentity),
    /// Cable (EMCA) discovery timed out.
    CableNotDetected,
    /// The Rp termination advertised by the partner source changed.
    RpChange(RpLevel),
    /// Rp removal detected while in the Attached.SNK state.
    RpDetach,
    /// Hard Reset received.
    HardResetReceived,
    /// Hard Reset sent by this port.
    HardResetSent,
    /// Hard Reset processing completed.
    HardResetComplete,
    /// Soft Reset sent by this port on the given SOP class.
    SoftResetSent(Sop),
    /// Cable Reset sent.
    CableResetSent,
    /// The policy engine was disabled.
    PolicyEngineDisabled,
    /// A PD message was received that the stack does not consume itself.
    PacketReceived,
    /// Contract negotiation completed.
    ContractNegotiationComplete {
        /// Outcome of the negotiation.
        status: ContractStatus,
        /// The request that concluded the negotiation, where applicable.
        request: Option<PowerSource>,
    },
    /// A PD sink device attached while this port sources power.
    SinkDeviceConnected,
    /// Source_Capabilities went unanswered for the final time; the partner
    /// is considered non-PD.
    SourceCapsTriedWithNoResponse,
    /// Sender response timeout occurred.
    SenderResponseTimeout,
    /// No response was received within tNoResponse.
    NoResponseTimeout,
    /// PR_Swap completed; this port now has the given role.
    PrSwapComplete(PowerRole),
    /// DR_Swap completed.
    DrSwapComplete,
    /// VConn swap completed.
    VconnSwapComplete,
    /// A VConn swap attempt failed.
    VconnSwapFailed,
    /// FR_Swap completed.
    FrSwapComplete,
    /// An Alert message was received.
    AlertReceived(u32),
    /// BIST carrier mode was entered.
    BistCarrierMode,
    /// BIST test-data mode was entered; traffic stops until hard reset.
    BistTestData,
    /// EPR mode entry was requested by the sink.
    EprModeEntryReceived,
    /// EPR mode entry succeeded.
    EprModeEntered,
    /// EPR mode entry failed with the given cause.
    EprModeEntryFailed(DataEnterFailed),
    /// EPR mode was exited.
    EprModeExited,
    /// A USB4 Data_Reset was received.
    DataResetReceived,
    /// A USB4 Data_Reset was sent.
    DataResetSent,
    /// The Data_Reset sequence completed.
    DataResetComplete,
    /// USB4 entry completed.
    Usb4EntryComplete,
    /// A hardware fault was reported.
    Fault(FaultKind),
    /// The stack configuration is unusable.
    ConfigError,
    /// The port is power cycling.
    PowerCycle,
    /// Outcome of the in-flight port command.
    ///
    /// Specific completions are additionally reported through their own
    /// events, e.g. [`AppEvent::ContractNegotiationComplete`] or
    /// [`AppEvent::DrSwapComplete`].
    Command(CommandResult),
}
