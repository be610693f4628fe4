//! Timers that are used by the protocol layer, the policy engines and the
//! Type-C connection state machine.
use core::future::Future;

use crate::protocol_layer::message::header::SpecificationRevision;

/// Provider of protocol timeouts.
///
/// Implement this over your platform's time source, e.g. `embassy-time` or a
/// [`crate::soft_timer::SoftTimer`] pool driven from a 1 ms tick.
pub trait Timer {
    /// Resolve after the given number of milliseconds.
    fn after_millis(milliseconds: u64) -> impl Future<Output = ()>;
}

/// Protocol timeouts.
///
/// Values are the nominal ones from USB PD R3.2 [Table 6.68] and USB Type-C
/// R2.2 [Table 4.30].
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerType {
    /// tBISTContMode, carrier mode hold time.
    BISTContMode,
    /// tCableMessage spacing between cable discovery attempts (tCblDscId).
    CableDiscovery,
    /// tCCDebounce, entry into attached states.
    CCDebounce,
    /// tChunkingNotSupported.
    ChunkingNotSupported,
    /// tChunkSenderRequest, wait for the next chunk after requesting it.
    ChunkSenderRequest,
    /// tChunkSenderResponse, wait for a chunk request after sending a chunk.
    ChunkSenderResponse,
    /// tReceive, wait for GoodCRC after transmission.
    CRCReceive,
    /// tDataReset.
    DataReset,
    /// tDataResetComplete.
    DataResetComplete,
    /// DFP-side settling delay before Data_Reset_Complete is sent.
    DataResetDfpDelay,
    /// tDRPTry, holding the preferred role during Try.SRC/Try.SNK.
    DRPTry,
    /// tErrorRecovery, CC lines held open.
    ErrorRecovery,
    /// tFRSwap5V, bound on VBus removal during Fast Role Swap.
    FRSwap,
    /// tHardResetComplete.
    HardResetComplete,
    /// tHardReset, message queue flush before hard reset signalling.
    HardResetTx,
    /// tNoResponse, bound on first-ever partner response.
    NoResponse,
    /// tPDDebounce, exit from attached states and attach re-verification.
    PDDebounce,
    /// tPSHardReset.
    PSHardReset,
    /// tPSSourceOff, old source supply removal during PR_Swap.
    PSSourceOff,
    /// tPSSourceOn, new source supply application during PR_Swap.
    PSSourceOn,
    /// tPSTransition while in SPR mode (sink waiting for PS_RDY).
    PSTransitionSpr,
    /// tPSTransition while in EPR mode.
    PSTransitionEpr,
    /// tRdDebounce.
    RdDebounce,
    /// tSenderResponse under PD 2.0.
    SenderResponse2_0,
    /// tSenderResponse under PD 3.x.
    SenderResponse3_X,
    /// tSinkEPREnter, overall EPR entry bound.
    SinkEPREnter,
    /// tSinkEPRKeepAlive, sink-side keep-alive period.
    SinkEPRKeepAlive,
    /// Periodic re-request while operating from a PPS supply.
    SinkPPSPeriodic,
    /// tSinkRequest, delay before re-requesting after a Wait.
    SinkRequest,
    /// tSinkTx, collision avoidance hold after SinkTxNG.
    SinkTx,
    /// Sink-side bound on VBus removal during hard reset.
    SinkVBusTurnOff,
    /// Sink-side bound on VBus restoration after hard reset.
    SinkVBusTurnOn,
    /// tTypeCSinkWaitCap.
    SinkWaitCap,
    /// tTypeCSendSourceCap, retry period for Source_Capabilities.
    SourceCapability,
    /// Source CC detach debounce (tSrcDisconnect).
    SourceDisconnect,
    /// tSourceEPRKeepAlive, source-side keep-alive supervision.
    SourceEPRKeepAlive,
    /// Bound on PPS communication before the source hard resets.
    SourcePPSComm,
    /// tSrcRecover after a hard reset in SPR mode.
    SourceRecover,
    /// tSrcRecover after a hard reset in EPR mode.
    SourceRecoverEpr,
    /// Source supply settling bound for an SPR transition (tPSSrcTrans).
    SourceTransitionSpr,
    /// Source supply settling bound for an EPR fixed transition.
    SourceTransitionEpr,
    /// tSwapSourceStart.
    SwapSourceStart,
    /// tTryTimeout, Try.SRC/Try.SNK fall-through.
    TryTimeout,
    /// tVBusOff, bound on VBus reaching vSafe0V.
    VBusOff,
    /// tVBusOn for an SPR contract.
    VBusOn,
    /// tVBusOn for an EPR contract.
    VBusOnEpr,
    /// tVCONNSourceDischarge.
    VCONNDischarge,
    /// tVCONNSourceOff.
    VCONNOff,
    /// tVCONNSourceOn.
    VCONNOn,
    /// tVDMSenderResponse.
    VDMResponse,
}

impl TimerType {
    /// The nominal timeout in milliseconds.
    pub const fn value_ms(self) -> u64 {
        match self {
            TimerType::BISTContMode => 45,
            TimerType::CableDiscovery => 49,
            TimerType::CCDebounce => 140,
            TimerType::ChunkingNotSupported => 45,
            TimerType::ChunkSenderRequest => 27,
            TimerType::ChunkSenderResponse => 27,
            TimerType::CRCReceive => 3,
            TimerType::DataReset => 220,
            TimerType::DataResetComplete => 250,
            TimerType::DataResetDfpDelay => 225,
            TimerType::DRPTry => 110,
            TimerType::ErrorRecovery => 250,
            TimerType::FRSwap => 15,
            TimerType::HardResetComplete => 5,
            TimerType::HardResetTx => 20,
            TimerType::NoResponse => 5000,
            TimerType::PDDebounce => 11,
            TimerType::PSHardReset => 27,
            TimerType::PSSourceOff => 900,
            TimerType::PSSourceOn => 450,
            TimerType::PSTransitionSpr => 500,
            TimerType::PSTransitionEpr => 925,
            TimerType::RdDebounce => 12,
            TimerType::SenderResponse2_0 => 27,
            TimerType::SenderResponse3_X => 30,
            TimerType::SinkEPREnter => 500,
            TimerType::SinkEPRKeepAlive => 375,
            TimerType::SinkPPSPeriodic => 5000,
            TimerType::SinkRequest => 100,
            TimerType::SinkTx => 18,
            TimerType::SinkVBusTurnOff => 750,
            TimerType::SinkVBusTurnOn => 1300,
            TimerType::SinkWaitCap => 400,
            TimerType::SourceCapability => 180,
            TimerType::SourceDisconnect => 2,
            TimerType::SourceEPRKeepAlive => 900,
            TimerType::SourcePPSComm => 13500,
            TimerType::SourceRecover => 800,
            TimerType::SourceRecoverEpr => 1250,
            TimerType::SourceTransitionSpr => 400,
            TimerType::SourceTransitionEpr => 860,
            TimerType::SwapSourceStart => 20,
            TimerType::TryTimeout => 800,
            TimerType::VBusOff => 625,
            TimerType::VBusOn => 275,
            TimerType::VBusOnEpr => 700,
            TimerType::VCONNDischarge => 200,
            TimerType::VCONNOff => 25,
            TimerType::VCONNOn => 100,
            TimerType::VDMResponse => 27,
        }
    }

    /// tSenderResponse for the given specification revision.
    pub const fn sender_response(revision: SpecificationRevision) -> Self {
        match revision {
            SpecificationRevision::R1_0 | SpecificationRevision::R2_0 => TimerType::SenderResponse2_0,
            SpecificationRevision::R3_X => TimerType::SenderResponse3_X,
        }
    }

    /// Get a timeout future for a given timer type.
    pub fn get_timer<TIMER: Timer>(timer_type: TimerType) -> impl Future<Output = ()> {
        TIMER::after_millis(timer_type.value_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::{SpecificationRevision, TimerType};

    #[test]
    fn sender_response_follows_revision() {
        assert_eq!(
            TimerType::sender_response(SpecificationRevision::R2_0).value_ms(),
            27
        );
        assert_eq!(
            TimerType::sender_response(SpecificationRevision::R3_X).value_ms(),
            30
        );
    }
}
