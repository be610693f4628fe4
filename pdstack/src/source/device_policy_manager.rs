//! The source-side device policy manager: power supply arbitration and
//! policy decisions for a port that sources power.
use core::future::Future;

use pdstack_traits::Sop;

use crate::SwapResponse;
use crate::events::EventHandler;
use crate::protocol_layer::message::data::alert::AlertDataObject;
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::vendor_defined::VdmPayload;
use crate::units::{ElectricCurrent, ElectricPotential};

/// Verdict of the device policy manager on a sink's request.
///
/// The policy engine has already validated the request against the advertised
/// capabilities; this is the application's veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestStatus {
    /// Accept the request.
    Accept,
    /// Reject the request.
    Reject,
    /// The request cannot be met right now; the sink shall retry.
    Wait,
}

/// Events that the device policy manager can send to the source policy
/// engine.
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    /// Empty event.
    None,
    /// The source capabilities changed; advertise them anew.
    CapabilitiesChanged,
    /// Request the partner's sink capabilities.
    GetSinkCapabilities,
    /// Initiate a hard reset.
    HardReset,
    /// Initiate a soft reset towards the partner.
    SoftReset,
    /// Initiate a data role swap.
    DrSwap,
    /// Initiate a power role swap.
    PrSwap,
    /// Initiate a VConn swap.
    VconnSwap,
    /// Announce an imminent loss of power through Fast Role Swap signalling.
    FrSwap,
    /// Initiate a USB4 Data_Reset (DFP only).
    DataReset,
    /// Raise an Alert towards the sink.
    SendAlert(AlertDataObject),
    /// Send a vendor-defined message.
    SendVdm {
        /// The SOP target.
        sop: Sop,
        /// VDM header and data objects.
        payload: VdmPayload,
    },
}

/// Trait for the source-side device policy manager.
///
/// All methods have defaults; `impl DevicePolicyManager for MySource {}`
/// accepts every structurally valid request and controls no real supply.
/// Stack events arrive through the [`EventHandler`] supertrait.
pub trait DevicePolicyManager: EventHandler {
    /// The application's veto over a structurally valid request.
    fn evaluate_request(&mut self, _request: &PowerSource) -> impl Future<Output = RequestStatus> {
        async { RequestStatus::Accept }
    }

    /// Program the supply output for an accepted request.
    fn set_supply(
        &mut self,
        _voltage: ElectricPotential,
        _current: ElectricCurrent,
    ) -> impl Future<Output = ()> {
        async {}
    }

    /// Enable or disable the VBus output.
    fn enable_source(&mut self, _enabled: bool) -> impl Future<Output = ()> {
        async {}
    }

    /// Discharge VBus towards vSafe0V, e.g. during hard reset recovery.
    fn discharge_vbus(&mut self, _enabled: bool) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device of a hard reset; the supply returns to vSafe5V.
    fn hard_reset(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Evaluate a data role swap request from the partner.
    fn evaluate_dr_swap(&mut self) -> impl Future<Output = SwapResponse> {
        async { SwapResponse::Accept }
    }

    /// Evaluate a power role swap request from the partner.
    ///
    /// Only consulted when the port configuration is dual-role.
    fn evaluate_pr_swap(&mut self) -> impl Future<Output = SwapResponse> {
        async { SwapResponse::Accept }
    }

    /// Evaluate a VConn swap request from the partner.
    fn evaluate_vconn_swap(&mut self) -> impl Future<Output = SwapResponse> {
        async { SwapResponse::Accept }
    }

    /// Enable or disable the VConn supply.
    fn set_vconn(&mut self, _enabled: bool) -> impl Future<Output = ()> {
        async {}
    }

    /// Whether the supply can deliver the extended power range.
    ///
    /// Consulted during EPR mode entry, on top of the cable and RDO gates.
    fn evaluate_epr_entry(&mut self, _operational_pdp_watts: u8) -> impl Future<Output = bool> {
        async { true }
    }

    /// Handle a vendor-defined message; return a response to transmit, if any.
    fn evaluate_vdm(&mut self, _payload: &VdmPayload) -> impl Future<Output = Option<VdmPayload>> {
        async { None }
    }

    /// The policy engine gets and evaluates device policy events when ready.
    ///
    /// By default, this is a future that never resolves. The method must be
    /// cancellation safe.
    fn get_event(&mut self) -> impl Future<Output = Event> {
        async { core::future::pending().await }
    }
}
