//! The device policy manager (DPM) allows a device to control the policy engine, and be informed about status changes.
//!
//! For example, through the DPM, a device can request certain source capabilities (voltage, current),
//! or renegotiate the power contract.
use core::future::Future;

use pdstack_traits::Sop;

use crate::SwapResponse;
use crate::events::EventHandler;
use crate::protocol_layer::message::data::request::{self, PdoSelection};
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::data::vendor_defined::VdmPayload;
use crate::protocol_layer::message::data::epr_mode::DataEnterFailed;
use crate::units;

/// Events that the device policy manager can send to the policy engine.
///
/// This is the asynchronous form of a port command buffer: at most one event
/// is consumed at a time, and its outcome is reported through
/// [`DevicePolicyManager::handle_event`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    /// Empty event.
    None,
    /// Request SPR source capabilities.
    RequestSprSourceCapabilities,
    /// Request EPR source capabilities.
    ///
    /// See [8.3.3.8.1]
    RequestEprSourceCapabilities,
    /// Request a certain power level.
    RequestPower(request::PowerSource),
    /// Enter EPR mode with the given operational PDP.
    EnterEprMode(units::Power),
    /// Exit EPR mode.
    ExitEprMode,
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
    /// Send a vendor-defined message.
    SendVdm {
        /// The SOP target.
        sop: Sop,
        /// VDM header and data objects.
        payload: VdmPayload,
    },
}

/// Trait for the sink-side device policy manager.
///
/// This entity commands the policy engine and enforces device policy. All
/// methods have conservative defaults, so `impl DevicePolicyManager for MySink {}`
/// yields a functioning 5 V sink. Stack events arrive through the
/// [`EventHandler`] supertrait.
pub trait DevicePolicyManager: EventHandler {
    /// Inform the device about source capabilities, e.g. after a request.
    fn inform(&mut self, _source_capabilities: &SourceCapabilities) -> impl Future<Output = ()> {
        async {}
    }

    /// Request a power source.
    ///
    /// The default implementation picks a fixed PDO per the configured
    /// selection strategy, falling back to the vSafe5V supply.
    fn request(
        &mut self,
        source_capabilities: &SourceCapabilities,
        strategy: PdoSelection,
    ) -> impl Future<Output = request::PowerSource> {
        async move {
            match request::PowerSource::new_fixed_with_strategy(strategy, source_capabilities) {
                Ok(request) => request,
                Err(_) => request::PowerSource::new_fixed(
                    request::CurrentRequest::Highest,
                    request::VoltageRequest::Safe5V,
                    source_capabilities,
                )
                .unwrap_or(request::PowerSource::Unknown(request::RawDataObject(0).with_object_position(1))),
            }
        }
    }

    /// Notify the device that it shall transition to a new power level.
    ///
    /// The device is informed about the request that was accepted by the source.
    fn transition_power(&mut self, _accepted: &request::PowerSource) -> impl Future<Output = ()> {
        async {}
    }

    /// Enable or disable the sink power path.
    fn enable_sink(&mut self, _enabled: bool) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device of a hard reset; it shall transition to vSafe5V
    /// operation.
    fn hard_reset(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device that EPR mode entry failed.
    fn epr_mode_entry_failed(&mut self, _reason: DataEnterFailed) -> impl Future<Output = ()> {
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

    /// Handle a vendor-defined message; return a response to transmit, if any.
    fn evaluate_vdm(&mut self, _payload: &VdmPayload) -> impl Future<Output = Option<VdmPayload>> {
        async { None }
    }

    /// The policy engine gets and evaluates device policy events when ready.
    ///
    /// By default, this is a future that never resolves.
    ///
    /// <div class="warning">
    /// The function must be safe to cancel. To determine whether your own methods are cancellation safe,
    /// look for the location of uses of .await. This is because when an asynchronous method is cancelled,
    /// that always happens at an .await. If your function behaves correctly even if it is restarted while waiting
    /// at an .await, then it is cancellation safe.
    /// </div>
    fn get_event(&mut self, _source_capabilities: &SourceCapabilities) -> impl Future<Output = Event> {
        async { core::future::pending().await }
    }
}
