//! Implements dummy drivers, timers and policy managers for testing.
use std::future::pending;
use std::vec::Vec;

use pdstack_traits::{CcDriver, CcPull, CcState, Driver, Sop};
use uom::si::power::watt;

use crate::protocol_layer::message::Message;
use crate::protocol_layer::message::data::source_capabilities::{
    Augmented, FixedSupply, PowerDataObject, SprProgrammablePowerSupply,
};
use crate::sink::device_policy_manager::{DevicePolicyManager as SinkDevicePolicyManager, Event as SinkEvent};
use crate::source::device_policy_manager::DevicePolicyManager as SourceDevicePolicyManager;
use crate::timers::Timer;
use crate::units;

/// Maximum frame size the dummy driver transports.
pub const MAX_DATA_MESSAGE_SIZE: usize = 272;

/// A dummy sink device that implements the sink device policy manager.
pub struct DummySinkDevice {}

impl crate::events::EventHandler for DummySinkDevice {}
impl SinkDevicePolicyManager for DummySinkDevice {}

/// A dummy sink device that requests EPR mode entry once it is ready.
pub struct DummySinkEprDevice {
    entry_requested: bool,
}

impl DummySinkEprDevice {
    pub fn new() -> Self {
        Self {
            entry_requested: false,
        }
    }
}

impl crate::events::EventHandler for DummySinkEprDevice {}

impl SinkDevicePolicyManager for DummySinkEprDevice {
    async fn get_event(
        &mut self,
        _source_capabilities: &crate::protocol_layer::message::data::source_capabilities::SourceCapabilities,
    ) -> SinkEvent {
        if !self.entry_requested {
            self.entry_requested = true;
            SinkEvent::EnterEprMode(units::Power::new::<watt>(140))
        } else {
            pending().await
        }
    }
}

/// A dummy source device that implements the source device policy manager.
pub struct DummySourceDevice {}

impl crate::events::EventHandler for DummySourceDevice {}
impl SourceDevicePolicyManager for DummySourceDevice {}

/// A dummy timer that never fires.
pub struct DummyTimer {}

impl Timer for DummyTimer {
    async fn after_millis(_milliseconds: u64) {
        // Never time out
        pending().await
    }
}

/// A timer whose timeouts all fire immediately.
///
/// Useful for driving debounce and retry windows to completion in one poll.
pub struct InstantTimer {}

impl Timer for InstantTimer {
    async fn after_millis(_milliseconds: u64) {}
}

/// A timer that stays pending for one poll, then fires.
///
/// In `select` races this lets ready work (queued receive data, pending
/// events) win against the timeout, while unattended windows still elapse.
pub struct YieldTimer {}

struct YieldOnce {
    yielded: bool,
}

impl core::future::Future for YieldOnce {
    type Output = ();

    fn poll(mut self: core::pin::Pin<&mut Self>, cx: &mut core::task::Context<'_>) -> core::task::Poll<()> {
        if self.yielded {
            core::task::Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            core::task::Poll::Pending
        }
    }
}

impl Timer for YieldTimer {
    fn after_millis(_milliseconds: u64) -> impl core::future::Future<Output = ()> {
        YieldOnce { yielded: false }
    }
}

/// One receive-queue entry of the dummy driver.
enum RxEntry<const N: usize> {
    Frame(Sop, heapless::Vec<u8, N>),
    HardReset,
}

/// A dummy driver for testing.
pub struct DummyDriver<const N: usize> {
    rx_vec: Vec<RxEntry<N>>,
    tx_vec: Vec<(Sop, heapless::Vec<u8, N>)>,
}

impl<const N: usize> DummyDriver<N> {
    /// Create a new dummy driver.
    pub fn new() -> Self {
        Self {
            rx_vec: Vec::new(),
            tx_vec: Vec::new(),
        }
    }

    /// Inject received data that the stack consumes later.
    pub fn inject_received_data(&mut self, sop: Sop, data: &[u8]) {
        let mut vec = heapless::Vec::new();
        vec.extend_from_slice(data).unwrap();

        self.rx_vec.push(RxEntry::Frame(sop, vec));
    }

    /// Inject hard reset signalling from the partner.
    pub fn inject_hard_reset(&mut self) {
        self.rx_vec.push(RxEntry::HardReset);
    }

    /// Probe raw data that was transmitted by the stack.
    pub fn probe_transmitted_data(&mut self) -> (Sop, heapless::Vec<u8, N>) {
        self.tx_vec.remove(0)
    }

    /// Probe a transmitted frame, parsed back into a message.
    pub fn probe_transmitted_message(&mut self) -> (Sop, Message) {
        let (sop, data) = self.probe_transmitted_data();
        (sop, Message::from_bytes(&data).unwrap())
    }

    /// Whether any transmitted frames remain unprobed.
    pub fn has_transmitted_data(&self) -> bool {
        !self.tx_vec.is_empty()
    }
}

impl<const N: usize> Driver for DummyDriver<N> {
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<(Sop, usize), pdstack_traits::DriverRxError> {
        if self.rx_vec.is_empty() {
            // Pend until the test injects more data and polls again.
            pending::<()>().await;
        }

        match self.rx_vec.remove(0) {
            RxEntry::HardReset => Err(pdstack_traits::DriverRxError::HardReset),
            RxEntry::Frame(sop, first) => {
                let len = first.len();
                buffer[..len].copy_from_slice(&first);

                Ok((sop, len))
            }
        }
    }

    async fn transmit(&mut self, sop: Sop, data: &[u8]) -> Result<(), pdstack_traits::DriverTxError> {
        let mut vec = heapless::Vec::new();
        vec.extend_from_slice(data).unwrap();
        self.tx_vec.push((sop, vec));

        Ok(())
    }

    async fn transmit_hard_reset(&mut self) -> Result<(), pdstack_traits::DriverTxError> {
        // Do nothing.
        Ok(())
    }

    async fn wait_for_vbus(&self) {
        // Do nothing.
    }
}

/// A scriptable CC line driver with static line readings.
pub struct DummyCcDriver {
    cc1: CcState,
    cc2: CcState,
    vbus: bool,
    pulls: Vec<CcPull>,
}

impl DummyCcDriver {
    pub fn new() -> Self {
        Self {
            cc1: CcState::Open,
            cc2: CcState::Open,
            vbus: false,
            pulls: Vec::new(),
        }
    }

    /// Set the readings of both CC lines.
    pub fn set_line_state(&mut self, cc1: CcState, cc2: CcState) {
        self.cc1 = cc1;
        self.cc2 = cc2;
    }

    /// Set VBus presence.
    pub fn set_vbus(&mut self, present: bool) {
        self.vbus = present;
    }

    /// The terminations the state machine applied, in order.
    pub fn applied_pulls(&self) -> &[CcPull] {
        &self.pulls
    }
}

impl CcDriver for DummyCcDriver {
    async fn set_pull(&mut self, pull: CcPull) {
        self.pulls.push(pull);
    }

    async fn cc_state(&mut self) -> (CcState, CcState) {
        (self.cc1, self.cc2)
    }

    async fn wait_for_cc_change(&mut self) {
        // The line state is static within one test step.
        pending().await
    }

    async fn vbus_present(&mut self) -> bool {
        self.vbus
    }

    async fn wait_for_vbus_change(&mut self) {
        pending().await
    }
}

/// Dummy capabilities to deserialize.
///
/// - Fixed 5 V at 3 A
/// - Fixed 9 V at 3 A
/// - Fixed 15 V at 3 A
/// - Fixed 20 V at 2.25 A
/// - PPS 3.3-11 V at 5 A
/// - PPS 3.3-16 V at 3 A
/// - PPS 3.3-21 V at 2.25 A
pub const DUMMY_CAPABILITIES: [u8; 30] = [
    0xA1, // Header
    0x71, // Header
    0x2c, // +
    0x91, // | Fixed 5V @ 3A
    0x01, // |
    0x08, // +
    0x2c, // +
    0xD1, // |
    0x02, // | Fixed 9V @ 3A
    0x00, // +
    0x2C, // +
    0xB1, // |
    0x04, // | Fixed 15V @ 3A
    0x00, // +
    0xE1, // +
    0x40, // |
    0x06, // | Fixed 20V @ 2.25A
    0x00, // +
    0x64, // +
    0x21, // |
    0xDC, // | PPS 3.3-11V @ 5A
    0xC8, // +
    0x3C, // +
    0x21, // |
    0x40, // | PPS 3.3-16V @ 3A
    0xC9, // +
    0x2D, // +
    0x21, // |
    0xA4, // | PPS 3.3-21V @ 2.25A
    0xC9, // +
];

/// Get dummy source capabilities for testing.
///
/// Corresponds to the `DUMMY_CAPABILITIES` above.
pub fn get_dummy_source_capabilities() -> Vec<PowerDataObject> {
    let mut pdos: Vec<PowerDataObject> = Vec::new();
    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::default()
            .with_raw_voltage(100)
            .with_raw_max_current(300)
            .with_unconstrained_power(true),
    ));

    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::default().with_raw_voltage(180).with_raw_max_current(300),
    ));

    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::default().with_raw_voltage(300).with_raw_max_current(300),
    ));

    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::default().with_raw_voltage(400).with_raw_max_current(225),
    ));

    pdos.push(PowerDataObject::Augmented(Augmented::Spr(
        SprProgrammablePowerSupply::default()
            .with_raw_max_current(100)
            .with_raw_min_voltage(33)
            .with_raw_max_voltage(110)
            .with_pps_power_limited(true),
    )));

    pdos.push(PowerDataObject::Augmented(Augmented::Spr(
        SprProgrammablePowerSupply::default()
            .with_raw_max_current(60)
            .with_raw_min_voltage(33)
            .with_raw_max_voltage(160)
            .with_pps_power_limited(true),
    )));

    pdos.push(PowerDataObject::Augmented(Augmented::Spr(
        SprProgrammablePowerSupply::default()
            .with_raw_max_current(45)
            .with_raw_min_voltage(33)
            .with_raw_max_voltage(210)
            .with_pps_power_limited(true),
    )));

    pdos
}

/// Build a Source_Capabilities frame as the partner source would send it.
pub fn build_source_caps_frame(pdos: &[PowerDataObject], message_id: u8) -> heapless::Vec<u8, 64> {
    use crate::counters::{Counter, CounterType};
    use crate::protocol_layer::message::data::Data;
    use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
    use crate::protocol_layer::message::header::{DataMessageType, Header, SpecificationRevision};
    use crate::{DataRole, PowerRole};

    let capabilities = SourceCapabilities::new(pdos.iter().copied().collect());
    let template = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);
    let header = Header::new_data(
        template,
        Counter::new_from_value(CounterType::MessageId, message_id),
        DataMessageType::SourceCapabilities,
        capabilities.num_objects(),
    );

    let mut buf = [0u8; 64];
    let size = Message::new_with_data(header, Data::SourceCapabilities(capabilities)).to_bytes(&mut buf);

    let mut frame = heapless::Vec::new();
    frame.extend_from_slice(&buf[..size]).unwrap();
    frame
}

#[cfg(test)]
mod tests {
    use pdstack_traits::{Driver, Sop};

    use crate::dummy::DummyDriver;

    #[tokio::test]
    async fn test_receive() {
        let mut driver: DummyDriver<30> = DummyDriver::new();

        let mut injected_data = [0u8; 30];
        injected_data[0] = 123;

        driver.inject_received_data(Sop::Sop, &injected_data);

        injected_data[1] = 255;
        driver.inject_received_data(Sop::SopPrime, &injected_data);

        let mut buf = [0u8; 30];
        let (sop, _) = driver.receive(&mut buf).await.unwrap();

        assert_eq!(sop, Sop::Sop);
        assert_eq!(buf[0], 123);
        assert_eq!(buf[1], 0);

        let mut buf = [0u8; 30];
        let (sop, _) = driver.receive(&mut buf).await.unwrap();

        assert_eq!(sop, Sop::SopPrime);
        assert_eq!(buf[0], 123);
        assert_eq!(buf[1], 255);
    }
}
