//! Hardware abstraction traits for the `pdstack` USB Power Delivery stack.
//!
//! Two traits connect the stack to a board:
//! - [`Driver`] wraps the PD PHY (BMC transceiver) and moves framed messages,
//! - [`CcDriver`] wraps the CC/VBUS front end that the Type-C connection
//!   state machine senses and drives.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
use core::future::Future;

/// Receive Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverRxError {
    /// Received message discarded, e.g. due to CRC errors.
    Discarded,

    /// Hard Reset received before or during reception.
    HardReset,
}

/// Transmit Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverTxError {
    /// Concurrent receive in progress or excessive noise on the line.
    Discarded,

    /// Hard Reset received before or during transmission.
    HardReset,
}

/// Start-of-packet classes, addressing the port partner or a cable marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sop {
    /// SOP, addressed at the port partner.
    #[default]
    Sop,
    /// SOP', addressed at the near-end cable marker.
    SopPrime,
    /// SOP'', addressed at the far-end cable marker.
    SopDoublePrime,
}

impl Sop {
    /// Index into per-SOP state tables.
    pub const fn index(self) -> usize {
        match self {
            Sop::Sop => 0,
            Sop::SopPrime => 1,
            Sop::SopDoublePrime => 2,
        }
    }
}

/// Driver trait, through which the protocol layer talks to the PHY.
pub trait Driver {
    /// If this is `true`, the protocol layer will not send its own
    /// GoodCRC messages and will instead rely on the hardware.
    const HAS_AUTO_GOOD_CRC: bool = false;

    /// If this is `true`, the hardware automatically retries transmission
    /// when no GoodCRC is received. The protocol layer then skips its own
    /// retry loop.
    const HAS_AUTO_RETRY: bool = false;

    /// Wait for availability of VBus voltage.
    fn wait_for_vbus(&self) -> impl Future<Output = ()>;

    /// Wait for VBus to reach vSafe0V, e.g. during a hard reset.
    ///
    /// Drivers without VBus removal sensing may leave the default, which
    /// resolves immediately.
    fn wait_for_vbus_off(&self) -> impl Future<Output = ()> {
        async {}
    }

    /// Receive a packet, reporting its SOP class and length.
    fn receive(&mut self, buffer: &mut [u8]) -> impl Future<Output = Result<(Sop, usize), DriverRxError>>;

    /// Transmit a packet towards the given SOP target.
    fn transmit(&mut self, sop: Sop, data: &[u8]) -> impl Future<Output = Result<(), DriverTxError>>;

    /// Transmit a hard reset signal.
    fn transmit_hard_reset(&mut self) -> impl Future<Output = Result<(), DriverTxError>>;

    /// Transmit the Fast Role Swap signal.
    ///
    /// Only ports that enable FRS in their configuration call this.
    fn transmit_fast_role_swap(&mut self) -> impl Future<Output = Result<(), DriverTxError>> {
        async { Err(DriverTxError::Discarded) }
    }
}

impl<T: Driver> Driver for &mut T {
    const HAS_AUTO_GOOD_CRC: bool = T::HAS_AUTO_GOOD_CRC;
    const HAS_AUTO_RETRY: bool = T::HAS_AUTO_RETRY;

    async fn wait_for_vbus(&self) {
        T::wait_for_vbus(self).await
    }

    async fn wait_for_vbus_off(&self) {
        T::wait_for_vbus_off(self).await
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<(Sop, usize), DriverRxError> {
        T::receive(self, buffer).await
    }

    async fn transmit(&mut self, sop: Sop, data: &[u8]) -> Result<(), DriverTxError> {
        T::transmit(self, sop, data).await
    }

    async fn transmit_hard_reset(&mut self) -> Result<(), DriverTxError> {
        T::transmit_hard_reset(self).await
    }

    async fn transmit_fast_role_swap(&mut self) -> Result<(), DriverTxError> {
        T::transmit_fast_role_swap(self).await
    }
}

/// Termination presented on a CC line by this port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcPull {
    /// No termination, line floating.
    Open,
    /// Rd pull-down, presenting as a sink.
    Sink,
    /// Rp pull-up at the given current advertisement, presenting as a source.
    Source(RpLevel),
}

/// Rp current advertisement levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RpLevel {
    /// Default USB current (900 mA for USB 3.x).
    #[default]
    Default,
    /// 1.5 A.
    Rp1A5,
    /// 3.0 A.
    Rp3A0,
}

/// Voltage class sensed on a single CC line.
///
/// As a source (presenting Rp), the far end reads back as `Open`, `Ra` or
/// `Rd`. As a sink (presenting Rd), the far end reads back as `Open` or one
/// of the `Rp*` advertisement levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcState {
    /// Line floating.
    Open,
    /// Powered-cable/accessory termination.
    Ra,
    /// Sink termination.
    Rd,
    /// Source advertising default current.
    RpDefault,
    /// Source advertising 1.5 A.
    Rp1A5,
    /// Source advertising 3.0 A.
    Rp3A0,
}

impl CcState {
    /// Whether this reading indicates an attached sink, as seen by a source.
    pub const fn is_rd(self) -> bool {
        matches!(self, CcState::Rd)
    }

    /// Whether this reading indicates an attached source, as seen by a sink.
    pub const fn is_rp(self) -> bool {
        matches!(self, CcState::RpDefault | CcState::Rp1A5 | CcState::Rp3A0)
    }
}

/// Plug orientation, derived from which CC line carries the termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Polarity {
    /// CC1 is the active configuration channel.
    #[default]
    Cc1,
    /// CC2 is the active configuration channel.
    Cc2,
}

/// CC/VBUS front end, sensed and driven by the Type-C connection state machine.
pub trait CcDriver {
    /// Present the given termination on both CC lines.
    fn set_pull(&mut self, pull: CcPull) -> impl Future<Output = ()>;

    /// Read the momentary state of both CC lines, `(CC1, CC2)`.
    fn cc_state(&mut self) -> impl Future<Output = (CcState, CcState)>;

    /// Wait for any change on the CC lines.
    fn wait_for_cc_change(&mut self) -> impl Future<Output = ()>;

    /// Whether VBus is above vSafe5V minimum.
    fn vbus_present(&mut self) -> impl Future<Output = bool>;

    /// Wait for a VBus presence change.
    fn wait_for_vbus_change(&mut self) -> impl Future<Output = ()>;

    /// Source VConn on the CC line opposite to the active one.
    fn set_vconn(&mut self, polarity: Polarity, enabled: bool) -> impl Future<Output = ()> {
        let _ = (polarity, enabled);
        async {}
    }
}

impl<T: CcDriver> CcDriver for &mut T {
    async fn set_pull(&mut self, pull: CcPull) {
        T::set_pull(self, pull).await
    }

    async fn cc_state(&mut self) -> (CcState, CcState) {
        T::cc_state(self).await
    }

    async fn wait_for_cc_change(&mut self) {
        T::wait_for_cc_change(self).await
    }

    async fn vbus_present(&mut self) -> bool {
        T::vbus_present(self).await
    }

    async fn wait_for_vbus_change(&mut self) {
        T::wait_for_vbus_change(self).await
    }

    async fn set_vconn(&mut self, polarity: Polarity, enabled: bool) {
        T::set_vconn(self, polarity, enabled).await
    }
}
