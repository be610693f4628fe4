//! Definitions of vendor-defined message (VDM) content.
//!
//! The stack itself only originates Discover_Identity towards cable markers;
//! other structured and unstructured VDMs pass through to the application.
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use proc_bitfield::bitfield;

use crate::protocol_layer::message::header::SpecificationRevision;

/// Standard and well-known vendor IDs carried in VDM headers.
pub mod svid {
    /// The standard ID (PD SID).
    pub const STANDARD: u16 = 0xFF00;
    /// DisplayPort alternate mode.
    pub const DISPLAYPORT: u16 = 0xFF01;
    /// Thunderbolt alternate mode.
    pub const THUNDERBOLT: u16 = 0x8087;
    /// Apple.
    pub const APPLE: u16 = 0x05AC;
    /// Infineon / Cypress.
    pub const INFINEON: u16 = 0x04B4;
}

/// VDM type (bit 15 of the VDM header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmType {
    /// Unstructured VDM, payload defined by the vendor.
    Unstructured,
    /// Structured VDM, payload defined by the PD specification.
    Structured,
}

impl From<VdmType> for bool {
    fn from(value: VdmType) -> Self {
        matches!(value, VdmType::Structured)
    }
}

impl From<bool> for VdmType {
    fn from(value: bool) -> Self {
        match value {
            true => VdmType::Structured,
            false => VdmType::Unstructured,
        }
    }
}

/// Structured VDM commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum VdmCommand {
    DiscoverIdentity,
    DiscoverSvids,
    DiscoverModes,
    EnterMode,
    ExitMode,
    Attention,
    DisplayPortStatus,
    DisplayPortConfig,
    /// A reserved or SVID-specific command this stack does not interpret.
    ///
    /// Partner-controlled; unknown codes decode here so malformed VDMs are
    /// ignored or NAKed instead of faulting the engine.
    Reserved(u8),
}

impl From<VdmCommand> for u8 {
    fn from(value: VdmCommand) -> Self {
        match value {
            VdmCommand::DiscoverIdentity => 0x1,
            VdmCommand::DiscoverSvids => 0x2,
            VdmCommand::DiscoverModes => 0x3,
            VdmCommand::EnterMode => 0x4,
            VdmCommand::ExitMode => 0x5,
            VdmCommand::Attention => 0x6,
            VdmCommand::DisplayPortStatus => 0x10,
            VdmCommand::DisplayPortConfig => 0x11,
            VdmCommand::Reserved(other) => other,
        }
    }
}

impl From<u8> for VdmCommand {
    fn from(value: u8) -> Self {
        match value {
            0x01 => VdmCommand::DiscoverIdentity,
            0x02 => VdmCommand::DiscoverSvids,
            0x03 => VdmCommand::DiscoverModes,
            0x04 => VdmCommand::EnterMode,
            0x05 => VdmCommand::ExitMode,
            0x06 => VdmCommand::Attention,
            0x10 => VdmCommand::DisplayPortStatus,
            0x11 => VdmCommand::DisplayPortConfig,
            other => VdmCommand::Reserved(other),
        }
    }
}

/// Structured VDM command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmCommandType {
    /// Command request from the initiator.
    InitiatorReq,
    /// Responder acknowledges the command.
    ResponderAck,
    /// Responder rejects the command.
    ResponderNak,
    /// Responder is busy; the initiator may retry.
    ResponderBsy,
}

impl From<VdmCommandType> for u8 {
    fn from(value: VdmCommandType) -> Self {
        match value {
            VdmCommandType::InitiatorReq => 0,
            VdmCommandType::ResponderAck => 1,
            VdmCommandType::ResponderNak => 2,
            VdmCommandType::ResponderBsy => 3,
        }
    }
}

impl From<u8> for VdmCommandType {
    fn from(value: u8) -> Self {
        // The command type is a two-bit field.
        match value & 0b11 {
            0 => VdmCommandType::InitiatorReq,
            1 => VdmCommandType::ResponderAck,
            2 => VdmCommandType::ResponderNak,
            _ => VdmCommandType::ResponderBsy,
        }
    }
}

bitfield! {
    /// The common fields of structured and unstructured VDM headers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct VdmHeaderRaw(pub u32): FromStorage, IntoStorage {
        /// VDM Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// VDM Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
    }
}

bitfield! {
    /// A structured VDM header.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmHeaderStructured(pub u32): FromStorage, IntoStorage {
        /// VDM Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// VDM Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
        /// Structured VDM version, major
        pub vdm_version_major: u8 @ 13..=14,
        /// Structured VDM version, minor
        pub vdm_version_minor: u8 @ 11..=12,
        /// Object Position
        pub object_position: u8 @ 8..=10,
        /// Command Type
        pub command_type: u8 [VdmCommandType] @ 6..=7,
        /// Command
        pub command: u8 [VdmCommand] @ 0..=4,
    }
}

impl Default for VdmHeaderStructured {
    fn default() -> Self {
        VdmHeaderStructured(0).with_vdm_type(VdmType::Structured)
    }
}

impl VdmHeaderStructured {
    /// Serialize to a buffer.
    pub fn to_bytes(self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.0);
    }

    /// Build a Discover_Identity request towards a cable marker.
    ///
    /// The structured VDM version advertised follows the negotiated spec
    /// revision: 2.0 under PD 3.x, 1.0 under PD 2.0.
    pub fn discover_identity(revision: SpecificationRevision) -> Self {
        let version_major = match revision {
            SpecificationRevision::R1_0 | SpecificationRevision::R2_0 => 0b00,
            SpecificationRevision::R3_X => 0b01,
        };

        Self::default()
            .with_standard_or_vid(svid::STANDARD)
            .with_vdm_version_major(version_major)
            .with_command_type(VdmCommandType::InitiatorReq)
            .with_command(VdmCommand::DiscoverIdentity)
    }
}

bitfield! {
    /// An unstructured VDM header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmHeaderUnstructured(pub u32): FromStorage, IntoStorage {
        /// Vdm Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// Vdm Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
        /// Message defined
        pub data: u16 @ 0..=14
    }
}

impl VdmHeaderUnstructured {
    /// Serialize to a buffer.
    pub fn to_bytes(self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.0);
    }
}

/// A VDM header of either type.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VdmHeader {
    /// A structured header.
    Structured(VdmHeaderStructured),
    /// An unstructured header.
    Unstructured(VdmHeaderUnstructured),
}

impl VdmHeader {
    /// Serialize to a buffer.
    pub fn to_bytes(self, buf: &mut [u8]) {
        match self {
            VdmHeader::Structured(header) => header.to_bytes(buf),
            VdmHeader::Unstructured(header) => header.to_bytes(buf),
        }
    }
}

impl From<VdmHeader> for u32 {
    fn from(value: VdmHeader) -> Self {
        match value {
            VdmHeader::Structured(header) => header.0,
            VdmHeader::Unstructured(header) => header.0,
        }
    }
}

impl From<u32> for VdmHeader {
    fn from(value: u32) -> Self {
        let header = VdmHeaderRaw(value);
        match header.vdm_type() {
            VdmType::Structured => VdmHeader::Structured(VdmHeaderStructured(value)),
            VdmType::Unstructured => VdmHeader::Unstructured(VdmHeaderUnstructured(value)),
        }
    }
}

/// Product types a UFP or cable marker can report in its ID header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SopProductType {
    /// Not a UFP or undefined.
    Undefined,
    /// PD USB hub.
    PdUsbHub,
    /// PD USB peripheral.
    PdUsbPeripheral,
    /// Power sink device (SOP) or passive cable (SOP').
    PsdOrPassiveCable,
    /// Active cable.
    ActiveCable,
    /// Alternate mode adapter.
    Ama,
    /// VConn powered device.
    Vpd,
    /// Reserved value.
    Reserved,
}

impl From<u8> for SopProductType {
    fn from(value: u8) -> Self {
        match value {
            0b000 => SopProductType::Undefined,
            0b001 => SopProductType::PdUsbHub,
            0b010 => SopProductType::PdUsbPeripheral,
            0b011 => SopProductType::PsdOrPassiveCable,
            0b100 => SopProductType::ActiveCable,
            0b101 => SopProductType::Ama,
            0b110 => SopProductType::Vpd,
            _ => SopProductType::Reserved,
        }
    }
}

impl From<SopProductType> for u8 {
    fn from(value: SopProductType) -> Self {
        match value {
            SopProductType::Undefined => 0b000,
            SopProductType::PdUsbHub => 0b001,
            SopProductType::PdUsbPeripheral => 0b010,
            SopProductType::PsdOrPassiveCable => 0b011,
            SopProductType::ActiveCable => 0b100,
            SopProductType::Ama => 0b101,
            SopProductType::Vpd => 0b110,
            SopProductType::Reserved => 0b111,
        }
    }
}

bitfield! {
    /// The ID header VDO, the first object of a Discover_Identity response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct VdmIdentityHeader(pub u32): FromStorage, IntoStorage {
        /// Host data capable
        pub host_data: bool @ 31,
        /// Device data capable
        pub device_data: bool @ 30,
        /// Product type (UFP for SOP, cable plug for SOP')
        pub product_type_ufp: u8 [SopProductType] @ 27..=29,
        /// Modal Operation Supported
        pub modal_supported: bool @ 26,
        /// Product type DFP
        pub product_type_dfp: u8 @ 23..=25,
        /// Connector type
        pub connector_type: u8 @ 21..=22,
        /// VID
        pub vid: u16 @ 0..=15,
    }
}

impl VdmIdentityHeader {
    /// Serialize to a buffer.
    pub fn to_bytes(self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.0);
    }
}

bitfield! {
    /// The certification status VDO.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct CertStatVdo(pub u32): FromStorage, IntoStorage {
        /// XID assigned by USB-IF
        pub xid: u32 @ 0..=31,
    }
}

bitfield! {
    /// The product VDO.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct ProductVdo(pub u32): FromStorage, IntoStorage {
        /// USB Product ID
        pub pid: u16 @ 16..=31,
        /// Device release number
        pub bcd_device: u16 @ 0..=15,
    }
}

/// VBus current handling capability reported by a cable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CableCurrent {
    /// Default USB current only.
    UsbDefault,
    /// 3 A capable.
    Capable3A,
    /// 5 A capable.
    Capable5A,
    /// The cable does not carry VBus through.
    None,
}

impl From<u8> for CableCurrent {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => CableCurrent::Capable3A,
            0b10 => CableCurrent::Capable5A,
            0b00 => CableCurrent::UsbDefault,
            _ => CableCurrent::None,
        }
    }
}

impl From<CableCurrent> for u8 {
    fn from(value: CableCurrent) -> Self {
        match value {
            CableCurrent::UsbDefault => 0b00,
            CableCurrent::Capable3A => 0b01,
            CableCurrent::Capable5A => 0b10,
            CableCurrent::None => 0b11,
        }
    }
}

bitfield! {
    /// The passive cable VDO, reported by an EMCA in its Discover_Identity
    /// response.
    ///
    /// See USB PD R3.2, [Table 6.38].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct PassiveCableVdo(pub u32): FromStorage, IntoStorage {
        /// Hardware version, vendor assigned
        pub hw_version: u8 @ 28..=31,
        /// Firmware version, vendor assigned
        pub fw_version: u8 @ 24..=27,
        /// VDO version
        pub vdo_version: u8 @ 21..=23,
        /// Plug type (USB Type-C = 10b)
        pub plug_type: u8 @ 18..=19,
        /// Whether the cable supports EPR mode voltages and signalling
        pub epr_mode_capable: bool @ 17,
        /// Cable latency
        pub latency: u8 @ 13..=16,
        /// Cable termination type
        pub termination: u8 @ 11..=12,
        /// Maximum VBus voltage (00b 20 V .. 11b 50 V)
        pub max_vbus_voltage: u8 @ 9..=10,
        /// VBus current handling capability
        pub vbus_current: u8 [CableCurrent] @ 5..=6,
        /// USB highest speed
        pub usb_speed: u8 @ 0..=2,
    }
}

impl PassiveCableVdo {
    /// Serialize to a buffer.
    pub fn to_bytes(self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.0);
    }
}

/// Cable properties recorded after a successful SOP' Discover_Identity.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CableIdentity {
    /// The ID header VDO.
    pub id_header: VdmIdentityHeader,
    /// The certification status VDO.
    pub cert_stat: CertStatVdo,
    /// The product VDO.
    pub product: ProductVdo,
    /// The cable VDO, when the marker reported one.
    pub cable_vdo: Option<PassiveCableVdo>,
}

impl CableIdentity {
    /// Parse a Discover_Identity ACK's data objects (excluding the VDM header).
    pub fn from_vdos(vdos: &[u32]) -> Option<Self> {
        if vdos.len() < 3 {
            return None;
        }

        Some(Self {
            id_header: VdmIdentityHeader(vdos[0]),
            cert_stat: CertStatVdo(vdos[1]),
            product: ProductVdo(vdos[2]),
            cable_vdo: vdos.get(3).map(|raw| PassiveCableVdo(*raw)),
        })
    }

    /// Whether the cable supports EPR mode operation.
    pub fn epr_mode_capable(&self) -> bool {
        self.cable_vdo.map(|vdo| vdo.epr_mode_capable()).unwrap_or(false)
    }

    /// The cable's VBus current handling capability.
    pub fn vbus_current(&self) -> CableCurrent {
        self.cable_vdo
            .map(|vdo| vdo.vbus_current())
            .unwrap_or(CableCurrent::UsbDefault)
    }
}

/// Payload of a vendor-defined data message: the VDM header plus up to six
/// additional data objects.
pub type VdmPayload = (VdmHeader, Vec<u32, 7>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_identity_request_encoding() {
        let vdm = VdmHeaderStructured::discover_identity(SpecificationRevision::R3_X);

        assert_eq!(vdm.standard_or_vid(), svid::STANDARD);
        assert_eq!(vdm.command(), VdmCommand::DiscoverIdentity);
        assert_eq!(vdm.command_type(), VdmCommandType::InitiatorReq);
        // Structured VDM version 2.0 under PD 3.x.
        assert_eq!(vdm.vdm_version_major(), 0b01);

        let legacy = VdmHeaderStructured::discover_identity(SpecificationRevision::R2_0);
        assert_eq!(legacy.vdm_version_major(), 0b00);
    }

    #[test]
    fn cable_identity_from_ack() {
        let id_header = VdmIdentityHeader(0)
            .with_product_type_ufp(SopProductType::PsdOrPassiveCable)
            .with_vid(svid::INFINEON);
        let cable_vdo = PassiveCableVdo(0)
            .with_plug_type(0b10)
            .with_epr_mode_capable(true)
            .with_vbus_current(CableCurrent::Capable5A);

        let vdos = [id_header.0, 0xDEAD_BEEF, 0x1234_0001, cable_vdo.0];
        let identity = CableIdentity::from_vdos(&vdos).unwrap();

        assert!(identity.epr_mode_capable());
        assert_eq!(identity.vbus_current(), CableCurrent::Capable5A);
        assert_eq!(identity.id_header.vid(), svid::INFINEON);

        // Identity responses without the cable VDO are still accepted.
        let short = CableIdentity::from_vdos(&vdos[..3]).unwrap();
        assert!(!short.epr_mode_capable());

        assert!(CableIdentity::from_vdos(&vdos[..2]).is_none());
    }
}
