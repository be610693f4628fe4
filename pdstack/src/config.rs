//! Per-port configuration.
//!
//! A [`PortConfig`] can be built in code or parsed from the binary 'PDSC'
//! configuration blob that configuration tools emit. All multi-byte fields in
//! the blob are little-endian.
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use pdstack_traits::RpLevel;

use crate::protocol_layer::message::data::request::PdoSelection;
use crate::protocol_layer::message::data::sink_capabilities::SinkCapabilities;
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::extended::EXTENDED_CAPS_SIZE;
use crate::protocol_layer::message::extended::manufacturer_info::ManufacturerInfo;

/// Hard maximum of SPR PDOs per role.
pub const MAX_SPR_PDOS: usize = 7;

/// Hard maximum of EPR PDOs per role.
pub const MAX_EPR_PDOS: usize = 6;

/// Length of the manufacturer name field, including the terminating null.
pub const MFG_NAME_SIZE: usize = 22;

/// Expected size of the binary configuration blob.
pub const CONFIG_BLOB_SIZE: usize = 242;

const SIGNATURE: &[u8; 4] = b"PDSC";

/// The power role(s) a port may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortRole {
    /// Sink only.
    #[default]
    Sink,
    /// Source only.
    Source,
    /// Dual-role port.
    DualRole,
}

/// Preferred-role behaviour of a dual-role port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TryRole {
    /// No role preference.
    #[default]
    None,
    /// Try to become source on attach (Try.SRC).
    TrySrc,
    /// Try to become sink on attach (Try.SNK).
    TrySnk,
}

/// Fast Role Swap configuration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrsConfig {
    /// Whether FRS reception (initial sink side) is enabled.
    pub receive: bool,
    /// Whether FRS transmission (initial source side) is enabled.
    pub transmit: bool,
}

/// Errors in the configuration blob or the configured values.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The blob does not start with the 'PDSC' signature.
    #[error("bad configuration signature")]
    BadSignature,
    /// The blob is shorter than the fixed layout.
    #[error("configuration too short (expected {expected}, found {found})")]
    TooShort {
        /// Expected number of bytes.
        expected: usize,
        /// Actual number of bytes.
        found: usize,
    },
    /// The port role byte is out of range.
    #[error("invalid port role `{0}`")]
    InvalidRole(u8),
    /// The Rp current level byte is out of range.
    #[error("invalid Rp current level `{0}`")]
    InvalidRpLevel(u8),
    /// The Try.SRC/Try.SNK byte is out of range.
    #[error("invalid preferred role `{0}`")]
    InvalidTryRole(u8),
    /// The manufacturer info length is not 0 or 5..=26.
    #[error("invalid manufacturer info length `{0}`")]
    InvalidMfgLength(u8),
    /// A source-capable port has no enabled source PDOs.
    #[error("no source PDOs configured")]
    NoSourcePdos,
    /// A sink-capable port has no enabled sink PDOs.
    #[error("no sink PDOs configured")]
    NoSinkPdos,
}

/// Static per-port configuration.
///
/// Constructed once at initialisation; changed afterwards only through the
/// capabilities-changed port command.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortConfig {
    /// Configuration version, 8.8 major.minor.
    pub version: u16,

    /// Manufacturer USB vendor ID.
    pub mfg_vid: u16,
    /// Manufacturer product ID.
    pub mfg_pid: u16,
    /// Null-terminated manufacturer name.
    pub mfg_name: [u8; MFG_NAME_SIZE],

    /// The role(s) this port supports.
    pub port_role: PortRole,
    /// Default role of a dual-role port.
    pub default_role: PortRole,
    /// The Rp current level advertised as a source.
    pub rp_level: RpLevel,
    /// Whether Rp/Rd toggling runs while unattached (DRP).
    pub drp_toggle: bool,
    /// Percentage of the DRP toggle period spent presenting Rp.
    pub drp_source_duty_percent: u8,
    /// Whether USB PD operation is enabled at all.
    pub pd_enabled: bool,
    /// Try.SRC/Try.SNK preference.
    pub try_role: TryRole,
    /// Whether the port starts disabled.
    pub port_disabled: bool,

    /// Whether cable discovery runs in the source state machine.
    pub cable_discovery: bool,
    /// Number of SOP' Discover_Identity attempts.
    pub cable_discovery_count: u8,

    /// Whether dead-battery operation is supported.
    pub dead_battery: bool,
    /// Whether Type-C error recovery is enabled.
    pub error_recovery: bool,
    /// Whether audio/debug accessory detection is enabled.
    pub accessory: bool,
    /// Whether Rp-based disconnect detection runs in sink role.
    pub rp_detach: bool,
    /// Whether VConn stays on even if the cable does not require it.
    pub vconn_retain: bool,
    /// Fast Role Swap flags.
    pub frs: FrsConfig,

    /// Source PDO list, raw 32-bit words.
    pub src_pdos: Vec<u32, MAX_SPR_PDOS>,
    /// Bitmask enabling entries of [`Self::src_pdos`].
    pub src_pdo_mask: u8,
    /// Sink PDO list, raw 32-bit words.
    pub snk_pdos: Vec<u32, MAX_SPR_PDOS>,
    /// Bitmask enabling entries of [`Self::snk_pdos`].
    pub snk_pdo_mask: u8,
    /// Sink min/max current list; bit 15 is the give-back flag, the low
    /// 10 bits the current in 10 mA units.
    pub snk_min_max_current: Vec<u16, MAX_SPR_PDOS>,

    /// EPR source PDO list. A non-empty list enables EPR source operation.
    pub epr_src_pdos: Vec<u32, MAX_EPR_PDOS>,
    /// Bitmask enabling entries of [`Self::epr_src_pdos`].
    pub epr_src_pdo_mask: u8,
    /// EPR sink PDO list. A non-empty list enables EPR sink operation.
    pub epr_snk_pdos: Vec<u32, MAX_EPR_PDOS>,
    /// Bitmask enabling entries of [`Self::epr_snk_pdos`].
    pub epr_snk_pdo_mask: u8,

    /// Whether the extended source capabilities response is enabled.
    pub ext_src_cap_enabled: bool,
    /// Extended source capabilities response payload.
    pub ext_src_cap: [u8; EXTENDED_CAPS_SIZE],
    /// Whether the extended sink capabilities response is enabled.
    pub ext_snk_cap_enabled: bool,
    /// Extended sink capabilities response payload.
    pub ext_snk_cap: [u8; EXTENDED_CAPS_SIZE],

    /// Get_Revision response data object.
    pub pd_revision_response: u32,
    /// Get_Source_Info response data object.
    pub source_info_response: u32,

    /// Whether BIST shared test mode (PD 3.2) is supported.
    pub bist_stm_enabled: bool,
    /// How the sink picks a PDO out of received source capabilities.
    pub pdo_selection: PdoSelection,
}

impl Default for PortConfig {
    fn default() -> Self {
        // A 5 V, 900 mA sink-only port.
        let mut snk_pdos = Vec::new();
        snk_pdos.push(0x0001_905A).ok();

        Self {
            version: 0x0100,
            mfg_vid: 0,
            mfg_pid: 0,
            mfg_name: [0; MFG_NAME_SIZE],
            port_role: PortRole::Sink,
            default_role: PortRole::Sink,
            rp_level: RpLevel::Default,
            drp_toggle: false,
            drp_source_duty_percent: 50,
            pd_enabled: true,
            try_role: TryRole::None,
            port_disabled: false,
            cable_discovery: false,
            cable_discovery_count: 20,
            dead_battery: false,
            error_recovery: true,
            accessory: false,
            rp_detach: false,
            vconn_retain: false,
            frs: FrsConfig::default(),
            src_pdos: Vec::new(),
            src_pdo_mask: 0,
            snk_pdos,
            snk_pdo_mask: 0x01,
            snk_min_max_current: Vec::new(),
            epr_src_pdos: Vec::new(),
            epr_src_pdo_mask: 0,
            epr_snk_pdos: Vec::new(),
            epr_snk_pdo_mask: 0,
            ext_src_cap_enabled: false,
            ext_src_cap: [0; EXTENDED_CAPS_SIZE],
            ext_snk_cap_enabled: false,
            ext_snk_cap: [0; EXTENDED_CAPS_SIZE],
            pd_revision_response: 0,
            source_info_response: 0,
            bist_stm_enabled: false,
            pdo_selection: PdoSelection::default(),
        }
    }
}

impl PortConfig {
    /// Parse a configuration from its binary 'PDSC' blob.
    pub fn from_blob(blob: &[u8]) -> Result<Self, ConfigError> {
        if blob.len() < CONFIG_BLOB_SIZE {
            return Err(ConfigError::TooShort {
                expected: CONFIG_BLOB_SIZE,
                found: blob.len(),
            });
        }

        if &blob[0..4] != SIGNATURE {
            return Err(ConfigError::BadSignature);
        }

        let mfg_len = blob[6];
        if mfg_len != 0 && !(5..=26).contains(&mfg_len) {
            return Err(ConfigError::InvalidMfgLength(mfg_len));
        }

        let mut mfg_name = [0u8; MFG_NAME_SIZE];
        mfg_name.copy_from_slice(&blob[12..34]);

        let mut ext_src_cap = [0u8; EXTENDED_CAPS_SIZE];
        ext_src_cap.copy_from_slice(&blob[36..61]);
        let mut ext_snk_cap = [0u8; EXTENDED_CAPS_SIZE];
        ext_snk_cap.copy_from_slice(&blob[61..86]);

        let port_role = match blob[86] {
            0 => PortRole::Sink,
            1 => PortRole::Source,
            2 => PortRole::DualRole,
            other => return Err(ConfigError::InvalidRole(other)),
        };
        let default_role = match blob[87] {
            0 => PortRole::Sink,
            1 => PortRole::Source,
            other => return Err(ConfigError::InvalidRole(other)),
        };
        let rp_level = match blob[88] {
            0 => RpLevel::Default,
            1 => RpLevel::Rp1A5,
            2 => RpLevel::Rp3A0,
            other => return Err(ConfigError::InvalidRpLevel(other)),
        };
        let try_role = match blob[97] {
            0 => TryRole::None,
            1 => TryRole::TrySrc,
            2 => TryRole::TrySnk,
            other => return Err(ConfigError::InvalidTryRole(other)),
        };

        // PDO counts are clamped to the hard maxima.
        let src_pdo_count = (blob[106] as usize).min(MAX_SPR_PDOS);
        let snk_pdo_count = (blob[108] as usize).min(MAX_SPR_PDOS);

        let mut src_pdos = Vec::new();
        for i in 0..src_pdo_count {
            src_pdos.push(LittleEndian::read_u32(&blob[110 + 4 * i..])).ok();
        }
        let mut snk_pdos = Vec::new();
        for i in 0..snk_pdo_count {
            snk_pdos.push(LittleEndian::read_u32(&blob[138 + 4 * i..])).ok();
        }
        let mut snk_min_max_current = Vec::new();
        for i in 0..snk_pdo_count {
            snk_min_max_current.push(LittleEndian::read_u16(&blob[166 + 2 * i..])).ok();
        }

        let epr_src_pdo_count = (blob[190] as usize).min(MAX_EPR_PDOS);
        let epr_snk_pdo_count = (blob[192] as usize).min(MAX_EPR_PDOS);

        let mut epr_src_pdos = Vec::new();
        for i in 0..epr_src_pdo_count {
            epr_src_pdos.push(LittleEndian::read_u32(&blob[194 + 4 * i..])).ok();
        }
        let mut epr_snk_pdos = Vec::new();
        for i in 0..epr_snk_pdo_count {
            epr_snk_pdos.push(LittleEndian::read_u32(&blob[218 + 4 * i..])).ok();
        }

        let frs_config = blob[105];

        let config = Self {
            version: LittleEndian::read_u16(&blob[4..6]),
            mfg_vid: LittleEndian::read_u16(&blob[8..10]),
            mfg_pid: LittleEndian::read_u16(&blob[10..12]),
            mfg_name,
            port_role,
            default_role,
            rp_level,
            drp_toggle: blob[94] != 0,
            drp_source_duty_percent: 50,
            pd_enabled: blob[96] != 0,
            try_role,
            port_disabled: blob[98] != 0,
            cable_discovery: blob[99] != 0,
            cable_discovery_count: blob[89].min(0x14),
            dead_battery: blob[100] != 0,
            error_recovery: blob[101] != 0,
            accessory: blob[102] != 0,
            rp_detach: blob[103] != 0,
            vconn_retain: blob[104] != 0,
            frs: FrsConfig {
                receive: frs_config & 0x01 != 0,
                transmit: frs_config & 0x02 != 0,
            },
            src_pdos,
            src_pdo_mask: blob[107],
            snk_pdos,
            snk_pdo_mask: blob[109],
            snk_min_max_current,
            epr_src_pdos,
            epr_src_pdo_mask: blob[191],
            epr_snk_pdos,
            epr_snk_pdo_mask: blob[193],
            ext_src_cap_enabled: blob[34] != 0,
            ext_src_cap,
            ext_snk_cap_enabled: blob[35] != 0,
            ext_snk_cap,
            pd_revision_response: LittleEndian::read_u32(&blob[182..186]),
            source_info_response: LittleEndian::read_u32(&blob[186..190]),
            bist_stm_enabled: false,
            pdo_selection: PdoSelection::default(),
        };

        Ok(config)
    }

    /// Validate that the configured roles have usable PDO sets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let source_capable = matches!(self.port_role, PortRole::Source | PortRole::DualRole);
        let sink_capable = matches!(self.port_role, PortRole::Sink | PortRole::DualRole);

        if source_capable && self.enabled_pdos(&self.src_pdos, self.src_pdo_mask).is_empty() {
            return Err(ConfigError::NoSourcePdos);
        }
        if sink_capable && self.enabled_pdos(&self.snk_pdos, self.snk_pdo_mask).is_empty() {
            return Err(ConfigError::NoSinkPdos);
        }

        Ok(())
    }

    fn enabled_pdos<const N: usize>(&self, pdos: &Vec<u32, N>, mask: u8) -> Vec<u32, N> {
        pdos.iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, pdo)| *pdo)
            .collect()
    }

    /// The advertised SPR source capabilities, with the enable mask applied.
    pub fn source_capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::from_raw_pdos(&self.enabled_pdos(&self.src_pdos, self.src_pdo_mask))
    }

    /// The advertised EPR source capabilities: the SPR objects padded to
    /// seven positions, followed by the enabled EPR objects.
    pub fn epr_source_capabilities(&self) -> SourceCapabilities {
        let spr = self.enabled_pdos(&self.src_pdos, self.src_pdo_mask);
        let epr = self.enabled_pdos(&self.epr_src_pdos, self.epr_src_pdo_mask);

        let mut raw: Vec<u32, { MAX_SPR_PDOS + MAX_EPR_PDOS }> = Vec::new();
        for pdo in spr.iter() {
            raw.push(*pdo).ok();
        }
        while raw.len() < MAX_SPR_PDOS {
            raw.push(0).ok();
        }
        for pdo in epr.iter() {
            raw.push(*pdo).ok();
        }

        SourceCapabilities::from_raw_pdos(&raw)
    }

    /// Whether EPR source operation is enabled.
    pub fn epr_source_enabled(&self) -> bool {
        !self.enabled_pdos(&self.epr_src_pdos, self.epr_src_pdo_mask).is_empty()
    }

    /// Whether EPR sink operation is enabled.
    pub fn epr_sink_enabled(&self) -> bool {
        !self.enabled_pdos(&self.epr_snk_pdos, self.epr_snk_pdo_mask).is_empty()
    }

    /// The advertised sink capabilities, with the enable mask applied.
    pub fn sink_capabilities(&self) -> SinkCapabilities {
        SinkCapabilities::from_raw_pdos(&self.enabled_pdos(&self.snk_pdos, self.snk_pdo_mask))
    }

    /// The Manufacturer_Info response payload for this port.
    pub fn manufacturer_info(&self) -> ManufacturerInfo {
        ManufacturerInfo::new(self.mfg_vid, self.mfg_pid, &self.mfg_name)
    }

    /// The DRP toggle duty cycle, clamped to the minimum source share.
    pub fn drp_source_duty(&self) -> u8 {
        self.drp_source_duty_percent.clamp(30, 70)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal valid blob: DRP port, 2 source PDOs, 1 sink PDO.
    fn build_blob() -> [u8; CONFIG_BLOB_SIZE] {
        let mut blob = [0u8; CONFIG_BLOB_SIZE];

        blob[0..4].copy_from_slice(b"PDSC");
        LittleEndian::write_u16(&mut blob[4..6], 0x0201); // Version 2.1
        blob[6] = 14; // Manufacturer info length
        LittleEndian::write_u16(&mut blob[8..10], 0x04B4);
        LittleEndian::write_u16(&mut blob[10..12], 0xF500);
        blob[12..26].copy_from_slice(b"ACME Power Ltd");

        blob[86] = 2; // DRP
        blob[87] = 1; // Default source
        blob[88] = 2; // 3 A Rp
        blob[89] = 20; // Cable discovery attempts
        blob[94] = 1; // DRP toggle
        blob[96] = 1; // PD enabled
        blob[97] = 1; // Try.SRC
        blob[99] = 1; // Cable discovery
        blob[101] = 1; // Error recovery
        blob[105] = 0x03; // FRS rx + tx

        blob[106] = 2; // Source PDO count
        blob[107] = 0x03;
        blob[108] = 1; // Sink PDO count
        blob[109] = 0x01;
        LittleEndian::write_u32(&mut blob[110..114], 0x0A01_912C); // 5 V, 3 A
        LittleEndian::write_u32(&mut blob[114..118], 0x0002_D12C); // 9 V, 3 A
        LittleEndian::write_u32(&mut blob[138..142], 0x0001_905A); // 5 V sink
        LittleEndian::write_u16(&mut blob[166..168], 0x005A);

        LittleEndian::write_u32(&mut blob[182..186], 0x0000_3230);

        blob[190] = 1; // One EPR source PDO
        blob[191] = 0x01;
        LittleEndian::write_u32(&mut blob[194..198], 0x0003_05F4); // 28 V fixed

        blob
    }

    #[test]
    fn parse_round_trip() {
        let config = PortConfig::from_blob(&build_blob()).unwrap();

        assert_eq!(config.version, 0x0201);
        assert_eq!(config.mfg_vid, 0x04B4);
        assert_eq!(config.mfg_pid, 0xF500);
        assert_eq!(config.port_role, PortRole::DualRole);
        assert_eq!(config.default_role, PortRole::Source);
        assert_eq!(config.rp_level, RpLevel::Rp3A0);
        assert!(config.drp_toggle);
        assert!(config.pd_enabled);
        assert_eq!(config.try_role, TryRole::TrySrc);
        assert!(config.cable_discovery);
        assert_eq!(config.cable_discovery_count, 20);
        assert!(config.frs.receive);
        assert!(config.frs.transmit);

        assert_eq!(config.src_pdos.len(), 2);
        assert_eq!(config.snk_pdos.len(), 1);
        assert_eq!(config.snk_min_max_current[0], 0x005A);
        assert_eq!(config.epr_src_pdos.len(), 1);
        assert!(config.epr_source_enabled());
        assert!(!config.epr_sink_enabled());

        assert!(config.validate().is_ok());

        let info = config.manufacturer_info();
        assert_eq!(&info.string[..], b"ACME Power Ltd");
    }

    #[test]
    fn pdo_counts_are_clamped() {
        let mut blob = build_blob();
        blob[106] = 9; // More than 7 source PDOs
        blob[190] = 7; // More than 6 EPR PDOs

        let config = PortConfig::from_blob(&blob).unwrap();
        assert_eq!(config.src_pdos.len(), MAX_SPR_PDOS);
        assert_eq!(config.epr_src_pdos.len(), MAX_EPR_PDOS);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut blob = build_blob();
        blob[0] = b'X';
        assert_eq!(PortConfig::from_blob(&blob), Err(ConfigError::BadSignature));
    }

    #[test]
    fn short_blob_is_rejected() {
        let blob = build_blob();
        assert!(matches!(
            PortConfig::from_blob(&blob[..100]),
            Err(ConfigError::TooShort { .. })
        ));
    }

    #[test]
    fn source_without_pdos_refuses_to_validate() {
        let mut blob = build_blob();
        blob[107] = 0; // Mask disables every source PDO.

        let config = PortConfig::from_blob(&blob).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::NoSourcePdos));
    }

    #[test]
    fn epr_capabilities_pad_spr_positions() {
        let config = PortConfig::from_blob(&build_blob()).unwrap();
        let caps = config.epr_source_capabilities();

        // Two SPR PDOs, five zero-padded positions, one EPR PDO.
        assert_eq!(caps.pdos().len(), 8);
        assert!(caps.pdos()[2].is_zero_padding());
        assert!(!caps.pdos()[7].is_zero_padding());
    }

    #[test]
    fn duty_cycle_clamps_to_minimum_source_share() {
        let mut config = PortConfig::default();
        config.drp_source_duty_percent = 10;
        assert_eq!(config.drp_source_duty(), 30);
    }
}
