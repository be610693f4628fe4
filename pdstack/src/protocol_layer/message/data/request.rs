//! Definitions of request message content.
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;
use uom::si::electric_current::{self, centiampere};
use uom::si::{self};

use super::source_capabilities::{self, Augmented, PowerDataObject, SourceCapabilities};
use crate::_20millivolts_mod::_20millivolts;
use crate::_50milliamperes_mod::_50milliamperes;
use crate::_100millivolts_mod::_100millivolts;
use crate::_250milliwatts_mod::_250milliwatts;
use crate::protocol_layer::message::header::DataMessageType;
use crate::units::{ElectricCurrent, ElectricPotential};

bitfield! {
    /// A request data object of yet-undetermined supply type.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct RawDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
    }
}

bitfield! {
    /// Request for a fixed or variable supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FixedVariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// Whether the sink will respond to GotoMin.
        pub giveback_flag: bool @ 27,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Operating current in 10mA units
        pub raw_operating_current: u16 @ 10..=19,
        /// Maximum (or minimum, with give-back) operating current in 10mA units
        pub raw_max_operating_current: u16 @ 0..=9,
    }
}

impl FixedVariableSupply {
    /// Serialize to a buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operating_current().into())
    }

    /// The requested maximum operating current.
    pub fn max_operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_operating_current().into())
    }
}

bitfield! {
    /// Request for a battery supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b and 1110b…1111b are Reserved and Shall Not be used)
        pub object_position: u8 @ 28..=31,
        /// GiveBackFlag = 0
        pub giveback_flag: bool @ 27,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Operating power in 250mW units
        pub raw_operating_power: u16 @ 10..=19,
        /// Maximum operating power in 250mW units
        pub raw_max_operating_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// Serialize to a buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested operating power.
    pub fn operating_power(&self) -> si::u32::Power {
        si::u32::Power::new::<_250milliwatts>(self.raw_operating_power().into())
    }

    /// The requested maximum operating power.
    pub fn max_operating_power(&self) -> si::u32::Power {
        si::u32::Power::new::<_250milliwatts>(self.raw_max_operating_power().into())
    }
}

bitfield!(
    /// Request for a programmable power supply APDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Pps(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b and 1110b…1111b are Reserved and Shall Not be used)
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Output voltage in 20mV units
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50mA units
        pub raw_operating_current: u16 @ 0..=6,
    }
);

impl Pps {
    /// Serialize to a buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

bitfield!(
    /// Request for an adjustable voltage supply APDO.
    ///
    /// Voltage is encoded in 100 mV steps with the two least significant bits
    /// zero, current in 50 mA steps. See USB PD R3.2, [Table 6.26].
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Avs(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b and 1110b…1111b are Reserved and Shall Not be used)
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Output voltage in 25mV units (LSB 2 bits shall be zero)
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50mA units
        pub raw_operating_current: u16 @ 0..=6,
    }
);

impl Avs {
    /// Serialize to a buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

/// An EPR request carries the RDO and a copy of the selected PDO.
///
/// Per USB PD R3.2, [6.4.11], the source shall hard reset when the PDO copy
/// does not mirror its advertised capability.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EprRequest {
    /// The raw request data object.
    pub rdo: u32,
    /// A copy of the PDO that the request selects.
    pub pdo: PowerDataObject,
}

impl EprRequest {
    /// Build an EPR request for a fixed supply at the given object position.
    pub fn new_fixed(object_position: u8, supply: source_capabilities::FixedSupply) -> Self {
        let rdo = FixedVariableSupply(0)
            .with_object_position(object_position)
            .with_raw_operating_current(supply.raw_max_current())
            .with_raw_max_operating_current(supply.raw_max_current())
            .with_epr_mode_capable(true)
            .with_no_usb_suspend(true)
            .with_usb_communications_capable(true);

        Self {
            rdo: rdo.0,
            pdo: PowerDataObject::FixedSupply(supply),
        }
    }

    /// Build an EPR request for an AVS supply at a specific voltage.
    pub fn new_avs(
        object_position: u8,
        supply: source_capabilities::EprAdjustableVoltageSupply,
        voltage: ElectricPotential,
        current: ElectricCurrent,
    ) -> Self {
        // AVS voltage steps are 100 mV; the 25 mV field keeps its LSBs zero.
        let raw_voltage = voltage.get::<_100millivolts>() as u16 * 4;
        let rdo = Avs(0)
            .with_object_position(object_position)
            .with_raw_output_voltage(raw_voltage)
            .with_raw_operating_current(current.get::<_50milliamperes>() as u16)
            .with_epr_mode_capable(true)
            .with_no_usb_suspend(true)
            .with_usb_communications_capable(true);

        Self {
            rdo: rdo.0,
            pdo: PowerDataObject::Augmented(Augmented::Epr(supply)),
        }
    }

    /// The object position the request selects.
    pub fn object_position(&self) -> u8 {
        RawDataObject(self.rdo).object_position()
    }

    /// Serialize to a buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.rdo);
        LittleEndian::write_u32(&mut buf[4..], self.pdo.to_raw());
        8
    }
}

/// Power requests towards the source.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerSource {
    /// Request for a fixed or variable supply.
    FixedVariableSupply(FixedVariableSupply),
    /// Request for a battery supply.
    Battery(Battery),
    /// Request for a programmable power supply.
    Pps(Pps),
    /// Request for an adjustable voltage supply.
    Avs(Avs),
    /// An EPR mode request, carrying the PDO copy.
    EprRequest(EprRequest),
    /// A request whose supply type could not be determined.
    Unknown(RawDataObject),
}

/// Errors that can occur during sink requests towards the source.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A requested (specific) voltage does not exist in the PDOs.
    VoltageMismatch,
}

/// Requestable voltage levels.
#[derive(Debug)]
pub enum VoltageRequest {
    /// The safe 5 V supply.
    Safe5V,
    /// The highest voltage that the source can supply.
    Highest,
    /// A specific voltage.
    Specific(ElectricPotential),
}

/// Requestable currents.
#[derive(Debug)]
pub enum CurrentRequest {
    /// The highest current that the source can supply.
    Highest,
    /// A specific current.
    Specific(ElectricCurrent),
}

/// Strategy for picking a fixed PDO out of the source capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PdoSelection {
    /// Select the PDO with the highest deliverable power.
    #[default]
    HighestPower,
    /// Select the PDO with the highest deliverable current.
    HighestCurrent,
    /// Select the PDO with the highest voltage.
    HighestVoltage,
}

impl PowerSource {
    /// The object position the request selects.
    pub fn object_position(&self) -> u8 {
        match self {
            PowerSource::FixedVariableSupply(p) => p.object_position(),
            PowerSource::Battery(p) => p.object_position(),
            PowerSource::Pps(p) => p.object_position(),
            PowerSource::Avs(p) => p.object_position(),
            PowerSource::EprRequest(p) => p.object_position(),
            PowerSource::Unknown(p) => p.object_position(),
        }
    }

    /// The data message type that carries this request.
    pub fn message_type(&self) -> DataMessageType {
        match self {
            PowerSource::EprRequest(_) => DataMessageType::EprRequest,
            _ => DataMessageType::Request,
        }
    }

    /// The number of data objects this request occupies.
    pub fn num_objects(&self) -> u8 {
        match self {
            PowerSource::EprRequest(_) => 2,
            _ => 1,
        }
    }

    /// Find the best fixed supply per the given selection strategy.
    ///
    /// Reports the index of the found PDO and the fixed supply instance, or
    /// `None` if there is no fixed supply PDO.
    pub fn select_fixed(
        strategy: PdoSelection,
        source_capabilities: &SourceCapabilities,
    ) -> Option<(usize, &source_capabilities::FixedSupply)> {
        let mut selected: Option<(usize, &source_capabilities::FixedSupply)> = None;

        for (index, cap) in source_capabilities.pdos().iter().enumerate() {
            let PowerDataObject::FixedSupply(fixed_supply) = cap else {
                continue;
            };

            let better = match selected {
                None => true,
                Some((_, best)) => match strategy {
                    PdoSelection::HighestPower => {
                        fixed_supply.voltage() * fixed_supply.max_current() > best.voltage() * best.max_current()
                    }
                    PdoSelection::HighestCurrent => fixed_supply.max_current() > best.max_current(),
                    PdoSelection::HighestVoltage => fixed_supply.voltage() > best.voltage(),
                },
            };

            if better {
                selected = Some((index, fixed_supply));
            }
        }

        selected
    }

    /// Find the highest fixed voltage that can be found in the source capabilities.
    fn find_highest_fixed_voltage(
        source_capabilities: &SourceCapabilities,
    ) -> Option<(usize, &source_capabilities::FixedSupply)> {
        Self::select_fixed(PdoSelection::HighestVoltage, source_capabilities)
    }

    /// Find a specific fixed voltage within the source capabilities.
    fn find_specific_fixed_voltage(
        source_capabilities: &SourceCapabilities,
        voltage: ElectricPotential,
    ) -> Option<(usize, &source_capabilities::FixedSupply)> {
        for (index, cap) in source_capabilities.pdos().iter().enumerate() {
            if let PowerDataObject::FixedSupply(fixed_supply) = cap {
                if fixed_supply.voltage() == voltage {
                    return Some((index, fixed_supply));
                }
            }
        }

        None
    }

    /// Find a suitable PPS APDO whose voltage range covers the request.
    fn find_pps_voltage(
        source_capabilities: &SourceCapabilities,
        voltage: ElectricPotential,
    ) -> Option<(usize, &Augmented)> {
        for (index, cap) in source_capabilities.pdos().iter().enumerate() {
            let PowerDataObject::Augmented(augmented) = cap else {
                trace!("Skip non-augmented PDO {:?}", cap);
                continue;
            };

            match augmented {
                Augmented::Spr(spr) => {
                    if spr.min_voltage() <= voltage && spr.max_voltage() >= voltage {
                        return Some((index, augmented));
                    } else {
                        trace!("Skip PDO, voltage out of range. {:?}", augmented);
                    }
                }
                _ => trace!("Skip PDO, only SPR is supported. {:?}", augmented),
            };
        }

        trace!("Could not find suitable PPS voltage");
        None
    }

    /// Create a new power source request for a fixed supply.
    ///
    /// Finds a suitable PDO by evaluating the provided current and voltage requests against the source capabilities.
    pub fn new_fixed(
        current_request: CurrentRequest,
        voltage_request: VoltageRequest,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let selected = match voltage_request {
            VoltageRequest::Safe5V => source_capabilities.vsafe_5v().map(|supply| (0, supply)),
            VoltageRequest::Highest => Self::find_highest_fixed_voltage(source_capabilities),
            VoltageRequest::Specific(x) => Self::find_specific_fixed_voltage(source_capabilities, x),
        };

        let (index, supply) = selected.ok_or(Error::VoltageMismatch)?;

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (supply.max_current(), false),
            CurrentRequest::Specific(x) => (x, x > supply.max_current()),
        };

        let mut raw_current = current.get::<electric_current::centiampere>() as u16;

        if raw_current > 0x3ff {
            error!("Clamping invalid current: {} mA", 10 * raw_current);
            raw_current = 0x3ff;
        }

        let object_position = index + 1;
        debug_assert!(object_position > 0b0000 && object_position <= 0b1110);

        Ok(Self::FixedVariableSupply(
            FixedVariableSupply(0)
                .with_raw_operating_current(raw_current)
                .with_raw_max_operating_current(raw_current)
                .with_object_position(object_position as u8)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        ))
    }

    /// Create a fixed-supply request per the given selection strategy.
    pub fn new_fixed_with_strategy(
        strategy: PdoSelection,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let (index, supply) = Self::select_fixed(strategy, source_capabilities).ok_or(Error::VoltageMismatch)?;
        let raw_current = supply.raw_max_current().min(0x3ff);

        Ok(Self::FixedVariableSupply(
            FixedVariableSupply(0)
                .with_raw_operating_current(raw_current)
                .with_raw_max_operating_current(raw_current)
                .with_object_position(index as u8 + 1)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        ))
    }

    /// Create a new power source request for a programmable power supply (PPS).
    ///
    /// Finds a suitable PDO by evaluating the provided current and voltage requests against the source capabilities.
    /// If no PDO is found that matches the request, an error is returned.
    pub fn new_pps(
        current_request: CurrentRequest,
        voltage: ElectricPotential,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let selected = Self::find_pps_voltage(source_capabilities, voltage);

        let (index, supply) = selected.ok_or(Error::VoltageMismatch)?;
        let max_current = match supply {
            Augmented::Spr(spr) => spr.max_current(),
            _ => unreachable!(),
        };

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (max_current, false),
            CurrentRequest::Specific(x) => (x, x > max_current),
        };

        let mut raw_current = current.get::<_50milliamperes>() as u16;

        if raw_current > 0x7f {
            error!("Clamping invalid current: {} mA", 50 * raw_current);
            raw_current = 0x7f;
        }

        let raw_voltage = voltage.get::<_20millivolts>() as u16;

        let object_position = index + 1;
        debug_assert!(object_position > 0b0000 && object_position <= 0b1110);

        Ok(Self::Pps(
            Pps(0)
                .with_raw_output_voltage(raw_voltage)
                .with_raw_operating_current(raw_current)
                .with_object_position(object_position as u8)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        ))
    }

    /// Create an EPR request for the highest-power fixed supply, searching
    /// the whole (SPR + EPR) object range.
    pub fn new_epr_fixed(source_capabilities: &SourceCapabilities) -> Result<Self, Error> {
        let mut selected: Option<(usize, source_capabilities::FixedSupply)> = None;

        for (index, cap) in source_capabilities.pdos().iter().enumerate() {
            let PowerDataObject::FixedSupply(fixed_supply) = cap else {
                continue;
            };
            if cap.is_zero_padding() {
                continue;
            }

            let better = match &selected {
                None => true,
                Some((_, best)) => {
                    fixed_supply.voltage() * fixed_supply.max_current() > best.voltage() * best.max_current()
                }
            };
            if better {
                selected = Some((index, *fixed_supply));
            }
        }

        let (index, supply) = selected.ok_or(Error::VoltageMismatch)?;
        Ok(Self::EprRequest(EprRequest::new_fixed(index as u8 + 1, supply)))
    }

    /// Serialize the request, returning the number of written bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        match self {
            PowerSource::FixedVariableSupply(data_object) => data_object.to_bytes(buf),
            PowerSource::Battery(data_object) => data_object.to_bytes(buf),
            PowerSource::Pps(data_object) => data_object.to_bytes(buf),
            PowerSource::Avs(data_object) => data_object.to_bytes(buf),
            PowerSource::EprRequest(data_object) => data_object.to_bytes(buf),
            PowerSource::Unknown(data_object) => {
                LittleEndian::write_u32(buf, data_object.0);
                4
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uom::si::electric_current::milliampere;
    use uom::si::electric_potential::millivolt;

    use super::*;
    use crate::dummy::get_dummy_source_capabilities;
    use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
    use crate::units::{ElectricCurrent, ElectricPotential};

    fn caps() -> SourceCapabilities {
        SourceCapabilities::new(get_dummy_source_capabilities().into_iter().collect())
    }

    #[test]
    fn request_safe_5v() {
        let request = PowerSource::new_fixed(CurrentRequest::Highest, VoltageRequest::Safe5V, &caps()).unwrap();

        let PowerSource::FixedVariableSupply(rdo) = request else {
            panic!("expected fixed supply request");
        };
        assert_eq!(rdo.object_position(), 1);
        assert_eq!(rdo.raw_operating_current(), 300);
        assert!(!rdo.capability_mismatch());
    }

    #[test]
    fn request_highest_fixed_voltage() {
        let request = PowerSource::new_fixed(CurrentRequest::Highest, VoltageRequest::Highest, &caps()).unwrap();

        // 20 V @ 2.25 A is the highest fixed voltage in the dummy capabilities.
        let PowerSource::FixedVariableSupply(rdo) = request else {
            panic!("expected fixed supply request");
        };
        assert_eq!(rdo.object_position(), 4);
        assert_eq!(rdo.raw_operating_current(), 225);
    }

    #[test]
    fn selection_strategies_differ() {
        let caps = caps();

        // Highest power: 20 V * 2.25 A = 45 W beats 15 V * 3 A = 45 W? No -
        // equal products keep the first found, so 15 V * 3 A wins by order.
        let (power_index, _) = PowerSource::select_fixed(PdoSelection::HighestPower, &caps).unwrap();
        let (current_index, _) = PowerSource::select_fixed(PdoSelection::HighestCurrent, &caps).unwrap();
        let (voltage_index, _) = PowerSource::select_fixed(PdoSelection::HighestVoltage, &caps).unwrap();

        assert_eq!(power_index, 2); // 15 V @ 3 A
        assert_eq!(current_index, 0); // 5 V @ 3 A, first with 3 A
        assert_eq!(voltage_index, 3); // 20 V @ 2.25 A
    }

    #[test]
    fn capability_mismatch_is_flagged() {
        let request = PowerSource::new_fixed(
            CurrentRequest::Specific(ElectricCurrent::new::<milliampere>(5000)),
            VoltageRequest::Safe5V,
            &caps(),
        )
        .unwrap();

        let PowerSource::FixedVariableSupply(rdo) = request else {
            panic!("expected fixed supply request");
        };
        assert!(rdo.capability_mismatch());
    }

    #[test]
    fn pps_request_encodes_voltage_steps() {
        let request = PowerSource::new_pps(
            CurrentRequest::Highest,
            ElectricPotential::new::<millivolt>(9000),
            &caps(),
        )
        .unwrap();

        let PowerSource::Pps(rdo) = request else {
            panic!("expected PPS request");
        };
        // 9 V in 20 mV steps.
        assert_eq!(rdo.raw_output_voltage(), 450);
        assert_eq!(rdo.object_position(), 5);
    }

    #[test]
    fn epr_request_mirrors_pdo() {
        let mut pdos = get_dummy_source_capabilities();
        // A 28 V @ 5 A EPR-range fixed supply in object position 8.
        let epr_fixed = source_capabilities::FixedSupply::default()
            .with_raw_voltage(560)
            .with_raw_max_current(500);
        pdos.push(source_capabilities::PowerDataObject::FixedSupply(epr_fixed));
        let caps = SourceCapabilities::new(pdos.into_iter().collect());

        let request = PowerSource::new_epr_fixed(&caps).unwrap();
        let PowerSource::EprRequest(epr) = request else {
            panic!("expected EPR request");
        };
        assert_eq!(epr.object_position(), 8);
        assert_eq!(epr.pdo.to_raw(), epr_fixed.0);

        let mut buf = [0u8; 8];
        assert_eq!(epr.to_bytes(&mut buf), 8);
    }
}
