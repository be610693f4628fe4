//! A USB Power Delivery and Type-C protocol stack.
//!
//! The stack is layered leaves-first:
//! - [`soft_timer`] multiplexes protocol timeouts over one hardware tick,
//! - [`protocol_layer`] frames, sequences and acknowledges PD messages,
//! - [`type_c`] runs the connection (attach/detach) state machine,
//! - [`sink`] and [`source`] hold the per-role policy engines,
//! - [`port`] is the device-policy-manager façade the application drives.
//!
//! Hardware comes in through the traits in `pdstack-traits`, time through
//! the [`timers::Timer`] trait, and device policy through the
//! `DevicePolicyManager` traits of the role modules.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

mod fmt;

pub mod config;
pub mod counters;
pub mod events;
pub mod port;
pub mod protocol_layer;
pub mod sink;
pub mod soft_timer;
pub mod source;
pub mod timers;
pub mod type_c;

#[cfg(test)]
pub(crate) mod dummy;

#[macro_use]
extern crate uom;

pub use pdstack_traits::{Polarity, Sop};

/// Quantities used throughout the protocol layer, stored as `u32` values of
/// millivolts, milliamperes and microwatts.
pub mod units {
    ISQ!(
        uom::si,
        u32,
        (millimeter, kilogram, second, milliampere, kelvin, mole, candela)
    );
}

pub(crate) mod _50milliamperes_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_current;

        @_50milliamperes: 0.05; "_50mA", "_50milliamps", "_50milliamps";
    }
}

pub(crate) mod _50millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_50millivolts: 0.05; "_50mV", "_50millivolts", "_50millivolts";
    }
}

pub(crate) mod _20millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_20millivolts: 0.02; "_20mV", "_20millivolts", "_20millivolts";
    }
}

pub(crate) mod _100millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_100millivolts: 0.1; "_100mV", "_100millivolts", "_100millivolts";
    }
}

pub(crate) mod _250milliwatts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::power;

        @_250milliwatts: 0.25; "_250mW", "_250milliwatts", "_250milliwatts";
    }
}

/// The power role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerRole {
    /// Supplies power on VBus.
    Source,
    /// Consumes power from VBus.
    Sink,
}

impl PowerRole {
    /// The opposite power role, e.g. after a PR_Swap.
    pub fn flipped(self) -> Self {
        match self {
            Self::Source => Self::Sink,
            Self::Sink => Self::Source,
        }
    }
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        match role {
            PowerRole::Sink => false,
            PowerRole::Source => true,
        }
    }
}

/// Response of the device policy manager to a swap request from the partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapResponse {
    /// Accept the swap.
    Accept,
    /// Reject the swap.
    Reject,
    /// Delay the swap; the partner may retry.
    Wait,
    /// The swap is not supported. Degrades to Reject under PD 2.0.
    NotSupported,
}

/// The data role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataRole {
    /// Upstream-facing port.
    Ufp,
    /// Downstream-facing port.
    Dfp,
}

impl DataRole {
    /// The opposite data role, e.g. after a DR_Swap.
    pub fn flipped(self) -> Self {
        match self {
            Self::Ufp => Self::Dfp,
            Self::Dfp => Self::Ufp,
        }
    }
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        match role {
            DataRole::Ufp => false,
            DataRole::Dfp => true,
        }
    }
}
