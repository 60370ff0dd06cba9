// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the vmops crates.
//!
//! This crate defines the SCSI topology vocabulary (bus/unit addresses and the
//! device key scheme derived from them) and the string vocabularies vCenter
//! uses for disk provisioning, controller, and adapter types, so that the core
//! library, the config parser, and the CLI can all share them without layering
//! oddities.

use std::fmt::Display;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

mod kinds;

pub use kinds::*;

/// Number of SCSI controllers (and therefore buses) a VM may carry.
pub const SCSI_BUS_COUNT: u8 = 4;

/// Number of unit positions on each SCSI bus, including the reserved one.
pub const SCSI_UNITS_PER_BUS: u8 = 16;

/// The unit position a SCSI controller occupies on its own bus.
pub const SCSI_CONTROLLER_UNIT: u8 = 7;

/// Unit positions on one bus that can hold a disk.
pub const USABLE_UNITS_PER_BUS: usize = SCSI_UNITS_PER_BUS as usize - 1;

/// Total disk slots across all buses.
pub const TOTAL_DISK_SLOTS: usize =
    SCSI_BUS_COUNT as usize * USABLE_UNITS_PER_BUS;

const CONTROLLER_KEY_BASE: i32 = 1000;
const DISK_KEY_BASE: i32 = 2000;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("SCSI bus {0} outside range of 0-{max}", max = SCSI_BUS_COUNT - 1)]
    BusOutOfRange(u8),

    #[error(
        "SCSI unit {0} outside range of 0-{max}",
        max = SCSI_UNITS_PER_BUS - 1
    )]
    UnitOutOfRange(u8),

    #[error(
        "SCSI unit {unit} is reserved for the controller",
        unit = SCSI_CONTROLLER_UNIT
    )]
    ReservedUnit,

    #[error("key {0} does not encode a SCSI disk address")]
    NotADiskKey(i32),
}

/// Returns the controller key used for a controller on `bus`.
#[inline]
pub fn controller_key(bus: u8) -> i32 {
    CONTROLLER_KEY_BASE + i32::from(bus)
}

/// Returns the bus encoded by a synthetic controller key, if the key is in the
/// controller range.
pub fn bus_for_controller_key(key: i32) -> Option<u8> {
    let bus = key.checked_sub(CONTROLLER_KEY_BASE)?;
    u8::try_from(bus).ok().filter(|bus| *bus < SCSI_BUS_COUNT)
}

/// A disk position on a virtual SCSI bus. Supports conversion from a string
/// formatted as "bus:unit", e.g. "0:3", or as its display form "SCSI(0:3)".
///
/// Addresses order by bus, then unit, which is also the order in which free
/// slots are handed out.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct ScsiAddress {
    bus: u8,
    unit: u8,
}

impl ScsiAddress {
    pub fn new(bus: u8, unit: u8) -> Result<Self, AddressError> {
        if bus >= SCSI_BUS_COUNT {
            return Err(AddressError::BusOutOfRange(bus));
        }

        if unit >= SCSI_UNITS_PER_BUS {
            return Err(AddressError::UnitOutOfRange(unit));
        }

        if unit == SCSI_CONTROLLER_UNIT {
            return Err(AddressError::ReservedUnit);
        }

        Ok(Self { bus, unit })
    }

    #[inline]
    pub fn bus(&self) -> u8 {
        self.bus
    }

    #[inline]
    pub fn unit(&self) -> u8 {
        self.unit
    }

    /// The key a disk created at this address is given.
    #[inline]
    pub fn disk_key(&self) -> i32 {
        DISK_KEY_BASE
            + i32::from(self.bus) * i32::from(SCSI_UNITS_PER_BUS)
            + i32::from(self.unit)
    }

    /// The key of the controller that owns this address's bus.
    #[inline]
    pub fn controller_key(&self) -> i32 {
        controller_key(self.bus)
    }

    /// Recovers the address a synthesized disk key was derived from.
    pub fn from_disk_key(key: i32) -> Result<Self, AddressError> {
        let offset = key
            .checked_sub(DISK_KEY_BASE)
            .filter(|off| {
                (0..i32::from(SCSI_BUS_COUNT * SCSI_UNITS_PER_BUS))
                    .contains(off)
            })
            .ok_or(AddressError::NotADiskKey(key))?;

        let per_bus = i32::from(SCSI_UNITS_PER_BUS);
        let bus = (offset / per_bus) as u8;
        let unit = (offset % per_bus) as u8;
        Self::new(bus, unit).map_err(|_| AddressError::NotADiskKey(key))
    }

    /// Yields every usable disk address in allocation order.
    pub fn all() -> impl Iterator<Item = ScsiAddress> {
        (0..SCSI_BUS_COUNT).flat_map(Self::on_bus)
    }

    /// Yields the usable disk addresses on one bus, lowest unit first.
    pub fn on_bus(bus: u8) -> impl Iterator<Item = ScsiAddress> {
        (0..SCSI_UNITS_PER_BUS)
            .filter(|unit| *unit != SCSI_CONTROLLER_UNIT)
            .map(move |unit| ScsiAddress { bus, unit })
    }
}

impl FromStr for ScsiAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix("SCSI(")
            .and_then(|rest| rest.strip_suffix(')'))
            .unwrap_or(s);

        let (bus, unit) = inner
            .split_once(':')
            .ok_or_else(|| AddressParseError::Malformed(s.to_owned()))?;

        let bus = u8::from_str(bus)
            .map_err(|_| AddressParseError::Malformed(s.to_owned()))?;
        let unit = u8::from_str(unit)
            .map_err(|_| AddressParseError::Malformed(s.to_owned()))?;

        Ok(Self::new(bus, unit)?)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("expected a SCSI address of the form bus:unit, got {0:?}")]
    Malformed(String),

    #[error(transparent)]
    Invalid(#[from] AddressError),
}

impl Display for ScsiAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SCSI({}:{})", self.bus, self.unit)
    }
}

impl Serialize for ScsiAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{}", self).as_str())
    }
}

impl<'d> Deserialize<'d> for ScsiAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use serde_test::{assert_tokens, Token};

    const TEST_CASES: &[(&str, Result<(u8, u8), ()>)] = &[
        ("0:0", Ok((0, 0))),
        ("1:3", Ok((1, 3))),
        ("3:15", Ok((3, 15))),
        ("SCSI(2:8)", Ok((2, 8))),
        ("0:7", Err(())),
        ("4:0", Err(())),
        ("0:16", Err(())),
        ("0.1", Err(())),
        ("a:b", Err(())),
        ("SCSI(1:2", Err(())),
        ("", Err(())),
        ("alas, poor SCSI device", Err(())),
    ];

    #[test]
    fn scsi_address_from_str() {
        for (input, expected) in TEST_CASES {
            match ScsiAddress::from_str(input) {
                Ok(addr) => {
                    let (bus, unit) = expected.unwrap();
                    assert_eq!((addr.bus(), addr.unit()), (bus, unit));
                }
                Err(_) => assert!(
                    expected.is_err(),
                    "Expected error parsing SCSI address {}",
                    input
                ),
            }
        }
    }

    #[test]
    fn scsi_address_serialization() {
        let addr = ScsiAddress::new(1, 9).unwrap();
        assert_tokens(&addr, &[Token::Str("SCSI(1:9)")]);

        let tokens = [Token::Str("1:7")];
        let mut de = serde_test::Deserializer::new(&tokens);
        assert!(ScsiAddress::deserialize(&mut de).is_err());
    }

    #[test]
    fn known_keys() {
        let addr = ScsiAddress::new(0, 2).unwrap();
        assert_eq!(addr.disk_key(), 2002);
        assert_eq!(addr.controller_key(), 1000);

        let addr = ScsiAddress::new(3, 15).unwrap();
        assert_eq!(addr.disk_key(), 2063);
        assert_eq!(addr.controller_key(), 1003);

        assert_eq!(bus_for_controller_key(1002), Some(2));
        assert_eq!(bus_for_controller_key(1004), None);
        assert_eq!(bus_for_controller_key(200), None);
    }

    #[test]
    fn disk_key_outside_range_is_rejected() {
        assert!(ScsiAddress::from_disk_key(1999).is_err());
        assert!(ScsiAddress::from_disk_key(2064).is_err());
        // Unit 7 never carries a disk.
        assert!(ScsiAddress::from_disk_key(2007).is_err());
    }

    #[test]
    fn all_addresses_skip_the_controller_unit() {
        let all: Vec<_> = ScsiAddress::all().collect();
        assert_eq!(all.len(), TOTAL_DISK_SLOTS);
        assert!(all.iter().all(|a| a.unit() != SCSI_CONTROLLER_UNIT));
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }

    proptest! {
        #[test]
        fn disk_key_round_trips(bus in 0u8..4, unit in 0u8..16) {
            prop_assume!(unit != SCSI_CONTROLLER_UNIT);
            let addr = ScsiAddress::new(bus, unit).unwrap();
            let decoded = ScsiAddress::from_disk_key(addr.disk_key()).unwrap();
            prop_assert_eq!(decoded, addr);
            prop_assert_eq!(
                bus_for_controller_key(addr.controller_key()),
                Some(bus)
            );
        }

        #[test]
        fn display_round_trips(bus in 0u8..4, unit in 0u8..16) {
            prop_assume!(unit != SCSI_CONTROLLER_UNIT);
            let addr = ScsiAddress::new(bus, unit).unwrap();
            let parsed: ScsiAddress = addr.to_string().parse().unwrap();
            prop_assert_eq!(parsed, addr);
        }
    }
}
