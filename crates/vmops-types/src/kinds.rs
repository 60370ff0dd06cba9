// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! String vocabularies for device types.
//!
//! The spellings here are vCenter's own and must not be renamed: they appear
//! verbatim in caller input and in the requests handed to the remote side.

use std::fmt::Display;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Implements `Serialize`/`Deserialize` through a type's `Display` and
/// `FromStr` impls.
macro_rules! serde_via_str {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'d> Deserialize<'d> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'d>,
            {
                let s = String::deserialize(deserializer)?;
                FromStr::from_str(&s).map_err(de::Error::custom)
            }
        }
    };
}

/// The flavor of SCSI controller a bus is driven by.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum ScsiControllerType {
    BusLogic,
    LsiLogic,
    #[strum(to_string = "LsiLogicSAS")]
    LsiLogicSas,
    ParaVirtual,
}
serde_via_str!(ScsiControllerType);

impl ScsiControllerType {
    /// The vSphere device class implementing this controller type.
    pub fn device_type_name(self) -> &'static str {
        match self {
            Self::BusLogic => "VirtualBusLogicController",
            Self::LsiLogic => "VirtualLsiLogicController",
            Self::LsiLogicSas => "VirtualLsiLogicSASController",
            Self::ParaVirtual => "ParaVirtualSCSIController",
        }
    }

    pub fn from_device_type_name(name: &str) -> Option<Self> {
        <Self as strum::IntoEnumIterator>::iter()
            .find(|ty| ty.device_type_name() == name)
    }
}

/// A virtual network adapter model.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum NicAdapterType {
    E1000,
    E1000E,
    #[strum(to_string = "VMXNET3")]
    Vmxnet3,
}
serde_via_str!(NicAdapterType);

impl NicAdapterType {
    pub fn device_type_name(self) -> &'static str {
        match self {
            Self::E1000 => "VirtualE1000",
            Self::E1000E => "VirtualE1000e",
            Self::Vmxnet3 => "VirtualVmxnet3",
        }
    }

    pub fn from_device_type_name(name: &str) -> Option<Self> {
        <Self as strum::IntoEnumIterator>::iter()
            .find(|ty| ty.device_type_name() == name)
    }
}

/// How a SCSI bus may be shared between VMs.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "camelCase")]
pub enum SharedBus {
    #[default]
    NoSharing,
    VirtualSharing,
    PhysicalSharing,
}
serde_via_str!(SharedBus);

/// Compatibility mode of a raw device mapping.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "camelCase")]
pub enum CompatibilityMode {
    VirtualMode,
    PhysicalMode,
}
serde_via_str!(CompatibilityMode);

/// Persistence mode of a disk backing.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum DiskMode {
    #[default]
    Persistent,
    Nonpersistent,
    Undoable,
    IndependentPersistent,
    IndependentNonpersistent,
    Append,
}
serde_via_str!(DiskMode);

/// How a virtual disk's storage is provisioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiskType {
    /// Space is allocated on demand.
    Thin,
    /// Space is allocated up front and zeroed lazily.
    Preallocated,
    /// Space is allocated and zeroed up front.
    EagerZeroedThick,
    /// The disk maps a raw host device instead of a file.
    Raw(CompatibilityMode),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unrecognized disk type {0:?}")]
pub struct UnknownDiskType(pub String);

impl FromStr for DiskType {
    type Err = UnknownDiskType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thin" => Ok(Self::Thin),
            // "thick" is the historical name for lazily zeroed thick disks.
            "preallocated" | "thick" => Ok(Self::Preallocated),
            "eagerZeroedThick" => Ok(Self::EagerZeroedThick),
            "rdm" => Ok(Self::Raw(CompatibilityMode::VirtualMode)),
            "rdmp" => Ok(Self::Raw(CompatibilityMode::PhysicalMode)),
            _ => Err(UnknownDiskType(s.to_owned())),
        }
    }
}

impl Display for DiskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Thin => "thin",
            Self::Preallocated => "preallocated",
            Self::EagerZeroedThick => "eagerZeroedThick",
            Self::Raw(CompatibilityMode::VirtualMode) => "rdm",
            Self::Raw(CompatibilityMode::PhysicalMode) => "rdmp",
        };
        f.write_str(s)
    }
}
serde_via_str!(DiskType);

impl DiskType {
    pub fn is_raw(self) -> bool {
        matches!(self, Self::Raw(_))
    }

    /// The flat-file backing flags that select this provisioning type, or
    /// `None` for raw mappings, which have no such flags.
    pub fn provisioning(self) -> Option<ProvisioningFlags> {
        match self {
            Self::Thin => Some(ProvisioningFlags {
                thin_provisioned: Some(true),
                eagerly_scrub: None,
            }),
            Self::Preallocated => Some(ProvisioningFlags {
                thin_provisioned: Some(false),
                eagerly_scrub: Some(false),
            }),
            Self::EagerZeroedThick => Some(ProvisioningFlags {
                thin_provisioned: Some(false),
                eagerly_scrub: Some(true),
            }),
            Self::Raw(_) => None,
        }
    }
}

/// The provisioning flags carried by a flat-file disk backing.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thin_provisioned: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eagerly_scrub: Option<bool>,
}

impl ProvisioningFlags {
    /// Classifies a set of backing flags. Thin provisioning wins over eager
    /// scrubbing; a backing with neither set is preallocated.
    pub fn disk_type(&self) -> DiskType {
        if self.thin_provisioned == Some(true) {
            DiskType::Thin
        } else if self.eagerly_scrub == Some(true) {
            DiskType::EagerZeroedThick
        } else {
            DiskType::Preallocated
        }
    }
}

/// A type named by a caller, which may or may not be one this crate knows.
///
/// Unrecognized names are kept verbatim so that the code consuming the request
/// can decide whether to substitute a default or refuse the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requested<T> {
    Known(T),
    Unrecognized(String),
}

impl<T: FromStr> Requested<T> {
    pub fn parse(s: &str) -> Self {
        match T::from_str(s) {
            Ok(t) => Self::Known(t),
            Err(_) => Self::Unrecognized(s.to_owned()),
        }
    }
}

impl<T> From<T> for Requested<T> {
    fn from(value: T) -> Self {
        Self::Known(value)
    }
}

impl<T: Display> Display for Requested<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(t) => t.fmt(f),
            Self::Unrecognized(s) => f.write_str(s),
        }
    }
}

impl<T: Display> Serialize for Requested<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'d, T: FromStr> Deserialize<'d> for Requested<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_test::{assert_tokens, Token};

    #[test]
    fn disk_type_mapping() {
        let thin = DiskType::Thin.provisioning().unwrap();
        assert_eq!(thin.thin_provisioned, Some(true));
        assert_eq!(thin.eagerly_scrub, None);

        let eager = DiskType::EagerZeroedThick.provisioning().unwrap();
        assert_eq!(eager.thin_provisioned, Some(false));
        assert_eq!(eager.eagerly_scrub, Some(true));

        let prealloc = DiskType::Preallocated.provisioning().unwrap();
        assert_eq!(prealloc.thin_provisioned, Some(false));
        assert_eq!(prealloc.eagerly_scrub, Some(false));

        assert!(DiskType::Raw(CompatibilityMode::PhysicalMode)
            .provisioning()
            .is_none());
    }

    #[test]
    fn raw_modes_are_distinct_set_members() {
        use std::collections::HashSet;

        let seen: HashSet<DiskType> = [
            DiskType::Raw(CompatibilityMode::VirtualMode),
            DiskType::Raw(CompatibilityMode::PhysicalMode),
            DiskType::Raw(CompatibilityMode::VirtualMode),
            DiskType::Thin,
        ]
        .into_iter()
        .collect();
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn provisioning_flags_classify_back() {
        for ty in [
            DiskType::Thin,
            DiskType::Preallocated,
            DiskType::EagerZeroedThick,
        ] {
            assert_eq!(ty.provisioning().unwrap().disk_type(), ty);
        }

        // A backing reporting nothing is treated as preallocated.
        assert_eq!(
            ProvisioningFlags::default().disk_type(),
            DiskType::Preallocated
        );
    }

    #[test]
    fn disk_type_strings() {
        assert_eq!("thin".parse::<DiskType>().unwrap(), DiskType::Thin);
        assert_eq!(
            "thick".parse::<DiskType>().unwrap(),
            DiskType::Preallocated
        );
        assert_eq!(
            "rdmp".parse::<DiskType>().unwrap(),
            DiskType::Raw(CompatibilityMode::PhysicalMode)
        );
        assert!("sparse".parse::<DiskType>().is_err());
        assert_eq!(DiskType::EagerZeroedThick.to_string(), "eagerZeroedThick");
    }

    #[test]
    fn controller_type_strings() {
        assert_tokens(
            &ScsiControllerType::LsiLogicSas,
            &[Token::Str("LsiLogicSAS")],
        );
        assert_eq!(
            "lsiLogicsas".parse::<ScsiControllerType>().unwrap(),
            ScsiControllerType::LsiLogicSas
        );
        assert_eq!(
            "paraVirtual".parse::<ScsiControllerType>().unwrap(),
            ScsiControllerType::ParaVirtual
        );
        assert_eq!(
            ScsiControllerType::from_device_type_name(
                "ParaVirtualSCSIController"
            ),
            Some(ScsiControllerType::ParaVirtual)
        );
    }

    #[test]
    fn adapter_type_strings() {
        assert_tokens(&NicAdapterType::Vmxnet3, &[Token::Str("VMXNET3")]);
        assert_eq!(
            "e1000e".parse::<NicAdapterType>().unwrap(),
            NicAdapterType::E1000E
        );
        assert_eq!(
            NicAdapterType::from_device_type_name("VirtualE1000"),
            Some(NicAdapterType::E1000)
        );
        assert!("pcnet32".parse::<NicAdapterType>().is_err());
    }

    #[test]
    fn vocabulary_spellings() {
        assert_eq!(SharedBus::PhysicalSharing.to_string(), "physicalSharing");
        assert_eq!(CompatibilityMode::VirtualMode.to_string(), "virtualMode");
        assert_eq!(
            DiskMode::IndependentPersistent.to_string(),
            "independent_persistent"
        );
    }

    #[test]
    fn requested_keeps_unrecognized_names() {
        let req: Requested<NicAdapterType> =
            serde_json::from_str("\"vmxnet2\"").unwrap();
        assert_eq!(req, Requested::Unrecognized("vmxnet2".to_owned()));

        let req: Requested<DiskType> =
            serde_json::from_str("\"eagerZeroedThick\"").unwrap();
        assert_eq!(req, Requested::Known(DiskType::EagerZeroedThick));
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            "\"eagerZeroedThick\""
        );
    }
}
