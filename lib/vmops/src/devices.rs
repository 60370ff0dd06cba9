// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device descriptions as reported by vCenter.
//!
//! [`RawDevice`] is the shape a VM's hardware device list arrives in from the
//! remote object model: one loosely-typed record per device, identified by its
//! vSphere class name. Nothing in this module interprets those records; see
//! [`crate::inventory`] for classification.

use serde::{Deserialize, Serialize};
use vmops_types::{CompatibilityMode, DiskMode, ProvisioningFlags, SharedBus};

/// One entry of a VM's `config.hardware.device` list.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawDevice {
    pub key: i32,

    /// The vSphere device class, e.g. `VirtualDisk` or
    /// `ParaVirtualSCSIController`.
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Key of the controller this device hangs off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_key: Option<i32>,

    /// Position of this device on its controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<u8>,

    /// Bus number, for controllers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_number: Option<u8>,

    #[serde(
        default,
        rename = "capacityInKB",
        skip_serializing_if = "Option::is_none"
    )]
    pub capacity_kb: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_bus: Option<SharedBus>,

    /// Keys of the devices attached to this one, for controllers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device: Vec<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing: Option<Backing>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Any device backing the remote side can report.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Backing {
    Disk(DiskBacking),
    Nic(NicBacking),
}

impl Backing {
    pub fn kind(&self) -> &'static str {
        match self {
            Backing::Disk(b) => b.kind(),
            Backing::Nic(b) => b.kind(),
        }
    }
}

/// The storage behind a virtual disk.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DiskBacking {
    FlatVer2(FlatBacking),
    RawDiskMapping(RawDiskMappingBacking),
}

impl DiskBacking {
    pub fn kind(&self) -> &'static str {
        match self {
            DiskBacking::FlatVer2(_) => "flatVer2",
            DiskBacking::RawDiskMapping(_) => "rawDiskMapping",
        }
    }

    pub fn file_name(&self) -> &str {
        match self {
            DiskBacking::FlatVer2(b) => &b.file_name,
            DiskBacking::RawDiskMapping(b) => &b.file_name,
        }
    }

    pub fn datastore(&self) -> Option<&str> {
        match self {
            DiskBacking::FlatVer2(b) => b.datastore.as_deref(),
            DiskBacking::RawDiskMapping(b) => b.datastore.as_deref(),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, DiskBacking::RawDiskMapping(_))
    }
}

/// A VMDK file backing.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlatBacking {
    /// Datastore path of the VMDK, e.g. `[datastore1] vm/vm.vmdk`. Empty or a
    /// bare `[datastore]` when the file is yet to be created.
    #[serde(default)]
    pub file_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,

    #[serde(default)]
    pub disk_mode: DiskMode,

    #[serde(flatten)]
    pub provisioning: ProvisioningFlags,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// A raw device mapping backing.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawDiskMappingBacking {
    /// Host path of the mapped LUN.
    pub device_name: String,

    pub compatibility_mode: CompatibilityMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lun_uuid: Option<String>,

    /// Datastore path of the mapping file.
    #[serde(default)]
    pub file_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,

    #[serde(default)]
    pub disk_mode: DiskMode,
}

/// The network a virtual NIC is plugged into.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NicBacking {
    /// A standard vSwitch port group.
    Network(NetworkBacking),
    /// A distributed vSwitch port group.
    DistributedPort(DistributedPortBacking),
}

impl NicBacking {
    pub fn kind(&self) -> &'static str {
        match self {
            NicBacking::Network(_) => "network",
            NicBacking::DistributedPort(_) => "distributedPort",
        }
    }

    /// The identifier of the port group this backing points at: the network's
    /// managed object id or the distributed port group key.
    pub fn port_group_id(&self) -> &str {
        match self {
            NicBacking::Network(b) => &b.network,
            NicBacking::DistributedPort(b) => &b.portgroup_key,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkBacking {
    /// Managed object id of the network, e.g. `network-12`.
    pub network: String,

    /// Name of the network.
    pub device_name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DistributedPortBacking {
    pub switch_uuid: String,

    /// Key of the port group, e.g. `dvportgroup-100`.
    pub portgroup_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_key: Option<String>,
}
