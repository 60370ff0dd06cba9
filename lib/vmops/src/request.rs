// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptions of the disks and adapters a caller wants a VM to have.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use vmops_types::{
    DiskType, NicAdapterType, Requested, ScsiAddress, ScsiControllerType,
    SharedBus,
};

/// Where a new disk may be placed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotRequest {
    /// The first free slot, bus 0 first.
    #[default]
    Any,
    /// The lowest free unit on one bus.
    OnBus(u8),
    /// Exactly this address.
    At(ScsiAddress),
}

/// Identifies an existing disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskSelector {
    Key(i32),
    /// The datastore path of the disk's backing file.
    Path(String),
    Address(ScsiAddress),
}

impl Display for DiskSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key {key}"),
            Self::Path(path) => write!(f, "path {path:?}"),
            Self::Address(addr) => write!(f, "{addr}"),
        }
    }
}

/// The host device behind a raw disk mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDeviceRef {
    /// Host path of the LUN, e.g. `/vmfs/devices/disks/naa.6000...`.
    pub device_name: String,
    pub lun_uuid: Option<String>,
}

/// A disk the VM should have.
///
/// If `existing` names a disk, or `file_path` matches the backing file of one,
/// the request edits that disk. Otherwise it adds a new one: attached to
/// `file_path` when given, or backed by a newly created file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiskSpecRequest {
    pub capacity_kb: u64,
    pub disk_type: Option<Requested<DiskType>>,
    pub datastore: Option<String>,
    pub placement: SlotRequest,
    pub existing: Option<DiskSelector>,
    pub file_path: Option<String>,
    pub controller_type: Option<Requested<ScsiControllerType>>,
    pub shared_bus: Option<SharedBus>,
    pub raw_device: Option<RawDeviceRef>,
}

impl DiskSpecRequest {
    pub fn new(capacity_kb: u64) -> Self {
        Self { capacity_kb, ..Default::default() }
    }
}

/// A disk the VM should no longer have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskRemoval {
    pub selector: DiskSelector,
    /// Delete the backing file as well as detaching it.
    pub destroy_backing: bool,
}

/// The port group a NIC should be connected to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortGroupRef {
    /// A standard vSwitch network.
    Network { moid: String, name: String },
    /// A distributed vSwitch port group.
    Distributed {
        key: String,
        switch_uuid: String,
        #[serde(default)]
        port_key: Option<String>,
    },
}

impl PortGroupRef {
    /// The identifier compared against an existing backing to decide whether
    /// a NIC already points here.
    pub fn id(&self) -> &str {
        match self {
            Self::Network { moid, .. } => moid,
            Self::Distributed { key, .. } => key,
        }
    }
}

/// A network adapter the VM should have.
#[derive(Clone, Debug, PartialEq)]
pub struct NicSpecRequest {
    pub port_group: PortGroupRef,
    pub adapter_type: Option<Requested<NicAdapterType>>,
    /// Key of an existing adapter to edit.
    pub existing: Option<i32>,
    pub mac_address: Option<String>,
}

impl NicSpecRequest {
    pub fn new(port_group: PortGroupRef) -> Self {
        Self {
            port_group,
            adapter_type: None,
            existing: None,
            mac_address: None,
        }
    }
}

/// How requests relate to the devices a VM already has.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Only devices named by a request are touched.
    #[default]
    Incremental,
    /// The requests describe the complete set of disks and adapters: existing
    /// devices no request claims are removed, and adapter requests without a
    /// key take over unclaimed adapters in device order.
    Exact,
}

/// Everything a caller wants changed about a VM's disks and adapters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceIntent {
    pub mode: ReconcileMode,
    pub disks: Vec<DiskSpecRequest>,
    pub disk_removals: Vec<DiskRemoval>,
    pub nics: Vec<NicSpecRequest>,
    pub nic_removals: Vec<i32>,
}
