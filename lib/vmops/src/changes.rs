// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device change records.
//!
//! A [`DeviceChange`] is one entry of a reconfiguration's `deviceChange` list.
//! Records are built whole by their constructors and never modified
//! afterwards; the builder only ever appends complete records to a batch.

use serde::Serialize;
use vmops_types::{
    NicAdapterType, ScsiAddress, ScsiControllerType, SharedBus,
    SCSI_CONTROLLER_UNIT,
};

use crate::devices::{DiskBacking, NicBacking};
use crate::inventory::{Disk, Nic, ScsiController};

/// Key of the virtual PCI controller new SCSI controllers attach to.
pub const PCI_CONTROLLER_KEY: i32 = 100;

/// PCI slot of the SCSI controller on bus 0; later buses follow it.
const FIRST_SCSI_PCI_UNIT: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Add,
    Edit,
    Remove,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FileOperation {
    Create,
    Destroy,
}

/// A virtual disk as it should exist after the change.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskDevice {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: u8,

    #[serde(rename = "capacityInKB", skip_serializing_if = "Option::is_none")]
    pub capacity_kb: Option<u64>,

    pub backing: DiskBacking,

    #[serde(skip)]
    pub address: ScsiAddress,
}

impl From<&Disk> for DiskDevice {
    fn from(disk: &Disk) -> Self {
        Self {
            key: disk.key,
            controller_key: disk.controller_key,
            unit_number: disk.address.unit(),
            capacity_kb: Some(disk.capacity_kb),
            backing: disk.backing.clone(),
            address: disk.address,
        }
    }
}

/// A SCSI controller.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerDevice {
    pub key: i32,
    pub bus_number: u8,

    #[serde(rename = "type")]
    pub device_type: &'static str,

    #[serde(skip)]
    pub controller_type: ScsiControllerType,

    pub shared_bus: SharedBus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hot_add_remove: Option<bool>,

    /// Key of the PCI controller this controller attaches to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_key: Option<i32>,

    /// PCI slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scsi_ctlr_unit_number: Option<u8>,
}

impl ControllerDevice {
    /// Describes a controller to be created on `bus`.
    pub fn new(
        bus: u8,
        controller_type: ScsiControllerType,
        shared_bus: SharedBus,
    ) -> Self {
        Self {
            key: vmops_types::controller_key(bus),
            bus_number: bus,
            device_type: controller_type.device_type_name(),
            controller_type,
            shared_bus,
            hot_add_remove: Some(true),
            controller_key: Some(PCI_CONTROLLER_KEY),
            unit_number: Some(FIRST_SCSI_PCI_UNIT + bus),
            scsi_ctlr_unit_number: Some(SCSI_CONTROLLER_UNIT),
        }
    }
}

impl From<&ScsiController> for ControllerDevice {
    fn from(ctrl: &ScsiController) -> Self {
        Self {
            key: ctrl.key,
            bus_number: ctrl.bus,
            device_type: ctrl.controller_type.device_type_name(),
            controller_type: ctrl.controller_type,
            shared_bus: ctrl.shared_bus,
            hot_add_remove: None,
            controller_key: ctrl.pci_controller_key,
            unit_number: ctrl.pci_unit,
            scsi_ctlr_unit_number: None,
        }
    }
}

/// Connection state of a NIC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connectable {
    pub start_connected: bool,
    pub allow_guest_control: bool,
    pub connected: bool,
}

impl Connectable {
    pub const ATTACHED: Self = Self {
        start_connected: true,
        allow_guest_control: true,
        connected: true,
    };
}

/// How a NIC's MAC address is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressType {
    Manual,
    Generated,
}

/// A virtual network adapter.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NicDevice {
    pub key: i32,

    #[serde(rename = "type")]
    pub device_type: String,

    #[serde(skip)]
    pub model: Option<NicAdapterType>,

    pub backing: NicBacking,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connectable: Option<Connectable>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_on_lan_enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_type: Option<AddressType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

impl NicDevice {
    /// Describes a new adapter. A given MAC address is pinned; otherwise
    /// vCenter generates one.
    pub fn new(
        key: i32,
        model: NicAdapterType,
        backing: NicBacking,
        mac_address: Option<String>,
    ) -> Self {
        let address_type = if mac_address.is_some() {
            AddressType::Manual
        } else {
            AddressType::Generated
        };

        Self {
            key,
            device_type: model.device_type_name().to_owned(),
            model: Some(model),
            backing,
            connectable: Some(Connectable::ATTACHED),
            wake_on_lan_enabled: Some(true),
            address_type: Some(address_type),
            mac_address,
        }
    }

    /// Describes `nic` moved onto `backing`, reconnected.
    pub fn retargeted(nic: &Nic, backing: NicBacking) -> Self {
        Self {
            key: nic.key,
            device_type: nic.type_name.clone(),
            model: nic.model,
            backing,
            connectable: Some(Connectable::ATTACHED),
            wake_on_lan_enabled: Some(true),
            address_type: None,
            mac_address: None,
        }
    }
}

impl From<&Nic> for NicDevice {
    fn from(nic: &Nic) -> Self {
        Self {
            key: nic.key,
            device_type: nic.type_name.clone(),
            model: nic.model,
            backing: nic.backing.clone(),
            connectable: None,
            wake_on_lan_enabled: None,
            address_type: None,
            mac_address: nic.mac_address.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Device {
    Disk(DiskDevice),
    Controller(ControllerDevice),
    Nic(NicDevice),
}

impl Device {
    pub fn key(&self) -> i32 {
        match self {
            Device::Disk(d) => d.key,
            Device::Controller(c) => c.key,
            Device::Nic(n) => n.key,
        }
    }
}

/// One entry of a reconfiguration's device change list.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceChange {
    operation: Operation,

    #[serde(skip_serializing_if = "Option::is_none")]
    file_operation: Option<FileOperation>,

    device: Device,
}

impl DeviceChange {
    /// Adds a disk, creating its backing file if `create_file` is set.
    pub fn add_disk(disk: DiskDevice, create_file: bool) -> Self {
        Self {
            operation: Operation::Add,
            file_operation: create_file.then_some(FileOperation::Create),
            device: Device::Disk(disk),
        }
    }

    pub fn edit_disk(disk: DiskDevice) -> Self {
        Self {
            operation: Operation::Edit,
            file_operation: None,
            device: Device::Disk(disk),
        }
    }

    /// Detaches a disk, deleting its backing file if `destroy_file` is set.
    pub fn remove_disk(disk: DiskDevice, destroy_file: bool) -> Self {
        Self {
            operation: Operation::Remove,
            file_operation: destroy_file.then_some(FileOperation::Destroy),
            device: Device::Disk(disk),
        }
    }

    pub fn add_controller(ctrl: ControllerDevice) -> Self {
        Self {
            operation: Operation::Add,
            file_operation: None,
            device: Device::Controller(ctrl),
        }
    }

    pub fn remove_controller(ctrl: ControllerDevice) -> Self {
        Self {
            operation: Operation::Remove,
            file_operation: None,
            device: Device::Controller(ctrl),
        }
    }

    pub fn add_nic(nic: NicDevice) -> Self {
        Self {
            operation: Operation::Add,
            file_operation: None,
            device: Device::Nic(nic),
        }
    }

    pub fn edit_nic(nic: NicDevice) -> Self {
        Self {
            operation: Operation::Edit,
            file_operation: None,
            device: Device::Nic(nic),
        }
    }

    pub fn remove_nic(nic: NicDevice) -> Self {
        Self {
            operation: Operation::Remove,
            file_operation: None,
            device: Device::Nic(nic),
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn file_operation(&self) -> Option<FileOperation> {
        self.file_operation
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn disk(&self) -> Option<&DiskDevice> {
        match &self.device {
            Device::Disk(d) => Some(d),
            _ => None,
        }
    }

    pub fn controller(&self) -> Option<&ControllerDevice> {
        match &self.device {
            Device::Controller(c) => Some(c),
            _ => None,
        }
    }

    pub fn nic(&self) -> Option<&NicDevice> {
        match &self.device {
            Device::Nic(n) => Some(n),
            _ => None,
        }
    }
}
