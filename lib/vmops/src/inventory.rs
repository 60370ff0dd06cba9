// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classification of a VM's existing devices.
//!
//! [`DeviceInventory::from_devices`] takes the flat device list reported for a
//! VM and sorts it into the three device families the builder manages (SCSI
//! controllers, the disks attached to them, and network adapters), checking
//! the topology for consistency along the way.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use vmops_types::{
    AddressError, NicAdapterType, ScsiAddress, ScsiControllerType, SharedBus,
    SCSI_BUS_COUNT,
};

use crate::devices::{Backing, DiskBacking, NicBacking, RawDevice};

/// vSphere classes for the virtual Ethernet card family that this crate does
/// not model as a [`NicAdapterType`], but which are still network adapters.
const LEGACY_ETHERNET_TYPES: &[&str] = &[
    "VirtualPCNet32",
    "VirtualVmxnet",
    "VirtualVmxnet2",
    "VirtualVmxnet3Vrdma",
    "VirtualSriovEthernetCard",
];

/// The role a device plays, assigned once from its vSphere class name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceRole {
    /// A SCSI controller of a known flavor.
    Controller(ScsiControllerType),
    Disk,
    /// A virtual Ethernet card. The model is `None` for legacy adapters.
    NetworkAdapter(Option<NicAdapterType>),
    Other,
}

impl DeviceRole {
    pub fn classify(type_name: &str) -> Self {
        if type_name == "VirtualDisk" {
            return Self::Disk;
        }

        if let Some(ty) = ScsiControllerType::from_device_type_name(type_name)
        {
            return Self::Controller(ty);
        }

        if let Some(model) = NicAdapterType::from_device_type_name(type_name) {
            return Self::NetworkAdapter(Some(model));
        }

        if LEGACY_ETHERNET_TYPES.contains(&type_name) {
            return Self::NetworkAdapter(None);
        }

        Self::Other
    }
}

/// Errors raised when a device list is internally inconsistent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("device key {0} appears more than once")]
    DuplicateKey(i32),

    #[error("SCSI controller {key} has no bus number")]
    ControllerMissingBus { key: i32 },

    #[error("SCSI controller {key} sits on bus {bus}, outside range of 0-{max}", max = SCSI_BUS_COUNT - 1)]
    ControllerBusOutOfRange { key: i32, bus: u8 },

    #[error("SCSI controllers {first} and {second} both claim bus {bus}")]
    DuplicateControllerBus { bus: u8, first: i32, second: i32 },

    #[error("disk {key} has no controller key")]
    DiskMissingController { key: i32 },

    #[error("disk {key} has no unit number")]
    DiskMissingUnit { key: i32 },

    #[error("disk {key} refers to controller {controller_key}, which does not exist")]
    UnknownController { key: i32, controller_key: i32 },

    #[error("disk {key} has an invalid SCSI position")]
    InvalidDiskAddress {
        key: i32,
        #[source]
        source: AddressError,
    },

    #[error("disks {first} and {second} both occupy {address}")]
    DuplicateDiskAddress { address: ScsiAddress, first: i32, second: i32 },

    #[error("device {key} has no backing")]
    MissingBacking { key: i32 },

    #[error("device {key} has a {found} backing, expected a {expected} backing")]
    WrongBackingKind { key: i32, expected: &'static str, found: &'static str },
}

/// An existing SCSI controller.
#[derive(Clone, Debug, PartialEq)]
pub struct ScsiController {
    pub key: i32,
    pub bus: u8,
    pub controller_type: ScsiControllerType,
    pub shared_bus: SharedBus,

    /// Key of the PCI controller this controller is attached to.
    pub pci_controller_key: Option<i32>,

    /// PCI slot of this controller.
    pub pci_unit: Option<u8>,

    /// Keys of every device the remote side reports as attached, plus any
    /// disks found pointing at this controller.
    pub attached: BTreeSet<i32>,
}

/// An existing disk on a managed SCSI controller.
#[derive(Clone, Debug, PartialEq)]
pub struct Disk {
    pub key: i32,
    pub controller_key: i32,
    pub address: ScsiAddress,
    pub capacity_kb: u64,
    pub backing: DiskBacking,
    pub label: Option<String>,
}

/// An existing virtual network adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct Nic {
    pub key: i32,

    /// The vSphere class of the adapter, kept so that edits can echo it.
    pub type_name: String,

    pub model: Option<NicAdapterType>,
    pub backing: NicBacking,
    pub mac_address: Option<String>,
    pub label: Option<String>,
}

/// The classified devices of a VM.
#[derive(Clone, Debug, Default)]
pub struct DeviceInventory {
    controllers: BTreeMap<u8, ScsiController>,
    disks: BTreeMap<ScsiAddress, Disk>,
    nics: Vec<Nic>,
    unmanaged_disks: Vec<RawDevice>,
}

impl DeviceInventory {
    /// Classifies `devices`, validating the SCSI topology and the kinds of
    /// backing each disk and adapter carries.
    pub fn from_devices(devices: &[RawDevice]) -> Result<Self, InventoryError> {
        let mut keys = BTreeSet::new();
        for dev in devices {
            if !keys.insert(dev.key) {
                return Err(InventoryError::DuplicateKey(dev.key));
            }
        }

        let mut inventory = Self::default();
        let mut disks = Vec::new();
        for dev in devices {
            match DeviceRole::classify(&dev.type_name) {
                DeviceRole::Controller(ty) => inventory.add_controller(dev, ty)?,
                DeviceRole::Disk => disks.push(dev),
                DeviceRole::NetworkAdapter(model) => {
                    inventory.add_nic(dev, model)?
                }
                DeviceRole::Other => {}
            }
        }

        // Disks are placed once every controller is known, since the device
        // list is not ordered controllers-first.
        for dev in disks {
            inventory.add_disk(dev, &keys)?;
        }

        Ok(inventory)
    }

    fn add_controller(
        &mut self,
        dev: &RawDevice,
        controller_type: ScsiControllerType,
    ) -> Result<(), InventoryError> {
        let bus = dev
            .bus_number
            .ok_or(InventoryError::ControllerMissingBus { key: dev.key })?;
        if bus >= SCSI_BUS_COUNT {
            return Err(InventoryError::ControllerBusOutOfRange {
                key: dev.key,
                bus,
            });
        }

        if let Some(first) = self.controllers.get(&bus) {
            return Err(InventoryError::DuplicateControllerBus {
                bus,
                first: first.key,
                second: dev.key,
            });
        }

        self.controllers.insert(
            bus,
            ScsiController {
                key: dev.key,
                bus,
                controller_type,
                shared_bus: dev.shared_bus.unwrap_or_default(),
                pci_controller_key: dev.controller_key,
                pci_unit: dev.unit_number,
                attached: dev.device.iter().copied().collect(),
            },
        );
        Ok(())
    }

    fn add_nic(
        &mut self,
        dev: &RawDevice,
        model: Option<NicAdapterType>,
    ) -> Result<(), InventoryError> {
        let backing = match &dev.backing {
            Some(Backing::Nic(b)) => b.clone(),
            Some(other) => {
                return Err(InventoryError::WrongBackingKind {
                    key: dev.key,
                    expected: "network",
                    found: other.kind(),
                })
            }
            None => return Err(InventoryError::MissingBacking { key: dev.key }),
        };

        self.nics.push(Nic {
            key: dev.key,
            type_name: dev.type_name.clone(),
            model,
            backing,
            mac_address: dev.mac_address.clone(),
            label: dev.label.clone(),
        });
        Ok(())
    }

    fn add_disk(
        &mut self,
        dev: &RawDevice,
        all_keys: &BTreeSet<i32>,
    ) -> Result<(), InventoryError> {
        let controller_key = dev
            .controller_key
            .ok_or(InventoryError::DiskMissingController { key: dev.key })?;

        let Some(bus) = self.bus_of(controller_key) else {
            if all_keys.contains(&controller_key) {
                // IDE, SATA, and NVMe disks are left alone.
                self.unmanaged_disks.push(dev.clone());
                return Ok(());
            }

            return Err(InventoryError::UnknownController {
                key: dev.key,
                controller_key,
            });
        };

        let unit = dev
            .unit_number
            .ok_or(InventoryError::DiskMissingUnit { key: dev.key })?;
        let address = ScsiAddress::new(bus, unit).map_err(|source| {
            InventoryError::InvalidDiskAddress { key: dev.key, source }
        })?;

        let backing = match &dev.backing {
            Some(Backing::Disk(b)) => b.clone(),
            Some(other) => {
                return Err(InventoryError::WrongBackingKind {
                    key: dev.key,
                    expected: "disk",
                    found: other.kind(),
                })
            }
            None => return Err(InventoryError::MissingBacking { key: dev.key }),
        };

        if let Some(first) = self.disks.get(&address) {
            return Err(InventoryError::DuplicateDiskAddress {
                address,
                first: first.key,
                second: dev.key,
            });
        }

        if let Some(ctrl) = self.controllers.get_mut(&bus) {
            ctrl.attached.insert(dev.key);
        }

        self.disks.insert(
            address,
            Disk {
                key: dev.key,
                controller_key,
                address,
                capacity_kb: dev.capacity_kb.unwrap_or(0),
                backing,
                label: dev.label.clone(),
            },
        );
        Ok(())
    }

    fn bus_of(&self, controller_key: i32) -> Option<u8> {
        self.controllers
            .values()
            .find(|c| c.key == controller_key)
            .map(|c| c.bus)
    }

    /// SCSI controllers, in bus order.
    pub fn controllers(&self) -> impl Iterator<Item = &ScsiController> {
        self.controllers.values()
    }

    pub fn controller_on_bus(&self, bus: u8) -> Option<&ScsiController> {
        self.controllers.get(&bus)
    }

    pub fn controller_by_key(&self, key: i32) -> Option<&ScsiController> {
        self.controllers.values().find(|c| c.key == key)
    }

    /// Managed disks, in address order.
    pub fn disks(&self) -> impl Iterator<Item = &Disk> {
        self.disks.values()
    }

    pub fn disks_on(&self, controller_key: i32) -> impl Iterator<Item = &Disk> {
        self.disks.values().filter(move |d| d.controller_key == controller_key)
    }

    pub fn disk_at(&self, address: ScsiAddress) -> Option<&Disk> {
        self.disks.get(&address)
    }

    pub fn disk_by_key(&self, key: i32) -> Option<&Disk> {
        self.disks.values().find(|d| d.key == key)
    }

    /// Finds the disk whose backing file is `path`.
    pub fn disk_by_path(&self, path: &str) -> Option<&Disk> {
        self.disks.values().find(|d| {
            let name = d.backing.file_name();
            !name.is_empty() && name == path
        })
    }

    /// SCSI slots already holding a disk.
    pub fn occupied(&self) -> impl Iterator<Item = ScsiAddress> + '_ {
        self.disks.keys().copied()
    }

    /// Network adapters, in device list order.
    pub fn nics(&self) -> &[Nic] {
        &self.nics
    }

    pub fn nic_by_key(&self, key: i32) -> Option<&Nic> {
        self.nics.iter().find(|n| n.key == key)
    }

    /// Disks attached to IDE, SATA, or NVMe controllers.
    pub fn unmanaged_disks(&self) -> &[RawDevice] {
        &self.unmanaged_disks
    }
}
