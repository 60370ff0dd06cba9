// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A builder for device change batches.

use std::collections::{BTreeMap, BTreeSet};

use slog::{info, warn};
use thiserror::Error;
use vmops_types::{DiskMode, DiskType, NicAdapterType, Requested};

use crate::changes::{ControllerDevice, DeviceChange, DiskDevice, NicDevice};
use crate::devices::{DiskBacking, FlatBacking, RawDiskMappingBacking};
use crate::inventory::{DeviceInventory, Disk, Nic};
use crate::policy::{BuildPolicy, Unrecognized};
use crate::request::{
    DeviceIntent, DiskRemoval, DiskSelector, DiskSpecRequest, NicSpecRequest,
    ReconcileMode, SlotRequest,
};
use crate::slots::{
    nic_backing, resolve_controller, resolve_nic_backing,
    ControllerTypeMismatch, NicBackingChange, ResolvedController,
    SlotAllocator, SlotError,
};

/// Key given to the first NIC added in a batch. Later NICs count down from
/// here; vCenter replaces negative keys when the device is created.
const FIRST_NEW_NIC_KEY: i32 = -100;

/// Errors that can arise while building a device change batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error(transparent)]
    ControllerType(#[from] ControllerTypeMismatch),

    #[error("unrecognized {what} {name:?}")]
    UnrecognizedType { what: &'static str, name: String },

    #[error("no disk matches {0}")]
    UnknownDisk(DiskSelector),

    #[error("no network adapter has key {0}")]
    UnknownNic(i32),

    #[error("device {0} is named by more than one request")]
    DeviceClaimedTwice(i32),

    #[error("disk {key} cannot be converted between raw and flat backings")]
    RawConversion { key: i32, requested: DiskType },

    #[error("raw disk request does not name a host device")]
    MissingRawDevice,

    #[error("network adapter {key} is a {existing}, not a {requested}")]
    NicModelMismatch {
        key: i32,
        existing: String,
        requested: NicAdapterType,
    },
}

impl From<Unrecognized> for BuildError {
    fn from(u: Unrecognized) -> Self {
        Self::UnrecognizedType { what: u.what, name: u.name }
    }
}

/// Accumulates device changes against one VM's existing devices.
///
/// Every change is checked against the inventory and the changes made before
/// it, so a finished batch never claims a slot twice, never touches a device
/// twice, and keeps controllers and their disks consistent.
pub struct ReconfigBuilder<'a> {
    inventory: &'a DeviceInventory,
    policy: &'a BuildPolicy,
    mode: ReconcileMode,
    log: slog::Logger,
    slots: SlotAllocator,
    nic_changes: Vec<DeviceChange>,
    disk_changes: Vec<DeviceChange>,
    new_controllers: BTreeMap<u8, ControllerDevice>,
    claimed: BTreeSet<i32>,
    removed: BTreeSet<i32>,
    buses_added_to: BTreeSet<u8>,
    next_nic_key: i32,
}

impl<'a> ReconfigBuilder<'a> {
    pub fn new(
        inventory: &'a DeviceInventory,
        policy: &'a BuildPolicy,
        mode: ReconcileMode,
        log: slog::Logger,
    ) -> Self {
        Self {
            inventory,
            policy,
            mode,
            log,
            slots: SlotAllocator::from_inventory(inventory),
            nic_changes: Vec::new(),
            disk_changes: Vec::new(),
            new_controllers: BTreeMap::new(),
            claimed: BTreeSet::new(),
            removed: BTreeSet::new(),
            buses_added_to: BTreeSet::new(),
            next_nic_key: FIRST_NEW_NIC_KEY,
        }
    }

    /// Adds every change described by `intent`.
    ///
    /// Removals are applied first, then adapter requests that name a key, so
    /// that requests pairing up with unclaimed adapters only see adapters no
    /// one else asked for.
    pub fn apply(
        &mut self,
        intent: &DeviceIntent,
    ) -> Result<&Self, BuildError> {
        for key in &intent.nic_removals {
            self.remove_nic(*key)?;
        }

        let (keyed, unkeyed): (Vec<_>, Vec<_>) =
            intent.nics.iter().partition(|n| n.existing.is_some());
        for nic in keyed.into_iter().chain(unkeyed) {
            self.add_nic(nic)?;
        }

        for removal in &intent.disk_removals {
            self.remove_disk(removal)?;
        }

        for disk in &intent.disks {
            self.add_disk(disk)?;
        }

        Ok(self)
    }

    fn claim(&mut self, key: i32) -> Result<(), BuildError> {
        if !self.claimed.insert(key) {
            return Err(BuildError::DeviceClaimedTwice(key));
        }

        Ok(())
    }

    fn select_disk(&self, selector: &DiskSelector) -> Result<&'a Disk, BuildError> {
        let inventory = self.inventory;
        match selector {
            DiskSelector::Key(key) => inventory.disk_by_key(*key),
            DiskSelector::Path(path) => inventory.disk_by_path(path),
            DiskSelector::Address(addr) => inventory.disk_at(*addr),
        }
        .ok_or_else(|| BuildError::UnknownDisk(selector.clone()))
    }

    /// Adds or edits a disk, depending on whether `req` matches a disk the VM
    /// already has.
    pub fn add_disk(
        &mut self,
        req: &DiskSpecRequest,
    ) -> Result<&Self, BuildError> {
        let inventory = self.inventory;
        let existing = match &req.existing {
            Some(selector) => Some(self.select_disk(selector)?),
            None => req
                .file_path
                .as_deref()
                .and_then(|path| inventory.disk_by_path(path)),
        };

        match existing {
            Some(disk) => self.edit_disk(disk, req),
            None => self.create_disk(req),
        }
    }

    fn create_disk(
        &mut self,
        req: &DiskSpecRequest,
    ) -> Result<&Self, BuildError> {
        let disk_type = self.policy.resolve(
            &self.log,
            "disk type",
            req.disk_type.as_ref(),
            self.policy.default_disk_type,
        )?;
        let controller_type = self.requested_controller_type(req)?;

        let raw = match disk_type {
            DiskType::Raw(mode) => Some((
                mode,
                req.raw_device.as_ref().ok_or(BuildError::MissingRawDevice)?,
            )),
            _ => None,
        };

        let address = match req.placement {
            SlotRequest::Any => self.slots.allocate()?,
            SlotRequest::OnBus(bus) => self.slots.allocate_on_bus(bus)?,
            SlotRequest::At(address) => self.slots.claim(address)?,
        };

        let controller = match resolve_controller(
            self.inventory,
            &self.new_controllers,
            address.bus(),
            controller_type,
            req.shared_bus,
            self.policy,
            &self.log,
        ) {
            Ok(controller) => controller,
            Err(e) => {
                self.slots.release(address);
                return Err(e.into());
            }
        };
        let controller_key = controller.key();
        if let ResolvedController::New(ctrl) = controller {
            self.new_controllers.insert(address.bus(), ctrl);
        }
        self.buses_added_to.insert(address.bus());

        let file_name = match (&req.file_path, &req.datastore) {
            (Some(path), _) => path.clone(),
            (None, Some(datastore)) => format!("[{datastore}]"),
            (None, None) => String::new(),
        };

        let (backing, capacity_kb) = match raw {
            Some((compatibility_mode, device)) => (
                DiskBacking::RawDiskMapping(RawDiskMappingBacking {
                    device_name: device.device_name.clone(),
                    compatibility_mode,
                    lun_uuid: device.lun_uuid.clone(),
                    file_name,
                    datastore: req.datastore.clone(),
                    disk_mode: DiskMode::IndependentPersistent,
                }),
                None,
            ),
            None => (
                DiskBacking::FlatVer2(FlatBacking {
                    file_name,
                    datastore: req.datastore.clone(),
                    disk_mode: DiskMode::Persistent,
                    provisioning: disk_type.provisioning().unwrap_or_default(),
                    uuid: None,
                }),
                Some(req.capacity_kb),
            ),
        };

        let disk = DiskDevice {
            key: address.disk_key(),
            controller_key,
            unit_number: address.unit(),
            capacity_kb,
            backing,
            address,
        };

        info!(self.log, "adding disk";
              "address" => %address,
              "key" => disk.key,
              "type" => %disk_type,
              "attach" => req.file_path.as_deref());

        self.disk_changes
            .push(DeviceChange::add_disk(disk, req.file_path.is_none()));
        Ok(self)
    }

    fn requested_controller_type(
        &self,
        req: &DiskSpecRequest,
    ) -> Result<Option<vmops_types::ScsiControllerType>, BuildError> {
        req.controller_type
            .as_ref()
            .map(|requested| {
                self.policy.resolve(
                    &self.log,
                    "controller type",
                    Some(requested),
                    self.policy.default_controller_type,
                )
            })
            .transpose()
            .map_err(BuildError::from)
    }

    fn edit_disk(
        &mut self,
        disk: &'a Disk,
        req: &DiskSpecRequest,
    ) -> Result<&Self, BuildError> {
        self.claim(disk.key)?;

        // An unrecognized type on an edit keeps the disk's current format
        // rather than switching it to the default.
        let disk_type = match req.disk_type.as_ref() {
            Some(Requested::Unrecognized(name)) if !self.policy.is_strict() => {
                warn!(self.log, "unrecognized disk type, keeping current format";
                      "key" => disk.key,
                      "requested" => name.as_str());
                None
            }
            other => other
                .map(|requested| {
                    self.policy.resolve(
                        &self.log,
                        "disk type",
                        Some(requested),
                        self.policy.default_disk_type,
                    )
                })
                .transpose()?,
        };

        if let Some(requested) =
            disk_type.filter(|t| t.is_raw() != disk.backing.is_raw())
        {
            return Err(BuildError::RawConversion { key: disk.key, requested });
        }

        // Existing controllers are never changed, but a mismatch is still
        // reported.
        let controller_type = self.requested_controller_type(req)?;
        if controller_type.is_some() || req.shared_bus.is_some() {
            resolve_controller(
                self.inventory,
                &self.new_controllers,
                disk.address.bus(),
                controller_type,
                req.shared_bus,
                self.policy,
                &self.log,
            )?;
        }

        let moved = match req.placement {
            SlotRequest::Any => false,
            SlotRequest::OnBus(bus) => bus != disk.address.bus(),
            SlotRequest::At(address) => address != disk.address,
        };
        if moved {
            warn!(self.log, "disks are not moved between slots";
                  "key" => disk.key,
                  "address" => %disk.address);
        }

        if req.capacity_kb < disk.capacity_kb {
            info!(self.log, "disk capacity cannot shrink, keeping current size";
                  "key" => disk.key,
                  "current_kb" => disk.capacity_kb,
                  "requested_kb" => req.capacity_kb);
        }
        let capacity_kb = disk.capacity_kb.max(req.capacity_kb);

        let (backing, capacity_kb) = match &disk.backing {
            DiskBacking::FlatVer2(current) => {
                let provisioning = disk_type
                    .and_then(DiskType::provisioning)
                    .unwrap_or(current.provisioning);
                (
                    DiskBacking::FlatVer2(FlatBacking {
                        file_name: req
                            .file_path
                            .clone()
                            .unwrap_or_else(|| current.file_name.clone()),
                        datastore: req
                            .datastore
                            .clone()
                            .or_else(|| current.datastore.clone()),
                        provisioning,
                        ..current.clone()
                    }),
                    Some(capacity_kb),
                )
            }
            DiskBacking::RawDiskMapping(current) => {
                let compatibility_mode = match disk_type {
                    Some(DiskType::Raw(mode)) => mode,
                    _ => current.compatibility_mode,
                };
                (
                    DiskBacking::RawDiskMapping(RawDiskMappingBacking {
                        compatibility_mode,
                        file_name: req
                            .file_path
                            .clone()
                            .unwrap_or_else(|| current.file_name.clone()),
                        datastore: req
                            .datastore
                            .clone()
                            .or_else(|| current.datastore.clone()),
                        ..current.clone()
                    }),
                    None,
                )
            }
        };

        info!(self.log, "editing disk";
              "address" => %disk.address,
              "key" => disk.key,
              "capacity_kb" => capacity_kb);

        self.disk_changes.push(DeviceChange::edit_disk(DiskDevice {
            capacity_kb,
            backing,
            ..DiskDevice::from(disk)
        }));
        Ok(self)
    }

    /// Removes a disk, and its controller if nothing else stays on it.
    pub fn remove_disk(
        &mut self,
        removal: &DiskRemoval,
    ) -> Result<&Self, BuildError> {
        let disk = self.select_disk(&removal.selector)?;
        self.claim(disk.key)?;
        self.push_disk_removal(disk, removal.destroy_backing);
        Ok(self)
    }

    fn push_disk_removal(&mut self, disk: &Disk, destroy_backing: bool) {
        info!(self.log, "removing disk";
              "address" => %disk.address,
              "key" => disk.key,
              "destroy_backing" => destroy_backing);

        self.removed.insert(disk.key);
        self.disk_changes.push(DeviceChange::remove_disk(
            DiskDevice::from(disk),
            destroy_backing,
        ));
    }

    /// Adds a NIC, or edits the existing NIC the request names.
    ///
    /// When reconciling exactly, a request without a key edits the first
    /// adapter no other request has claimed.
    pub fn add_nic(
        &mut self,
        req: &NicSpecRequest,
    ) -> Result<&Self, BuildError> {
        let requested_model = req
            .adapter_type
            .as_ref()
            .map(|requested| {
                self.policy.resolve(
                    &self.log,
                    "adapter type",
                    Some(requested),
                    self.policy.default_nic_adapter,
                )
            })
            .transpose()?;

        let inventory = self.inventory;
        let existing = match req.existing {
            Some(key) => {
                Some(inventory.nic_by_key(key).ok_or(BuildError::UnknownNic(key))?)
            }
            None if self.mode == ReconcileMode::Exact => inventory
                .nics()
                .iter()
                .find(|nic| !self.claimed.contains(&nic.key)),
            None => None,
        };

        match existing {
            Some(nic) => self.edit_nic(nic, req, requested_model),
            None => {
                let model =
                    requested_model.unwrap_or(self.policy.default_nic_adapter);
                self.create_nic(req, model)
            }
        }
    }

    fn create_nic(
        &mut self,
        req: &NicSpecRequest,
        model: NicAdapterType,
    ) -> Result<&Self, BuildError> {
        let key = self.next_nic_key;
        self.next_nic_key -= 1;

        info!(self.log, "adding network adapter";
              "key" => key,
              "model" => %model,
              "port_group" => req.port_group.id());

        self.nic_changes.push(DeviceChange::add_nic(NicDevice::new(
            key,
            model,
            nic_backing(&req.port_group),
            req.mac_address.clone(),
        )));
        Ok(self)
    }

    fn edit_nic(
        &mut self,
        nic: &Nic,
        req: &NicSpecRequest,
        requested_model: Option<NicAdapterType>,
    ) -> Result<&Self, BuildError> {
        self.claim(nic.key)?;

        if let Some(requested) =
            requested_model.filter(|m| Some(*m) != nic.model)
        {
            if self.policy.is_strict() {
                return Err(BuildError::NicModelMismatch {
                    key: nic.key,
                    existing: nic.type_name.clone(),
                    requested,
                });
            }

            warn!(self.log, "keeping existing network adapter model";
                  "key" => nic.key,
                  "existing" => nic.type_name.as_str(),
                  "requested" => %requested);
        }

        if req.mac_address.is_some() && req.mac_address != nic.mac_address {
            warn!(self.log, "MAC addresses are only set on new adapters";
                  "key" => nic.key);
        }

        match resolve_nic_backing(&nic.backing, &req.port_group) {
            NicBackingChange::Unchanged => {
                info!(self.log, "network adapter already on port group";
                      "key" => nic.key,
                      "port_group" => req.port_group.id());
            }
            NicBackingChange::Retarget(backing)
            | NicBackingChange::Replace(backing) => {
                info!(self.log, "moving network adapter";
                      "key" => nic.key,
                      "from" => nic.backing.port_group_id(),
                      "to" => backing.port_group_id(),
                      "kind" => backing.kind());
                self.nic_changes
                    .push(DeviceChange::edit_nic(NicDevice::retargeted(
                        nic, backing,
                    )));
            }
        }
        Ok(self)
    }

    /// Removes the NIC with key `key`.
    pub fn remove_nic(&mut self, key: i32) -> Result<&Self, BuildError> {
        let inventory = self.inventory;
        let nic = inventory.nic_by_key(key).ok_or(BuildError::UnknownNic(key))?;
        self.claim(nic.key)?;
        self.push_nic_removal(nic);
        Ok(self)
    }

    fn push_nic_removal(&mut self, nic: &Nic) {
        info!(self.log, "removing network adapter"; "key" => nic.key);
        self.nic_changes.push(DeviceChange::remove_nic(NicDevice::from(nic)));
    }

    /// Completes the batch.
    ///
    /// Under [`ReconcileMode::Exact`] every disk and NIC no request claimed is
    /// removed here. A controller is removed when every device attached to it
    /// has been removed and no disk was added to its bus.
    pub fn finish(mut self) -> Vec<DeviceChange> {
        let inventory = self.inventory;

        if self.mode == ReconcileMode::Exact {
            for nic in inventory.nics() {
                if self.claimed.insert(nic.key) {
                    self.push_nic_removal(nic);
                }
            }

            for disk in inventory.disks() {
                if self.claimed.insert(disk.key) {
                    self.push_disk_removal(disk, false);
                }
            }
        }

        let mut controller_removals = Vec::new();
        for ctrl in inventory.controllers() {
            let emptied = !ctrl.attached.is_empty()
                && ctrl.attached.iter().all(|key| self.removed.contains(key));
            if emptied && !self.buses_added_to.contains(&ctrl.bus) {
                info!(self.log, "removing emptied SCSI controller";
                      "bus" => ctrl.bus,
                      "key" => ctrl.key);
                controller_removals.push(DeviceChange::remove_controller(
                    ControllerDevice::from(ctrl),
                ));
            }
        }

        let mut changes = self.nic_changes;
        changes.append(&mut self.disk_changes);
        changes.extend(
            self.new_controllers.into_values().map(DeviceChange::add_controller),
        );
        changes.append(&mut controller_removals);
        changes
    }
}
