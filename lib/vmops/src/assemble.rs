// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assembly of complete reconfigure and clone requests.
//!
//! Requests are built in two phases: the device change batch is finished
//! first, and anything derived from it (clone relocation disk locators) is
//! computed from the finished batch afterwards.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::builder::{BuildError, ReconfigBuilder};
use crate::changes::{DeviceChange, Operation};
use crate::customize::{build_customization, Customization, CustomizationRequest};
use crate::devices::{DiskBacking, RawDevice};
use crate::inventory::{DeviceInventory, InventoryError};
use crate::policy::BuildPolicy;
use crate::request::DeviceIntent;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("VM device list is inconsistent")]
    Inventory(#[from] InventoryError),

    #[error("failed to build device changes")]
    Build(#[from] BuildError),
}

/// The instance uuid a request should carry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstanceId {
    /// Leave the VM's uuid alone.
    #[default]
    Keep,
    /// Assign a freshly generated uuid.
    Generate,
    Use(Uuid),
}

/// Virtual hardware settings outside the device list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoardSettings {
    pub cpus: Option<u32>,
    pub cores_per_socket: Option<u32>,
    pub memory_mb: Option<u64>,
    pub instance_id: InstanceId,
}

/// A VM reconfiguration.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconfigureRequest {
    #[serde(rename = "numCPUs", skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_cores_per_socket: Option<u32>,

    #[serde(rename = "memoryMB", skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,

    pub device_change: Vec<DeviceChange>,
}

impl ReconfigureRequest {
    pub fn new(board: &BoardSettings, device_change: Vec<DeviceChange>) -> Self {
        let uuid = match board.instance_id {
            InstanceId::Keep => None,
            InstanceId::Generate => Some(Uuid::new_v4()),
            InstanceId::Use(id) => Some(id),
        };

        Self {
            num_cpus: board.cpus,
            num_cores_per_socket: board.cores_per_socket,
            memory_mb: board.memory_mb,
            uuid,
            device_change,
        }
    }
}

/// Where a disk of a cloned VM is placed.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskLocator {
    pub disk_id: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,

    pub disk_backing_info: DiskBacking,
}

/// Where a clone is placed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,
}

/// Relocation of a clone's storage and compute.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelocateSpec {
    #[serde(flatten)]
    pub placement: Placement,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disk: Vec<DiskLocator>,
}

impl RelocateSpec {
    /// Derives the relocation for a finished change batch: every edited disk
    /// gets a locator carrying its edited backing.
    pub fn for_changes(placement: Placement, changes: &[DeviceChange]) -> Self {
        let disk = changes
            .iter()
            .filter(|c| c.operation() == Operation::Edit)
            .filter_map(DeviceChange::disk)
            .map(|d| DiskLocator {
                disk_id: d.key,
                datastore: d.backing.datastore().map(str::to_owned),
                disk_backing_info: d.backing.clone(),
            })
            .collect();

        Self { placement, disk }
    }
}

/// Clone options besides the device changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloneSettings {
    pub placement: Placement,
    pub customization: Option<CustomizationRequest>,
    pub power_on: bool,
    pub template: bool,
}

/// A VM clone.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneRequest {
    pub location: RelocateSpec,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub customization: Option<Customization>,

    pub config: ReconfigureRequest,
    pub power_on: bool,
    pub template: bool,
}

impl CloneRequest {
    pub fn new(
        board: &BoardSettings,
        changes: Vec<DeviceChange>,
        settings: &CloneSettings,
    ) -> Self {
        let location =
            RelocateSpec::for_changes(settings.placement.clone(), &changes);
        Self {
            location,
            customization: settings.customization.as_ref().map(build_customization),
            config: ReconfigureRequest::new(board, changes),
            power_on: settings.power_on,
            template: settings.template,
        }
    }
}

/// Classifies `devices` and builds the change batch for `intent`.
pub fn plan_changes(
    devices: &[RawDevice],
    intent: &DeviceIntent,
    policy: &BuildPolicy,
    log: &slog::Logger,
) -> Result<Vec<DeviceChange>, PlanError> {
    let inventory = DeviceInventory::from_devices(devices)?;
    if !inventory.unmanaged_disks().is_empty() {
        slog::debug!(log, "ignoring disks on non-SCSI controllers";
                     "count" => inventory.unmanaged_disks().len());
    }

    let mut builder = ReconfigBuilder::new(
        &inventory,
        policy,
        intent.mode,
        log.new(slog::o!("component" => "reconfig-builder")),
    );
    builder.apply(intent)?;
    Ok(builder.finish())
}

/// Builds a complete reconfigure request for a VM with `devices`.
pub fn plan_reconfigure(
    devices: &[RawDevice],
    intent: &DeviceIntent,
    board: &BoardSettings,
    policy: &BuildPolicy,
    log: &slog::Logger,
) -> Result<ReconfigureRequest, PlanError> {
    let changes = plan_changes(devices, intent, policy, log)?;
    Ok(ReconfigureRequest::new(board, changes))
}

/// Builds a complete clone request from a source VM with `devices`.
pub fn plan_clone(
    devices: &[RawDevice],
    intent: &DeviceIntent,
    board: &BoardSettings,
    settings: &CloneSettings,
    policy: &BuildPolicy,
    log: &slog::Logger,
) -> Result<CloneRequest, PlanError> {
    let changes = plan_changes(devices, intent, policy, log)?;
    Ok(CloneRequest::new(board, changes, settings))
}
