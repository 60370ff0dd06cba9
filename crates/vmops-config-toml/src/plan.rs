// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functions for converting a [`super::Config`] into the requests the core
//! builder consumes.

use thiserror::Error;
use uuid::Uuid;
use vmops::assemble::{BoardSettings, CloneSettings, InstanceId, Placement};
use vmops::customize::{CustomizationRequest, GuestFamily, NicIpSettings};
use vmops::policy::BuildPolicy;
use vmops::request::{
    DeviceIntent, DiskRemoval, DiskSelector, DiskSpecRequest, NicSpecRequest,
    PortGroupRef, RawDeviceRef, SlotRequest,
};
use vmops_types::{DiskType, ScsiAddress};

const KB_PER_GB: u64 = 1024 * 1024;

/// Value of `board.instance_uuid` asking for a fresh uuid.
pub const GENERATE_UUID: &str = "generate";

#[derive(Debug, Error)]
pub enum TomlToPlanError {
    #[error("raw disk type {0} cannot be the default_disk_type")]
    RawDefaultDiskType(DiskType),

    #[error("disk {0}: size of {1} GiB is too large")]
    DiskTooLarge(usize, u64),

    #[error("disk {0}: bus and address are mutually exclusive")]
    ConflictingPlacement(usize),

    #[error(
        "disk {0}: at most one of existing_key, existing_path and \
         existing_address may be set"
    )]
    ConflictingSelectors(usize),

    #[error("disk {0}: lun_uuid given without raw_device")]
    LunWithoutDevice(usize),

    #[error("disk removal {0}: exactly one of key, path and address must be set")]
    InvalidRemovalSelector(usize),

    #[error("nic {0}: exactly one of network and portgroup must be set")]
    InvalidPortGroup(usize),

    #[error("nic {0}: distributed port group needs a switch_uuid")]
    MissingSwitchUuid(usize),

    #[error("nic {0}: ip and netmask must be given together")]
    IncompleteAddress(usize),

    #[error("invalid instance uuid {0:?}")]
    InvalidInstanceUuid(String, #[source] uuid::Error),

    #[error("unrecognized guest family {0:?}")]
    UnknownGuestFamily(String),

    #[error("customization needs a family or a guest_id")]
    MissingGuestFamily,
}

/// A clone destination and its settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ClonePlan {
    pub name: String,
    pub folder: String,
    pub settings: CloneSettings,
}

/// Everything a plan file asks for, in the core's terms.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    pub policy: BuildPolicy,
    pub intent: DeviceIntent,
    pub board: BoardSettings,
    pub clone: Option<ClonePlan>,
}

impl TryFrom<&super::Config> for Plan {
    type Error = TomlToPlanError;

    fn try_from(config: &super::Config) -> Result<Self, Self::Error> {
        let opts = &config.options;
        if let Some(ty) = opts.default_disk_type.filter(|ty| ty.is_raw()) {
            return Err(TomlToPlanError::RawDefaultDiskType(ty));
        }

        let defaults = BuildPolicy::default();
        let policy = BuildPolicy {
            strictness: opts.strictness.unwrap_or(defaults.strictness),
            default_controller_type: opts
                .default_controller
                .unwrap_or(defaults.default_controller_type),
            default_disk_type: opts
                .default_disk_type
                .unwrap_or(defaults.default_disk_type),
            default_nic_adapter: opts
                .default_adapter
                .unwrap_or(defaults.default_nic_adapter),
            default_shared_bus: opts
                .default_shared_bus
                .unwrap_or(defaults.default_shared_bus),
        };

        let mut intent = DeviceIntent {
            mode: opts.mode.unwrap_or_default(),
            ..Default::default()
        };

        for (idx, disk) in config.disks.iter().enumerate() {
            intent.disks.push(parse_disk(idx, disk)?);
        }

        for (idx, removal) in config.disk_removals.iter().enumerate() {
            let mut found = selectors(
                removal.key,
                removal.path.as_ref(),
                removal.address,
            );
            if found.len() != 1 {
                return Err(TomlToPlanError::InvalidRemovalSelector(idx));
            }
            intent.disk_removals.push(DiskRemoval {
                selector: found.remove(0),
                destroy_backing: removal.destroy,
            });
        }

        let mut ip_settings = Vec::with_capacity(config.nics.len());
        for (idx, nic) in config.nics.iter().enumerate() {
            intent.nics.push(parse_nic(idx, nic)?);
            ip_settings.push(parse_ip_settings(idx, nic)?);
        }

        intent.nic_removals =
            config.nic_removals.iter().map(|r| r.key).collect();

        let board = BoardSettings {
            cpus: config.board.cpus,
            cores_per_socket: config.board.cores_per_socket,
            memory_mb: config.board.memory_mb,
            instance_id: match config.board.instance_uuid.as_deref() {
                None => InstanceId::Keep,
                Some(GENERATE_UUID) => InstanceId::Generate,
                Some(s) => InstanceId::Use(Uuid::parse_str(s).map_err(
                    |e| TomlToPlanError::InvalidInstanceUuid(s.to_owned(), e),
                )?),
            },
        };

        let clone = config
            .clone
            .as_ref()
            .map(|target| parse_clone(target, ip_settings))
            .transpose()?;

        Ok(Plan { policy, intent, board, clone })
    }
}

fn selectors(
    key: Option<i32>,
    path: Option<&String>,
    address: Option<ScsiAddress>,
) -> Vec<DiskSelector> {
    key.map(DiskSelector::Key)
        .into_iter()
        .chain(path.cloned().map(DiskSelector::Path))
        .chain(address.map(DiskSelector::Address))
        .collect()
}

fn parse_disk(
    idx: usize,
    disk: &super::Disk,
) -> Result<DiskSpecRequest, TomlToPlanError> {
    let capacity_kb = disk
        .size_gb
        .checked_mul(KB_PER_GB)
        .ok_or(TomlToPlanError::DiskTooLarge(idx, disk.size_gb))?;

    let placement = match (disk.bus, disk.address) {
        (None, None) => SlotRequest::Any,
        (Some(bus), None) => SlotRequest::OnBus(bus),
        (None, Some(addr)) => SlotRequest::At(addr),
        (Some(_), Some(_)) => {
            return Err(TomlToPlanError::ConflictingPlacement(idx))
        }
    };

    let mut existing = selectors(
        disk.existing_key,
        disk.existing_path.as_ref(),
        disk.existing_address,
    );
    if existing.len() > 1 {
        return Err(TomlToPlanError::ConflictingSelectors(idx));
    }

    let raw_device = match (&disk.raw_device, &disk.lun_uuid) {
        (Some(device_name), lun_uuid) => Some(RawDeviceRef {
            device_name: device_name.clone(),
            lun_uuid: lun_uuid.clone(),
        }),
        (None, Some(_)) => {
            return Err(TomlToPlanError::LunWithoutDevice(idx))
        }
        (None, None) => None,
    };

    Ok(DiskSpecRequest {
        capacity_kb,
        disk_type: disk.disk_type.clone(),
        datastore: disk.datastore.clone(),
        placement,
        existing: existing.pop(),
        file_path: disk.file_path.clone(),
        controller_type: disk.controller.clone(),
        shared_bus: disk.shared_bus,
        raw_device,
    })
}

fn parse_nic(
    idx: usize,
    nic: &super::Nic,
) -> Result<NicSpecRequest, TomlToPlanError> {
    let port_group = match (&nic.network, &nic.portgroup) {
        (Some(moid), None) => PortGroupRef::Network {
            moid: moid.clone(),
            name: nic.network_name.clone().unwrap_or_else(|| moid.clone()),
        },
        (None, Some(key)) => PortGroupRef::Distributed {
            key: key.clone(),
            switch_uuid: nic
                .switch_uuid
                .clone()
                .ok_or(TomlToPlanError::MissingSwitchUuid(idx))?,
            port_key: nic.port_key.clone(),
        },
        _ => return Err(TomlToPlanError::InvalidPortGroup(idx)),
    };

    Ok(NicSpecRequest {
        port_group,
        adapter_type: nic.adapter.clone(),
        existing: nic.existing_key,
        mac_address: nic.mac_address.clone(),
    })
}

fn parse_ip_settings(
    idx: usize,
    nic: &super::Nic,
) -> Result<NicIpSettings, TomlToPlanError> {
    match (nic.ip, nic.netmask) {
        (Some(ip), Some(netmask)) => {
            Ok(NicIpSettings::Fixed { ip, netmask, gateway: nic.gateway })
        }
        (None, None) => Ok(NicIpSettings::Dhcp),
        _ => Err(TomlToPlanError::IncompleteAddress(idx)),
    }
}

fn parse_clone(
    target: &super::CloneTarget,
    ip_settings: Vec<NicIpSettings>,
) -> Result<ClonePlan, TomlToPlanError> {
    let customization = target
        .customization
        .as_ref()
        .map(|custom| {
            let family = match (&custom.family, &custom.guest_id) {
                (Some(family), _) => family.parse::<GuestFamily>().map_err(
                    |_| TomlToPlanError::UnknownGuestFamily(family.clone()),
                )?,
                (None, Some(guest_id)) => GuestFamily::from_guest_id(guest_id),
                (None, None) => return Err(TomlToPlanError::MissingGuestFamily),
            };

            let mut req = CustomizationRequest::new(family, &target.name);
            req.hostname = custom.hostname.clone();
            req.domain = custom.domain.clone();
            req.nics = ip_settings;
            req.dns_servers = custom.dns_servers.clone();
            if let Some(tz) = &custom.time_zone {
                req.linux_time_zone = tz.clone();
            }

            let win = &mut req.windows;
            win.admin_password = custom.admin_password.clone();
            if let Some(tz) = custom.windows_time_zone {
                win.time_zone = tz;
            }
            if let Some(workgroup) = &custom.workgroup {
                win.workgroup = workgroup.clone();
            }
            if let Some(count) = custom.auto_logon_count {
                win.auto_logon_count = count;
            }
            Ok(req)
        })
        .transpose()?;

    Ok(ClonePlan {
        name: target.name.clone(),
        folder: target.folder.clone(),
        settings: CloneSettings {
            placement: Placement {
                pool: target.pool.clone(),
                host: target.host.clone(),
                datastore: target.datastore.clone(),
            },
            customization,
            power_on: target.power_on,
            template: target.template,
        },
    })
}
