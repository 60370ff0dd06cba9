// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TOML plan files describing a VM reconfiguration or clone.
//!
//! ```toml
//! [options]
//! mode = "exact"
//!
//! [board]
//! memory_mb = 8192
//!
//! [[disk]]
//! size_gb = 40
//! type = "thin"
//! datastore = "datastore-1"
//!
//! [[nic]]
//! network = "network-12"
//! network_name = "VM Network"
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use vmops::policy::Strictness;
use vmops::request::ReconcileMode;
use vmops_types::{
    DiskType, NicAdapterType, Requested, ScsiAddress, ScsiControllerType,
    SharedBus,
};

pub mod plan;

pub use plan::{ClonePlan, Plan, TomlToPlanError};

/// A plan file.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub options: Options,

    #[serde(default)]
    pub board: Board,

    #[serde(default, rename = "disk")]
    pub disks: Vec<Disk>,

    #[serde(default, rename = "remove_disk")]
    pub disk_removals: Vec<DiskRemoval>,

    #[serde(default, rename = "nic")]
    pub nics: Vec<Nic>,

    #[serde(default, rename = "remove_nic")]
    pub nic_removals: Vec<NicRemoval>,

    pub clone: Option<CloneTarget>,
}

/// Build policy and reconcile mode.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Options {
    pub strictness: Option<Strictness>,
    pub mode: Option<ReconcileMode>,
    pub default_controller: Option<ScsiControllerType>,
    /// Raw mapping types are refused, since they need a host device.
    pub default_disk_type: Option<DiskType>,
    pub default_adapter: Option<NicAdapterType>,
    pub default_shared_bus: Option<SharedBus>,
}

/// Virtual hardware outside the device list.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Board {
    pub cpus: Option<u32>,
    pub cores_per_socket: Option<u32>,
    pub memory_mb: Option<u64>,

    /// `"generate"` for a fresh uuid, or a literal uuid.
    pub instance_uuid: Option<String>,
}

/// A disk to create, or an existing disk to edit.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Disk {
    /// Capacity in GiB. Edits never shrink a disk, so 0 leaves an existing
    /// disk's size alone.
    #[serde(default)]
    pub size_gb: u64,

    #[serde(rename = "type")]
    pub disk_type: Option<Requested<DiskType>>,

    pub datastore: Option<String>,

    /// Place a new disk on this bus.
    pub bus: Option<u8>,

    /// Place a new disk at this `bus:unit`.
    pub address: Option<ScsiAddress>,

    pub existing_key: Option<i32>,
    pub existing_path: Option<String>,
    pub existing_address: Option<ScsiAddress>,

    /// Attach this existing backing file instead of creating one.
    pub file_path: Option<String>,

    pub controller: Option<Requested<ScsiControllerType>>,
    pub shared_bus: Option<SharedBus>,

    /// Host device for raw mappings.
    pub raw_device: Option<String>,
    pub lun_uuid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct DiskRemoval {
    pub key: Option<i32>,
    pub path: Option<String>,
    pub address: Option<ScsiAddress>,

    /// Delete the backing file along with the device.
    #[serde(default)]
    pub destroy: bool,
}

/// A NIC to add, or an existing NIC to edit.
///
/// Exactly one of `network` (a standard network's managed object id) or
/// `portgroup` (a distributed port group key) must be set.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Nic {
    pub network: Option<String>,
    pub network_name: Option<String>,

    pub portgroup: Option<String>,
    pub switch_uuid: Option<String>,
    pub port_key: Option<String>,

    pub adapter: Option<Requested<NicAdapterType>>,
    pub existing_key: Option<i32>,
    pub mac_address: Option<String>,

    /// Guest addressing, used only by clone customization. DHCP when unset.
    pub ip: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct NicRemoval {
    pub key: i32,
}

/// Clone target and placement.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct CloneTarget {
    pub name: String,
    pub folder: String,

    pub pool: Option<String>,
    pub host: Option<String>,
    pub datastore: Option<String>,

    #[serde(default)]
    pub power_on: bool,

    #[serde(default)]
    pub template: bool,

    pub customization: Option<Customization>,
}

/// Guest customization for a clone.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Customization {
    /// `linux` or `windows`. Derived from `guest_id` when unset.
    pub family: Option<String>,
    pub guest_id: Option<String>,

    pub hostname: Option<String>,
    pub domain: Option<String>,

    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,

    /// tz database name for Linux guests.
    pub time_zone: Option<String>,

    /// Microsoft time zone index for Windows guests.
    pub windows_time_zone: Option<u32>,
    pub admin_password: Option<String>,
    pub workgroup: Option<String>,
    pub auto_logon_count: Option<u32>,
}

/// Errors which may be returned when parsing a plan file.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML plan file.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}
