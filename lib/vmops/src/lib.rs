// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device allocation and reconfiguration request building for vCenter VMs.
//!
//! A VM's current device list ([`devices::RawDevice`]) is classified into a
//! [`inventory::DeviceInventory`], desired disks and NICs
//! ([`request::DeviceIntent`]) are matched against it by a
//! [`builder::ReconfigBuilder`], and the resulting change batch is bundled
//! into a reconfigure or clone request by [`assemble`]. Nothing here performs
//! vCenter calls; the [`remote`] traits are implemented by the caller.

#![allow(clippy::style)]

pub extern crate vmops_types;

pub mod assemble;
pub mod builder;
pub mod changes;
pub mod customize;
pub mod devices;
pub mod inventory;
pub mod policy;
pub mod remote;
pub mod request;
pub mod session;
pub mod slots;
pub mod task;

pub use assemble::{
    plan_changes, plan_clone, plan_reconfigure, BoardSettings, CloneRequest,
    CloneSettings, InstanceId, PlanError, ReconfigureRequest,
};
pub use builder::{BuildError, ReconfigBuilder};
pub use changes::DeviceChange;
pub use inventory::{DeviceInventory, InventoryError};
pub use policy::{BuildPolicy, Strictness};
pub use request::{DeviceIntent, DiskSpecRequest, NicSpecRequest, ReconcileMode};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
