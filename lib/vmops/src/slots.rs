// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SCSI slot accounting, controller resolution, and NIC backing resolution.

use std::collections::{BTreeMap, BTreeSet};

use slog::{info, warn};
use thiserror::Error;
use vmops_types::{
    ScsiAddress, ScsiControllerType, SharedBus, SCSI_BUS_COUNT,
    TOTAL_DISK_SLOTS,
};

use crate::changes::ControllerDevice;
use crate::devices::{DistributedPortBacking, NetworkBacking, NicBacking};
use crate::inventory::DeviceInventory;
use crate::policy::BuildPolicy;
use crate::request::PortGroupRef;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("all {total} SCSI disk slots are in use", total = TOTAL_DISK_SLOTS)]
    CapacityExhausted,

    #[error("{requested} disk slots requested but only {available} are free")]
    CapacityExceeded { requested: usize, available: usize },

    #[error("SCSI bus {0} has no free unit")]
    BusFull(u8),

    #[error("SCSI bus {0} outside range of 0-{max}", max = SCSI_BUS_COUNT - 1)]
    BusOutOfRange(u8),

    #[error("{0} is already in use")]
    SlotInUse(ScsiAddress),
}

/// Tracks which SCSI disk slots are taken while a batch is built.
///
/// Slots are handed out bus 0 first, lowest unit first. Unit 7 of each bus
/// belongs to the controller and is never handed out.
#[derive(Clone, Debug, Default)]
pub struct SlotAllocator {
    occupied: BTreeSet<ScsiAddress>,
}

impl SlotAllocator {
    pub fn new(occupied: impl IntoIterator<Item = ScsiAddress>) -> Self {
        Self { occupied: occupied.into_iter().collect() }
    }

    pub fn from_inventory(inventory: &DeviceInventory) -> Self {
        Self::new(inventory.occupied())
    }

    pub fn is_free(&self, address: ScsiAddress) -> bool {
        !self.occupied.contains(&address)
    }

    /// Number of slots still free.
    pub fn remaining(&self) -> usize {
        TOTAL_DISK_SLOTS - self.occupied.len()
    }

    /// Takes a specific slot.
    pub fn claim(
        &mut self,
        address: ScsiAddress,
    ) -> Result<ScsiAddress, SlotError> {
        if !self.occupied.insert(address) {
            return Err(SlotError::SlotInUse(address));
        }

        Ok(address)
    }

    /// Takes the first free slot.
    pub fn allocate(&mut self) -> Result<ScsiAddress, SlotError> {
        let address = ScsiAddress::all()
            .find(|a| self.is_free(*a))
            .ok_or(SlotError::CapacityExhausted)?;
        self.occupied.insert(address);
        Ok(address)
    }

    /// Takes the lowest free unit on `bus`.
    pub fn allocate_on_bus(
        &mut self,
        bus: u8,
    ) -> Result<ScsiAddress, SlotError> {
        if bus >= SCSI_BUS_COUNT {
            return Err(SlotError::BusOutOfRange(bus));
        }

        let address = ScsiAddress::on_bus(bus)
            .find(|a| self.is_free(*a))
            .ok_or(SlotError::BusFull(bus))?;
        self.occupied.insert(address);
        Ok(address)
    }

    /// Takes the first `count` free slots, or none at all if fewer than
    /// `count` are free.
    pub fn allocate_many(
        &mut self,
        count: usize,
    ) -> Result<Vec<ScsiAddress>, SlotError> {
        let available = self.remaining();
        if count > available {
            return Err(SlotError::CapacityExceeded {
                requested: count,
                available,
            });
        }

        let slots: Vec<_> =
            ScsiAddress::all().filter(|a| self.is_free(*a)).take(count).collect();
        self.occupied.extend(slots.iter().copied());
        Ok(slots)
    }

    /// Returns a slot to the free pool. Returns `false` if it was not taken.
    pub fn release(&mut self, address: ScsiAddress) -> bool {
        self.occupied.remove(&address)
    }
}

/// A requested controller type that differs from the type of the controller
/// already driving the bus.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "SCSI bus {bus} is driven by a {existing} controller, not {requested}"
)]
pub struct ControllerTypeMismatch {
    pub bus: u8,
    pub existing: ScsiControllerType,
    pub requested: ScsiControllerType,
}

/// The controller a disk on some bus will hang off.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedController {
    /// A controller the VM already has.
    Existing(i32),
    /// A controller added earlier in the same batch.
    Pending(i32),
    /// A controller that must be added.
    New(ControllerDevice),
}

impl ResolvedController {
    pub fn key(&self) -> i32 {
        match self {
            Self::Existing(key) | Self::Pending(key) => *key,
            Self::New(ctrl) => ctrl.key,
        }
    }
}

/// Finds or describes the controller for `bus`.
///
/// An existing controller is always kept. When its type differs from
/// `requested_type` that is a warning, or an error under a strict policy; a
/// shared-bus difference is only ever a warning.
pub fn resolve_controller(
    inventory: &DeviceInventory,
    pending: &BTreeMap<u8, ControllerDevice>,
    bus: u8,
    requested_type: Option<ScsiControllerType>,
    requested_shared_bus: Option<SharedBus>,
    policy: &BuildPolicy,
    log: &slog::Logger,
) -> Result<ResolvedController, ControllerTypeMismatch> {
    let found = inventory
        .controller_on_bus(bus)
        .map(|c| {
            (ResolvedController::Existing(c.key), c.controller_type, c.shared_bus)
        })
        .or_else(|| {
            pending.get(&bus).map(|c| {
                (ResolvedController::Pending(c.key), c.controller_type, c.shared_bus)
            })
        });

    let Some((resolved, existing, shared_bus)) = found else {
        let ctrl = ControllerDevice::new(
            bus,
            requested_type.unwrap_or(policy.default_controller_type),
            requested_shared_bus.unwrap_or(policy.default_shared_bus),
        );
        info!(log, "adding SCSI controller";
              "bus" => bus,
              "key" => ctrl.key,
              "type" => %ctrl.controller_type);
        return Ok(ResolvedController::New(ctrl));
    };

    if let Some(requested) = requested_type.filter(|t| *t != existing) {
        let mismatch = ControllerTypeMismatch { bus, existing, requested };
        if policy.is_strict() {
            return Err(mismatch);
        }

        warn!(log, "keeping existing SCSI controller type";
              "bus" => bus,
              "existing" => %existing,
              "requested" => %requested);
    }

    if let Some(requested) = requested_shared_bus.filter(|s| *s != shared_bus) {
        warn!(log, "keeping existing SCSI bus sharing mode";
              "bus" => bus,
              "existing" => %shared_bus,
              "requested" => %requested);
    }

    Ok(resolved)
}

/// What editing a NIC's port group takes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NicBackingChange {
    /// The NIC is already on the target port group.
    Unchanged,
    /// The NIC moves to another port group of the same kind.
    Retarget(NicBacking),
    /// The NIC moves between a standard and a distributed switch, which
    /// replaces its backing wholesale.
    Replace(NicBacking),
}

/// The backing that connects a NIC to `target`.
pub fn nic_backing(target: &PortGroupRef) -> NicBacking {
    match target {
        PortGroupRef::Network { moid, name } => {
            NicBacking::Network(NetworkBacking {
                network: moid.clone(),
                device_name: name.clone(),
            })
        }
        PortGroupRef::Distributed { key, switch_uuid, port_key } => {
            NicBacking::DistributedPort(DistributedPortBacking {
                switch_uuid: switch_uuid.clone(),
                portgroup_key: key.clone(),
                port_key: port_key.clone(),
            })
        }
    }
}

/// Compares a NIC's current backing against the port group it should be on.
pub fn resolve_nic_backing(
    current: &NicBacking,
    target: &PortGroupRef,
) -> NicBackingChange {
    let wanted = nic_backing(target);
    if wanted.kind() != current.kind() {
        return NicBackingChange::Replace(wanted);
    }

    if wanted.port_group_id() == current.port_group_id() {
        NicBackingChange::Unchanged
    } else {
        NicBackingChange::Retarget(wanted)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inventory::test::small_vm;
    use proptest::prelude::*;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn addr(bus: u8, unit: u8) -> ScsiAddress {
        ScsiAddress::new(bus, unit).unwrap()
    }

    #[test]
    fn allocation_skips_occupied_and_reserved() {
        let mut slots = SlotAllocator::new((0..7).map(|u| addr(0, u)));
        assert_eq!(slots.allocate().unwrap(), addr(0, 8));
        assert_eq!(slots.allocate_on_bus(2).unwrap(), addr(2, 0));
        assert_eq!(slots.remaining(), TOTAL_DISK_SLOTS - 9);
    }

    #[test]
    fn explicit_address_must_be_free() {
        let inv = crate::inventory::DeviceInventory::from_devices(&small_vm())
            .unwrap();
        let mut slots = SlotAllocator::from_inventory(&inv);
        assert_eq!(
            slots.claim(addr(0, 1)).unwrap_err(),
            SlotError::SlotInUse(addr(0, 1))
        );
        assert_eq!(slots.claim(addr(0, 2)).unwrap(), addr(0, 2));
    }

    #[test]
    fn full_bus() {
        let mut slots = SlotAllocator::new(ScsiAddress::on_bus(1));
        assert_eq!(slots.allocate_on_bus(1).unwrap_err(), SlotError::BusFull(1));
        assert_eq!(
            slots.allocate_on_bus(4).unwrap_err(),
            SlotError::BusOutOfRange(4)
        );
        assert_eq!(slots.allocate().unwrap(), addr(0, 0));
    }

    #[test]
    fn exhausted_allocator_allocates_nothing() {
        let mut slots = SlotAllocator::new(ScsiAddress::all().skip(2));
        assert_eq!(
            slots.allocate_many(3).unwrap_err(),
            SlotError::CapacityExceeded { requested: 3, available: 2 }
        );
        assert_eq!(slots.remaining(), 2);
        assert_eq!(slots.allocate_many(2).unwrap(), [addr(0, 0), addr(0, 1)]);
        assert_eq!(slots.allocate().unwrap_err(), SlotError::CapacityExhausted);

        assert!(slots.release(addr(0, 1)));
        assert!(!slots.release(addr(0, 1)));
        assert_eq!(slots.allocate().unwrap(), addr(0, 1));
    }

    #[test]
    fn controller_is_reused_or_synthesized() {
        let inv = crate::inventory::DeviceInventory::from_devices(&small_vm())
            .unwrap();
        let policy = BuildPolicy::default();
        let mut pending = BTreeMap::new();

        let bus0 =
            resolve_controller(&inv, &pending, 0, None, None, &policy, &logger())
                .unwrap();
        assert_eq!(bus0, ResolvedController::Existing(1000));

        let bus1 =
            resolve_controller(&inv, &pending, 1, None, None, &policy, &logger())
                .unwrap();
        let ResolvedController::New(ctrl) = bus1 else {
            panic!("expected a new controller, got {bus1:?}");
        };
        assert_eq!(ctrl.key, 1001);
        assert_eq!(ctrl.controller_type, ScsiControllerType::ParaVirtual);
        assert_eq!(ctrl.unit_number, Some(4));
        pending.insert(1, ctrl);

        let again =
            resolve_controller(&inv, &pending, 1, None, None, &policy, &logger())
                .unwrap();
        assert_eq!(again, ResolvedController::Pending(1001));
    }

    #[test]
    fn controller_type_mismatch() {
        let inv = crate::inventory::DeviceInventory::from_devices(&small_vm())
            .unwrap();
        let pending = BTreeMap::new();
        let requested = Some(ScsiControllerType::LsiLogic);

        let lenient = BuildPolicy::default();
        assert_eq!(
            resolve_controller(
                &inv,
                &pending,
                0,
                requested,
                Some(SharedBus::PhysicalSharing),
                &lenient,
                &logger()
            )
            .unwrap(),
            ResolvedController::Existing(1000)
        );

        let strict = BuildPolicy {
            strictness: crate::policy::Strictness::Strict,
            ..Default::default()
        };
        assert_eq!(
            resolve_controller(
                &inv, &pending, 0, requested, None, &strict, &logger()
            )
            .unwrap_err(),
            ControllerTypeMismatch {
                bus: 0,
                existing: ScsiControllerType::ParaVirtual,
                requested: ScsiControllerType::LsiLogic,
            }
        );

        // Shared-bus differences never fail.
        assert!(resolve_controller(
            &inv,
            &pending,
            0,
            None,
            Some(SharedBus::VirtualSharing),
            &strict,
            &logger()
        )
        .is_ok());
    }

    #[test]
    fn nic_backing_changes() {
        let current = NicBacking::Network(NetworkBacking {
            network: "network-1".to_owned(),
            device_name: "VM Network".to_owned(),
        });

        let same = PortGroupRef::Network {
            moid: "network-1".to_owned(),
            name: "VM Network".to_owned(),
        };
        assert_eq!(
            resolve_nic_backing(&current, &same),
            NicBackingChange::Unchanged
        );

        let other = PortGroupRef::Network {
            moid: "network-2".to_owned(),
            name: "Lab".to_owned(),
        };
        assert!(matches!(
            resolve_nic_backing(&current, &other),
            NicBackingChange::Retarget(NicBacking::Network(_))
        ));

        let distributed = PortGroupRef::Distributed {
            key: "dvportgroup-7".to_owned(),
            switch_uuid: "50 0c".to_owned(),
            port_key: None,
        };
        assert!(matches!(
            resolve_nic_backing(&current, &distributed),
            NicBackingChange::Replace(NicBacking::DistributedPort(_))
        ));
    }

    proptest! {
        #[test]
        fn allocations_are_distinct_and_skip_unit_7(
            preoccupied in proptest::collection::btree_set(
                (0u8..4, 0u8..16).prop_filter("unit 7", |(_, u)| *u != 7),
                0..60,
            ),
        ) {
            let mut slots = SlotAllocator::new(
                preoccupied.iter().map(|(b, u)| addr(*b, *u)),
            );
            let free = slots.remaining();
            let got = slots.allocate_many(free).unwrap();

            prop_assert_eq!(got.len(), free);
            let distinct: BTreeSet<_> = got.iter().copied().collect();
            prop_assert_eq!(distinct.len(), got.len());
            for a in &got {
                prop_assert!(a.unit() != 7);
                prop_assert!(!preoccupied.contains(&(a.bus(), a.unit())));
            }
            prop_assert!(got.windows(2).all(|w| w[0] < w[1]));

            // Every slot is now taken; one more is a capacity error.
            prop_assert_eq!(slots.remaining(), 0);
            prop_assert_eq!(
                slots.allocate_many(1).unwrap_err(),
                SlotError::CapacityExceeded { requested: 1, available: 0 }
            );
        }

        #[test]
        fn one_past_capacity_allocates_nothing(taken in 0usize..=60) {
            let mut slots = SlotAllocator::new(ScsiAddress::all().take(taken));
            let free = TOTAL_DISK_SLOTS - taken;
            prop_assert!(slots.allocate_many(free + 1).is_err());
            prop_assert_eq!(slots.remaining(), free);
        }
    }
}
