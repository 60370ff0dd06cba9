// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use slog::warn;
use vmops_types::{
    DiskType, NicAdapterType, Requested, ScsiControllerType, SharedBus,
};

/// What to do with requests that can be completed only by ignoring part of
/// them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Log a warning and carry on with the default or existing value.
    #[default]
    Fallback,
    /// Refuse the request.
    Strict,
}

/// Defaults applied while building a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildPolicy {
    pub strictness: Strictness,
    pub default_controller_type: ScsiControllerType,
    pub default_disk_type: DiskType,
    pub default_nic_adapter: NicAdapterType,
    pub default_shared_bus: SharedBus,
}

impl Default for BuildPolicy {
    fn default() -> Self {
        Self {
            strictness: Strictness::Fallback,
            default_controller_type: ScsiControllerType::ParaVirtual,
            default_disk_type: DiskType::Preallocated,
            default_nic_adapter: NicAdapterType::Vmxnet3,
            default_shared_bus: SharedBus::NoSharing,
        }
    }
}

/// A type name no vocabulary recognizes, refused under strict policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unrecognized {
    pub what: &'static str,
    pub name: String,
}

impl BuildPolicy {
    pub fn is_strict(&self) -> bool {
        self.strictness == Strictness::Strict
    }

    /// Resolves a caller's type name, substituting `default` for names that
    /// are not recognized unless the policy is strict.
    pub(crate) fn resolve<T: Copy + Display>(
        &self,
        log: &slog::Logger,
        what: &'static str,
        requested: Option<&Requested<T>>,
        default: T,
    ) -> Result<T, Unrecognized> {
        match requested {
            None => Ok(default),
            Some(Requested::Known(t)) => Ok(*t),
            Some(Requested::Unrecognized(name)) if self.is_strict() => {
                Err(Unrecognized { what, name: name.clone() })
            }
            Some(Requested::Unrecognized(name)) => {
                warn!(log, "unrecognized {}, using the default", what;
                      "requested" => name.as_str(),
                      "default" => %default);
                Ok(default)
            }
        }
    }
}
