// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the remote vCenter object model.
//!
//! This crate never talks to vCenter itself. The traits here are implemented
//! by whatever owns the connection; the functions at the bottom drive a
//! complete reconfigure or clone through them.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use slog::info;
use thiserror::Error;
use uuid::Uuid;

use crate::assemble::{
    plan_clone, plan_reconfigure, BoardSettings, CloneRequest, CloneSettings,
    PlanError, ReconfigureRequest,
};
use crate::devices::RawDevice;
use crate::policy::BuildPolicy;
use crate::request::DeviceIntent;
use crate::task::{wait_for_task, TaskError, WaitPolicy};

/// A failure reported by a collaborator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{operation} failed: {message}")]
pub struct RemoteError {
    pub operation: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self { operation: operation.into(), message: message.into() }
    }
}

/// The ways a VM can be looked up.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum VmIdentifier {
    Name(String),
    InstanceUuid(Uuid),
    /// A managed object id such as `vm-42`.
    Moid(String),
}

impl Display for VmIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name {name:?}"),
            Self::InstanceUuid(id) => write!(f, "instance uuid {id}"),
            Self::Moid(moid) => write!(f, "moid {moid}"),
        }
    }
}

/// Handle to a remote task.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(pub String);

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// A snapshot of a remote task.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TaskInfo {
    pub state: TaskState,

    /// Result reference, for example the managed object id of a new clone.
    #[serde(default)]
    pub result: Option<String>,

    /// Error message, set when the task failed.
    #[serde(default)]
    pub error: Option<String>,
}

/// A VM on the remote side.
#[cfg_attr(test, mockall::automock)]
pub trait VmHandle {
    /// Returns the VM's current hardware device list.
    fn devices(&self) -> Result<Vec<RawDevice>, RemoteError>;

    /// Submits a reconfiguration.
    fn reconfigure(
        &self,
        request: &ReconfigureRequest,
    ) -> Result<TaskId, RemoteError>;

    /// Submits a clone of this VM named `name` into `folder`.
    fn clone_vm(
        &self,
        name: &str,
        folder: &str,
        request: &CloneRequest,
    ) -> Result<TaskId, RemoteError>;
}

/// Resolves VM identifiers to handles.
#[cfg_attr(test, mockall::automock(type Handle = MockVmHandle;))]
pub trait VmLocator {
    type Handle: VmHandle;

    /// Looks up a VM, returning `None` if no VM matches.
    fn locate(
        &self,
        id: &VmIdentifier,
    ) -> Result<Option<Self::Handle>, RemoteError>;
}

/// Reports on remote tasks.
#[cfg_attr(test, mockall::automock)]
pub trait TaskTracker {
    fn poll(&self, task: &TaskId) -> Result<TaskInfo, RemoteError>;
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("no VM matches {0}")]
    VmNotFound(VmIdentifier),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Looks up the VM `id` names.
pub fn find_vm<L: VmLocator + ?Sized>(
    locator: &L,
    id: &VmIdentifier,
) -> Result<L::Handle, OperationError> {
    locator.locate(id)?.ok_or_else(|| OperationError::VmNotFound(id.clone()))
}

/// Reconfigures `vm` to match `intent` and `board`, and waits for the task
/// to finish.
#[allow(clippy::too_many_arguments)]
pub fn reconfigure_vm<V, T>(
    vm: &V,
    tracker: &T,
    intent: &DeviceIntent,
    board: &BoardSettings,
    policy: &BuildPolicy,
    wait: &WaitPolicy,
    log: &slog::Logger,
) -> Result<TaskInfo, OperationError>
where
    V: VmHandle + ?Sized,
    T: TaskTracker + ?Sized,
{
    let devices = vm.devices()?;
    let request = plan_reconfigure(&devices, intent, board, policy, log)?;
    let task = vm.reconfigure(&request)?;
    info!(log, "submitted reconfiguration";
          "task" => %task,
          "changes" => request.device_change.len());
    Ok(wait_for_task(tracker, &task, wait, log)?)
}

/// Clones `source` into a VM `name` in `folder`, and waits for the task to
/// finish. The returned task info's result names the new VM.
#[allow(clippy::too_many_arguments)]
pub fn clone_vm<V, T>(
    source: &V,
    tracker: &T,
    name: &str,
    folder: &str,
    intent: &DeviceIntent,
    board: &BoardSettings,
    settings: &CloneSettings,
    policy: &BuildPolicy,
    wait: &WaitPolicy,
    log: &slog::Logger,
) -> Result<TaskInfo, OperationError>
where
    V: VmHandle + ?Sized,
    T: TaskTracker + ?Sized,
{
    let devices = source.devices()?;
    let request =
        plan_clone(&devices, intent, board, settings, policy, log)?;
    let task = source.clone_vm(name, folder, &request)?;
    info!(log, "submitted clone";
          "task" => %task,
          "name" => name,
          "changes" => request.config.device_change.len());
    Ok(wait_for_task(tracker, &task, wait, log)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inventory::test::small_vm;
    use crate::request::{DiskSpecRequest, ReconcileMode};
    use mockall::predicate::eq;
    use std::time::Duration;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn fast_wait() -> WaitPolicy {
        WaitPolicy {
            interval: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(5)),
        }
    }

    fn done(result: Option<&str>) -> TaskInfo {
        TaskInfo {
            state: TaskState::Success,
            result: result.map(str::to_owned),
            error: None,
        }
    }

    #[test]
    fn reconfigure_submits_the_planned_batch() {
        let mut vm = MockVmHandle::new();
        vm.expect_devices().times(1).returning(|| Ok(small_vm()));
        vm.expect_reconfigure()
            .withf(|req: &ReconfigureRequest| {
                req.device_change.len() == 1 && req.memory_mb == Some(4096)
            })
            .times(1)
            .returning(|_| Ok(TaskId("task-1".to_owned())));

        let mut tracker = MockTaskTracker::new();
        tracker
            .expect_poll()
            .with(eq(TaskId("task-1".to_owned())))
            .times(1)
            .returning(|_| Ok(done(None)));

        let intent = DeviceIntent {
            disks: vec![DiskSpecRequest::new(1024)],
            ..Default::default()
        };
        let board = BoardSettings { memory_mb: Some(4096), ..Default::default() };

        let info = reconfigure_vm(
            &vm,
            &tracker,
            &intent,
            &board,
            &BuildPolicy::default(),
            &fast_wait(),
            &logger(),
        )
        .unwrap();
        assert_eq!(info.state, TaskState::Success);
    }

    #[test]
    fn build_failure_submits_nothing() {
        let mut vm = MockVmHandle::new();
        vm.expect_devices().returning(|| Ok(small_vm()));
        vm.expect_reconfigure().never();
        let tracker = MockTaskTracker::new();

        let intent = DeviceIntent {
            nic_removals: vec![4999],
            ..Default::default()
        };
        let err = reconfigure_vm(
            &vm,
            &tracker,
            &intent,
            &BoardSettings::default(),
            &BuildPolicy::default(),
            &fast_wait(),
            &logger(),
        )
        .unwrap_err();
        assert!(matches!(err, OperationError::Plan(PlanError::Build(_))));
    }

    #[test]
    fn clone_reports_the_new_vm() {
        let mut source = MockVmHandle::new();
        source.expect_devices().returning(|| Ok(small_vm()));
        source
            .expect_clone_vm()
            .withf(|name, folder, req| {
                name == "web-02"
                    && folder == "group-v3"
                    && req.template
                    // both disks, the NIC, and the emptied controller
                    && req.config.device_change.len() == 4
            })
            .times(1)
            .returning(|_, _, _| Ok(TaskId("task-2".to_owned())));

        let mut tracker = MockTaskTracker::new();
        tracker.expect_poll().returning(|_| Ok(done(Some("vm-77"))));

        let settings = CloneSettings { template: true, ..Default::default() };
        let intent =
            DeviceIntent { mode: ReconcileMode::Exact, ..Default::default() };

        let info = clone_vm(
            &source,
            &tracker,
            "web-02",
            "group-v3",
            &intent,
            &BoardSettings::default(),
            &settings,
            &BuildPolicy::default(),
            &fast_wait(),
            &logger(),
        )
        .unwrap();
        assert_eq!(info.result.as_deref(), Some("vm-77"));
    }

    #[test]
    fn locate_missing_vm() {
        let mut locator = MockVmLocator::new();
        locator.expect_locate().returning(|_| Ok(None));

        let id = VmIdentifier::Name("ghost".to_owned());
        let err = find_vm(&locator, &id).err().unwrap();
        assert!(matches!(err, OperationError::VmNotFound(VmIdentifier::Name(_))));

        let mut locator = MockVmLocator::new();
        locator.expect_locate().returning(|_| {
            let mut vm = MockVmHandle::new();
            vm.expect_devices().returning(|| Ok(Vec::new()));
            Ok(Some(vm))
        });
        let vm = find_vm(&locator, &VmIdentifier::Moid("vm-42".to_owned()))
            .unwrap();
        assert!(vm.devices().unwrap().is_empty());
    }

    #[test]
    fn remote_failures_surface_unchanged() {
        let mut vm = MockVmHandle::new();
        vm.expect_devices()
            .returning(|| Err(RemoteError::new("devices", "session expired")));
        let tracker = MockTaskTracker::new();

        let err = reconfigure_vm(
            &vm,
            &tracker,
            &DeviceIntent::default(),
            &BoardSettings::default(),
            &BuildPolicy::default(),
            &fast_wait(),
            &logger(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "devices failed: session expired");
    }

    #[test]
    fn identifiers_serialize_tagged() {
        let id = VmIdentifier::Moid("vm-42".to_owned());
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            r#"{"by":"moid","value":"vm-42"}"#
        );
    }
}
