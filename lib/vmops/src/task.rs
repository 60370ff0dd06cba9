// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for remote tasks to finish.

use std::time::{Duration, Instant};

use slog::debug;
use thiserror::Error;

use crate::remote::{RemoteError, TaskId, TaskInfo, TaskState, TaskTracker};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to poll task {task}")]
    Poll {
        task: TaskId,
        #[source]
        source: RemoteError,
    },

    #[error("task {task} failed: {message}")]
    Failed { task: TaskId, message: String },

    #[error("task {task} still unfinished after {elapsed:?}")]
    TimedOut { task: TaskId, elapsed: Duration },
}

/// How often to poll a task, and for how long.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    pub interval: Duration,
    /// Give up after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(60 * 60)),
        }
    }
}

/// Polls `task` until it succeeds, fails, or outlasts the policy's timeout.
///
/// This blocks the calling thread. Poll errors are returned immediately and
/// are not retried.
pub fn wait_for_task<T: TaskTracker + ?Sized>(
    tracker: &T,
    task: &TaskId,
    policy: &WaitPolicy,
    log: &slog::Logger,
) -> Result<TaskInfo, TaskError> {
    let start = Instant::now();
    let mut last_state = None;

    loop {
        let info = tracker
            .poll(task)
            .map_err(|source| TaskError::Poll { task: task.clone(), source })?;

        if last_state != Some(info.state) {
            debug!(log, "task state changed";
                   "task" => %task,
                   "state" => %info.state);
            last_state = Some(info.state);
        }

        match info.state {
            TaskState::Success => return Ok(info),
            TaskState::Error => {
                return Err(TaskError::Failed {
                    task: task.clone(),
                    message: info
                        .error
                        .unwrap_or_else(|| "no error message".to_owned()),
                })
            }
            TaskState::Queued | TaskState::Running => {}
        }

        let elapsed = start.elapsed();
        if policy.timeout.is_some_and(|timeout| elapsed >= timeout) {
            return Err(TaskError::TimedOut { task: task.clone(), elapsed });
        }

        std::thread::sleep(policy.interval);
    }
}
