use serde::{Deserialize, Serialize};
use uuid::Uuid;


#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    #[default]
    Unknown,
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    ActionNeeded,
}

impl TaskState {
    /// Scheduling class of this state. `Unknown` is never scheduled.
    pub fn scheduling_class(self) -> Option<SchedulingClass> {
        match self {
            TaskState::Pending => Some(SchedulingClass::Pending),
            TaskState::Running | TaskState::ActionNeeded => {
                Some(SchedulingClass::Running)
            }
            TaskState::Success | TaskState::Failed | TaskState::Skipped => {
                Some(SchedulingClass::Done)
            }
            TaskState::Unknown => None,
        }
    }

    pub fn is(self, class: SchedulingClass) -> bool {
        self.scheduling_class() == Some(class)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Unknown => "UNKNOWN",
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
            TaskState::Skipped => "SKIPPED",
            TaskState::ActionNeeded => "ACTION_NEEDED",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulingClass {
    Pending,
    Running,
    Done,
}


/// Detached copy of a task and its subtree.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Snapshot {
    pub name: String,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub children: Vec<Snapshot>,
}


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub version: i64,
    pub uuid: Uuid,
    pub root: Option<Snapshot>,
}


/// Path-addressed state change. The path names children below the root.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub state: TaskState,
}
