pub mod client;
pub mod command;
mod error;
mod job;
mod plans;
mod process;
mod server;
mod task;
mod tasks;

pub use command::{Cli, Command};
pub use error::{Error, ErrorKind};
pub use job::{diff, ChangeSet, Job, Lifecycle};
pub use plans::PlanSpec;
pub use process::{Output, Process};
pub use server::{router, serve, Server, ServerError};
pub use task::{
    Background, Behavior, Callback, CallbackContext, CustomPoll, Nested,
    NestedOptions, Outcome, Shell, Status, StatusHandle, Task, CALLBACK_TIMEOUT,
};
pub use tasks::{JobSnapshot, SchedulingClass, Snapshot, TaskRequest, TaskState};
