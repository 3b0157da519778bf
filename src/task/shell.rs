use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::{Exit, Process};
use crate::task::{lock, Behavior, Task};
use crate::tasks::{SchedulingClass, TaskState};


/// Leaf that runs an external command.
pub struct Shell {
    program: String,
    args: Vec<String>,
    launched: Mutex<Option<Launched>>,
}

struct Launched {
    process: Arc<Process>,
    exit: Exit,
    kill: CancellationToken,
}

impl Shell {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            launched: Mutex::new(None),
        }
    }

    fn launch(&self, task: &Task, token: &CancellationToken) -> Option<Launched> {
        if let Err(err) = tokio::runtime::Handle::try_current() {
            task.modify(|status| {
                status.state = TaskState::Failed;
                status.message = format!("failed to start: {}", err);
            });
            return None;
        }

        let kill = token.child_token();
        match Process::start(&self.program, &self.args, kill.clone()) {
            Ok((process, exit)) => {
                debug!(task = task.name(), program = %self.program, "Started process");
                task.modify(|status| {
                    status.state = TaskState::Running;
                    status.message = "Started".to_string();
                });
                Some(Launched { process, exit, kill })
            }
            Err(err) => {
                warn!(task = task.name(), program = %self.program, "{}", err);
                task.modify(|status| {
                    status.state = TaskState::Failed;
                    status.message = err.to_string();
                });
                None
            }
        }
    }
}

impl Task {
    pub fn shell<I, S>(name: impl Into<String>, program: impl Into<String>, args: I) -> Arc<Task>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Task::new(name, false, Shell::new(program, args))
    }
}

impl Behavior for Shell {
    fn poll(&self, task: &Task, token: &CancellationToken) {
        let running = task.state().is(SchedulingClass::Running);
        let mut launched = lock(&self.launched);

        if launched.is_none() {
            if running {
                *launched = self.launch(task, token);
            }
            return;
        }

        let Some(current) = launched.as_mut() else {
            return;
        };

        let finished = if !running {
            // Moved out of RUNNING from outside; the state stays as set.
            current.kill.cancel();
            debug!(task = task.name(), "Stopped process of finished task");
            true
        } else {
            match current.exit.try_recv() {
                Ok(Ok(exit)) => {
                    let (state, message) = describe(exit, current.process.last_line());
                    task.modify(|status| {
                        status.state = state;
                        status.message = message;
                    });
                    true
                }
                Ok(Err(err)) => {
                    task.modify(|status| {
                        status.state = TaskState::Failed;
                        status.message = err.to_string();
                    });
                    true
                }
                Err(TryRecvError::Empty) if token.is_cancelled() => {
                    warn!(task = task.name(), "Cancelled, killing process");
                    current.kill.cancel();
                    task.modify(|status| {
                        status.state = TaskState::Failed;
                        status.message = "killed".to_string();
                    });
                    true
                }
                Err(TryRecvError::Empty) => false,
                Err(TryRecvError::Closed) => {
                    task.modify(|status| {
                        status.state = TaskState::Failed;
                        status.message = "process result lost".to_string();
                    });
                    true
                }
            }
        };

        if finished {
            *launched = None;
        }
    }
}

fn describe(exit: ExitStatus, last_line: Option<String>) -> (TaskState, String) {
    if exit.success() {
        return (TaskState::Success, "Exited".to_string());
    }

    let message = match last_line {
        Some(line) if !line.is_empty() => format!("{}: {}", exit, line),
        _ => exit.to_string(),
    };
    (TaskState::Failed, message)
}
