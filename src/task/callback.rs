use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::task::{lock, Behavior, Task};
use crate::tasks::{SchedulingClass, TaskState};


/// Time budget handed to every callback invocation.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(1);


/// What a callback reports after one invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Not done yet, nothing to report.
    Continue,
    /// Not done yet; the text replaces the task message.
    Progress(String),
    Success,
    /// Done with an error; the text becomes the task message.
    Failure(String),
}

impl Outcome {
    /// Maps a `(done, error)` pair onto an outcome.
    pub fn from_parts(done: bool, error: Option<String>) -> Self {
        match (done, error) {
            (true, None) => Outcome::Success,
            (true, Some(error)) => Outcome::Failure(error),
            (false, Some(error)) => Outcome::Progress(error),
            (false, None) => Outcome::Continue,
        }
    }
}


#[derive(Clone, Debug)]
pub struct CallbackContext {
    token: CancellationToken,
    deadline: Instant,
}

impl CallbackContext {
    /// Cancelled when the poll token is, and at the deadline when the poll
    /// runs inside a multi-threaded tokio runtime.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    // Cancels the token at the deadline. Without a runtime only
    // `is_expired` and `remaining` observe the deadline.
    fn arm(&self) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let token = self.token.clone();
        let deadline = tokio::time::Instant::from_std(self.deadline);
        Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            token.cancel();
        }))
    }
}


type CallbackFn = Box<dyn Fn(&Task, &CallbackContext) -> Outcome + Send + Sync>;

/// Leaf that calls a function synchronously on every poll while running.
pub struct Callback {
    callback: CallbackFn,
    last: Mutex<Option<TaskState>>,
}

impl Callback {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Task, &CallbackContext) -> Outcome + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
            last: Mutex::new(None),
        }
    }
}

impl Task {
    pub fn callback<F>(name: impl Into<String>, callback: F) -> Arc<Task>
    where
        F: Fn(&Task, &CallbackContext) -> Outcome + Send + Sync + 'static,
    {
        Task::new(name, false, Callback::new(callback))
    }
}

impl Behavior for Callback {
    fn poll(&self, task: &Task, token: &CancellationToken) {
        let state = task.state();
        let changed = lock(&self.last).is_some_and(|last| last != state);
        if !state.is(SchedulingClass::Running) && !changed {
            *lock(&self.last) = Some(state);
            return;
        }

        let ctx = CallbackContext {
            token: token.child_token(),
            deadline: Instant::now() + CALLBACK_TIMEOUT,
        };
        let timer = ctx.arm();
        let outcome = (self.callback)(task, &ctx);
        if let Some(timer) = timer {
            timer.abort();
        }
        if Instant::now() >= ctx.deadline {
            warn!(task = task.name(), "Callback overran its deadline");
        }
        ctx.token.cancel();

        // Finished tasks keep their state; only running ones resolve.
        let status = task.modify(move |status| {
            let running = status.state.is(SchedulingClass::Running);
            match outcome {
                Outcome::Continue => {}
                Outcome::Progress(message) => status.message = message,
                Outcome::Success => {
                    if running {
                        status.state = TaskState::Success;
                    }
                }
                Outcome::Failure(message) => {
                    status.message = message;
                    if running {
                        status.state = TaskState::Failed;
                    }
                }
            }
        });
        *lock(&self.last) = Some(status.state);
    }
}
