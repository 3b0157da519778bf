use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::task::{lock, Behavior, StatusHandle, Task};
use crate::tasks::{SchedulingClass, TaskState};


type BackgroundFn = Box<
    dyn Fn(CancellationToken, StatusHandle) -> BoxFuture<'static, ()> + Send + Sync
>;

/// Leaf that keeps one background execution alive while it is running.
///
/// With `runs_in_background` the execution also survives the move to
/// `SUCCESS`, stopping only once the task leaves both states.
pub struct Background {
    run: BackgroundFn,
    parent: CancellationToken,
    runs_in_background: bool,
    active: Mutex<Option<CancellationToken>>,
}

impl Background {
    pub fn new<F, Fut>(parent: CancellationToken, runs_in_background: bool, run: F) -> Self
    where
        F: Fn(CancellationToken, StatusHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            run: Box::new(move |token, handle| run(token, handle).boxed()),
            parent,
            runs_in_background,
            active: Mutex::new(None),
        }
    }

    fn wanted(&self, state: TaskState) -> bool {
        state.is(SchedulingClass::Running)
            || (self.runs_in_background && state == TaskState::Success)
    }
}

impl Task {
    pub fn background<F, Fut>(
        name: impl Into<String>,
        parent: CancellationToken,
        runs_in_background: bool,
        run: F,
    ) -> Arc<Task>
    where
        F: Fn(CancellationToken, StatusHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Task::new(name, false, Background::new(parent, runs_in_background, run))
    }
}

impl Behavior for Background {
    fn poll(&self, task: &Task, _token: &CancellationToken) {
        let mut active = lock(&self.active);

        if !self.wanted(task.state()) {
            if let Some(token) = active.take() {
                token.cancel();
                debug!(task = task.name(), "Cancelled background execution");
            }
            return;
        }

        if active.is_some() {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(task = task.name(), "Cannot start background execution: {}", err);
                task.modify(|status| {
                    status.state = TaskState::Failed;
                    status.message = err.to_string();
                });
                return;
            }
        };

        let token = self.parent.child_token();
        runtime.spawn((self.run)(token.clone(), task.handle()));
        *active = Some(token);
        debug!(task = task.name(), "Started background execution");
    }
}
