use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::tasks::{Snapshot, TaskState};

mod background;
mod callback;
mod nested;
mod shell;

pub use background::Background;
pub use callback::{Callback, CallbackContext, Outcome, CALLBACK_TIMEOUT};
pub use nested::{CustomPoll, Nested, NestedOptions};
pub use shell::Shell;


/// The kind-specific part of a task: one non-blocking step of work.
///
/// Implementations must not assume they hold any of the task's locks; they
/// are free to call back into `task` (add children, change state, take
/// snapshots) while polling.
pub trait Behavior: Send + Sync {
    fn poll(&self, task: &Task, token: &CancellationToken);
}


struct FnBehavior<F>(F);

impl<F> Behavior for FnBehavior<F>
where
    F: Fn(&Task, &CancellationToken) + Send + Sync,
{
    fn poll(&self, task: &Task, token: &CancellationToken) {
        (self.0)(task, token)
    }
}


#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Status {
    pub state: TaskState,
    pub message: String,
}


/// Cloneable access to a task's status, detached from the tree.
///
/// Background executions hold one of these instead of the task itself.
#[derive(Clone, Debug)]
pub struct StatusHandle {
    name: Arc<str>,
    status: Arc<Mutex<Status>>,
}

impl StatusHandle {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            status: Arc::new(Mutex::new(Status {
                state: TaskState::Pending,
                message: String::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        lock(&self.status).clone()
    }

    pub fn state(&self) -> TaskState {
        lock(&self.status).state
    }

    pub fn modify<F: FnOnce(&mut Status)>(&self, f: F) -> Status {
        let mut status = lock(&self.status);
        f(&mut status);
        status.clone()
    }

    pub fn set_state(&self, state: TaskState) {
        self.modify(|status| status.state = state);
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.modify(move |status| status.message = message);
    }
}


pub struct Task {
    handle: StatusHandle,
    children: Option<Mutex<Vec<Arc<Task>>>>,
    behavior: Box<dyn Behavior>,
    token: Mutex<CancellationToken>,
}

impl Task {
    /// Creates a task in the `PENDING` state. Only tasks built with
    /// `children == true` accept [`Task::add_child`].
    pub fn new(
        name: impl Into<String>,
        children: bool,
        behavior: impl Behavior + 'static,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            handle: StatusHandle::new(&name),
            children: children.then(|| Mutex::new(vec![])),
            behavior: Box::new(behavior),
            token: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn from_fn<F>(name: impl Into<String>, children: bool, f: F) -> Arc<Self>
    where
        F: Fn(&Task, &CancellationToken) + Send + Sync + 'static,
    {
        Self::new(name, children, FnBehavior(f))
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn poll(&self, token: &CancellationToken) {
        *lock(&self.token) = token.clone();
        self.behavior.poll(self, token);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.update(|snapshot| snapshot)
    }

    /// Applies `updater` to the current snapshot under this node's lock and
    /// returns the result with freshly rebuilt children.
    ///
    /// Only `state` and `message` are taken from the updater's result; the
    /// name is fixed at construction and children are always live. The
    /// updater must not touch this task itself.
    pub fn update<F>(&self, updater: F) -> Snapshot
    where
        F: FnOnce(Snapshot) -> Snapshot,
    {
        let children: Vec<Snapshot> = self.children()
            .iter()
            .map(|child| child.snapshot())
            .collect();

        let mut status = lock(&self.handle.status);
        let updated = updater(Snapshot {
            name: self.name().to_string(),
            state: status.state,
            message: status.message.clone(),
            children: children.clone(),
        });
        status.state = updated.state;
        status.message = updated.message.clone();
        drop(status);

        Snapshot {
            name: self.name().to_string(),
            state: updated.state,
            message: updated.message,
            children,
        }
    }

    pub fn status(&self) -> Status {
        self.handle.status()
    }

    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    pub fn modify<F: FnOnce(&mut Status)>(&self, f: F) -> Status {
        self.handle.modify(f)
    }

    pub fn handle(&self) -> StatusHandle {
        self.handle.clone()
    }

    /// Sets the state and immediately polls the task with the token of its
    /// most recent poll.
    pub fn set_state(&self, state: TaskState) {
        let token = lock(&self.token).clone();
        self.set_state_with(state, &token);
    }

    /// Sets the state and immediately polls the task with `token`.
    pub fn set_state_with(&self, state: TaskState, token: &CancellationToken) {
        self.handle.set_state(state);
        self.poll(token);
    }

    pub fn allows_children(&self) -> bool {
        self.children.is_some()
    }

    pub fn children(&self) -> Vec<Arc<Task>> {
        match &self.children {
            Some(children) => lock(children).clone(),
            None => vec![],
        }
    }

    pub fn get_child(&self, name: &str) -> Option<Arc<Task>> {
        let children = self.children.as_ref()?;
        lock(children).iter().find(|child| child.name() == name).cloned()
    }

    pub fn add_child(&self, child: Arc<Task>) -> Result<(), Error> {
        let Some(children) = &self.children else {
            return Err(Error::NoChildrenAllowed(self.name().to_string()));
        };

        let mut children = lock(children);
        if children.iter().any(|c| c.name() == child.name()) {
            return Err(Error::DuplicateName(child.name().to_string()));
        }
        children.push(child);
        Ok(())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("status", &self.status())
            .field("children", &self.children())
            .finish_non_exhaustive()
    }
}


pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
