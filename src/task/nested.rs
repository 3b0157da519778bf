use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::task::{lock, Behavior, Task};
use crate::tasks::{SchedulingClass, TaskState};


/// Hook run at the start of every scheduling step of a running nested task.
pub type CustomPoll = Box<dyn Fn(&Task, &[Arc<Task>]) + Send + Sync>;


pub struct NestedOptions {
    /// Maximum number of children in the RUNNING class at once.
    pub parallelism: usize,
    /// Wait for every child to finish instead of failing on the first
    /// failed child.
    pub complete_all: bool,
    pub custom_poll: Option<CustomPoll>,
}

impl NestedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn complete_all(mut self, complete_all: bool) -> Self {
        self.complete_all = complete_all;
        self
    }

    pub fn custom_poll<F>(mut self, f: F) -> Self
    where
        F: Fn(&Task, &[Arc<Task>]) + Send + Sync + 'static,
    {
        self.custom_poll = Some(Box::new(f));
        self
    }
}

impl Default for NestedOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            complete_all: false,
            custom_poll: None,
        }
    }
}

impl std::fmt::Debug for NestedOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NestedOptions")
            .field("parallelism", &self.parallelism)
            .field("complete_all", &self.complete_all)
            .field("custom_poll", &self.custom_poll.is_some())
            .finish()
    }
}


/// Scheduler over a task's children.
pub struct Nested {
    options: NestedOptions,
    // State of each child as of the end of the previous scheduling step.
    seen: Mutex<HashMap<String, TaskState>>,
}

impl Nested {
    pub fn new(mut options: NestedOptions) -> Self {
        options.parallelism = options.parallelism.max(1);
        Self {
            options,
            seen: Mutex::new(HashMap::new()),
        }
    }
}

impl Task {
    pub fn nested(name: impl Into<String>, options: NestedOptions) -> Arc<Task> {
        Task::new(name, true, Nested::new(options))
    }
}

impl Behavior for Nested {
    fn poll(&self, task: &Task, token: &CancellationToken) {
        if !task.state().is(SchedulingClass::Running) {
            return;
        }

        if let Some(custom_poll) = &self.options.custom_poll {
            custom_poll(task, &task.children());
        }

        let children = task.children();
        let mut running = 0;
        let mut pending = vec![];
        for child in children.iter() {
            match child.state().scheduling_class() {
                Some(SchedulingClass::Running) => running += 1,
                Some(SchedulingClass::Pending) => pending.push(child),
                _ => {}
            }
        }

        // Only start new work; running children may have been started by hand.
        let mut pending = pending.into_iter();
        while running < self.options.parallelism {
            let Some(child) = pending.next() else {
                break;
            };
            child.modify(|status| status.state = TaskState::Running);
            debug!(task = task.name(), child = child.name(), "Starting child");
            running += 1;
        }

        for child in children.iter() {
            let state = child.state();
            let changed = lock(&self.seen)
                .get(child.name())
                .is_some_and(|seen| *seen != state);

            if state.is(SchedulingClass::Running) || changed {
                child.poll(token);
            }

            lock(&self.seen).insert(child.name().to_string(), child.state());
        }

        let total = children.len();
        let mut success = 0;
        let mut failed = 0;
        let mut done = 0;
        for child in children.iter() {
            let state = child.state();
            match state {
                TaskState::Success => success += 1,
                TaskState::Failed => failed += 1,
                _ => {}
            }
            if state.is(SchedulingClass::Done) {
                done += 1;
            }
        }

        task.modify(|status| status.message = format!("{}/{}", success, total));

        if !self.options.complete_all && failed > 0 {
            debug!(task = task.name(), failed, "Failing on first failed child");
            task.modify(|status| status.state = TaskState::Failed);
            return;
        }

        // An empty nested task stays open for children added later.
        if total > 0 && done == total {
            let state = if success == total {
                TaskState::Success
            } else {
                TaskState::Failed
            };
            debug!(task = task.name(), %state, "All children done");
            task.modify(|status| status.state = state);
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::task::testing::{mock, states};

    fn nested(options: NestedOptions) -> Arc<Task> {
        Task::nested("nested task test", options)
    }

    fn tick(task: &Task) {
        task.poll(&CancellationToken::new());
    }

    #[test]
    fn fail_first() {
        let nt = nested(NestedOptions::new().parallelism(1).complete_all(false));
        let (a, _) = mock("child 1", TaskState::Failed);
        let (b, _) = mock("child 2", TaskState::Success);
        nt.add_child(a.clone()).unwrap();
        nt.add_child(b.clone()).unwrap();
        nt.modify(|status| status.state = TaskState::Running);

        tick(&nt);
        assert_eq!(
            states(&[&a, &b, &nt]),
            vec![TaskState::Failed, TaskState::Pending, TaskState::Failed],
        );
    }

    #[test]
    fn complete_all_fail() {
        let nt = nested(NestedOptions::new().complete_all(true));
        let (a, _) = mock("child 1", TaskState::Failed);
        let (b, _) = mock("child 2", TaskState::Success);
        nt.add_child(a.clone()).unwrap();
        nt.add_child(b.clone()).unwrap();
        nt.modify(|status| status.state = TaskState::Running);

        tick(&nt);
        assert_eq!(
            states(&[&a, &b, &nt]),
            vec![TaskState::Failed, TaskState::Pending, TaskState::Running],
        );
        assert_eq!(nt.status().message, "0/2");

        tick(&nt);
        assert_eq!(
            states(&[&a, &b, &nt]),
            vec![TaskState::Failed, TaskState::Success, TaskState::Failed],
        );
        assert_eq!(nt.status().message, "1/2");
    }

    #[test]
    fn complete_all_success() {
        let nt = nested(NestedOptions::new().complete_all(true));
        let (a, _) = mock("child 1", TaskState::Success);
        let (b, _) = mock("child 2", TaskState::Success);
        nt.add_child(a.clone()).unwrap();
        nt.add_child(b.clone()).unwrap();
        nt.modify(|status| status.state = TaskState::Running);

        tick(&nt);
        assert_eq!(
            states(&[&a, &b, &nt]),
            vec![TaskState::Success, TaskState::Pending, TaskState::Running],
        );

        tick(&nt);
        assert_eq!(
            states(&[&a, &b, &nt]),
            vec![TaskState::Success, TaskState::Success, TaskState::Success],
        );
        assert_eq!(nt.status().message, "2/2");
    }

    #[test]
    fn parallelism_caps_running_children() {
        let nt = nested(NestedOptions::new().parallelism(2));
        let children: Vec<_> = (0..3)
            .map(|i| mock(&format!("child {i}"), TaskState::Running).0)
            .collect();
        for child in children.iter() {
            nt.add_child(child.clone()).unwrap();
        }
        nt.modify(|status| status.state = TaskState::Running);

        tick(&nt);
        tick(&nt);
        assert_eq!(
            states(&[&children[0], &children[1], &children[2]]),
            vec![TaskState::Running, TaskState::Running, TaskState::Pending],
        );
    }

    #[test]
    fn running_children_are_never_demoted() {
        let nt = nested(NestedOptions::new().parallelism(1));
        let (a, _) = mock("a", TaskState::Running);
        let (b, _) = mock("b", TaskState::Running);
        nt.add_child(a.clone()).unwrap();
        nt.add_child(b.clone()).unwrap();
        nt.modify(|status| status.state = TaskState::Running);
        b.modify(|status| status.state = TaskState::Running);

        tick(&nt);
        assert_eq!(states(&[&a, &b]), vec![TaskState::Pending, TaskState::Running]);
    }

    #[test]
    fn zero_children_never_resolves() {
        let nt = nested(NestedOptions::new().complete_all(true));
        nt.modify(|status| status.state = TaskState::Running);
        tick(&nt);
        tick(&nt);
        assert_eq!(nt.state(), TaskState::Running);
        assert_eq!(nt.status().message, "0/0");
    }

    #[test]
    fn idle_parent_does_not_touch_children() {
        let nt = nested(NestedOptions::new());
        let (a, polls) = mock("a", TaskState::Success);
        nt.add_child(a.clone()).unwrap();

        tick(&nt);
        assert_eq!(polls.load(Ordering::SeqCst), 0);
        assert_eq!(a.state(), TaskState::Pending);
    }

    #[test]
    fn custom_poll_only_runs_while_running() {
        let added = Arc::new(AtomicUsize::new(0));
        let counter = added.clone();
        let nt = nested(NestedOptions::new().complete_all(true).custom_poll(move |task, _children| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let (child, _) = mock(&format!("callback-added child {n}"), TaskState::Success);
            task.add_child(child).unwrap();
        }));

        nt.set_state(TaskState::Pending);
        assert_eq!(added.load(Ordering::SeqCst), 0);

        nt.set_state(TaskState::Running);
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(nt.children().len(), 1);

        nt.set_state(TaskState::Running);
        assert_eq!(nt.children().len(), 2);
    }

    #[test]
    fn polls_once_per_literal_state_change() {
        let nt = nested(NestedOptions::new().complete_all(true));
        // Stays RUNNING until changed from outside.
        let (ct, polls) = mock("child 1", TaskState::Running);
        nt.add_child(ct.clone()).unwrap();
        nt.modify(|status| status.state = TaskState::Running);

        let count = || polls.load(Ordering::SeqCst);

        let before = count();
        tick(&nt);
        assert_eq!(count(), before + 1, "not polled when promoted");

        let before = count();
        tick(&nt);
        assert_eq!(count(), before + 1, "not polled while running");

        ct.modify(|status| status.state = TaskState::Success);
        let before = count();
        tick(&nt);
        assert_eq!(count(), before + 1, "not polled after RUNNING -> SUCCESS");
        assert_eq!(nt.state(), TaskState::Success);

        nt.modify(|status| status.state = TaskState::Running);
        ct.modify(|status| status.state = TaskState::Skipped);
        let before = count();
        tick(&nt);
        assert_eq!(count(), before + 1, "not polled after SUCCESS -> SKIPPED");

        nt.modify(|status| status.state = TaskState::Running);
        let before = count();
        tick(&nt);
        assert_eq!(count(), before, "polled without a state change");
    }

    #[test]
    fn parallelism_is_at_least_one() {
        let nt = nested(NestedOptions::new().parallelism(0));
        let (a, _) = mock("a", TaskState::Success);
        nt.add_child(a.clone()).unwrap();
        nt.modify(|status| status.state = TaskState::Running);

        tick(&nt);
        assert_eq!(a.state(), TaskState::Success);
        assert_eq!(nt.state(), TaskState::Success);
    }
}
