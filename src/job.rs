use futures::future::{BoxFuture, FutureExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::task::{lock, Task};
use crate::tasks::{JobSnapshot, Snapshot, TaskRequest, TaskState};

mod diff;

pub use diff::diff;


const JOB_VERSION: i64 = 1;
const CHANGES_CAPACITY: usize = 64;
const MIN_INTERVAL: Duration = Duration::from_millis(1);


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    Idle,
    Running,
    Stopped,
}


/// One batch of change lines produced by a single poll.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangeSet {
    pub lines: Vec<String>,
}


#[derive(Debug)]
struct Run {
    lifecycle: Lifecycle,
    generation: u64,
    stop: Option<CancellationToken>,
    exited: Option<CancellationToken>,
    // Context of the active run, handed to tasks started by request.
    ctx: Option<CancellationToken>,
}


/// Drives a task tree with a periodic poll loop.
#[derive(Debug)]
pub struct Job {
    uuid: Uuid,
    root: Option<Arc<Task>>,
    previous: Mutex<Option<Snapshot>>,
    run: Mutex<Run>,
    error: Mutex<Option<Error>>,
    changes: broadcast::Sender<ChangeSet>,
}

impl Job {
    pub fn new(root: Arc<Task>) -> Self {
        Self::build(Some(root))
    }

    /// A job without a root task; every operation on it reports
    /// [`Error::RootNotConfigured`].
    pub fn empty() -> Self {
        Self::build(None)
    }

    fn build(root: Option<Arc<Task>>) -> Self {
        let (changes, _) = broadcast::channel(CHANGES_CAPACITY);
        Self {
            uuid: Uuid::new_v4(),
            root,
            previous: Mutex::new(None),
            run: Mutex::new(Run {
                lifecycle: Lifecycle::Idle,
                generation: 0,
                stop: None,
                exited: None,
                ctx: None,
            }),
            error: Mutex::new(None),
            changes,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn root(&self) -> Option<&Arc<Task>> {
        self.root.as_ref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        lock(&self.run).lifecycle
    }

    /// Error recorded when the poll loop exited because `ctx` was cancelled.
    pub fn err(&self) -> Option<Error> {
        lock(&self.error).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.changes.subscribe()
    }

    /// Marks the root task running and starts polling it every `interval`
    /// until [`Job::stop`] is called or `ctx` is cancelled.
    pub fn start(
        self: &Arc<Self>,
        ctx: CancellationToken,
        interval: Duration,
    ) -> Result<(), Error> {
        let root = self.root.clone().ok_or(Error::RootNotConfigured)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| Error::NoRuntime(err.to_string()))?;

        let mut run = lock(&self.run);
        if run.lifecycle == Lifecycle::Running {
            return Err(Error::AlreadyStarted);
        }

        let stop = CancellationToken::new();
        let exited = CancellationToken::new();
        run.generation += 1;
        run.lifecycle = Lifecycle::Running;
        run.stop = Some(stop.clone());
        run.exited = Some(exited.clone());
        run.ctx = Some(ctx.clone());
        let generation = run.generation;
        drop(run);

        *lock(&self.error) = None;
        info!(job = %self.uuid, root = root.name(), ?interval, "Starting job");

        root.modify(|status| status.state = TaskState::Running);
        root.poll(&ctx);

        let job = self.clone();
        runtime.spawn(async move {
            job.run_loop(ctx, interval.max(MIN_INTERVAL), stop, generation).await;
            exited.cancel();
        });

        Ok(())
    }

    async fn run_loop(
        &self,
        ctx: CancellationToken,
        interval: Duration,
        stop: CancellationToken,
        generation: u64,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => {
                    info!(job = %self.uuid, "Job stopped");
                    return;
                }
                _ = ctx.cancelled() => {
                    warn!(job = %self.uuid, "Job cancelled");
                    *lock(&self.error) = Some(Error::Cancelled);
                    let mut run = lock(&self.run);
                    if run.generation == generation {
                        run.lifecycle = Lifecycle::Stopped;
                        run.stop = None;
                        run.ctx = None;
                    }
                    return;
                }
                _ = ticker.tick() => {
                    self.poll(&ctx);
                }
            }
        }
    }

    /// Signals the poll loop to exit.
    pub fn stop(&self) -> Result<(), Error> {
        let mut run = lock(&self.run);
        if run.lifecycle != Lifecycle::Running {
            return Err(Error::NotRunning);
        }

        if let Some(stop) = run.stop.take() {
            stop.cancel();
        }
        run.lifecycle = Lifecycle::Stopped;
        run.ctx = None;
        debug!(job = %self.uuid, "Stop requested");
        Ok(())
    }

    /// Resolves once the most recently started poll loop has exited, or
    /// immediately if the job was never started.
    pub fn wait(&self) -> BoxFuture<'static, ()> {
        let exited = lock(&self.run).exited.clone();
        async move {
            if let Some(exited) = exited {
                exited.cancelled().await;
            }
        }.boxed()
    }

    /// Polls the root once and publishes any changes since the last poll.
    pub fn poll(&self, ctx: &CancellationToken) {
        let Some(root) = &self.root else {
            return;
        };

        root.poll(ctx);
        let snapshot = root.snapshot();

        let mut previous = lock(&self.previous);
        let lines = diff(previous.as_ref(), Some(&snapshot));
        if !lines.is_empty() {
            info!(job = %self.uuid, "State changed:\n{}", lines.join("\n"));
            let _ = self.changes.send(ChangeSet { lines });
        }
        *previous = Some(snapshot);
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            version: JOB_VERSION,
            uuid: self.uuid,
            root: self.root.as_ref().map(|root| root.snapshot()),
        }
    }

    /// Resolves `path` below the root, one child name per segment.
    pub fn find(&self, path: &[String]) -> Result<Arc<Task>, Error> {
        let mut task = self.root.clone().ok_or(Error::RootNotConfigured)?;
        for name in path {
            task = task.get_child(name)
                .ok_or_else(|| Error::TaskNotFound(path.to_vec()))?;
        }
        Ok(task)
    }

    /// Sets the state of the task at `request.path` and polls it. While the
    /// job is running the poll uses the run's context, so work started by
    /// request is cancelled along with the job.
    pub fn task_request(&self, request: &TaskRequest) -> Result<(), Error> {
        let task = self.find(&request.path)?;
        if request.state == TaskState::Unknown {
            return Ok(());
        }

        debug!(job = %self.uuid, path = ?request.path, state = %request.state, "Task request");
        let ctx = lock(&self.run).ctx.clone();
        match ctx {
            Some(ctx) => task.set_state_with(request.state, &ctx),
            None => task.set_state(request.state),
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::ErrorKind;
    use crate::task::testing::mock;
    use crate::task::NestedOptions;

    const TICK: Duration = Duration::from_millis(5);

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(TICK).await;
        }
        panic!("condition not reached");
    }

    fn counting_root() -> (Arc<Task>, Arc<AtomicUsize>) {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let root = Task::from_fn("root", false, move |_task, _token| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (root, polls)
    }

    fn tree() -> Arc<Task> {
        let root = Task::nested("root", NestedOptions::new().complete_all(true));
        let stage = Task::nested("stage", NestedOptions::new().parallelism(2));
        stage.add_child(mock("a", TaskState::Success).0).unwrap();
        stage.add_child(mock("b", TaskState::Success).0).unwrap();
        root.add_child(stage).unwrap();
        root.add_child(mock("c", TaskState::Success).0).unwrap();
        root
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let (root, polls) = counting_root();
        let job = Arc::new(Job::new(root.clone()));
        let ctx = CancellationToken::new();

        assert_eq!(job.lifecycle(), Lifecycle::Idle);
        job.start(ctx.clone(), TICK).unwrap();
        assert_eq!(root.state(), TaskState::Running);

        let err = job.start(ctx.clone(), Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
        assert_eq!(err.kind(), ErrorKind::Lifecycle);

        eventually(|| polls.load(Ordering::SeqCst) >= 5).await;
        job.stop().unwrap();
        tokio::time::timeout(Duration::from_secs(1), job.wait()).await.unwrap();

        assert_eq!(job.lifecycle(), Lifecycle::Stopped);
        assert!(matches!(job.stop(), Err(Error::NotRunning)));
        assert!(job.err().is_none());
    }

    #[tokio::test]
    async fn stop_before_start_fails() {
        let (root, _) = counting_root();
        let job = Job::new(root);
        assert!(matches!(job.stop(), Err(Error::NotRunning)));
        tokio::time::timeout(Duration::from_millis(100), job.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let (root, _) = counting_root();
        let job = Arc::new(Job::new(root));
        let ctx = CancellationToken::new();

        job.start(ctx.clone(), TICK).unwrap();
        job.stop().unwrap();
        job.wait().await;

        job.start(ctx.clone(), TICK).unwrap();
        assert_eq!(job.lifecycle(), Lifecycle::Running);
        job.stop().unwrap();
        job.wait().await;
    }

    #[tokio::test]
    async fn cancellation_is_a_terminal_error() {
        let (root, _) = counting_root();
        let job = Arc::new(Job::new(root));
        let ctx = CancellationToken::new();

        job.start(ctx.clone(), TICK).unwrap();
        let wait = job.wait();
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), wait).await.unwrap();

        assert!(matches!(job.err(), Some(Error::Cancelled)));
        assert_eq!(job.lifecycle(), Lifecycle::Stopped);
        assert!(matches!(job.stop(), Err(Error::NotRunning)));
    }

    #[test]
    fn start_outside_runtime_fails() {
        let (root, polls) = counting_root();
        let job = Arc::new(Job::new(root.clone()));

        let err = job.start(CancellationToken::new(), TICK).unwrap_err();
        assert!(matches!(err, Error::NoRuntime(_)));
        assert_eq!(job.lifecycle(), Lifecycle::Idle);
        assert_eq!(root.state(), TaskState::Pending);
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_job_has_no_root() {
        let job = Arc::new(Job::empty());
        let err = job.start(CancellationToken::new(), TICK).unwrap_err();
        assert!(matches!(err, Error::RootNotConfigured));

        let err = job.task_request(&TaskRequest::default()).unwrap_err();
        assert!(matches!(err, Error::RootNotConfigured));
        assert!(job.snapshot().root.is_none());
    }

    #[tokio::test]
    async fn poll_loop_drives_tree_to_completion() {
        let root = tree();
        let job = Arc::new(Job::new(root.clone()));
        job.start(CancellationToken::new(), TICK).unwrap();

        eventually(|| root.state() == TaskState::Success).await;
        job.stop().unwrap();

        let snapshot = job.snapshot();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.uuid, job.uuid());
        let root = snapshot.root.unwrap();
        assert_eq!(root.message, "2/2");
        assert_eq!(root.children[0].message, "2/2");
    }

    #[tokio::test]
    async fn changes_are_batched_per_poll() {
        let root = tree();
        let job = Job::new(root.clone());
        let mut changes = job.subscribe();
        let ctx = CancellationToken::new();

        root.modify(|status| status.state = TaskState::Running);
        job.poll(&ctx);
        let first = changes.try_recv().unwrap();
        assert!(first.lines.contains(&"[root/stage]: (new) () -> SUCCESS (2/2)".to_string()));
        assert!(first.lines.contains(&"[root/stage/a]: (new) () -> SUCCESS ()".to_string()));

        job.poll(&ctx);
        let second = changes.try_recv().unwrap();
        assert_eq!(second.lines, vec![
            "[root]: RUNNING (1/2) -> SUCCESS (2/2)",
            "[root/c]: PENDING () -> SUCCESS ()",
        ]);

        job.poll(&ctx);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn task_request_sets_state_by_path() {
        let root = tree();
        let job = Job::new(root.clone());

        let request = TaskRequest {
            path: vec!["stage".into(), "b".into()],
            state: TaskState::Skipped,
        };
        job.task_request(&request).unwrap();
        assert_eq!(job.find(&request.path).unwrap().state(), TaskState::Skipped);

        let request = TaskRequest {
            path: vec!["stage".into(), "a".into()],
            state: TaskState::Unknown,
        };
        job.task_request(&request).unwrap();
        assert_eq!(job.find(&request.path).unwrap().state(), TaskState::Pending);

        let request = TaskRequest {
            path: vec!["stage".into(), "missing".into()],
            state: TaskState::Skipped,
        };
        let err = job.task_request(&request).unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(ref path) if path == &request.path));
        assert_eq!(err.kind(), ErrorKind::Lookup);
    }

    #[tokio::test]
    async fn task_request_polls_the_target() {
        let (child, polls) = mock("child", TaskState::Success);
        let root = Task::nested("root", NestedOptions::new());
        root.add_child(child.clone()).unwrap();
        let job = Job::new(root);

        job.task_request(&TaskRequest {
            path: vec!["child".into()],
            state: TaskState::Running,
        }).unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(child.state(), TaskState::Success);
    }

    #[tokio::test]
    async fn requested_task_is_cancelled_with_the_job() {
        let marker = std::env::temp_dir().join(format!("canopy-{}", Uuid::new_v4()));
        let script = format!("sleep 1; touch {}", marker.display());

        let root = Task::nested("root", NestedOptions::new());
        root.add_child(Task::shell("a", "sleep", ["30"])).unwrap();
        root.add_child(Task::shell("b", "sh", ["-c", script.as_str()])).unwrap();
        let job = Arc::new(Job::new(root));
        let ctx = CancellationToken::new();

        job.start(ctx.clone(), TICK).unwrap();
        job.task_request(&TaskRequest {
            path: vec!["b".into()],
            state: TaskState::Running,
        }).unwrap();
        let b = job.find(&["b".to_string()]).unwrap();
        assert_eq!(b.status().message, "Started");

        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), job.wait()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "process started by request outlived the job");
    }
}
