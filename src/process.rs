use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::task::lock;


// How long to keep draining output after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);


/// Receives the result of a started process exactly once.
pub type Exit = oneshot::Receiver<Result<ExitStatus, Error>>;


#[derive(Debug)]
pub struct Process {
    program: String,
    inner: Mutex<ProcessState>,
}

impl Process {
    fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            inner: Mutex::new(ProcessState {
                output: vec![],
                status: None,
            }),
        }
    }

    /// Spawns `program` and waits for it in the background.
    ///
    /// Must be called from within a tokio runtime. Cancelling `kill` kills
    /// the process, and the exit then resolves to [`Error::Killed`].
    pub fn start(
        program: &str,
        args: &[String],
        kill: CancellationToken,
    ) -> Result<(Arc<Self>, Exit), Error> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::Spawn(Arc::new(err)))?;

        let process = Arc::new(Self::new(program));
        let mut readers = vec![];
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(process.clone().capture(stdout, Output::Stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(process.clone().capture(stderr, Output::Stderr)));
        }

        let (tx, rx) = oneshot::channel();
        let this = process.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill.cancelled() => None,
            };

            let result = match exited {
                Some(Ok(status)) => {
                    let drain = futures::future::join_all(readers);
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
                    lock(&this.inner).status = Some(status);
                    Ok(status)
                }
                Some(Err(err)) => Err(Error::from(err)),
                None => {
                    debug!(program = %this.program, "Killing process");
                    match child.kill().await {
                        Ok(()) => Err(Error::Killed),
                        Err(err) => Err(Error::from(err)),
                    }
                }
            };

            let _ = tx.send(result);
        });

        Ok((process, rx))
    }

    async fn capture<R>(self: Arc<Self>, reader: R, wrap: fn(String) -> Output)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = tokio::io::BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(program = %self.program, "{}", line);
            lock(&self.inner).output.push(wrap(line));
        }
    }

    pub fn output(&self) -> Vec<Output> {
        lock(&self.inner).output.clone()
    }

    pub fn last_line(&self) -> Option<String> {
        lock(&self.inner).output.last().map(|output| output.line().to_string())
    }

    pub fn status(&self) -> Option<ExitStatus> {
        lock(&self.inner).status
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Output {
    Stdout(String),
    Stderr(String),
}

impl Output {
    pub fn line(&self) -> &str {
        match self {
            Output::Stdout(line) | Output::Stderr(line) => line,
        }
    }
}


#[derive(Debug)]
struct ProcessState {
    output: Vec<Output>,
    status: Option<ExitStatus>,
}
