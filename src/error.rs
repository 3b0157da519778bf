use std::sync::Arc;
use thiserror::Error;


/// Coarse grouping of [`Error`] variants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Configuration,
    Lifecycle,
    Lookup,
    Execution,
    Plan,
    Io,
}


#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("task named '{0}' already exists")]
    DuplicateName(String),
    #[error("no children allowed for task '{0}'")]
    NoChildrenAllowed(String),
    #[error("job was already started")]
    AlreadyStarted,
    #[error("no tokio runtime: {0}")]
    NoRuntime(String),
    #[error("job is not running")]
    NotRunning,
    #[error("task {0:?} not found")]
    TaskNotFound(Vec<String>),
    #[error("root task not configured")]
    RootNotConfigured,
    #[error("job cancelled")]
    Cancelled,
    #[error("failed to start: {0}")]
    Spawn(Arc<std::io::Error>),
    #[error("killed")]
    Killed,
    #[error("task '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("invalid plan: {0}")]
    Yaml(Arc<serde_yaml::Error>),
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateName(_) | Error::NoChildrenAllowed(_) => {
                ErrorKind::Configuration
            }
            Error::AlreadyStarted
            | Error::NotRunning
            | Error::NoRuntime(_)
            | Error::Cancelled => {
                ErrorKind::Lifecycle
            }
            Error::TaskNotFound(_) | Error::RootNotConfigured => {
                ErrorKind::Lookup
            }
            Error::Spawn(_) | Error::Killed => ErrorKind::Execution,
            Error::EmptyCommand(_) | Error::Yaml(_) => {
                ErrorKind::Plan
            }
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Yaml(Arc::new(err))
    }
}
