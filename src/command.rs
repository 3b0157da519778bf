use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::tasks::TaskState;

mod run;

pub use run::run;


#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] crate::client::Error),
    #[error(transparent)]
    Canopy(#[from] crate::error::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}


#[derive(Debug, Parser)]
#[command(name = "canopy", version, about = "Hierarchical task runner")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}


#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a plan and serve its state over HTTP
    Serve {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long = "interval-ms", default_value_t = 100)]
        interval_ms: u64,
    },
    /// Print the current job snapshot
    Status {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,
    },
    /// Request a state change for the task at PATH
    Set {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,
        #[arg(long, value_parser = parse_state)]
        state: TaskState,
        path: Vec<String>,
    },
}


fn parse_state(value: &str) -> Result<TaskState, String> {
    serde_json::from_value(serde_json::Value::String(value.to_uppercase()))
        .map_err(|_| format!("unknown task state {:?}", value))
}
