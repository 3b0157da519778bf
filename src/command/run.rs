use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::client::Client;
use crate::command::{Cli, Command, Error};
use crate::job::Job;
use crate::plans::PlanSpec;
use crate::server::Server;
use crate::tasks::{TaskRequest, TaskState};


pub async fn run() -> Result<(), Error> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::Serve { plan, bind, port, interval_ms } => {
            serve(&plan, bind, port, Duration::from_millis(interval_ms)).await?;
        }
        Command::Status { server } => {
            status(server).await?;
        }
        Command::Set { server, state, path } => {
            set(server, state, path).await?;
        }
    }
    Ok(())
}


fn init_tracing(verbose: bool) {
    let default = if verbose { "canopy=debug" } else { "canopy=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}


async fn serve(
    plan: &Path,
    bind: String,
    port: u16,
    interval: Duration,
) -> Result<(), Error> {
    let root = PlanSpec::load(plan)?.build()?;
    let job = Arc::new(Job::new(root));

    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
        }
        interrupt.cancel();
    });

    job.start(ctx.clone(), interval)?;

    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, job = %job.uuid(), "Listening");

    let shutdown = ctx.clone();
    crate::server::serve(
        Arc::new(Server::new(job.clone())),
        listener,
        async move { shutdown.cancelled().await },
    ).await?;

    job.wait().await;
    Ok(())
}


async fn status(server: String) -> Result<(), Error> {
    let snapshot = Client::new(server).snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}


async fn set(server: String, state: TaskState, path: Vec<String>) -> Result<(), Error> {
    let snapshot = Client::new(server)
        .task_request(&TaskRequest { path, state })
        .await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
