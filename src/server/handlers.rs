use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::debug;

use crate::server::{Server, ServerError};
use crate::tasks::{JobSnapshot, TaskRequest};


pub async fn get_tasks(State(server): State<Arc<Server>>) -> Json<JobSnapshot> {
    Json(server.job.snapshot())
}


pub async fn post_tasks(
    State(server): State<Arc<Server>>,
    Json(request): Json<TaskRequest>,
) -> Result<Json<JobSnapshot>, ServerError> {
    debug!(path = ?request.path, state = %request.state, "Received task request");
    server.job.task_request(&request)?;
    Ok(Json(server.job.snapshot()))
}
