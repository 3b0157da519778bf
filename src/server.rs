use axum::routing::get;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Error, ErrorKind};
use crate::job::Job;

mod handlers;


pub struct Server {
    pub job: Arc<Job>,
}

impl Server {
    pub fn new(job: Arc<Job>) -> Self {
        Self { job }
    }
}


#[derive(Debug)]
pub struct ServerError(pub Error);

impl From<Error> for ServerError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::http::Response<axum::body::Body> {
        let status = match self.0.kind() {
            ErrorKind::Lookup => axum::http::StatusCode::NOT_FOUND,
            ErrorKind::Lifecycle => axum::http::StatusCode::CONFLICT,
            _ => axum::http::StatusCode::BAD_REQUEST,
        };
        (status, self.0.to_string()).into_response()
    }
}


pub fn router(server: Arc<Server>) -> axum::Router {
    axum::Router::new()
        .route("/tasks", get(handlers::get_tasks).post(handlers::post_tasks))
        .with_state(server)
}


pub async fn serve<F>(
    server: Arc<Server>,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(server))
        .with_graceful_shutdown(shutdown)
        .await
}
