use crate::tasks::{JobSnapshot, TaskRequest};


#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}


#[derive(Clone, Debug)]
pub struct Client {
    reqwest: reqwest::Client,
    server: String,
}

impl Client {
    pub fn new(server: String) -> Self {
        Self {
            reqwest: reqwest::Client::new(),
            server: server.trim_end_matches('/').to_string(),
        }
    }

    pub async fn snapshot(&self) -> Result<JobSnapshot, Error> {
        let response = self.reqwest
            .get(format!("{}/tasks", self.server))
            .send()
            .await?;

        Ok(checked(response).await?.json().await?)
    }

    pub async fn task_request(&self, request: &TaskRequest) -> Result<JobSnapshot, Error> {
        let response = self.reqwest
            .post(format!("{}/tasks", self.server))
            .json(request)
            .send()
            .await?;

        Ok(checked(response).await?.json().await?)
    }
}


async fn checked(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::Status { status, body })
}
