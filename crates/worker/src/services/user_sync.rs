//! Propagation of newly registered users to the backend service.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Anything other than 201 Created.
    #[error("backend returned status {status}")]
    Status { status: u16 },
    #[error("backend unreachable: {0}")]
    Transport(String),
}

#[async_trait::async_trait]
pub trait UserSyncTarget: Send + Sync {
    async fn create_user(&self, id: Uuid, name: &str, email: &str) -> Result<(), RemoteError>;
}

#[async_trait::async_trait]
impl<T> UserSyncTarget for std::sync::Arc<T>
where
    T: UserSyncTarget + ?Sized,
{
    async fn create_user(&self, id: Uuid, name: &str, email: &str) -> Result<(), RemoteError> {
        (**self).create_user(id, name, email).await
    }
}

#[derive(Serialize)]
struct CreateUserRequest<'a> {
    id: Uuid,
    name: &'a str,
    email: &'a str,
}

/// POSTs users to `{backend}/api/users`.
pub struct HttpUserSyncTarget {
    client: Client,
    backend_url: String,
}

impl HttpUserSyncTarget {
    pub fn new(backend_url: impl Into<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            backend_url: backend_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn users_url(&self) -> String {
        format!("{}/api/users", self.backend_url)
    }
}

#[async_trait::async_trait]
impl UserSyncTarget for HttpUserSyncTarget {
    #[instrument(skip(self, name), fields(%id), err)]
    async fn create_user(&self, id: Uuid, name: &str, email: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(self.users_url())
            .json(&CreateUserRequest { id, name, email })
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::CREATED => {
                info!(%id, email, "user created in backend");
                Ok(())
            }
            status => Err(RemoteError::Status {
                status: status.as_u16(),
            }),
        }
    }
}
