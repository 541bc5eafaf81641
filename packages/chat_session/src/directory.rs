//! Online-user directory.

use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use crate::config::DirectoryConfig;
use crate::error::DirectoryFetchError;
use crate::model::Identity;

/// Source of point-in-time snapshots of who is online.
pub trait Directory: Send + Sync + 'static {
    fn fetch_online(&self) -> BoxFuture<'_, Result<Vec<Identity>, DirectoryFetchError>>;
}

/// One record of `GET /api/users/online`. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineUser {
    username: String,
    #[serde(default)]
    full_name: Option<String>,
}

impl From<OnlineUser> for Identity {
    fn from(user: OnlineUser) -> Self {
        let display_name = user
            .full_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| user.username.clone());
        Identity::new(user.username, display_name)
    }
}

/// Directory served over HTTP.
pub struct HttpDirectory {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpDirectory {
    pub fn new(config: &DirectoryConfig, token: Option<String>) -> Result<Self, DirectoryFetchError> {
        Self::with_timeout(config.online_url(), config.timeout, token)
    }

    pub fn with_timeout(url: String, timeout: Duration, token: Option<String>) -> Result<Self, DirectoryFetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DirectoryFetchError::from_reqwest)?;
        Ok(Self { client, url, token })
    }
}

impl Directory for HttpDirectory {
    fn fetch_online(&self) -> BoxFuture<'_, Result<Vec<Identity>, DirectoryFetchError>> {
        Box::pin(async move {
            let mut request = self.client.get(&self.url);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let users: Vec<OnlineUser> = request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(DirectoryFetchError::from_reqwest)?
                .json()
                .await
                .map_err(DirectoryFetchError::from_reqwest)?;
            debug!(url = %self.url, count = users.len(), "fetched online users");
            Ok(users.into_iter().map(Identity::from).collect())
        })
    }
}
