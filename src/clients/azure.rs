use crate::clients::kubernetes::poll_until;
use reqwest::{header::LOCATION, StatusCode};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

const RESOURCE_GROUP_API_VERSION: &str = "2021-04-01";

/// Tokens are refreshed this long before they actually expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown cloud environment: {0}")]
    UnknownEnvironment(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} returned {status}: {body}")]
    Status {
        operation: String,
        status: StatusCode,
        body: String,
    },

    #[error("deletion of resource group {0} is still in progress")]
    DeletionInProgress(String),
}

/// Authority and management endpoints for a sovereign cloud.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloudEnvironment {
    pub name: &'static str,
    pub active_directory_endpoint: &'static str,
    pub resource_manager_endpoint: &'static str,
}

impl CloudEnvironment {
    pub const PUBLIC: Self = Self {
        name: "AzurePublicCloud",
        active_directory_endpoint: "https://login.microsoftonline.com/",
        resource_manager_endpoint: "https://management.azure.com/",
    };

    pub const CHINA: Self = Self {
        name: "AzureChinaCloud",
        active_directory_endpoint: "https://login.chinacloudapi.cn/",
        resource_manager_endpoint: "https://management.chinacloudapi.cn/",
    };

    pub const US_GOVERNMENT: Self = Self {
        name: "AzureUSGovernmentCloud",
        active_directory_endpoint: "https://login.microsoftonline.us/",
        resource_manager_endpoint: "https://management.usgovcloudapi.net/",
    };

    pub fn token_url(&self, tenant_id: &str) -> String {
        format!(
            "{}{}/oauth2/v2.0/token",
            self.active_directory_endpoint, tenant_id
        )
    }

    pub fn token_scope(&self) -> String {
        format!("{}.default", self.resource_manager_endpoint)
    }

    pub fn resource_group_url(&self, subscription_id: &str, name: &str) -> String {
        format!(
            "{}subscriptions/{}/resourcegroups/{}?api-version={}",
            self.resource_manager_endpoint, subscription_id, name, RESOURCE_GROUP_API_VERSION
        )
    }
}

impl FromStr for CloudEnvironment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::PUBLIC, Self::CHINA, Self::US_GOVERNMENT]
            .into_iter()
            .find(|env| env.name.eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownEnvironment(s.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Clone, Debug)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Serialize)]
struct ResourceGroupRequest<'a> {
    location: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<&'a BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ResourceGroup {
    pub id: String,
    pub name: String,
    pub location: String,

    #[serde(default)]
    pub properties: Option<ResourceGroupProperties>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupProperties {
    pub provisioning_state: String,
}

/// Minimal resource-manager client, authenticated with a service principal.
#[derive(Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    environment: CloudEnvironment,
    subscription_id: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    token: Arc<Mutex<Option<AccessToken>>>,
}

impl CloudClient {
    pub fn new(
        environment: CloudEnvironment,
        subscription_id: &str,
        client_id: &str,
        tenant_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            environment,
            subscription_id: subscription_id.to_string(),
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: Arc::new(Mutex::new(None)),
        }
    }

    async fn bearer_token(&self) -> Result<String, Error> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let scope = self.environment.token_scope();
        let response = self
            .http
            .post(self.environment.token_url(&self.tenant_id))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;
        let response = check_status("token request", response).await?;
        let token: TokenResponse = response.json().await?;

        let value = token.access_token.clone();
        *cached = Some(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });

        Ok(value)
    }

    /// Creates the resource group, or updates it in place if it exists.
    pub async fn ensure_resource_group(
        &self,
        name: &str,
        location: &str,
        tags: Option<&BTreeMap<String, String>>,
    ) -> Result<ResourceGroup, Error> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .put(self.environment.resource_group_url(&self.subscription_id, name))
            .bearer_auth(token)
            .json(&ResourceGroupRequest { location, tags })
            .send()
            .await?;
        let response = check_status("create resource group", response).await?;

        let group: ResourceGroup = response.json().await?;
        info!(name = %group.name, location = %group.location, "ensured resource group");

        Ok(group)
    }

    /// Deletes the resource group and waits until it is gone.  A group that
    /// does not exist is treated as deleted.
    pub async fn delete_resource_group(&self, name: &str, timeout: Duration) -> Result<(), Error> {
        let url = self.environment.resource_group_url(&self.subscription_id, name);
        let token = self.bearer_token().await?;
        let response = self.http.delete(&url).bearer_auth(token).send().await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        match classify_delete(response.status(), location) {
            DeleteResponse::Deleted => Ok(()),
            DeleteResponse::Accepted(Some(location)) => {
                self.wait_for_deletion(name, &location, classify_operation, timeout)
                    .await
            }
            DeleteResponse::Accepted(None) => {
                debug!(name, "deletion accepted without a polling location");
                self.wait_for_deletion(name, &url, classify_group_lookup, timeout)
                    .await
            }
            DeleteResponse::Rejected => {
                Err(status_error("delete resource group", response).await)
            }
        }
    }

    /// Polls `url` until `classify` reports the deletion as done or failed.
    async fn wait_for_deletion(
        &self,
        name: &str,
        url: &str,
        classify: fn(StatusCode) -> PollStatus,
        timeout: Duration,
    ) -> Result<(), Error> {
        poll_until(timeout, || async {
            let token = self.bearer_token().await.map_err(backoff::Error::transient)?;
            let response = self
                .http
                .get(url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(Error::Http(e)))?;

            match classify(response.status()) {
                PollStatus::Done => Ok(()),
                PollStatus::InProgress => Err(backoff::Error::transient(
                    Error::DeletionInProgress(name.to_string()),
                )),
                PollStatus::Failed => Err(backoff::Error::permanent(
                    status_error("poll resource group deletion", response).await,
                )),
            }
        })
        .await?;

        info!(name, "deleted resource group");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum DeleteResponse {
    Deleted,
    /// Deletion runs asynchronously; carries the operation URL if given.
    Accepted(Option<String>),
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PollStatus {
    Done,
    InProgress,
    Failed,
}

fn classify_delete(status: StatusCode, location: Option<String>) -> DeleteResponse {
    match status {
        StatusCode::ACCEPTED => DeleteResponse::Accepted(location),
        StatusCode::NOT_FOUND => DeleteResponse::Deleted,
        status if status.is_success() => DeleteResponse::Deleted,
        _ => DeleteResponse::Rejected,
    }
}

/// Status of the asynchronous operation behind a `Location` header.
fn classify_operation(status: StatusCode) -> PollStatus {
    match status {
        StatusCode::ACCEPTED => PollStatus::InProgress,
        status if status.is_success() => PollStatus::Done,
        _ => PollStatus::Failed,
    }
}

/// Status of a lookup of the group being deleted.
fn classify_group_lookup(status: StatusCode) -> PollStatus {
    match status {
        StatusCode::NOT_FOUND => PollStatus::Done,
        status if status.is_success() => PollStatus::InProgress,
        _ => PollStatus::Failed,
    }
}

async fn check_status(
    operation: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, Error> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(operation, response).await)
    }
}

async fn status_error(operation: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    Error::Status {
        operation: operation.to_string(),
        status,
        body,
    }
}
