//! Azure Resource Manager client
//!
//! Thin authenticated transport over the ARM REST API. Resource specific
//! operations live in [`crate::pubip`] and [`crate::vm`].

use crate::credentials::Credentials;
use crate::error::AzureError;
use crate::models::{ErrorResponse, OperationStatus};
use prometheus::IntCounter;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Azure public cloud Resource Manager endpoint
pub const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
/// Azure public cloud Active Directory endpoint
pub const AUTHORITY_ENDPOINT: &str = "https://login.microsoftonline.com";
/// API version used for `Microsoft.Network` resources
pub const NETWORK_API_VERSION: &str = "2023-09-01";
/// API version used for `Microsoft.Compute` resources
pub const COMPUTE_API_VERSION: &str = "2023-09-01";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Azure Resource Manager client
///
/// Counts every outbound ARM request in the injected read/write counters.
/// Token requests are not counted.
pub struct AzureClient {
    client: Client,
    credentials: Credentials,
    management_endpoint: String,
    authority_endpoint: String,
    token: Mutex<Option<CachedToken>>,
    read_requests: IntCounter,
    write_requests: IntCounter,
    poll_interval: Duration,
}

impl std::fmt::Debug for AzureClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureClient")
            .field("credentials", &self.credentials)
            .field("management_endpoint", &self.management_endpoint)
            .field("authority_endpoint", &self.authority_endpoint)
            .finish_non_exhaustive()
    }
}

impl AzureClient {
    /// Create a new Azure client for the public cloud
    ///
    /// # Arguments
    /// * `credentials` - Service principal and resource group
    /// * `read_requests` - Counter incremented for every GET
    /// * `write_requests` - Counter incremented for every PUT, POST and DELETE
    pub fn new(
        credentials: Credentials,
        read_requests: IntCounter,
        write_requests: IntCounter,
    ) -> Result<Self, AzureError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(AzureError::Http)?;

        Ok(Self {
            client,
            credentials,
            management_endpoint: MANAGEMENT_ENDPOINT.to_string(),
            authority_endpoint: AUTHORITY_ENDPOINT.to_string(),
            token: Mutex::new(None),
            read_requests,
            write_requests,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Override the Resource Manager and Active Directory endpoints.
    #[must_use]
    pub fn with_endpoints(mut self, management: &str, authority: &str) -> Self {
        self.management_endpoint = management.trim_end_matches('/').to_string();
        self.authority_endpoint = authority.trim_end_matches('/').to_string();
        self
    }

    /// Override the default interval between polls of a long-running operation.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Credentials the client was created with
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// URL of a resource provider path within the configured resource group
    pub fn resource_group_url(&self, provider_path: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/{}",
            self.management_endpoint,
            self.credentials.subscription_id,
            self.credentials.resource_group,
            provider_path.trim_start_matches('/')
        )
    }

    /// Get a bearer token, refreshing it shortly before it expires
    async fn bearer_token(&self) -> Result<String, AzureError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_endpoint, self.credentials.tenant_id
        );
        let scope = format!("{}/.default", self.management_endpoint);
        debug!("Requesting Azure AD token for client {}", self.credentials.aad_client_id);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.aad_client_id.as_str()),
                ("client_secret", self.credentials.aad_client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AzureError::Authentication(format!(
                "token request failed: {status} - {body}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    /// Make a GET request and decode the response body
    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, AzureError> {
        debug!("GET {}", url);
        let token = self.bearer_token().await?;
        self.read_requests.inc();

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(AzureError::Serialization)
    }

    /// Make a PUT request and wait for the operation to complete
    pub async fn put<B: Serialize + Sync>(&self, url: &str, body: &B) -> Result<(), AzureError> {
        debug!("PUT {}", url);
        let token = self.bearer_token().await?;
        self.write_requests.inc();

        let response = self
            .client
            .put(url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;

        self.wait_for_completion(response).await
    }

    /// Make a POST request without a body and wait for the operation to complete
    pub async fn post(&self, url: &str) -> Result<(), AzureError> {
        debug!("POST {}", url);
        let token = self.bearer_token().await?;
        self.write_requests.inc();

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .header("Content-Length", "0")
            .send()
            .await?;

        self.wait_for_completion(response).await
    }

    /// Make a DELETE request and wait for the operation to complete
    pub async fn delete(&self, url: &str) -> Result<(), AzureError> {
        debug!("DELETE {}", url);
        let token = self.bearer_token().await?;
        self.write_requests.inc();

        let response = self
            .client
            .delete(url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?;

        self.wait_for_completion(response).await
    }

    /// Wait for the long-running operation started by `response`
    ///
    /// Polls `Azure-AsyncOperation` when present, `Location` otherwise. A
    /// response carrying neither header is already complete.
    async fn wait_for_completion(&self, response: Response) -> Result<(), AzureError> {
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let headers = response.headers();
        let (poll_url, async_operation) = if let Some(url) = header_str(headers, "azure-asyncoperation") {
            (url.to_string(), true)
        } else if let Some(url) = header_str(headers, "location") {
            (url.to_string(), false)
        } else {
            return Ok(());
        };
        let mut delay = retry_after(headers).unwrap_or(self.poll_interval);

        loop {
            tokio::time::sleep(delay).await;
            debug!("Polling operation {}", poll_url);
            let token = self.bearer_token().await?;
            self.read_requests.inc();

            let response = self
                .client
                .get(&poll_url)
                .bearer_auth(token)
                .header("Accept", "application/json")
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(error_from_response(response).await);
            }
            delay = retry_after(response.headers()).unwrap_or(self.poll_interval);

            if async_operation {
                let text = response.text().await?;
                let operation: OperationStatus = serde_json::from_str(&text)?;
                match operation.status.as_str() {
                    "Succeeded" => return Ok(()),
                    "Failed" | "Canceled" | "Cancelled" => {
                        let detail = operation.error.unwrap_or_default();
                        return Err(AzureError::Operation(format!(
                            "{} {}: {}",
                            operation.status, detail.code, detail.message
                        )));
                    }
                    other => debug!("Operation {} is {}", poll_url, other),
                }
            } else if status != StatusCode::ACCEPTED {
                return Ok(());
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, "retry-after")?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Convert an unsuccessful response into an error, 404 becomes `NotFound`
async fn error_from_response(response: Response) -> AzureError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or_else(|_| crate::models::ErrorDetail {
            code: status.canonical_reason().unwrap_or("Unknown").to_string(),
            message: body.chars().take(500).collect(),
        });

    if status == StatusCode::NOT_FOUND {
        return AzureError::NotFound(format!("{}: {}", detail.code, detail.message));
    }
    AzureError::Api {
        status: status.as_u16(),
        code: detail.code,
        message: detail.message,
    }
}
