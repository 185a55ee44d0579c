//! Azure credentials backed by plain HTTP token endpoints.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::config::IdentitySettings;

use super::{AccessToken, IdentityError, TokenProvider};

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Token endpoint response. AAD v2 returns `expires_in`; managed identity
/// endpoints return `expires_on` as epoch seconds, sometimes as a string.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
}

fn as_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl TokenResponse {
    fn into_token(self) -> Result<AccessToken, IdentityError> {
        if let Some(epoch) = self.expires_on.as_ref().and_then(as_i64) {
            let expires_on = Utc
                .timestamp_opt(epoch, 0)
                .single()
                .ok_or_else(|| IdentityError::InvalidResponse(format!("bad expires_on {}", epoch)))?;
            return Ok(AccessToken::new(self.access_token, expires_on));
        }

        if let Some(seconds) = self.expires_in.as_ref().and_then(as_i64) {
            return Ok(AccessToken::expiring_in(self.access_token, seconds));
        }

        Err(IdentityError::InvalidResponse(
            "token response carries no expiry".to_string(),
        ))
    }
}

async fn read_token(response: reqwest::Response) -> Result<AccessToken, IdentityError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(IdentityError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    response.json::<TokenResponse>().await?.into_token()
}

fn http_client() -> Result<Client, IdentityError> {
    Ok(Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// Managed identity endpoints take a resource, not a `/.default` scope.
fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

/// Service principal credential using the OAuth2 client-credentials grant.
pub struct ClientSecretCredential {
    http: Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl ClientSecretCredential {
    pub fn new(
        authority_host: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        Ok(Self {
            http: http_client()?,
            authority_host: authority_host.into(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }
}

#[async_trait::async_trait]
impl TokenProvider for ClientSecretCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, IdentityError> {
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await?;

        read_token(response).await
    }
}

/// Managed identity credential (App Service endpoint or VM metadata service).
pub struct ManagedIdentityCredential {
    http: Client,
    client_id: Option<String>,
    app_service: Option<(String, String)>,
}

impl ManagedIdentityCredential {
    pub fn new(
        client_id: Option<String>,
        endpoint: Option<String>,
        header: Option<String>,
    ) -> Result<Self, IdentityError> {
        let app_service = match (endpoint, header) {
            (Some(endpoint), Some(header)) => Some((endpoint, header)),
            _ => None,
        };

        Ok(Self {
            http: http_client()?,
            client_id,
            app_service,
        })
    }
}

#[async_trait::async_trait]
impl TokenProvider for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, IdentityError> {
        let resource = scope_to_resource(scope);

        let mut request = match &self.app_service {
            Some((endpoint, header)) => self
                .http
                .get(endpoint)
                .header("X-IDENTITY-HEADER", header)
                .query(&[("api-version", APP_SERVICE_API_VERSION), ("resource", resource)]),
            None => self
                .http
                .get(IMDS_ENDPOINT)
                .header("Metadata", "true")
                .query(&[("api-version", IMDS_API_VERSION), ("resource", resource)]),
        };

        if let Some(client_id) = &self.client_id {
            request = request.query(&[("client_id", client_id.as_str())]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                IdentityError::Unavailable(format!("managed identity endpoint unreachable: {}", e))
            } else {
                IdentityError::Http(e)
            }
        })?;

        read_token(response).await
    }
}

/// Picks a service principal when one is fully configured, managed identity
/// otherwise.
pub struct DefaultCredential {
    inner: Box<dyn TokenProvider>,
}

impl DefaultCredential {
    pub fn from_settings(settings: &IdentitySettings) -> Result<Self, IdentityError> {
        let inner: Box<dyn TokenProvider> = match (
            non_empty(&settings.tenant_id),
            non_empty(&settings.client_id),
            non_empty(&settings.client_secret),
        ) {
            (Some(tenant), Some(client), Some(secret)) => {
                tracing::debug!("Using client secret credential");
                Box::new(ClientSecretCredential::new(
                    settings.authority_host.clone(),
                    tenant,
                    client,
                    secret,
                )?)
            }
            (_, client, _) => {
                tracing::debug!("Using managed identity credential");
                Box::new(ManagedIdentityCredential::new(
                    client.map(str::to_string),
                    settings.endpoint.clone(),
                    settings.header.clone(),
                )?)
            }
        };

        Ok(Self { inner })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[async_trait::async_trait]
impl TokenProvider for DefaultCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, IdentityError> {
        self.inner.get_token(scope).await
    }
}
