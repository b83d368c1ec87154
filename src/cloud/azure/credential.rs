//! Bearer tokens for Azure Resource Manager.
//!
//! A service principal is used when `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and
//! `AZURE_CLIENT_SECRET` are all set, the VM's managed identity otherwise. Tokens
//! are cached until shortly before they expire.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::core::error::{ProviderError, ProviderResult};

pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

const LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";

const EXPIRY_MARGIN: Duration = Duration::from_secs(300);

#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn token(&self) -> ProviderResult<String>;
}

/// Picks the credential from the environment.
pub fn default_credential(http: reqwest::Client) -> Arc<dyn TokenCredential> {
    let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
    let tenant_id = env("AZURE_TENANT_ID");
    let client_id = env("AZURE_CLIENT_ID");
    let client_secret = env("AZURE_CLIENT_SECRET");
    match (tenant_id, client_id, client_secret) {
        (Some(tenant_id), Some(client_id), Some(client_secret)) => {
            debug!("Authenticating to Azure with client secret of {client_id}");
            Arc::new(ClientSecretCredential::new(http, tenant_id, client_id, client_secret))
        }
        (_, client_id, _) => {
            debug!("Authenticating to Azure with managed identity");
            Arc::new(ManagedIdentityCredential::new(http, client_id))
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    // IMDS sends a string, the login endpoint a number
    #[serde(default)]
    expires_in: serde_json::Value,
}

impl TokenResponse {
    fn lifetime(&self) -> Duration {
        let secs = match &self.expires_in {
            serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
            serde_json::Value::String(s) => s.parse().unwrap_or(0),
            _ => 0,
        };
        Duration::from_secs(secs).saturating_sub(EXPIRY_MARGIN)
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct TokenCache {
    inner: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    async fn get_or_fetch<F, Fut>(&self, fetch: F) -> ProviderResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProviderResult<TokenResponse>>,
    {
        let mut cached = self.inner.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let response = fetch().await?;
        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at: Instant::now() + response.lifetime(),
        });
        Ok(response.access_token)
    }
}

async fn request_token(
    request: reqwest::RequestBuilder,
    source: &str,
) -> ProviderResult<TokenResponse> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::transient(&format!("{source} token request failed"), e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let msg = format!("{source} token request returned {status}: {body}");
        return Err(ProviderError::Transient(msg));
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::transient(&format!("invalid {source} token response"), e))
}

pub struct ClientSecretCredential {
    http: reqwest::Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    cache: TokenCache,
}

impl ClientSecretCredential {
    pub fn new(
        http: reqwest::Client,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            http,
            authority: LOGIN_ENDPOINT.to_string(),
            tenant_id,
            client_id,
            client_secret,
            cache: TokenCache::default(),
        }
    }

    pub fn with_authority(mut self, authority: &str) -> Self {
        self.authority = authority.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn token(&self) -> ProviderResult<String> {
        self.cache
            .get_or_fetch(|| {
                let url = format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id);
                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.as_str()),
                    ("scope", MANAGEMENT_SCOPE),
                ];
                let request = self.http.post(url).form(&form);
                request_token(request, "client secret")
            })
            .await
    }
}

pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
    cache: TokenCache,
}

impl ManagedIdentityCredential {
    /// `client_id` selects a user-assigned identity.
    pub fn new(http: reqwest::Client, client_id: Option<String>) -> Self {
        Self {
            http,
            endpoint: IMDS_TOKEN_ENDPOINT.to_string(),
            client_id,
            cache: TokenCache::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn token(&self) -> ProviderResult<String> {
        self.cache
            .get_or_fetch(|| {
                let query = [
                    ("api-version", IMDS_API_VERSION),
                    ("resource", MANAGEMENT_RESOURCE),
                ];
                let mut request = self
                    .http
                    .get(&self.endpoint)
                    .header("Metadata", "true")
                    .query(&query);
                if let Some(client_id) = &self.client_id {
                    request = request.query(&[("client_id", client_id)]);
                }
                request_token(request, "managed identity")
            })
            .await
    }
}
