//! Client for the NGINX Plus REST API.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{normalize_address, LoadBalancerGateway, UpstreamServer};
use crate::config::{Config, UpstreamKind, MAX_CUSTOM_HEADERS};
use crate::core::error::{GatewayError, GatewayResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    text: String,
}

pub struct NginxPlusClient {
    http: reqwest::Client,
    endpoint: String,
    version: u32,
}

impl NginxPlusClient {
    /// `custom_headers` are sent with every request.
    pub fn new(
        endpoint: &str,
        version: u32,
        custom_headers: &HashMap<String, String>,
    ) -> GatewayResult<Self> {
        if custom_headers.len() > MAX_CUSTOM_HEADERS {
            return Err(GatewayError::Configuration(format!(
                "{} custom headers configured, at most {MAX_CUSTOM_HEADERS} are allowed",
                custom_headers.len()
            )));
        }

        let mut headers = HeaderMap::with_capacity(custom_headers.len());
        for (name, value) in custom_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| invalid_header(name, e))?;
            let header_value = HeaderValue::from_str(value).map_err(|e| invalid_header(name, e))?;
            headers.insert(header_name, header_value);
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            version,
        })
    }

    pub fn from_config(config: &Config) -> GatewayResult<Self> {
        Self::new(
            &config.api_endpoint,
            config.api_version,
            &config.custom_headers,
        )
    }

    /// Fails unless the server supports the configured API version.
    pub async fn check_api_version(&self) -> GatewayResult<()> {
        let url = format!("{}/", self.endpoint);
        let versions: Vec<u32> = decode(self.http.get(url).send().await?).await?;
        if versions.contains(&self.version) {
            Ok(())
        } else {
            Err(GatewayError::Configuration(format!(
                "API version {} is not supported by the server, supported versions: {versions:?}",
                self.version
            )))
        }
    }

    fn servers_url(&self, upstream: &str, kind: UpstreamKind) -> String {
        let endpoint = &self.endpoint;
        let version = self.version;
        let kind = kind.as_str();
        format!("{endpoint}/{version}/{kind}/upstreams/{upstream}/servers")
    }
}

fn invalid_header(name: &str, err: impl Display) -> GatewayError {
    GatewayError::Configuration(format!("invalid custom header {name:?}: {err}"))
}

async fn check(response: reqwest::Response) -> GatewayResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let text = match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(err) => err.error.text,
        Err(_) => body,
    };
    Err(GatewayError::Api {
        status: status.as_u16(),
        text,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> GatewayResult<T> {
    let body = check(response).await?.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| GatewayError::Decode(e.to_string()))
}

#[async_trait]
impl LoadBalancerGateway for NginxPlusClient {
    async fn list_servers(
        &self,
        upstream: &str,
        kind: UpstreamKind,
    ) -> GatewayResult<Vec<UpstreamServer>> {
        let url = self.servers_url(upstream, kind);
        decode(self.http.get(url).send().await?).await
    }

    async fn add_server(
        &self,
        upstream: &str,
        kind: UpstreamKind,
        server: &UpstreamServer,
    ) -> GatewayResult<()> {
        let response = self
            .http
            .post(self.servers_url(upstream, kind))
            .json(server)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn remove_server(
        &self,
        upstream: &str,
        kind: UpstreamKind,
        address: &str,
    ) -> GatewayResult<()> {
        let wanted = normalize_address(address);
        let servers = self.list_servers(upstream, kind).await?;
        let Some(server) = servers
            .iter()
            .find(|s| normalize_address(&s.server) == wanted)
        else {
            debug!("Server {address} is already gone from upstream {upstream}");
            return Ok(());
        };
        let Some(id) = server.id else {
            return Err(GatewayError::Decode(format!(
                "server {address} of upstream {upstream} was listed without an id"
            )));
        };

        let url = format!("{}/{id}", self.servers_url(upstream, kind));
        check(self.http.delete(url).send().await?).await?;
        Ok(())
    }
}
