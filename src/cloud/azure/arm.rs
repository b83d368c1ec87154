//! [`ScaleSetApi`] over the Azure Resource Manager REST API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::credential::TokenCredential;
use super::models::{ArmErrorBody, ArmList, NetworkInterface, ScaleSet, ScaleSetVm, VirtualMachine};
use super::ScaleSetApi;
use crate::cloud::paging::Page;
use crate::core::error::{ProviderError, ProviderResult};

pub const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

const COMPUTE_API_VERSION: &str = "2024-07-01";
const NETWORK_API_VERSION: &str = "2024-05-01";

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ArmClient {
    http: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
    base_url: String,
    subscription_id: String,
    resource_group: String,
}

impl ArmClient {
    pub fn new(
        http: reqwest::Client,
        credential: Arc<dyn TokenCredential>,
        subscription_id: &str,
        resource_group: &str,
    ) -> Self {
        Self {
            http,
            credential,
            base_url: MANAGEMENT_ENDPOINT.to_string(),
            subscription_id: subscription_id.to_string(),
            resource_group: resource_group.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn resource_url(&self, path: &str, api_version: &str) -> String {
        let base = &self.base_url;
        let subscription = &self.subscription_id;
        let group = &self.resource_group;
        let scope = format!("{base}/subscriptions/{subscription}/resourceGroups/{group}");
        format!("{scope}/providers/{path}?api-version={api_version}")
    }

    fn compute_url(&self, path: &str) -> String {
        let path = format!("Microsoft.Compute/{path}");
        self.resource_url(&path, COMPUTE_API_VERSION)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> ProviderResult<T> {
        let token = self.credential.token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProviderError::transient(&format!("GET {url}"), e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(resource_path(url).to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let path = resource_path(url);
            let message = error_message(&body);
            let msg = format!("GET {path} returned {status}: {message}");
            return Err(ProviderError::Transient(msg));
        }

        let context = format!("decoding {}", resource_path(url));
        response
            .json()
            .await
            .map_err(|e| ProviderError::transient(&context, e))
    }

    /// Fetches `first_url`, or `next_link` when continuing a listing.
    async fn get_page<T: DeserializeOwned>(
        &self,
        first_url: String,
        next_link: Option<String>,
    ) -> ProviderResult<Page<T>> {
        let url = next_link.unwrap_or(first_url);
        let list: ArmList<T> = self.get(&url).await?;
        Ok(Page::new(list.value, list.next_link))
    }
}

#[async_trait]
impl ScaleSetApi for ArmClient {
    async fn get_scale_set(&self, name: &str) -> ProviderResult<ScaleSet> {
        let url = self.compute_url(&format!("virtualMachineScaleSets/{name}"));
        self.get(&url).await
    }

    async fn list_scale_set_interfaces(
        &self,
        name: &str,
        next_link: Option<String>,
    ) -> ProviderResult<Page<NetworkInterface>> {
        // scale set interfaces live under the compute provider but use the network API version
        let url = self.resource_url(
            &format!("microsoft.Compute/virtualMachineScaleSets/{name}/networkInterfaces"),
            NETWORK_API_VERSION,
        );
        self.get_page(url, next_link).await
    }

    async fn list_scale_set_vms(
        &self,
        name: &str,
        next_link: Option<String>,
    ) -> ProviderResult<Page<ScaleSetVm>> {
        let url = self.compute_url(&format!("virtualMachineScaleSets/{name}/virtualMachines"));
        self.get_page(url, next_link).await
    }

    async fn get_virtual_machine(&self, name: &str) -> ProviderResult<VirtualMachine> {
        let url = self.compute_url(&format!("virtualMachines/{name}"));
        self.get(&url).await
    }

    async fn get_interface(&self, name: &str) -> ProviderResult<NetworkInterface> {
        let url = self.resource_url(
            &format!("Microsoft.Network/networkInterfaces/{name}"),
            NETWORK_API_VERSION,
        );
        self.get(&url).await
    }
}

fn resource_path(url: &str) -> &str {
    let path = url.split('?').next().unwrap_or(url);
    match path.find("/subscriptions/") {
        Some(idx) => &path[idx..],
        None => path,
    }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ArmErrorBody>(body) {
        Ok(err) => format!("{} ({})", err.error.message, err.error.code),
        Err(_) => body.to_string(),
    }
}
