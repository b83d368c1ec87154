//! Virtual Machine Scale Set membership.
//!
//! Uniform scale sets expose their network interfaces directly. Flexible scale sets
//! only list their VMs, so every VM and each of its interfaces is looked up one by
//! one.

use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use log::{debug, warn};
use pingora_error::{Error, ErrorType::InternalError, OrErr, Result};

use crate::catalog::{Catalog, Upstream};
use crate::cloud::paging::{paginate, Page};
use crate::cloud::{collect_ips, CloudProvider, ScalingGroupSnapshot};
use crate::config::Config;
use crate::core::error::{ProviderError, ProviderResult};

pub mod arm;
pub mod credential;
pub mod models;

use arm::ArmClient;
use models::{NetworkInterface, OrchestrationMode, ScaleSet, ScaleSetVm, VirtualMachine};

#[async_trait]
pub trait ScaleSetApi: Send + Sync {
    async fn get_scale_set(&self, name: &str) -> ProviderResult<ScaleSet>;

    /// One page of the network interfaces of a Uniform scale set.
    async fn list_scale_set_interfaces(
        &self,
        name: &str,
        next_link: Option<String>,
    ) -> ProviderResult<Page<NetworkInterface>>;

    /// One page of the VMs of a Flexible scale set.
    async fn list_scale_set_vms(
        &self,
        name: &str,
        next_link: Option<String>,
    ) -> ProviderResult<Page<ScaleSetVm>>;

    async fn get_virtual_machine(&self, name: &str) -> ProviderResult<VirtualMachine>;

    async fn get_interface(&self, name: &str) -> ProviderResult<NetworkInterface>;
}

pub struct AzureProvider {
    catalog: Arc<Catalog>,
    api: Arc<dyn ScaleSetApi>,
}

impl AzureProvider {
    pub fn new(catalog: Arc<Catalog>, api: Arc<dyn ScaleSetApi>) -> Self {
        Self { catalog, api }
    }

    pub fn from_config(config: &Config, catalog: Arc<Catalog>) -> Result<Self> {
        let (Some(subscription_id), Some(resource_group)) = (
            config.subscription_id.as_deref(),
            config.resource_group_name.as_deref(),
        ) else {
            return Error::e_explain(
                InternalError,
                "subscription_id and resource_group_name are required for the Azure provider",
            );
        };

        let http = reqwest::Client::builder()
            .timeout(arm::REQUEST_TIMEOUT)
            .build()
            .or_err(InternalError, "Failed to build Azure HTTP client")?;
        let credential = credential::default_credential(http.clone());
        let client = ArmClient::new(http, credential, subscription_id, resource_group);

        Ok(Self::new(catalog, Arc::new(client)))
    }

    async fn uniform_ips(&self, name: &str) -> ProviderResult<Vec<String>> {
        let api = &self.api;
        let pages = paginate(move |next| api.list_scale_set_interfaces(name, next));
        let interfaces: Vec<NetworkInterface> = pages.try_concat().await?;
        Ok(primary_private_ips(&interfaces))
    }

    /// Resolves every VM of the scale set. Failures do not stop the walk, they are
    /// all reported together once every VM has been visited.
    async fn flexible_ips(&self, name: &str) -> ProviderResult<Vec<String>> {
        let api = &self.api;
        let mut pages = pin!(paginate(move |next| api.list_scale_set_vms(name, next)));

        let mut interfaces = Vec::new();
        let mut failures = Vec::new();
        while let Some(vms) = pages.try_next().await? {
            for vm in vms {
                let Some(vm_name) = vm.name else {
                    failures.push("VM with no name found".to_string());
                    continue;
                };
                match self.vm_interfaces(&vm_name).await {
                    Ok(found) => interfaces.extend(found),
                    Err(err) => failures.push(format!("VM {vm_name}: {err}")),
                }
            }
        }

        if !failures.is_empty() {
            return Err(ProviderError::Aggregated(failures));
        }
        Ok(primary_private_ips(&interfaces))
    }

    async fn vm_interfaces(&self, vm_name: &str) -> ProviderResult<Vec<NetworkInterface>> {
        let vm = self
            .api
            .get_virtual_machine(vm_name)
            .await
            .map_err(|e| ProviderError::transient("failed to get VM details", e))?;

        let Some(interface_ids) = vm.network_interface_ids() else {
            debug!("VM {vm_name} has no network profile");
            return Ok(Vec::new());
        };

        let mut interfaces = Vec::with_capacity(interface_ids.len());
        for id in interface_ids {
            let nic_name = resource_name_from_id(id)?;
            let context = format!("failed to get network interface {nic_name}");
            let nic = self.api.get_interface(nic_name).await;
            let nic = nic.map_err(|e| ProviderError::transient(&context, e))?;
            interfaces.push(nic);
        }
        Ok(interfaces)
    }
}

#[async_trait]
impl CloudProvider for AzureProvider {
    fn list_upstreams(&self) -> &[Upstream] {
        self.catalog.upstreams()
    }

    async fn resolve_members(&self, scaling_group: &str) -> ProviderResult<ScalingGroupSnapshot> {
        if scaling_group.is_empty() {
            let msg = "scale set name cannot be empty";
            return Err(ProviderError::InvalidRequest(msg.to_string()));
        }

        let scale_set = self.api.get_scale_set(scaling_group).await?;
        let mode = scale_set.properties.and_then(|p| p.orchestration_mode);

        let ips = match OrchestrationMode::parse(mode.as_deref()) {
            OrchestrationMode::Uniform => self.uniform_ips(scaling_group).await?,
            OrchestrationMode::Flexible => self.flexible_ips(scaling_group).await?,
            OrchestrationMode::Other(mode) => return Err(ProviderError::Unsupported(mode)),
        };
        Ok(collect_ips(scaling_group, ips))
    }

    async fn group_exists(&self, scaling_group: &str) -> ProviderResult<bool> {
        match self.api.get_scale_set(scaling_group).await {
            Ok(scale_set) => Ok(scale_set.id.is_some()),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => {
                warn!("Couldn't check if scale set {scaling_group} exists: {err}");
                Err(err)
            }
        }
    }
}

/// The last path segment of an ARM resource id.
pub fn resource_name_from_id(id: &str) -> ProviderResult<&str> {
    match id.rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(ProviderError::InvalidRequest(format!(
            "invalid resource ID format, empty resource name: {id:?}"
        ))),
    }
}

fn primary_private_ips(interfaces: &[NetworkInterface]) -> Vec<String> {
    interfaces
        .iter()
        .filter_map(|nic| nic.primary_private_ip())
        .map(str::to_string)
        .collect()
}
