//! Scaling-group membership resolution.
//!
//! Each cloud implements [`CloudProvider`] on its own; [`Provider`] picks one at
//! configuration time and dispatches to it.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use pingora_error::Result;

use crate::catalog::{Catalog, Upstream};
use crate::config::{CloudProviderKind, Config};
use crate::core::error::ProviderResult;

pub mod aws;
pub mod azure;
pub mod paging;

use aws::AwsProvider;
use azure::AzureProvider;

/// Private IPs belonging to a scaling group at one point in time.
pub type ScalingGroupSnapshot = BTreeSet<IpAddr>;

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// The statically configured upstreams, in configuration order.
    fn list_upstreams(&self) -> &[Upstream];

    /// Resolves the private IPs of the group's members.
    ///
    /// Any failure aborts the whole call, a partial membership is never returned.
    async fn resolve_members(&self, scaling_group: &str) -> ProviderResult<ScalingGroupSnapshot>;

    /// `Ok(false)` means the group is definitely gone; errors mean "unknown".
    async fn group_exists(&self, scaling_group: &str) -> ProviderResult<bool>;
}

pub enum Provider {
    ElasticCompute(AwsProvider),
    ScaleSet(AzureProvider),
}

impl Provider {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let catalog = Arc::new(Catalog::from_config(config));
        match config.cloud_provider {
            CloudProviderKind::Aws => {
                let provider = AwsProvider::from_config(config, catalog).await?;
                Ok(Provider::ElasticCompute(provider))
            }
            CloudProviderKind::Azure => {
                let provider = AzureProvider::from_config(config, catalog)?;
                Ok(Provider::ScaleSet(provider))
            }
        }
    }
}

#[async_trait]
impl CloudProvider for Provider {
    fn list_upstreams(&self) -> &[Upstream] {
        match self {
            Provider::ElasticCompute(p) => p.list_upstreams(),
            Provider::ScaleSet(p) => p.list_upstreams(),
        }
    }

    async fn resolve_members(&self, scaling_group: &str) -> ProviderResult<ScalingGroupSnapshot> {
        match self {
            Provider::ElasticCompute(p) => p.resolve_members(scaling_group).await,
            Provider::ScaleSet(p) => p.resolve_members(scaling_group).await,
        }
    }

    async fn group_exists(&self, scaling_group: &str) -> ProviderResult<bool> {
        match self {
            Provider::ElasticCompute(p) => p.group_exists(scaling_group).await,
            Provider::ScaleSet(p) => p.group_exists(scaling_group).await,
        }
    }
}

/// Turns cloud-reported address strings into a snapshot, dropping anything that
/// is not an IP address.
pub(crate) fn collect_ips<I, S>(scaling_group: &str, addresses: I) -> ScalingGroupSnapshot
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    addresses
        .into_iter()
        .filter_map(|addr| match addr.as_ref().parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                log::warn!(
                    "Ignoring invalid address {:?} reported for scaling group {scaling_group}",
                    addr.as_ref()
                );
                None
            }
        })
        .collect()
}
