//! [`InstanceApi`] and [`LifecycleApi`] backed by the AWS SDK.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::imds::{self, region::ImdsRegionProvider};
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{Filter, Instance};
use pingora_error::{Error, ErrorType::InternalError, Result};

use super::{GroupInstance, InstanceApi, LifecycleApi, GROUP_TAG_FILTER};
use crate::core::error::{ProviderError, ProviderResult};

const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
const METADATA_TIMEOUT: Duration = Duration::from_secs(1);

/// Reads the region of the instance we run on from instance metadata.
pub async fn discover_region() -> Result<String> {
    let imds = imds::Client::builder()
        .connect_timeout(METADATA_TIMEOUT)
        .read_timeout(METADATA_TIMEOUT)
        .build();
    let provider = ImdsRegionProvider::builder().imds_client(imds).build();

    match provider.region().await {
        Some(region) => Ok(region.to_string()),
        None => Error::e_explain(
            InternalError,
            "unable to retrieve region from instance metadata",
        ),
    }
}

pub async fn load_sdk_config(region: String) -> SdkConfig {
    let timeouts = TimeoutConfig::builder()
        .operation_timeout(OPERATION_TIMEOUT)
        .build();
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region))
        .timeout_config(timeouts)
        .load()
        .await
}

pub struct Ec2Instances {
    client: aws_sdk_ec2::Client,
}

impl Ec2Instances {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_ec2::Client::new(config),
        }
    }

    fn group_filter(scaling_group: &str) -> Filter {
        Filter::builder()
            .name(GROUP_TAG_FILTER)
            .values(scaling_group)
            .build()
    }
}

#[async_trait]
impl InstanceApi for Ec2Instances {
    async fn group_has_instances(&self, scaling_group: &str) -> ProviderResult<bool> {
        let output = self
            .client
            .describe_instances()
            .filters(Self::group_filter(scaling_group))
            .send()
            .await
            .map_err(|e| {
                ProviderError::transient(
                    &format!("couldn't check if autoscaling group {scaling_group} exists"),
                    DisplayErrorContext(&e),
                )
            })?;
        Ok(!output.reservations().is_empty())
    }

    async fn describe_group_instances(
        &self,
        scaling_group: &str,
    ) -> ProviderResult<Vec<GroupInstance>> {
        let mut pages = self
            .client
            .describe_instances()
            .filters(Self::group_filter(scaling_group))
            .into_paginator()
            .send();

        let mut instances = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                ProviderError::transient(
                    &format!("couldn't describe instances of autoscaling group {scaling_group}"),
                    DisplayErrorContext(&e),
                )
            })?;
            for reservation in page.reservations() {
                for instance in reservation.instances() {
                    let Some(instance_id) = instance.instance_id() else {
                        continue;
                    };
                    instances.push(GroupInstance {
                        instance_id: instance_id.to_string(),
                        private_ip: primary_private_ip(instance),
                    });
                }
            }
        }
        Ok(instances)
    }
}

/// The interface attached at device index 0, or the first one listed.
fn primary_private_ip(instance: &Instance) -> Option<String> {
    let interfaces = instance.network_interfaces();
    interfaces
        .iter()
        .find(|nic| nic.attachment().and_then(|a| a.device_index()) == Some(0))
        .or_else(|| interfaces.first())
        .and_then(|nic| nic.private_ip_address())
        .map(str::to_string)
}

pub struct AutoScalingLifecycle {
    client: aws_sdk_autoscaling::Client,
}

impl AutoScalingLifecycle {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_autoscaling::Client::new(config),
        }
    }
}

#[async_trait]
impl LifecycleApi for AutoScalingLifecycle {
    async fn describe_lifecycle_states(
        &self,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<(String, String)>> {
        let output = self
            .client
            .describe_auto_scaling_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(|e| {
                ProviderError::transient(
                    "couldn't describe autoscaling instances",
                    aws_sdk_autoscaling::error::DisplayErrorContext(&e),
                )
            })?;

        let states = output
            .auto_scaling_instances()
            .iter()
            .filter_map(|details| {
                let id = details.instance_id()?;
                Some((id.to_string(), details.lifecycle_state()?.to_string()))
            })
            .collect();
        Ok(states)
    }
}
