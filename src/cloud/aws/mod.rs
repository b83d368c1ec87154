//! Auto Scaling group membership through the EC2 and Auto Scaling APIs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use pingora_error::{Error, ErrorType::InternalError, Result};

use crate::catalog::{Catalog, Upstream};
use crate::cloud::{collect_ips, CloudProvider, ScalingGroupSnapshot};
use crate::config::Config;
use crate::core::error::{ProviderError, ProviderResult};

pub mod sdk;

/// Tag the Auto Scaling service puts on every instance it launches.
pub const GROUP_TAG_FILTER: &str = "tag:aws:autoscaling:groupName";

/// The lifecycle lookup accepts at most this many instance ids per call.
pub const MAX_INSTANCE_IDS_PER_CALL: usize = 50;

pub const IN_SERVICE: &str = "InService";

/// `region` value that asks for discovery through instance metadata.
pub const SELF_REGION: &str = "self";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInstance {
    pub instance_id: String,
    /// Private address of the primary network interface
    pub private_ip: Option<String>,
}

#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// Whether any instance carries the group's tag.
    async fn group_has_instances(&self, scaling_group: &str) -> ProviderResult<bool>;

    /// Every instance tagged with the group, across all result pages.
    async fn describe_group_instances(
        &self,
        scaling_group: &str,
    ) -> ProviderResult<Vec<GroupInstance>>;
}

#[async_trait]
pub trait LifecycleApi: Send + Sync {
    /// `(instance id, lifecycle state)` pairs for at most [`MAX_INSTANCE_IDS_PER_CALL`] ids.
    async fn describe_lifecycle_states(
        &self,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<(String, String)>>;
}

pub struct AwsProvider {
    catalog: Arc<Catalog>,
    instances: Arc<dyn InstanceApi>,
    lifecycle: Arc<dyn LifecycleApi>,
}

impl AwsProvider {
    pub fn new(
        catalog: Arc<Catalog>,
        instances: Arc<dyn InstanceApi>,
        lifecycle: Arc<dyn LifecycleApi>,
    ) -> Self {
        Self {
            catalog,
            instances,
            lifecycle,
        }
    }

    pub async fn from_config(config: &Config, catalog: Arc<Catalog>) -> Result<Self> {
        let region = match config.region.as_deref() {
            Some(SELF_REGION) => sdk::discover_region().await?,
            Some(region) if !region.is_empty() => region.to_string(),
            _ => return Error::e_explain(InternalError, "region is required for the AWS provider"),
        };
        info!("Using AWS region {region}");

        let sdk_config = sdk::load_sdk_config(region).await;
        Ok(Self::new(
            catalog,
            Arc::new(sdk::Ec2Instances::new(&sdk_config)),
            Arc::new(sdk::AutoScalingLifecycle::new(&sdk_config)),
        ))
    }

    /// Keeps the addresses of candidates whose lifecycle state is `InService`.
    async fn in_service_ips(
        &self,
        candidates: HashMap<String, String>,
    ) -> ProviderResult<Vec<String>> {
        let mut ids: Vec<String> = candidates.keys().cloned().collect();
        ids.sort();

        let mut ips = Vec::with_capacity(ids.len());
        for batch in ids.chunks(MAX_INSTANCE_IDS_PER_CALL) {
            let states = self.lifecycle.describe_lifecycle_states(batch).await?;
            for (id, state) in states {
                if state != IN_SERVICE {
                    debug!("Skipping instance {id} in lifecycle state {state}");
                    continue;
                }
                if let Some(ip) = candidates.get(&id) {
                    ips.push(ip.clone());
                }
            }
        }
        Ok(ips)
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn list_upstreams(&self) -> &[Upstream] {
        self.catalog.upstreams()
    }

    async fn resolve_members(&self, scaling_group: &str) -> ProviderResult<ScalingGroupSnapshot> {
        if scaling_group.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "autoscaling group name cannot be empty".to_string(),
            ));
        }

        let source = &self.instances;
        let instances = source.describe_group_instances(scaling_group).await?;
        if instances.is_empty() {
            return Err(ProviderError::NotFound(format!(
                "autoscaling group {scaling_group} doesn't exist"
            )));
        }

        let with_ip = instances.into_iter().filter_map(|instance| {
            let ip = instance.private_ip?;
            Some((instance.instance_id, ip))
        });

        let ips = if self.catalog.requires_in_service(scaling_group) {
            self.in_service_ips(with_ip.collect()).await?
        } else {
            with_ip.map(|(_, ip)| ip).collect()
        };
        Ok(collect_ips(scaling_group, ips))
    }

    async fn group_exists(&self, scaling_group: &str) -> ProviderResult<bool> {
        self.instances.group_has_instances(scaling_group).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::catalog::{DEFAULT_FAIL_TIMEOUT, DEFAULT_SLOW_START};
    use crate::config::UpstreamKind;

    #[derive(Default)]
    struct FakeInstances {
        groups: HashMap<String, Vec<GroupInstance>>,
        fail: bool,
    }

    #[async_trait]
    impl InstanceApi for FakeInstances {
        async fn group_has_instances(&self, scaling_group: &str) -> ProviderResult<bool> {
            if self.fail {
                return Err(ProviderError::Transient("throttled".to_string()));
            }
            let instances = self.groups.get(scaling_group);
            Ok(instances.is_some_and(|i| !i.is_empty()))
        }

        async fn describe_group_instances(
            &self,
            scaling_group: &str,
        ) -> ProviderResult<Vec<GroupInstance>> {
            if self.fail {
                return Err(ProviderError::Transient("throttled".to_string()));
            }
            let instances = self.groups.get(scaling_group).cloned();
            Ok(instances.unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct FakeLifecycle {
        states: HashMap<String, String>,
        batches: Mutex<Vec<usize>>,
    }

    impl FakeLifecycle {
        fn with_states(states: &[(&str, &str)]) -> Self {
            let states = states
                .iter()
                .map(|(id, state)| (id.to_string(), state.to_string()))
                .collect();
            Self {
                states,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl LifecycleApi for FakeLifecycle {
        async fn describe_lifecycle_states(
            &self,
            instance_ids: &[String],
        ) -> ProviderResult<Vec<(String, String)>> {
            self.batches.lock().unwrap().push(instance_ids.len());
            let states = instance_ids
                .iter()
                .filter_map(|id| Some((id.clone(), self.states.get(id)?.clone())))
                .collect();
            Ok(states)
        }
    }

    fn upstream(group: &str, in_service: bool) -> Upstream {
        Upstream {
            name: format!("ups-{group}"),
            port: 80,
            kind: UpstreamKind::Http,
            scaling_group: group.to_string(),
            max_conns: None,
            max_fails: None,
            fail_timeout: DEFAULT_FAIL_TIMEOUT.to_string(),
            slow_start: DEFAULT_SLOW_START.to_string(),
            in_service,
        }
    }

    fn instance(id: &str, ip: Option<&str>) -> GroupInstance {
        GroupInstance {
            instance_id: id.to_string(),
            private_ip: ip.map(str::to_string),
        }
    }

    fn aws_provider(
        upstreams: Vec<Upstream>,
        instances: FakeInstances,
        lifecycle: Arc<FakeLifecycle>,
    ) -> AwsProvider {
        let catalog = Arc::new(Catalog::new(upstreams));
        AwsProvider::new(catalog, Arc::new(instances), lifecycle)
    }

    fn single_group_provider(instances: FakeInstances) -> AwsProvider {
        aws_provider(vec![upstream("g1", false)], instances, Arc::default())
    }

    fn snapshot(ips: &[&str]) -> ScalingGroupSnapshot {
        ips.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_resolve_members_skips_instances_without_ip() {
        let mut instances = FakeInstances::default();
        instances.groups.insert(
            "g1".to_string(),
            vec![
                instance("i-1", Some("10.0.0.1")),
                instance("i-2", None),
                instance("i-3", Some("10.0.0.3")),
            ],
        );
        let lifecycle = Arc::new(FakeLifecycle::default());
        let provider = aws_provider(vec![upstream("g1", false)], instances, lifecycle.clone());

        let ips = provider.resolve_members("g1").await.unwrap();
        assert_eq!(ips, snapshot(&["10.0.0.1", "10.0.0.3"]));
        // no lifecycle lookups without in_service
        assert!(lifecycle.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_members_in_service_filter() {
        let mut instances = FakeInstances::default();
        instances.groups.insert(
            "g1".to_string(),
            vec![
                instance("i-1", Some("10.0.0.1")),
                instance("i-2", Some("10.0.0.2")),
                instance("i-3", Some("10.0.0.3")),
            ],
        );
        let lifecycle = FakeLifecycle::with_states(&[
            ("i-1", "InService"),
            ("i-2", "Pending"),
            ("i-3", "Terminating:Wait"),
        ]);
        let provider = aws_provider(vec![upstream("g1", true)], instances, Arc::new(lifecycle));

        let ips = provider.resolve_members("g1").await.unwrap();
        assert_eq!(ips, snapshot(&["10.0.0.1"]));
    }

    #[tokio::test]
    async fn test_in_service_lookups_are_batched() {
        let group: Vec<GroupInstance> = (0..120)
            .map(|i| {
                let ip = format!("10.0.{}.{}", i / 100, i % 100);
                instance(&format!("i-{i:03}"), Some(&ip))
            })
            .collect();
        let mut lifecycle = FakeLifecycle::default();
        for member in &group {
            let id = member.instance_id.clone();
            lifecycle.states.insert(id, IN_SERVICE.to_string());
        }
        let mut instances = FakeInstances::default();
        instances.groups.insert("g1".to_string(), group);
        let lifecycle = Arc::new(lifecycle);
        let provider = aws_provider(vec![upstream("g1", true)], instances, lifecycle.clone());

        let ips = provider.resolve_members("g1").await.unwrap();
        assert_eq!(ips.len(), 120);
        assert_eq!(*lifecycle.batches.lock().unwrap(), vec![50, 50, 20]);
    }

    #[tokio::test]
    async fn test_resolve_members_errors() {
        let provider = single_group_provider(FakeInstances::default());

        let err = provider.resolve_members("g1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            provider.resolve_members("").await,
            Err(ProviderError::InvalidRequest(_))
        ));

        let failing = FakeInstances {
            fail: true,
            ..Default::default()
        };
        let provider = single_group_provider(failing);
        assert!(matches!(
            provider.resolve_members("g1").await,
            Err(ProviderError::Transient(_))
        ));
        assert!(provider.group_exists("g1").await.is_err());
    }

    #[tokio::test]
    async fn test_group_exists() {
        let mut instances = FakeInstances::default();
        let members = vec![instance("i-1", Some("10.0.0.1"))];
        instances.groups.insert("g1".to_string(), members);
        let provider = single_group_provider(instances);

        assert!(provider.group_exists("g1").await.unwrap());
        assert!(!provider.group_exists("g2").await.unwrap());
        assert_eq!(provider.list_upstreams().len(), 1);
    }
}
