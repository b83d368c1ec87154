//! Reconciliation of load-balancer upstreams against scaling-group membership.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, HistogramOpts, IntCounterVec,
};

use crate::catalog::Upstream;
use crate::cloud::{CloudProvider, ScalingGroupSnapshot};
use crate::core::error::{SyncError, SyncStage};
use crate::gateway::{normalize_address, LoadBalancerGateway, UpstreamServer};

pub mod service;

pub use service::SyncService;

const PASS_BUCKETS: &[f64] = &[
    10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 30000.0,
];

static SERVERS_ADDED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "asg_sync_servers_added_total",
        "Servers added to load-balancer upstreams",
        &["upstream"]
    )
    .unwrap()
});

static SERVERS_REMOVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "asg_sync_servers_removed_total",
        "Servers removed from load-balancer upstreams",
        &["upstream"]
    )
    .unwrap()
});

static UPSTREAM_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "asg_sync_upstream_failures_total",
        "Upstreams skipped in a reconcile pass",
        &[
            "upstream", // upstream name
            "stage",    // resolve, fetch or apply
        ]
    )
    .unwrap()
});

static PASS_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "asg_sync_pass_duration_ms",
        "Duration of a full reconcile pass in milliseconds",
    )
    .buckets(PASS_BUCKETS.to_vec());
    register_histogram!(opts).unwrap()
});

/// Server addresses to add to and remove from one upstream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diff {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl Diff {
    pub fn compute(desired: &BTreeSet<String>, actual: &BTreeSet<String>) -> Self {
        Self {
            to_add: desired.difference(actual).cloned().collect(),
            to_remove: actual.difference(desired).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Changes applied to one upstream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Result of one pass over every upstream.
#[derive(Debug, Default)]
pub struct PassReport {
    pub synced: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Reconciler {
    provider: Arc<dyn CloudProvider>,
    gateway: Arc<dyn LoadBalancerGateway>,
}

impl Reconciler {
    pub fn new(provider: Arc<dyn CloudProvider>, gateway: Arc<dyn LoadBalancerGateway>) -> Self {
        Self { provider, gateway }
    }

    /// Reconciles every upstream concurrently. A failing upstream is logged and
    /// skipped, it never affects its siblings.
    pub async fn run_pass(&self) -> PassReport {
        let started = Instant::now();
        let upstreams = self.provider.list_upstreams();

        let syncs = upstreams.iter().map(|upstream| async move {
            let result = self.sync_upstream(upstream).await;
            (upstream, result)
        });
        let results = join_all(syncs).await;

        let mut report = PassReport::default();
        for (upstream, result) in results {
            match result {
                Ok(_) => report.synced.push(upstream.name.clone()),
                Err(err) => {
                    error!("Skipping upstream {}: {err}", upstream.name);
                    UPSTREAM_FAILURES
                        .with_label_values(&[upstream.name.as_str(), err.stage().as_str()])
                        .inc();
                    report.failed.push(upstream.name.clone());
                }
            }
        }

        let elapsed = started.elapsed();
        PASS_DURATION.observe(elapsed.as_secs_f64() * 1000.0);
        let (synced, failed) = (report.synced.len(), report.failed.len());
        debug!("Reconcile pass finished in {elapsed:?}: {synced} synced, {failed} failed");
        report
    }

    /// Converges one upstream onto its scaling group's current membership.
    pub async fn sync_upstream(&self, upstream: &Upstream) -> Result<SyncOutcome, SyncError> {
        let members = self.desired_members(upstream).await?;

        let servers = self
            .gateway
            .list_servers(&upstream.name, upstream.kind)
            .await
            .map_err(|e| SyncError::Gateway(SyncStage::Fetch, e))?;

        let desired: BTreeSet<String> = members
            .iter()
            .map(|ip| upstream.server_address(*ip))
            .collect();
        let actual: BTreeSet<String> = servers
            .iter()
            .map(|server| normalize_address(&server.server))
            .collect();

        let diff = Diff::compute(&desired, &actual);
        if diff.is_empty() {
            debug!("Upstream {} is up to date", upstream.name);
            return Ok(SyncOutcome::default());
        }
        self.apply(upstream, diff).await
    }

    /// An empty membership when the group is gone, so that every server is removed.
    async fn desired_members(
        &self,
        upstream: &Upstream,
    ) -> Result<ScalingGroupSnapshot, SyncError> {
        let group = &upstream.scaling_group;
        if !self.provider.group_exists(group).await? {
            warn!(
                "Scaling group {group} of upstream {} doesn't exist, removing all its servers",
                upstream.name
            );
            return Ok(ScalingGroupSnapshot::new());
        }

        match self.provider.resolve_members(group).await {
            Ok(members) => Ok(members),
            Err(err) if err.is_not_found() => {
                warn!("{err}, removing all servers of upstream {}", upstream.name);
                Ok(ScalingGroupSnapshot::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Removals go first. The first failing call aborts the rest.
    async fn apply(&self, upstream: &Upstream, diff: Diff) -> Result<SyncOutcome, SyncError> {
        let mut outcome = SyncOutcome::default();
        let name = upstream.name.as_str();

        for address in diff.to_remove {
            self.gateway
                .remove_server(name, upstream.kind, &address)
                .await
                .map_err(|e| SyncError::Gateway(SyncStage::Apply, e))?;
            SERVERS_REMOVED.with_label_values(&[name]).inc();
            outcome.removed.push(address);
        }

        for address in diff.to_add {
            let server = UpstreamServer::for_upstream(upstream, address);
            self.gateway
                .add_server(name, upstream.kind, &server)
                .await
                .map_err(|e| SyncError::Gateway(SyncStage::Apply, e))?;
            SERVERS_ADDED.with_label_values(&[name]).inc();
            outcome.added.push(server.server);
        }

        let group = &upstream.scaling_group;
        let SyncOutcome { added, removed } = &outcome;
        info!("Updated upstream {name} for group {group}: added {added:?}, removed {removed:?}");
        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::catalog::{DEFAULT_FAIL_TIMEOUT, DEFAULT_SLOW_START};
    use crate::config::UpstreamKind;
    use crate::core::error::{GatewayError, GatewayResult, ProviderError, ProviderResult};

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    pub(crate) fn upstream(name: &str, group: &str, port: u16) -> Upstream {
        Upstream {
            name: name.to_string(),
            port,
            kind: UpstreamKind::Http,
            scaling_group: group.to_string(),
            max_conns: Some(2),
            max_fails: Some(1),
            fail_timeout: DEFAULT_FAIL_TIMEOUT.to_string(),
            slow_start: DEFAULT_SLOW_START.to_string(),
            in_service: false,
        }
    }

    fn transient(msg: &str) -> ProviderError {
        ProviderError::Transient(msg.to_string())
    }

    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub upstreams: Vec<Upstream>,
        pub members: HashMap<String, ProviderResult<Vec<&'static str>>>,
        pub exists: HashMap<String, ProviderResult<bool>>,
    }

    impl FakeProvider {
        pub(crate) fn set_members(
            &mut self,
            group: &str,
            members: ProviderResult<Vec<&'static str>>,
        ) {
            self.members.insert(group.to_string(), members);
        }

        fn set_exists(&mut self, group: &str, exists: ProviderResult<bool>) {
            self.exists.insert(group.to_string(), exists);
        }
    }

    #[async_trait]
    impl CloudProvider for FakeProvider {
        fn list_upstreams(&self) -> &[Upstream] {
            &self.upstreams
        }

        async fn resolve_members(
            &self,
            scaling_group: &str,
        ) -> ProviderResult<ScalingGroupSnapshot> {
            match self.members.get(scaling_group) {
                Some(Ok(ips)) => Ok(ips.iter().map(|ip| ip.parse().unwrap()).collect()),
                Some(Err(err)) => Err(err.clone()),
                None => Err(ProviderError::NotFound(scaling_group.to_string())),
            }
        }

        async fn group_exists(&self, scaling_group: &str) -> ProviderResult<bool> {
            match self.exists.get(scaling_group) {
                Some(exists) => exists.clone(),
                None => Ok(true),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Op {
        Add(String, UpstreamServer),
        Remove(String, String),
    }

    #[derive(Default)]
    pub(crate) struct FakeGateway {
        pub servers: Mutex<HashMap<String, Vec<UpstreamServer>>>,
        pub ops: Mutex<Vec<Op>>,
        pub fail_list: Vec<String>,
        pub fail_remove: bool,
    }

    impl FakeGateway {
        pub(crate) fn with_servers(upstream: &str, addresses: &[&str]) -> Self {
            let servers: Vec<UpstreamServer> = addresses
                .iter()
                .map(|a| UpstreamServer {
                    server: a.to_string(),
                    ..Default::default()
                })
                .collect();
            let servers = HashMap::from([(upstream.to_string(), servers)]);
            FakeGateway {
                servers: Mutex::new(servers),
                ..Default::default()
            }
        }

        pub(crate) fn addresses(&self, upstream: &str) -> BTreeSet<String> {
            let servers = self.servers.lock().unwrap();
            servers
                .get(upstream)
                .map(|s| s.iter().map(|s| s.server.clone()).collect())
                .unwrap_or_default()
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LoadBalancerGateway for FakeGateway {
        async fn list_servers(
            &self,
            upstream: &str,
            _kind: UpstreamKind,
        ) -> GatewayResult<Vec<UpstreamServer>> {
            if self.fail_list.iter().any(|u| u == upstream) {
                return Err(GatewayError::Api {
                    status: 502,
                    text: "bad gateway".to_string(),
                });
            }
            let servers = self.servers.lock().unwrap();
            Ok(servers.get(upstream).cloned().unwrap_or_default())
        }

        async fn add_server(
            &self,
            upstream: &str,
            _kind: UpstreamKind,
            server: &UpstreamServer,
        ) -> GatewayResult<()> {
            let op = Op::Add(upstream.to_string(), server.clone());
            self.ops.lock().unwrap().push(op);
            let mut servers = self.servers.lock().unwrap();
            let listed = servers.entry(upstream.to_string()).or_default();
            listed.push(server.clone());
            Ok(())
        }

        async fn remove_server(
            &self,
            upstream: &str,
            _kind: UpstreamKind,
            address: &str,
        ) -> GatewayResult<()> {
            if self.fail_remove {
                return Err(GatewayError::Api {
                    status: 500,
                    text: "boom".to_string(),
                });
            }
            let op = Op::Remove(upstream.to_string(), address.to_string());
            self.ops.lock().unwrap().push(op);
            if let Some(servers) = self.servers.lock().unwrap().get_mut(upstream) {
                servers.retain(|s| s.server != address);
            }
            Ok(())
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn reconciler(provider: FakeProvider, gateway: Arc<FakeGateway>) -> Reconciler {
        Reconciler::new(Arc::new(provider), gateway)
    }

    #[test]
    fn test_diff() {
        let diff = Diff::compute(&set(&["A", "B", "C"]), &set(&["B", "C", "D"]));
        assert_eq!(diff.to_add, set(&["A"]));
        assert_eq!(diff.to_remove, set(&["D"]));

        assert!(Diff::compute(&set(&["A"]), &set(&["A"])).is_empty());

        let diff = Diff::compute(&set(&[]), &set(&["A", "B"]));
        assert_eq!(diff.to_remove, set(&["A", "B"]));
        assert!(diff.to_add.is_empty());
    }

    #[tokio::test]
    async fn test_sync_upstream_converges() {
        init_log();
        let api = upstream("api", "g1", 80);
        let mut provider = FakeProvider {
            upstreams: vec![api.clone()],
            ..Default::default()
        };
        provider.set_members("g1", Ok(vec!["10.0.0.1", "10.0.0.2"]));
        let gateway = Arc::new(FakeGateway::with_servers("api", &["10.0.0.2:80", "10.0.0.3:80"]));
        let reconciler = reconciler(provider, gateway.clone());

        let outcome = reconciler.sync_upstream(&api).await.unwrap();
        assert_eq!(outcome.added, vec!["10.0.0.1:80"]);
        assert_eq!(outcome.removed, vec!["10.0.0.3:80"]);

        // removals first, the unchanged server is never touched
        let expected_add = UpstreamServer {
            id: None,
            server: "10.0.0.1:80".to_string(),
            max_conns: Some(2),
            max_fails: Some(1),
            fail_timeout: Some("10s".to_string()),
            slow_start: Some("0s".to_string()),
            weight: None,
        };
        assert_eq!(
            gateway.ops(),
            vec![
                Op::Remove("api".to_string(), "10.0.0.3:80".to_string()),
                Op::Add("api".to_string(), expected_add),
            ]
        );
        assert_eq!(
            gateway.addresses("api"),
            set(&["10.0.0.1:80", "10.0.0.2:80"])
        );

        // a second pass is a no-op
        let outcome = reconciler.sync_upstream(&api).await.unwrap();
        assert_eq!(outcome, SyncOutcome::default());
        assert_eq!(gateway.ops().len(), 2);
    }

    #[tokio::test]
    async fn test_vanished_group_removes_every_server() {
        init_log();
        let mut provider = FakeProvider::default();
        provider.set_exists("g1", Ok(false));
        let gateway = Arc::new(FakeGateway::with_servers("api", &["10.0.0.1:80", "10.0.0.2:80"]));
        let reconciler = reconciler(provider, gateway.clone());

        let api = upstream("api", "g1", 80);
        let outcome = reconciler.sync_upstream(&api).await.unwrap();
        assert_eq!(outcome.removed.len(), 2);
        assert!(gateway.addresses("api").is_empty());
    }

    #[tokio::test]
    async fn test_not_found_membership_removes_every_server() {
        init_log();
        // exists, but disappears before membership is resolved
        let provider = FakeProvider::default();
        let gateway = Arc::new(FakeGateway::with_servers("api", &["10.0.0.1:80"]));
        let reconciler = reconciler(provider, gateway.clone());

        let api = upstream("api", "g1", 80);
        reconciler.sync_upstream(&api).await.unwrap();
        assert!(gateway.addresses("api").is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_upstream_untouched() {
        init_log();
        let mut provider = FakeProvider::default();
        let failures = vec!["VM vm1: timeout".to_string()];
        provider.set_members("g1", Err(ProviderError::Aggregated(failures)));
        provider.set_exists("g2", Err(transient("throttled")));
        let gateway = Arc::new(FakeGateway::with_servers("api", &["10.0.0.1:80"]));
        let reconciler = reconciler(provider, gateway.clone());

        let api = upstream("api", "g1", 80);
        let err = reconciler.sync_upstream(&api).await.unwrap_err();
        assert_eq!(err.stage(), SyncStage::Resolve);

        let api = upstream("api", "g2", 80);
        let err = reconciler.sync_upstream(&api).await.unwrap_err();
        assert_eq!(err.stage(), SyncStage::Resolve);

        assert!(gateway.ops().is_empty());
        assert_eq!(gateway.addresses("api"), set(&["10.0.0.1:80"]));
    }

    #[tokio::test]
    async fn test_apply_stops_at_first_failure() {
        init_log();
        let mut provider = FakeProvider::default();
        provider.set_members("g1", Ok(vec!["10.0.0.1"]));
        let mut gateway = FakeGateway::with_servers("api", &["10.0.0.9:80"]);
        gateway.fail_remove = true;
        let gateway = Arc::new(gateway);
        let reconciler = reconciler(provider, gateway.clone());

        let api = upstream("api", "g1", 80);
        let err = reconciler.sync_upstream(&api).await.unwrap_err();
        assert_eq!(err.stage(), SyncStage::Apply);
        // the add was never attempted
        assert!(gateway.ops().is_empty());
    }

    #[tokio::test]
    async fn test_pass_isolates_failing_upstreams() {
        init_log();
        let mut provider = FakeProvider {
            upstreams: vec![
                upstream("api", "g1", 80),
                upstream("web", "g2", 8080),
                upstream("admin", "g3", 9000),
            ],
            ..Default::default()
        };
        provider.set_members("g1", Ok(vec!["10.0.0.1"]));
        provider.set_members("g2", Err(transient("timeout")));
        provider.set_members("g3", Ok(vec!["10.0.0.3"]));
        let gateway = FakeGateway {
            fail_list: vec!["admin".to_string()],
            ..Default::default()
        };
        let gateway = Arc::new(gateway);
        let reconciler = reconciler(provider, gateway.clone());

        let report = reconciler.run_pass().await;
        assert_eq!(report.synced, vec!["api"]);
        assert_eq!(report.failed, vec!["web", "admin"]);
        assert_eq!(gateway.addresses("api"), set(&["10.0.0.1:80"]));
        assert!(gateway.addresses("web").is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_members_and_reported_addresses() {
        init_log();
        let mut provider = FakeProvider::default();
        provider.set_members("g1", Ok(vec!["fd00::1"]));
        // the load balancer may report a non-canonical form
        let gateway = Arc::new(FakeGateway::with_servers("api", &["[fd00:0:0::1]:80"]));
        let reconciler = reconciler(provider, gateway.clone());

        let api = upstream("api", "g1", 80);
        let outcome = reconciler.sync_upstream(&api).await.unwrap();
        assert_eq!(outcome, SyncOutcome::default());
    }
}
