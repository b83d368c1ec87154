//! The upstream catalog: validated upstream definitions, resolved against the
//! configured cloud provider. Read-only once built.

use std::net::{IpAddr, SocketAddr};

use crate::config::{CloudProviderKind, Config, UpstreamKind};

pub const DEFAULT_FAIL_TIMEOUT: &str = "10s";
pub const DEFAULT_SLOW_START: &str = "0s";

/// A load-balancer upstream kept in sync with one scaling group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub port: u16,
    pub kind: UpstreamKind,
    pub scaling_group: String,
    pub max_conns: Option<u32>,
    pub max_fails: Option<u32>,
    pub fail_timeout: String,
    pub slow_start: String,
    pub in_service: bool,
}

impl Upstream {
    /// The `ip:port` address the load balancer uses for a member of this upstream.
    pub fn server_address(&self, ip: IpAddr) -> String {
        SocketAddr::new(ip, self.port).to_string()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Catalog {
    upstreams: Vec<Upstream>,
}

impl Catalog {
    pub fn new(upstreams: Vec<Upstream>) -> Self {
        Self { upstreams }
    }

    /// Builds the catalog from an already validated configuration.
    pub fn from_config(config: &Config) -> Self {
        let provider = config.cloud_provider;
        let upstreams = config
            .upstreams
            .iter()
            .filter_map(|ups| {
                let scaling_group = ups.scaling_group(provider)?.to_string();
                if ups.in_service && provider != CloudProviderKind::Aws {
                    log::warn!(
                        "Upstream {}: in_service is only supported by the AWS provider, ignoring",
                        ups.name
                    );
                }
                Some(Upstream {
                    name: ups.name.clone(),
                    port: ups.port,
                    kind: ups.kind,
                    scaling_group,
                    max_conns: ups.max_conns,
                    max_fails: ups.max_fails,
                    fail_timeout: or_default(&ups.fail_timeout, DEFAULT_FAIL_TIMEOUT),
                    slow_start: or_default(&ups.slow_start, DEFAULT_SLOW_START),
                    in_service: ups.in_service && provider == CloudProviderKind::Aws,
                })
            })
            .collect();
        Self { upstreams }
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    /// Whether any upstream backed by `scaling_group` asks for in-service filtering.
    pub fn requires_in_service(&self, scaling_group: &str) -> bool {
        self.upstreams
            .iter()
            .any(|u| u.scaling_group == scaling_group && u.in_service)
    }
}

fn or_default(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}
