//! The load balancer's upstream control API.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::Upstream;
use crate::config::UpstreamKind;
use crate::core::error::GatewayResult;

pub mod nginx;

/// A server entry of a load-balancer upstream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamServer {
    /// Assigned by the load balancer, never sent back
    #[serde(default, skip_serializing)]
    pub id: Option<u64>,
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_conns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fails: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl UpstreamServer {
    /// A new member of `upstream` at `address`, carrying the upstream's tuning.
    pub fn for_upstream(upstream: &Upstream, address: String) -> Self {
        Self {
            id: None,
            server: address,
            max_conns: upstream.max_conns,
            max_fails: upstream.max_fails,
            fail_timeout: Some(upstream.fail_timeout.clone()),
            slow_start: Some(upstream.slow_start.clone()),
            weight: None,
        }
    }
}

#[async_trait]
pub trait LoadBalancerGateway: Send + Sync {
    async fn list_servers(
        &self,
        upstream: &str,
        kind: UpstreamKind,
    ) -> GatewayResult<Vec<UpstreamServer>>;

    async fn add_server(
        &self,
        upstream: &str,
        kind: UpstreamKind,
        server: &UpstreamServer,
    ) -> GatewayResult<()>;

    /// Removes the server listening on `address`; an unknown address is not an error.
    async fn remove_server(
        &self,
        upstream: &str,
        kind: UpstreamKind,
        address: &str,
    ) -> GatewayResult<()>;
}

/// Canonical `ip:port` form of a server address, so that addresses reported by
/// the load balancer compare equal to the ones we generate.
pub fn normalize_address(address: &str) -> String {
    match address.parse::<SocketAddr>() {
        Ok(addr) => addr.to_string(),
        Err(_) => address.to_string(),
    }
}
