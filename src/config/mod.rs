use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::net::SocketAddr;

use http::{HeaderName, HeaderValue};
use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::utils::duration;

/// Upper bound on the number of custom headers sent to the load balancer API.
pub const MAX_CUSTOM_HEADERS: usize = 50;

#[derive(Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_config"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    /// Base URL of the NGINX Plus API, e.g. `http://127.0.0.1:8080/api`
    pub api_endpoint: String,
    #[serde(default = "Config::default_api_version")]
    #[validate(range(min = 1))]
    pub api_version: u32,
    /// Seconds between two reconcile passes
    #[serde(default = "Config::default_sync_interval")]
    #[validate(range(min = 1))]
    pub sync_interval: u64,
    pub cloud_provider: CloudProviderKind,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,

    pub log: Option<Log>,
    pub status: Option<Status>,
    pub prometheus: Option<Prometheus>,

    // AWS
    pub region: Option<String>,
    // Azure
    pub subscription_id: Option<String>,
    pub resource_group_name: Option<String>,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub upstreams: Vec<UpstreamConfig>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn default_api_version() -> u32 {
        9
    }

    fn default_sync_interval() -> u64 {
        5
    }

    fn validate_config(&self) -> Result<(), ValidationError> {
        self.validate_api_endpoint()?;
        self.validate_custom_headers()?;
        self.validate_provider_fields()?;
        self.validate_unique_names()
    }

    fn validate_api_endpoint(&self) -> Result<(), ValidationError> {
        match reqwest::Url::parse(&self.api_endpoint) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(()),
            _ => {
                let mut err = ValidationError::new("invalid_api_endpoint");
                err.add_param("api_endpoint".into(), &self.api_endpoint);
                Err(err)
            }
        }
    }

    fn validate_custom_headers(&self) -> Result<(), ValidationError> {
        if self.custom_headers.len() > MAX_CUSTOM_HEADERS {
            let mut err = ValidationError::new("too_many_custom_headers");
            err.add_param("max".into(), &MAX_CUSTOM_HEADERS);
            return Err(err);
        }

        for (name, value) in &self.custom_headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err()
                || HeaderValue::from_str(value).is_err()
            {
                let mut err = ValidationError::new("invalid_custom_header");
                err.add_param("header".into(), name);
                return Err(err);
            }
        }
        Ok(())
    }

    fn validate_provider_fields(&self) -> Result<(), ValidationError> {
        let required: &[(&str, &Option<String>)] = match self.cloud_provider {
            CloudProviderKind::Aws => &[("region", &self.region)],
            CloudProviderKind::Azure => &[
                ("subscription_id", &self.subscription_id),
                ("resource_group_name", &self.resource_group_name),
            ],
        };
        for (field, value) in required {
            if value.as_deref().map_or(true, str::is_empty) {
                let mut err = ValidationError::new("provider_field_required");
                err.add_param("field".into(), field);
                return Err(err);
            }
        }

        for upstream in &self.upstreams {
            if upstream.scaling_group(self.cloud_provider).is_none() {
                let mut err = ValidationError::new("scaling_group_required");
                err.add_param("upstream".into(), &upstream.name);
                err.add_param("field".into(), &self.cloud_provider.group_key());
                return Err(err);
            }
        }
        Ok(())
    }

    fn validate_unique_names(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for upstream in &self.upstreams {
            if !seen.insert(upstream.name.as_str()) {
                let mut err = ValidationError::new("duplicate_upstream_name");
                err.add_param("upstream".into(), &upstream.name);
                return Err(err);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudProviderKind {
    #[serde(rename = "AWS")]
    Aws,
    #[serde(rename = "Azure")]
    Azure,
}

impl CloudProviderKind {
    /// Name of the per-upstream key holding the scaling group
    pub fn group_key(&self) -> &'static str {
        match self {
            CloudProviderKind::Aws => "autoscaling_group",
            CloudProviderKind::Azure => "virtual_machine_scale_set",
        }
    }
}

impl fmt::Display for CloudProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CloudProviderKind::Aws => write!(f, "AWS"),
            CloudProviderKind::Azure => write!(f, "Azure"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Http,
    Stream,
}

impl UpstreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamKind::Http => "http",
            UpstreamKind::Stream => "stream",
        }
    }
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "UpstreamConfig::validate_durations"))]
pub struct UpstreamConfig {
    #[validate(length(min = 1))]
    pub name: String,
    pub autoscaling_group: Option<String>,
    pub virtual_machine_scale_set: Option<String>,
    #[validate(range(min = 1))]
    pub port: u16,
    pub kind: UpstreamKind,
    pub max_conns: Option<u32>,
    pub max_fails: Option<u32>,
    #[serde(default)]
    pub fail_timeout: String,
    #[serde(default)]
    pub slow_start: String,
    #[serde(default)]
    pub in_service: bool,
}

impl UpstreamConfig {
    /// The non-empty scaling group name for the given provider, if configured.
    pub fn scaling_group(&self, provider: CloudProviderKind) -> Option<&str> {
        let group = match provider {
            CloudProviderKind::Aws => self.autoscaling_group.as_deref(),
            CloudProviderKind::Azure => self.virtual_machine_scale_set.as_deref(),
        };
        group.filter(|g| !g.is_empty())
    }

    // Empty durations fall back to defaults, anything else must parse.
    fn validate_durations(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("fail_timeout", &self.fail_timeout),
            ("slow_start", &self.slow_start),
        ] {
            if !value.is_empty() && duration::validate(value).is_err() {
                let mut err = ValidationError::new("invalid_duration");
                err.add_param("field".into(), &field);
                err.add_param("value".into(), value);
                return Err(err);
            }
        }
        Ok(())
    }
}
