//! Error types shared by the cloud providers, the load-balancer gateway and the
//! reconciler.
//!
//! Configuration errors are reported through `pingora_error` by the config module;
//! everything here is a runtime error that is scoped to a single upstream.

use std::fmt;

/// Errors raised while resolving scaling-group membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The scaling group does not exist
    NotFound(String),

    /// API or transport failure, expected to clear up by the next pass
    Transient(String),

    /// One or more sub-lookups failed during a multi-entity resolution
    Aggregated(Vec<String>),

    /// The scale set uses an orchestration mode we cannot resolve
    Unsupported(String),

    /// The request itself is malformed, e.g. an empty group name
    InvalidRequest(String),
}

impl ProviderError {
    pub fn transient<E: fmt::Display>(context: &str, err: E) -> Self {
        ProviderError::Transient(format!("{context}: {err}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::NotFound(msg) => write!(f, "Scaling group not found: {msg}"),
            ProviderError::Transient(msg) => write!(f, "Cloud API error: {msg}"),
            ProviderError::Aggregated(errors) => {
                write!(f, "{} lookups failed:", errors.len())?;
                for err in errors {
                    write!(f, "\n  {err}")?;
                }
                Ok(())
            }
            ProviderError::Unsupported(mode) => {
                write!(f, "Unsupported orchestration mode: {mode}")
            }
            ProviderError::InvalidRequest(msg) => write!(f, "Invalid request: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Errors raised by the load-balancer control API.
#[derive(Debug)]
pub enum GatewayError {
    /// The request never produced a response
    Request(reqwest::Error),

    /// The API answered with a non-success status
    Api { status: u16, text: String },

    /// The response body could not be decoded
    Decode(String),

    /// The client could not be built from configuration
    Configuration(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Request(err) => write!(f, "Load balancer request failed: {err}"),
            GatewayError::Api { status, text } => {
                write!(f, "Load balancer API returned {status}: {text}")
            }
            GatewayError::Decode(msg) => write!(f, "Unexpected load balancer response: {msg}"),
            GatewayError::Configuration(msg) => write!(f, "Gateway configuration error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Request(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Request(err)
    }
}

/// The stage of a reconcile pass that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Resolve,
    Fetch,
    Apply,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Resolve => "resolve",
            SyncStage::Fetch => "fetch",
            SyncStage::Apply => "apply",
        }
    }
}

/// A failed reconcile pass for one upstream.
#[derive(Debug)]
pub enum SyncError {
    Provider(ProviderError),
    Gateway(SyncStage, GatewayError),
}

impl SyncError {
    pub fn stage(&self) -> SyncStage {
        match self {
            SyncError::Provider(_) => SyncStage::Resolve,
            SyncError::Gateway(stage, _) => *stage,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Provider(err) => write!(f, "{err}"),
            SyncError::Gateway(stage, err) => write!(f, "{} failed: {err}", stage.as_str()),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Provider(err) => Some(err),
            SyncError::Gateway(_, err) => Some(err),
        }
    }
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        SyncError::Provider(err)
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
