//! Cloud call contracts used by the provisioning workflows.
//!
//! Only the handful of compute and network calls the workflows make are
//! modelled here:
//! - `ComputeApi`: create, inspect and delete servers, list their ports
//! - `NetworkApi`: router and floating-IP lookup, port forwarding on the bastion IP
//! - `TokenSource`: a scoped token that is refreshed before it expires
//!
//! `CloudClientFactory` is the Keystone-backed token source, `OpenStackCloud`
//! the REST implementation of both APIs. With the `mock` feature, `MockCloud`
//! provides an in-memory stand-in for tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use orchestrator_shared_types::OrchestrationError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod keystone;
pub mod openstack;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use keystone::CloudClientFactory;
pub use openstack::OpenStackCloud;

#[cfg(any(test, feature = "mock"))]
pub use mock::MockCloud;

/// Errors from cloud API calls.
#[derive(Debug, Error)]
pub enum CloudApiError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Service {0} not found in catalog")]
    Catalog(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The request collided with an existing resource (e.g. an external port
    /// already forwarded on the floating IP).
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl From<CloudApiError> for OrchestrationError {
    fn from(err: CloudApiError) -> Self {
        OrchestrationError::CloudApiError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CloudApiError>;

/// A scoped identity token.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    /// Identity endpoint the token was issued by; written into the
    /// infrastructure description next to the token.
    pub auth_url: String,
}

impl Token {
    /// Usable at `now` with at least `skew` to spare.
    pub fn is_valid_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now + skew < self.expires_at
    }
}

/// Hands out a token that is valid for at least a short while.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return the cached token, or obtain a new one if it is missing or about
    /// to expire.
    async fn valid_or_refresh(&self) -> Result<Token>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Build,
    Active,
    Error,
    Deleted,
    /// Any status the workflows do not act on (SHUTOFF, REBOOT, ...).
    Other,
}

impl ServerStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "BUILD" => ServerStatus::Build,
            "ACTIVE" => ServerStatus::Active,
            "ERROR" => ServerStatus::Error,
            "DELETED" | "SOFT_DELETED" => ServerStatus::Deleted,
            _ => ServerStatus::Other,
        }
    }
}

/// Request for a new server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub flavor: String,
    pub image: String,
    pub availability_zone: Option<String>,
    pub network_id: Option<String>,
    pub key_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    /// Fixed addresses across all attached networks.
    pub addresses: Vec<String>,
    /// Fault message reported for servers in ERROR.
    pub fault: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub device_id: String,
    pub fixed_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    pub address: String,
}

/// Port-forwarding rule to create on a floating IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortForwardingRequest {
    pub internal_port_id: String,
    pub internal_ip: String,
    pub internal_port: u16,
    pub external_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortForwardingRule {
    pub id: String,
    pub internal_port: u16,
    pub external_port: u16,
    pub protocol: String,
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn create_server(&self, spec: &ServerSpec) -> Result<Server>;

    /// `None` once the server no longer exists.
    async fn get_server(&self, server_id: &str) -> Result<Option<Server>>;

    /// Deleting an absent server succeeds.
    async fn delete_server(&self, server_id: &str) -> Result<()>;

    async fn list_ports(&self, device_id: &str) -> Result<Vec<Port>>;
}

#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn find_router_by_name(&self, name: &str) -> Result<Option<Router>>;

    async fn find_floating_ip_by_tag(&self, tag: &str) -> Result<Option<FloatingIp>>;

    /// Fails with `CloudApiError::Conflict` when the external port is taken.
    async fn create_port_forwarding(
        &self,
        floating_ip_id: &str,
        request: &PortForwardingRequest,
    ) -> Result<PortForwardingRule>;

    /// Deleting an absent rule succeeds.
    async fn delete_port_forwarding(&self, floating_ip_id: &str, rule_id: &str) -> Result<()>;
}

/// Cloud collaborators handed to the workflows.
#[derive(Clone)]
pub struct CloudClients {
    pub compute: Arc<dyn ComputeApi>,
    pub network: Arc<dyn NetworkApi>,
    pub tokens: Arc<dyn TokenSource>,
}

impl CloudClients {
    /// Build all three from one value implementing every trait.
    pub fn from_shared<C>(cloud: Arc<C>) -> Self
    where
        C: ComputeApi + NetworkApi + TokenSource + 'static,
    {
        Self {
            compute: cloud.clone(),
            network: cloud.clone(),
            tokens: cloud,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_validity_with_skew() {
        let now = Utc::now();
        let token = Token {
            value: "t".into(),
            expires_at: now + Duration::seconds(90),
            auth_url: "http://keystone/v3".into(),
        };
        assert!(token.is_valid_at(now, Duration::seconds(60)));
        assert!(!token.is_valid_at(now + Duration::seconds(31), Duration::seconds(60)));
    }

    #[test]
    fn test_server_status_parse() {
        assert_eq!(ServerStatus::parse("ACTIVE"), ServerStatus::Active);
        assert_eq!(ServerStatus::parse("build"), ServerStatus::Build);
        assert_eq!(ServerStatus::parse("SHUTOFF"), ServerStatus::Other);
    }

    #[test]
    fn test_error_converts_to_orchestration_error() {
        let err: OrchestrationError = CloudApiError::Conflict("port 30001".into()).into();
        assert!(matches!(err, OrchestrationError::CloudApiError(msg) if msg.contains("30001")));
    }
}
