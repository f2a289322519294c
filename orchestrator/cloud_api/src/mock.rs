//! In-memory cloud for tests.
//!
//! Servers become ACTIVE after a configurable number of status polls and
//! disappear a configurable number of polls after deletion. External ports
//! can be pre-marked as taken to exercise port-forward collisions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::{
    CloudApiError, ComputeApi, FloatingIp, NetworkApi, Port, PortForwardingRequest,
    PortForwardingRule, Result, Router, Server, ServerSpec, ServerStatus, Token, TokenSource,
};

#[derive(Debug, Clone)]
struct MockServer {
    server: Server,
    polls_left: u32,
    deleting: bool,
}

#[derive(Debug, Default)]
pub struct MockCloud {
    servers: Arc<RwLock<HashMap<String, MockServer>>>,
    taken_ports: Arc<RwLock<HashSet<u16>>>,
    rules: Arc<RwLock<HashMap<String, u16>>>,
    router: Option<Router>,
    bastion: Option<FloatingIp>,
    activate_after: u32,
    vanish_after: u32,
    fail_create: bool,
    fail_to_activate: bool,
    next_id: AtomicU32,
    token_requests: AtomicU32,
    port_attempts: AtomicU32,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            router: Some(Router {
                id: "router-1".into(),
                name: "router".into(),
            }),
            bastion: Some(FloatingIp {
                id: "fip-1".into(),
                address: "203.0.113.10".into(),
            }),
            ..Self::default()
        }
    }

    /// Servers report BUILD for `polls` status reads before turning ACTIVE.
    pub fn with_activation_polls(mut self, polls: u32) -> Self {
        self.activate_after = polls;
        self
    }

    /// Deleted servers stay visible for `polls` status reads.
    pub fn with_vanish_polls(mut self, polls: u32) -> Self {
        self.vanish_after = polls;
        self
    }

    pub fn failing_creation(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Servers go to ERROR instead of ACTIVE.
    pub fn failing_activation(mut self) -> Self {
        self.fail_to_activate = true;
        self
    }

    pub fn without_bastion(mut self) -> Self {
        self.bastion = None;
        self
    }

    pub async fn take_ports(&self, ports: impl IntoIterator<Item = u16>) {
        self.taken_ports.write().await.extend(ports);
    }

    pub async fn server_count(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn rule_count(&self) -> usize {
        self.rules.read().await.len()
    }

    pub fn token_requests(&self) -> u32 {
        self.token_requests.load(Ordering::SeqCst)
    }

    /// Port-forward creations attempted, including collisions.
    pub fn port_attempts(&self) -> u32 {
        self.port_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeApi for MockCloud {
    async fn create_server(&self, spec: &ServerSpec) -> Result<Server> {
        if self.fail_create {
            return Err(CloudApiError::Status {
                status: 403,
                body: "Quota exceeded for instances".into(),
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let server = Server {
            id: format!("srv-{n}"),
            name: spec.name.clone(),
            status: ServerStatus::Build,
            addresses: vec![format!("10.0.0.{}", n + 10)],
            fault: None,
        };
        info!(server_id = %server.id, name = %spec.name, "MockCloud: created server");
        self.servers.write().await.insert(
            server.id.clone(),
            MockServer {
                server: server.clone(),
                polls_left: self.activate_after,
                deleting: false,
            },
        );
        Ok(server)
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<Server>> {
        let mut servers = self.servers.write().await;
        let Some(entry) = servers.get_mut(server_id) else {
            return Ok(None);
        };
        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(Some(entry.server.clone()));
        }
        if entry.deleting {
            servers.remove(server_id);
            return Ok(None);
        }
        if entry.server.status == ServerStatus::Build {
            if self.fail_to_activate {
                entry.server.status = ServerStatus::Error;
                entry.server.fault = Some("No valid host was found".into());
            } else {
                entry.server.status = ServerStatus::Active;
            }
        }
        Ok(Some(entry.server.clone()))
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(server_id) {
            entry.deleting = true;
            entry.polls_left = self.vanish_after;
        }
        Ok(())
    }

    async fn list_ports(&self, device_id: &str) -> Result<Vec<Port>> {
        let servers = self.servers.read().await;
        Ok(servers
            .get(device_id)
            .map(|entry| {
                vec![Port {
                    id: format!("port-{device_id}"),
                    device_id: device_id.to_string(),
                    fixed_ip: entry.server.addresses.first().cloned(),
                }]
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl NetworkApi for MockCloud {
    async fn find_router_by_name(&self, name: &str) -> Result<Option<Router>> {
        Ok(self.router.clone().filter(|r| r.name == name))
    }

    async fn find_floating_ip_by_tag(&self, _tag: &str) -> Result<Option<FloatingIp>> {
        Ok(self.bastion.clone())
    }

    async fn create_port_forwarding(
        &self,
        _floating_ip_id: &str,
        request: &PortForwardingRequest,
    ) -> Result<PortForwardingRule> {
        self.port_attempts.fetch_add(1, Ordering::SeqCst);
        let mut taken = self.taken_ports.write().await;
        if !taken.insert(request.external_port) {
            return Err(CloudApiError::Conflict(format!(
                "external port {} already in use",
                request.external_port
            )));
        }
        let id = format!("pf-{}", request.external_port);
        self.rules.write().await.insert(id.clone(), request.external_port);
        Ok(PortForwardingRule {
            id,
            internal_port: request.internal_port,
            external_port: request.external_port,
            protocol: request.protocol.clone(),
        })
    }

    async fn delete_port_forwarding(&self, _floating_ip_id: &str, rule_id: &str) -> Result<()> {
        if let Some(port) = self.rules.write().await.remove(rule_id) {
            self.taken_ports.write().await.remove(&port);
        }
        Ok(())
    }
}

#[async_trait]
impl TokenSource for MockCloud {
    async fn valid_or_refresh(&self) -> Result<Token> {
        let n = self.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Token {
            value: format!("mock-token-{n}"),
            expires_at: Utc::now() + Duration::hours(1),
            auth_url: "http://keystone.mock/v3".into(),
        })
    }
}
