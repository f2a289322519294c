//! Nova and Neutron REST calls behind `ComputeApi` and `NetworkApi`.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::keystone::CloudClientFactory;
use crate::{
    CloudApiError, ComputeApi, FloatingIp, NetworkApi, Port, PortForwardingRequest,
    PortForwardingRule, Result, Router, Server, ServerSpec, ServerStatus, TokenSource,
};

/// REST client authenticated through a shared `CloudClientFactory`.
#[derive(Clone)]
pub struct OpenStackCloud {
    factory: Arc<CloudClientFactory>,
}

impl OpenStackCloud {
    pub fn new(factory: Arc<CloudClientFactory>) -> Self {
        Self { factory }
    }

    /// Issue one request and return the decoded body, `None` on 404.
    async fn call(
        &self,
        service: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        let token = self.factory.valid_or_refresh().await?;
        let url = format!("{}{}", self.factory.endpoint(service).await?, path);
        debug!(method = %method, url = %url, "Cloud API request");

        let mut request = self
            .factory
            .http()
            .request(method.clone(), &url)
            .header("X-Auth-Token", token.value);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CloudApiError::Http(format!("{method} {url}: {e}")))?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::NO_CONTENT => return Ok(Some(Value::Null)),
            _ => {}
        }
        let text = response
            .text()
            .await
            .map_err(|e| CloudApiError::Http(format!("{method} {url}: {e}")))?;

        if status == StatusCode::CONFLICT {
            return Err(CloudApiError::Conflict(text));
        }
        if !status.is_success() {
            warn!(method = %method, url = %url, status = status.as_u16(), "Cloud API error");
            return Err(CloudApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| CloudApiError::Decode(format!("{url}: {e}")))
    }

    async fn call_required(
        &self,
        service: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        self.call(service, method, path, body)
            .await?
            .ok_or_else(|| CloudApiError::NotFound(path.to_string()))
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| CloudApiError::Decode(format!("{what}: {e}")))
}

#[derive(Debug, Deserialize)]
struct NovaAddress {
    addr: String,
}

#[derive(Debug, Deserialize)]
struct NovaFault {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct NovaServer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    addresses: std::collections::BTreeMap<String, Vec<NovaAddress>>,
    #[serde(default)]
    fault: Option<NovaFault>,
}

impl From<NovaServer> for Server {
    fn from(raw: NovaServer) -> Self {
        Server {
            id: raw.id,
            name: raw.name,
            status: if raw.status.is_empty() {
                ServerStatus::Build
            } else {
                ServerStatus::parse(&raw.status)
            },
            addresses: raw
                .addresses
                .into_values()
                .flatten()
                .map(|a| a.addr)
                .collect(),
            fault: raw.fault.map(|f| f.message),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FixedIp {
    ip_address: String,
}

#[derive(Debug, Deserialize)]
struct NeutronPort {
    id: String,
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    fixed_ips: Vec<FixedIp>,
}

#[derive(Debug, Deserialize)]
struct NeutronFloatingIp {
    id: String,
    floating_ip_address: String,
}

#[derive(Debug, Deserialize)]
struct NeutronPortForwarding {
    id: String,
    internal_port: u16,
    external_port: u16,
    protocol: String,
}

fn server_body(spec: &ServerSpec) -> Value {
    let mut server = json!({
        "name": spec.name,
        "flavorRef": spec.flavor,
        "imageRef": spec.image,
    });
    if let Some(az) = &spec.availability_zone {
        server["availability_zone"] = json!(az);
    }
    if let Some(net) = &spec.network_id {
        server["networks"] = json!([{ "uuid": net }]);
    }
    if let Some(key) = &spec.key_name {
        server["key_name"] = json!(key);
    }
    json!({ "server": server })
}

#[async_trait]
impl ComputeApi for OpenStackCloud {
    async fn create_server(&self, spec: &ServerSpec) -> Result<Server> {
        let value = self
            .call_required("compute", Method::POST, "/servers", Some(server_body(spec)))
            .await?;
        let mut raw: NovaServer = decode(value["server"].clone(), "server")?;
        if raw.name.is_empty() {
            raw.name = spec.name.clone();
        }
        Ok(raw.into())
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<Server>> {
        let Some(value) = self
            .call("compute", Method::GET, &format!("/servers/{server_id}"), None)
            .await?
        else {
            return Ok(None);
        };
        let raw: NovaServer = decode(value["server"].clone(), "server")?;
        Ok(Some(raw.into()))
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        self.call("compute", Method::DELETE, &format!("/servers/{server_id}"), None)
            .await?;
        Ok(())
    }

    async fn list_ports(&self, device_id: &str) -> Result<Vec<Port>> {
        let value = self
            .call_required(
                "network",
                Method::GET,
                &format!("/v2.0/ports?device_id={device_id}"),
                None,
            )
            .await?;
        let ports: Vec<NeutronPort> = decode(value["ports"].clone(), "ports")?;
        Ok(ports
            .into_iter()
            .map(|p| Port {
                id: p.id,
                device_id: p.device_id,
                fixed_ip: p.fixed_ips.into_iter().next().map(|ip| ip.ip_address),
            })
            .collect())
    }
}

#[async_trait]
impl NetworkApi for OpenStackCloud {
    async fn find_router_by_name(&self, name: &str) -> Result<Option<Router>> {
        let value = self
            .call_required("network", Method::GET, &format!("/v2.0/routers?name={name}"), None)
            .await?;
        let routers: Vec<Router> = decode(value["routers"].clone(), "routers")?;
        Ok(routers.into_iter().next())
    }

    async fn find_floating_ip_by_tag(&self, tag: &str) -> Result<Option<FloatingIp>> {
        let value = self
            .call_required(
                "network",
                Method::GET,
                &format!("/v2.0/floatingips?tags={tag}"),
                None,
            )
            .await?;
        let fips: Vec<NeutronFloatingIp> = decode(value["floatingips"].clone(), "floatingips")?;
        Ok(fips.into_iter().next().map(|f| FloatingIp {
            id: f.id,
            address: f.floating_ip_address,
        }))
    }

    async fn create_port_forwarding(
        &self,
        floating_ip_id: &str,
        request: &PortForwardingRequest,
    ) -> Result<PortForwardingRule> {
        let body = json!({
            "port_forwarding": {
                "protocol": request.protocol,
                "internal_ip_address": request.internal_ip,
                "internal_port": request.internal_port,
                "internal_port_id": request.internal_port_id,
                "external_port": request.external_port,
            }
        });
        let path = format!("/v2.0/floatingips/{floating_ip_id}/port_forwardings");
        let value = match self
            .call_required("network", Method::POST, &path, Some(body))
            .await
        {
            // Neutron reports a taken external port as 400 on some releases.
            Err(CloudApiError::Status { status: 400, body }) if body.contains("already") => {
                return Err(CloudApiError::Conflict(body))
            }
            other => other?,
        };
        let raw: NeutronPortForwarding = decode(value["port_forwarding"].clone(), "port_forwarding")?;
        Ok(PortForwardingRule {
            id: raw.id,
            internal_port: raw.internal_port,
            external_port: raw.external_port,
            protocol: raw.protocol,
        })
    }

    async fn delete_port_forwarding(&self, floating_ip_id: &str, rule_id: &str) -> Result<()> {
        self.call(
            "network",
            Method::DELETE,
            &format!("/v2.0/floatingips/{floating_ip_id}/port_forwardings/{rule_id}"),
            None,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TokenSource for OpenStackCloud {
    async fn valid_or_refresh(&self) -> Result<crate::Token> {
        self.factory.valid_or_refresh().await
    }
}
