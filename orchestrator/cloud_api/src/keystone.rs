//! Keystone v3 password authentication with a cached, expiring token.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use engine_config::OpenStackConfig;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{CloudApiError, Result, Token, TokenSource};

/// Refresh this long before the token actually expires.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Clone)]
struct Session {
    token: Token,
    catalog: Vec<CatalogEntry>,
}

/// Produces cloud credentials for the workflows.
///
/// Holds the current token with its expiry and re-authenticates when the
/// token is missing or within a minute of expiring.
pub struct CloudClientFactory {
    http: reqwest::Client,
    config: OpenStackConfig,
    session: RwLock<Option<Session>>,
}

impl CloudClientFactory {
    pub fn new(config: OpenStackConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| CloudApiError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            session: RwLock::new(None),
        })
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Public URL of `service_type` (`compute`, `network`) from the catalog of
    /// a valid token.
    pub async fn endpoint(&self, service_type: &str) -> Result<String> {
        let session = self.valid_session().await?;
        select_endpoint(
            &session.catalog,
            service_type,
            &self.config.interface,
            self.config.region.as_deref(),
        )
        .ok_or_else(|| CloudApiError::Catalog(service_type.to_string()))
    }

    async fn valid_session(&self) -> Result<Session> {
        let skew = Duration::seconds(EXPIRY_SKEW_SECS);
        {
            let cached = self.session.read().await;
            if let Some(session) = cached.as_ref() {
                if session.token.is_valid_at(Utc::now(), skew) {
                    return Ok(session.clone());
                }
            }
        }

        let mut cached = self.session.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(session) = cached.as_ref() {
            if session.token.is_valid_at(Utc::now(), skew) {
                return Ok(session.clone());
            }
        }
        let session = self.authenticate().await?;
        *cached = Some(session.clone());
        Ok(session)
    }

    async fn authenticate(&self) -> Result<Session> {
        let url = format!("{}/auth/tokens", self.config.auth_url.trim_end_matches('/'));
        debug!(url = %url, user = %self.config.username, "Requesting identity token");

        let response = self
            .http
            .post(&url)
            .json(&auth_request(&self.config))
            .send()
            .await
            .map_err(|e| CloudApiError::Http(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudApiError::Auth(format!("status {status}: {body}")));
        }

        let value = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CloudApiError::Auth("response carried no X-Subject-Token".into()))?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| CloudApiError::Decode(format!("token body: {e}")))?;

        info!(expires_at = %body.token.expires_at, "Obtained identity token");
        Ok(Session {
            token: Token {
                value,
                expires_at: body.token.expires_at,
                auth_url: self.config.auth_url.clone(),
            },
            catalog: body.token.catalog,
        })
    }
}

#[async_trait]
impl TokenSource for CloudClientFactory {
    async fn valid_or_refresh(&self) -> Result<Token> {
        Ok(self.valid_session().await?.token)
    }
}

fn auth_request(config: &OpenStackConfig) -> serde_json::Value {
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": config.username,
                        "domain": { "name": config.user_domain },
                        "password": config.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": config.project_name,
                    "domain": { "name": config.project_domain },
                }
            }
        }
    })
}

fn select_endpoint(
    catalog: &[CatalogEntry],
    service_type: &str,
    interface: &str,
    region: Option<&str>,
) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == service_type)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == interface
                && region.map_or(true, |r| ep.region.as_deref() == Some(r))
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<CatalogEntry> {
        serde_json::from_value(json!([
            {
                "type": "compute",
                "endpoints": [
                    { "interface": "internal", "region": "RegionOne", "url": "http://nova.internal:8774/v2.1" },
                    { "interface": "public", "region": "RegionOne", "url": "https://nova.example:8774/v2.1/" },
                    { "interface": "public", "region": "RegionTwo", "url": "https://nova2.example:8774/v2.1" }
                ]
            },
            {
                "type": "network",
                "endpoints": [
                    { "interface": "public", "region": "RegionOne", "url": "https://neutron.example:9696" }
                ]
            }
        ]))
        .unwrap()
    }

    #[test]
    fn test_select_endpoint_by_interface_and_region() {
        let catalog = catalog();
        assert_eq!(
            select_endpoint(&catalog, "compute", "public", Some("RegionTwo")).as_deref(),
            Some("https://nova2.example:8774/v2.1")
        );
        assert_eq!(
            select_endpoint(&catalog, "compute", "public", None).as_deref(),
            Some("https://nova.example:8774/v2.1")
        );
        assert!(select_endpoint(&catalog, "volumev3", "public", None).is_none());
    }

    #[test]
    fn test_auth_request_shape() {
        let config = OpenStackConfig {
            username: "svc".into(),
            password: "pw".into(),
            project_name: "k8s".into(),
            ..OpenStackConfig::default()
        };
        let body = auth_request(&config);
        assert_eq!(body["auth"]["identity"]["methods"][0], "password");
        assert_eq!(body["auth"]["identity"]["password"]["user"]["name"], "svc");
        assert_eq!(body["auth"]["scope"]["project"]["name"], "k8s");
        assert_eq!(body["auth"]["scope"]["project"]["domain"]["name"], "Default");
    }

    #[test]
    fn test_token_response_parses() {
        let body: TokenResponse = serde_json::from_value(json!({
            "token": { "expires_at": "2030-01-01T00:00:00.000000Z", "catalog": [] }
        }))
        .unwrap();
        assert_eq!(body.token.expires_at.timestamp(), 1893456000);
    }
}
