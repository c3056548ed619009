//! Service registration with a discovery agent.
//!
//! The default [`ConsulRegistrator`] talks to the local Consul agent:
//!
//! | When | Call |
//! |---|---|
//! | boot, after the listener is up | `PUT /v1/agent/service/register` |
//! | shutdown, first step | `PUT /v1/agent/service/deregister/{id}` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::RegistrationConfig;
use crate::error::Error;

/// The body of a registration call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registration {
    pub name: String,
    pub id: String,
    pub tags: Vec<String>,
    pub port: u16,
    pub checks: Vec<Value>,
}

impl Registration {
    /// Builds the registration of `service_name` on `port`. The instance id
    /// is `{service_name}-{short random id}`, fresh for every call.
    pub fn new(service_name: &str, env: &str, port: u16, checks: Vec<Value>) -> Self {
        Self {
            name: service_name.to_owned(),
            id: format!("{service_name}-{}", short_id()),
            tags: vec![env.to_owned()],
            port,
            checks,
        }
    }
}

fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// A service registry.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    async fn register(&self, registration: &Registration) -> Result<(), Error>;

    async fn unregister(&self, id: &str) -> Result<(), Error>;
}

const SERVICE: &str = "consul";

/// Consul agent client.
pub struct ConsulRegistrator {
    client: reqwest::Client,
    base: String,
}

impl ConsulRegistrator {
    /// Client for the agent at `config.host`; sends `X-Consul-Token` when a
    /// token is configured.
    pub fn new(config: &RegistrationConfig) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(token)
                .map_err(|_| Error::InvalidConfig("registration.token is not a valid header value".into()))?;
            headers.insert("x-consul-token", value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, base: format!("http://{}/v1/", config.host) })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn put(&self, path: &str, body: Option<&Registration>) -> Result<(), Error> {
        let mut request = self.client.put(format!("{}{path}", self.base));
        if let Some(body) = body {
            request = request.json(body);
        }
        let status = request.send().await?.status();
        if !status.is_success() {
            return Err(Error::Upstream { service: SERVICE, status: status.as_u16() });
        }
        Ok(())
    }
}

#[async_trait]
impl Discovery for ConsulRegistrator {
    async fn register(&self, registration: &Registration) -> Result<(), Error> {
        self.put("agent/service/register", Some(registration)).await?;
        info!(id = %registration.id, port = registration.port, "registered network service");
        Ok(())
    }

    async fn unregister(&self, id: &str) -> Result<(), Error> {
        self.put(&format!("agent/service/deregister/{id}"), None).await?;
        info!(%id, "unregistered network service");
        Ok(())
    }
}
