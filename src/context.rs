//! Per-application shared state.

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;

use crate::config::Config;
use crate::resource::{Capability, Resource, Resources};

/// Identity of the running service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    /// Name registered with discovery. Defaults to `name`.
    pub service_name: Option<String>,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(), version: version.into(), service_name: None }
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn service_name(&self) -> &str {
        self.service_name.as_deref().unwrap_or(&self.name)
    }
}

/// Everything boot produced that requests may need: the service identity,
/// its configuration, the permission-node manifest and the opened resources.
///
/// Built once per [`App`](crate::App) and attached to every request as an
/// `Arc<Context>`.
#[derive(Debug)]
pub struct Context {
    pub info: ServiceInfo,
    pub config: Config,
    pub perm_nodes: Option<Value>,
    resources: Resources,
}

impl Context {
    pub fn new(info: ServiceInfo, config: Config) -> Self {
        Self { info, config, perm_nodes: None, resources: Resources::default() }
    }

    pub fn with_perm_nodes(mut self, perm_nodes: Option<Value>) -> Self {
        self.perm_nodes = perm_nodes;
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// `{name}-{env}`, the prefix every scope for this service carries.
    pub fn scope_key(&self) -> String {
        format!("{}-{}", self.info.name, self.config.env)
    }

    /// `{name}_{env}`, the application name reported to analytics.
    pub fn app_name(&self) -> String {
        format!("{}_{}", self.info.name, self.config.env)
    }

    /// Configured `user_agent`, else the scope key.
    pub fn user_agent(&self) -> String {
        self.config.user_agent.clone().unwrap_or_else(|| self.scope_key())
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn cache(&self) -> Option<&Arc<dyn Resource>> {
        self.resources.get(Capability::Cache)
    }

    pub fn store(&self) -> Option<&Arc<dyn Resource>> {
        self.resources.get(Capability::Store)
    }

    /// The cache handle as the connector's concrete type.
    pub fn cache_as<T: Any>(&self) -> Option<&T> {
        self.resources.downcast(Capability::Cache)
    }

    pub fn store_as<T: Any>(&self) -> Option<&T> {
        self.resources.downcast(Capability::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Context {
        Context::new(ServiceInfo::new("svc", "1.0.0"), Config::new("127.0.0.1", 0, "prod"))
    }

    #[test]
    fn derived_names() {
        let ctx = context();
        assert_eq!(ctx.scope_key(), "svc-prod");
        assert_eq!(ctx.app_name(), "svc_prod");
        assert_eq!(ctx.user_agent(), "svc-prod");
    }

    #[test]
    fn service_name_defaults_to_name() {
        let info = ServiceInfo::new("svc", "1.0.0");
        assert_eq!(info.service_name(), "svc");
        assert_eq!(info.with_service_name("svc-api").service_name(), "svc-api");
    }

    #[test]
    fn configured_user_agent_wins() {
        let mut ctx = context();
        ctx.config.user_agent = Some("custom/1".into());
        assert_eq!(ctx.user_agent(), "custom/1");
    }

    #[test]
    fn no_resources_by_default() {
        let ctx = context();
        assert!(ctx.cache().is_none());
        assert!(ctx.store_as::<String>().is_none());
    }
}
